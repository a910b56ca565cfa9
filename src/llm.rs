//! Text-generation oracle client
//!
//! One OpenAI-style chat completion per call, bearer authenticated, no
//! streaming. Replies are parsed into [`OracleReply`] before anyone looks at
//! the text.

use crate::config::Config;
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str =
    "You are a PostgreSQL expert. Answer with exactly one read-only SQL statement.";

/// Parsed oracle response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleReply {
    /// First choice's text. `truncated` is set when the service stopped on its token limit.
    Choices { text: String, truncated: bool },
    /// The body did not have the expected shape.
    Malformed(String),
}

impl OracleReply {
    pub fn parse(body: &str) -> Self {
        let response: ChatResponse = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => return OracleReply::Malformed(format!("invalid JSON: {}", e)),
        };
        let Some(choice) = response.choices.into_iter().next() else {
            return OracleReply::Malformed("no choices in response".to_string());
        };
        match choice.message.and_then(|m| m.content) {
            Some(text) => OracleReply::Choices {
                text,
                truncated: choice.finish_reason.as_deref() == Some("length"),
            },
            None => OracleReply::Malformed("choice has no message content".to_string()),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            OracleReply::Choices { text, .. } => Some(text),
            OracleReply::Malformed(_) => None,
        }
    }
}

/// Whether the oracle's credentials are known to work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OracleAuthState {
    #[default]
    Unknown,
    Valid,
    Rejected,
}

impl OracleAuthState {
    /// Next state after one oracle call. Only authentication failures and
    /// successes move the state; other errors say nothing about credentials.
    pub fn observe<T>(self, outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => OracleAuthState::Valid,
            Err(CopilotError::LlmAuth(_)) => OracleAuthState::Rejected,
            Err(_) => self,
        }
    }

    pub fn allows_calls(self) -> bool {
        self != OracleAuthState::Rejected
    }
}

/// Prompt in, one text blob out.
#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<OracleReply>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatReplyMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: Option<String>,
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: 0.1,
            max_tokens: 800,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let api_key = config.openai_api_key.clone().filter(|k| !k.trim().is_empty())?;
        Some(
            Self::new(api_key, config.openai_model.clone(), config.openai_base_url.clone())
                .with_sampling(config.temperature, config.max_tokens),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextOracle for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<OracleReply> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!("Calling {} with a {} character prompt", self.model, prompt.len());
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CopilotError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CopilotError::Llm(format!("Failed to read LLM response: {}", e)))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!("LLM API rejected credentials ({})", status);
            return Err(CopilotError::LlmAuth(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(CopilotError::Llm(format!(
                "LLM API returned {}: {}",
                status,
                truncate(&text, 200)
            )));
        }

        let reply = OracleReply::parse(&text);
        if let OracleReply::Malformed(reason) = &reply {
            warn!("Malformed LLM response: {}", reason);
        }
        Ok(reply)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice_text() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"},"finish_reason":"stop"}]}"#;
        assert_eq!(
            OracleReply::parse(body),
            OracleReply::Choices { text: "SELECT 1".to_string(), truncated: false }
        );
    }

    #[test]
    fn test_parse_marks_length_stop_as_truncated() {
        let body = r#"{"choices":[{"message":{"content":"SELECT * FROM t WHERE"},"finish_reason":"length"}]}"#;
        assert!(matches!(OracleReply::parse(body), OracleReply::Choices { truncated: true, .. }));
    }

    #[test]
    fn test_parse_malformed_shapes() {
        assert!(matches!(OracleReply::parse("not json"), OracleReply::Malformed(_)));
        assert!(matches!(OracleReply::parse(r#"{"choices":[]}"#), OracleReply::Malformed(_)));
        assert!(matches!(OracleReply::parse(r#"{"error":{"message":"x"}}"#), OracleReply::Malformed(_)));
        assert!(matches!(
            OracleReply::parse(r#"{"choices":[{"message":{"content":null}}]}"#),
            OracleReply::Malformed(_)
        ));
        assert_eq!(OracleReply::Malformed("x".into()).text(), None);
    }

    #[test]
    fn test_auth_state_transitions() {
        let ok: Result<()> = Ok(());
        let auth: Result<()> = Err(CopilotError::LlmAuth("401".into()));
        let other: Result<()> = Err(CopilotError::Llm("timeout".into()));

        assert_eq!(OracleAuthState::Unknown.observe(&ok), OracleAuthState::Valid);
        assert_eq!(OracleAuthState::Valid.observe(&auth), OracleAuthState::Rejected);
        assert_eq!(OracleAuthState::Valid.observe(&other), OracleAuthState::Valid);
        assert!(!OracleAuthState::Rejected.allows_calls());
        assert!(OracleAuthState::Unknown.allows_calls());
    }

    #[test]
    fn test_client_requires_key() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert!(LlmClient::from_config(&config).is_none());
        let config = Config::from_lookup(|k| (k == "OPENAI_API_KEY").then(|| "sk-test".to_string())).unwrap();
        let client = LlmClient::from_config(&config).unwrap();
        assert_eq!(client.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
