//! Question-to-answer pipeline
//!
//! Snapshot -> concept suggestions + business context -> synthesis (awaited
//! first) with the pattern fallback running beside it -> validation ->
//! execution -> formatting. Session state (connection health, oracle auth)
//! is passed in and handed back rather than kept in globals.

use crate::concept_resolver::{format_suggestions, ConceptResolver};
use crate::context::format_context;
use crate::db::connection::{ConnectionHealth, ProbeOutcome};
use crate::db::executor::{QueryExecutionResult, QueryExecutor};
use crate::error::{CopilotError, Result};
use crate::llm::OracleAuthState;
use crate::patterns::{self, PatternMatch};
use crate::result_formatter::{ChartTuples, ResultFormatter};
use crate::schema::cache::{SchemaCache, SnapshotOptions};
use crate::schema::model::SchemaSnapshot;
use crate::synthesis::{CompletenessState, PromptMode, QueryCandidate, QuerySynthesizer};
use crate::validator::{validate, AcceptedSql, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-session state threaded through [`QueryPipeline::ask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub connection: ConnectionHealth,
    pub oracle_auth: OracleAuthState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionHealth::Unknown,
            oracle_auth: OracleAuthState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    /// Free-form conversation context supplied by the caller.
    #[serde(default)]
    pub context: Option<String>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: None,
        }
    }
}

/// Where the executed statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuerySource {
    Synthesis,
    StrictSynthesis,
    Pattern,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub request_id: Uuid,
    pub sql: String,
    pub source: QuerySource,
    pub rows: QueryExecutionResult,
    pub chart_tuples: ChartTuples,
    pub briefing: String,
}

pub struct AskOutcome {
    pub result: Result<AskResponse>,
    pub state: SessionState,
}

/// Pattern candidate computed on its own task, awaited only when needed.
struct FallbackSlot {
    handle: Option<JoinHandle<Option<(PatternMatch, AcceptedSql)>>>,
    resolved: Option<(PatternMatch, AcceptedSql)>,
}

impl FallbackSlot {
    fn spawn(snapshot: Arc<SchemaSnapshot>, question: String) -> Self {
        let handle = tokio::spawn(async move {
            let candidate = patterns::generate(&snapshot, &question)?;
            match validate(&candidate.sql).into_result() {
                Ok(accepted) => Some((candidate, accepted)),
                Err(e) => {
                    warn!("Pattern candidate failed validation: {}", e);
                    None
                }
            }
        });
        Self {
            handle: Some(handle),
            resolved: None,
        }
    }

    async fn get(&mut self) -> Option<&(PatternMatch, AcceptedSql)> {
        if let Some(handle) = self.handle.take() {
            self.resolved = match handle.await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("Pattern fallback task failed: {}", e);
                    None
                }
            };
        }
        self.resolved.as_ref()
    }
}

/// Statement picked for execution.
struct Chosen {
    sql: AcceptedSql,
    source: QuerySource,
}

pub struct QueryPipeline {
    cache: Arc<SchemaCache>,
    synthesizer: Option<QuerySynthesizer>,
    executor: Arc<dyn QueryExecutor>,
    resolver: ConceptResolver,
    formatter: ResultFormatter,
    snapshot_options: SnapshotOptions,
}

impl QueryPipeline {
    pub fn new(
        cache: Arc<SchemaCache>,
        synthesizer: Option<QuerySynthesizer>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            cache,
            synthesizer,
            executor,
            resolver: ConceptResolver::default(),
            formatter: ResultFormatter::default(),
            snapshot_options: SnapshotOptions::default(),
        }
    }

    pub fn with_formatter(mut self, formatter: ResultFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_snapshot_options(mut self, options: SnapshotOptions) -> Self {
        self.snapshot_options = options;
        self
    }

    /// Answer one question. Never panics on oracle or database failure; the
    /// error is in `result` and the updated session state comes back either way.
    pub async fn ask(&self, request: &AskRequest, state: SessionState) -> AskOutcome {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", request_id = %request_id);
        let mut state = state;
        let result = self
            .answer(request_id, request, &mut state)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            warn!("Request {} failed ({:?}): {}", request_id, e.kind(), e);
        }
        AskOutcome { result, state }
    }

    async fn answer(&self, request_id: Uuid, request: &AskRequest, state: &mut SessionState) -> Result<AskResponse> {
        if let ConnectionHealth::Fatal { message } = &state.connection {
            return Err(CopilotError::Database(format!("database connection is unusable: {}", message)));
        }
        let question = request.question.trim();
        if question.is_empty() {
            return Err(CopilotError::SynthesisAbsent);
        }
        info!("Question: {}", question);

        let snapshot = self.cache.get_snapshot(self.snapshot_options).await?;
        let mut fallback = FallbackSlot::spawn(Arc::clone(&snapshot), question.to_string());

        let chosen = self.choose(question, request, &snapshot, &mut fallback, state).await?;
        info!("Executing {:?} statement", chosen.source);

        let (sql, source, rows) = match self.executor.execute(&chosen.sql).await {
            Ok(rows) => (chosen.sql, chosen.source, rows),
            Err(e) if chosen.source != QuerySource::Pattern && e.is_recoverable_by_fallback() => {
                let Some((pattern, accepted)) = fallback.get().await.cloned() else {
                    return Err(self.observe_execution(state, e));
                };
                warn!("Synthesized statement failed ({}); running {:?} pattern instead", e, pattern.kind);
                let rows = self
                    .executor
                    .execute(&accepted)
                    .await
                    .map_err(|e| self.observe_execution(state, e))?;
                (accepted, QuerySource::Pattern, rows)
            }
            Err(e) => return Err(self.observe_execution(state, e)),
        };
        state.connection = state.connection.observe(&ProbeOutcome::Ok);

        Ok(AskResponse {
            request_id,
            sql: sql.as_str().to_string(),
            source,
            chart_tuples: self.formatter.to_chart_tuples(&rows),
            briefing: self.formatter.format(&rows),
            rows,
        })
    }

    /// Pick the statement to run: a validated synthesis candidate, else the
    /// validated pattern candidate, else one strict synthesis retry.
    /// Unsafe synthesis output is reported as-is.
    async fn choose(
        &self,
        question: &str,
        request: &AskRequest,
        snapshot: &SchemaSnapshot,
        fallback: &mut FallbackSlot,
        state: &mut SessionState,
    ) -> Result<Chosen> {
        let synthesizer = match &self.synthesizer {
            Some(s) if state.oracle_auth.allows_calls() => s,
            _ => {
                info!("Oracle unavailable; using pattern fallback only");
                return match fallback.get().await {
                    Some((_, accepted)) => Ok(Chosen {
                        sql: accepted.clone(),
                        source: QuerySource::Pattern,
                    }),
                    None if state.oracle_auth == OracleAuthState::Rejected => {
                        Err(CopilotError::LlmAuth("oracle credentials were rejected".to_string()))
                    }
                    None => Err(CopilotError::SynthesisAbsent),
                };
            }
        };

        let mut context_text = format_context(snapshot);
        if let Some(extra) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
            context_text.push_str("\n## Conversation context\n\n");
            context_text.push_str(extra.trim());
            context_text.push('\n');
        }
        let suggestions = format_suggestions(&self.resolver.resolve_question(snapshot, question));

        let first = self
            .attempt(synthesizer, question, &context_text, &suggestions, PromptMode::Standard, state)
            .await;
        let first_err = match first {
            Ok(sql) => {
                return Ok(Chosen {
                    sql,
                    source: QuerySource::Synthesis,
                })
            }
            Err(e) => e,
        };

        if !first_err.is_recoverable_by_fallback() {
            return Err(first_err);
        }
        if let Some((pattern, accepted)) = fallback.get().await {
            info!("Synthesis unusable ({}); using {:?} pattern", first_err, pattern.kind);
            return Ok(Chosen {
                sql: accepted.clone(),
                source: QuerySource::Pattern,
            });
        }

        let retryable = matches!(
            first_err,
            CopilotError::SynthesisAbsent
                | CopilotError::SynthesisIncomplete { .. }
                | CopilotError::ValidationMalformed { .. }
        );
        if !retryable || !state.oracle_auth.allows_calls() {
            return Err(first_err);
        }

        info!("Retrying synthesis with strict instructions");
        self.attempt(synthesizer, question, &context_text, &suggestions, PromptMode::Strict, state)
            .await
            .map(|sql| Chosen {
                sql,
                source: QuerySource::StrictSynthesis,
            })
    }

    /// One synthesis round: oracle call, extraction, validation.
    async fn attempt(
        &self,
        synthesizer: &QuerySynthesizer,
        question: &str,
        context_text: &str,
        suggestions: &str,
        mode: PromptMode,
        state: &mut SessionState,
    ) -> Result<AcceptedSql> {
        let outcome = synthesizer.synthesize(question, context_text, suggestions, mode).await;
        state.oracle_auth = state.oracle_auth.observe(&outcome);
        accept_candidate(outcome?)
    }

    fn observe_execution(&self, state: &mut SessionState, err: CopilotError) -> CopilotError {
        if let CopilotError::ConnectionExhausted { message, .. } = &err {
            state.connection = state.connection.observe(&ProbeOutcome::Transient(message.clone()));
        }
        err
    }
}

/// Validate a complete candidate; anything else maps to its synthesis error.
pub fn accept_candidate(candidate: QueryCandidate) -> Result<AcceptedSql> {
    match (candidate.completeness_state, candidate.extracted_sql) {
        (CompletenessState::Complete, Some(sql)) => {
            let validated = validate(&sql);
            if let Verdict::RejectedUnsafe(reason) = &validated.verdict {
                warn!("Synthesized statement rejected as unsafe: {}", reason);
            }
            validated.into_result()
        }
        (CompletenessState::Incomplete, Some(sql)) => Err(CopilotError::SynthesisIncomplete { sql }),
        _ => Err(CopilotError::SynthesisAbsent),
    }
}
