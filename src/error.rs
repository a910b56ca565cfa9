use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("Transient connection error: {0}")]
    TransientConnection(String),

    #[error("Database temporarily unavailable after {attempts} attempts: {message}")]
    ConnectionExhausted { attempts: usize, message: String },

    #[error("Schema introspection error: {0}")]
    SchemaIntrospection(String),

    #[error("No SQL statement could be generated for the question")]
    SynthesisAbsent,

    #[error("Generated SQL is incomplete: {sql}")]
    SynthesisIncomplete { sql: String },

    #[error("Cannot run this query: {reason}")]
    ValidationUnsafe { sql: String, reason: String },

    #[error("Malformed query: {reason}")]
    ValidationMalformed { sql: String, reason: String },

    #[error("SQL syntax error: {message}")]
    ExecutionSyntax { sql: String, message: String },

    #[error("Unknown table or column: {message}")]
    ExecutionUnknownIdentifier { sql: String, message: String },

    #[error("Execution error: {message}")]
    Execution { sql: String, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM authentication rejected: {0}")]
    LlmAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable error tag handed to callers of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    TransientConnection,
    SchemaIntrospectionPartial,
    SchemaIntrospection,
    SynthesisAbsent,
    SynthesisIncomplete,
    ValidationUnsafe,
    ValidationMalformed,
    ExecutionSyntaxError,
    ExecutionUnknownIdentifier,
    ExecutionConnectionExhausted,
    ExecutionFailed,
    OracleUnavailable,
    OracleAuthRejected,
    Internal,
}

/// Structured error for the upstream surface: kind, offending SQL, message, hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub hint: String,
}

impl CopilotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CopilotError::TransientConnection(_) => ErrorKind::TransientConnection,
            CopilotError::ConnectionExhausted { .. } => ErrorKind::ExecutionConnectionExhausted,
            CopilotError::SchemaIntrospection(_) => ErrorKind::SchemaIntrospection,
            CopilotError::SynthesisAbsent => ErrorKind::SynthesisAbsent,
            CopilotError::SynthesisIncomplete { .. } => ErrorKind::SynthesisIncomplete,
            CopilotError::ValidationUnsafe { .. } => ErrorKind::ValidationUnsafe,
            CopilotError::ValidationMalformed { .. } => ErrorKind::ValidationMalformed,
            CopilotError::ExecutionSyntax { .. } => ErrorKind::ExecutionSyntaxError,
            CopilotError::ExecutionUnknownIdentifier { .. } => ErrorKind::ExecutionUnknownIdentifier,
            CopilotError::Execution { .. } => ErrorKind::ExecutionFailed,
            CopilotError::Llm(_) => ErrorKind::OracleUnavailable,
            CopilotError::LlmAuth(_) => ErrorKind::OracleAuthRejected,
            CopilotError::Database(_)
            | CopilotError::Config(_)
            | CopilotError::Io(_)
            | CopilotError::Json(_) => ErrorKind::Internal,
        }
    }

    /// The statement this error is about, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            CopilotError::SynthesisIncomplete { sql }
            | CopilotError::ValidationUnsafe { sql, .. }
            | CopilotError::ValidationMalformed { sql, .. }
            | CopilotError::ExecutionSyntax { sql, .. }
            | CopilotError::ExecutionUnknownIdentifier { sql, .. }
            | CopilotError::Execution { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Whether the caller may reasonably try the deterministic fallback or
    /// another synthesis round after this error.
    pub fn is_recoverable_by_fallback(&self) -> bool {
        matches!(
            self,
            CopilotError::SynthesisAbsent
                | CopilotError::SynthesisIncomplete { .. }
                | CopilotError::ValidationMalformed { .. }
                | CopilotError::ExecutionSyntax { .. }
                | CopilotError::ExecutionUnknownIdentifier { .. }
                | CopilotError::Llm(_)
                | CopilotError::LlmAuth(_)
        )
    }

    pub fn user_hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ValidationUnsafe => {
                "I cannot run this query: only read-only SELECT statements are allowed."
            }
            ErrorKind::ValidationMalformed
            | ErrorKind::SynthesisAbsent
            | ErrorKind::SynthesisIncomplete => {
                "I could not build a complete query for that question. Try rephrasing it more specifically."
            }
            ErrorKind::ExecutionSyntaxError | ErrorKind::ExecutionUnknownIdentifier => {
                "The generated query did not match the database. Try rephrasing with the table or column names you mean."
            }
            ErrorKind::ExecutionConnectionExhausted | ErrorKind::TransientConnection => {
                "The database is temporarily unavailable. Please try again in a moment."
            }
            ErrorKind::OracleUnavailable | ErrorKind::OracleAuthRejected => {
                "The query generator is unavailable right now. Only common question shapes can be answered."
            }
            _ => "Something went wrong while answering the question.",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            sql: self.sql().map(str::to_string),
            hint: self.user_hint().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CopilotError>;
