//! Schema-aware natural-language-to-SQL synthesis and validation.
//!
//! A question is answered against a cached snapshot of a PostgreSQL schema:
//! the oracle proposes a statement, a deterministic pattern library offers a
//! fallback, and only statements the validator accepts are executed, inside
//! a read-only transaction.

pub mod concept_resolver;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod llm;
pub mod patterns;
pub mod pipeline;
pub mod result_formatter;
pub mod schema;
pub mod sql_scan;
pub mod synthesis;
pub mod validator;

pub use config::Config;
pub use error::{CopilotError, ErrorKind, ErrorReport, Result};
pub use llm::{LlmClient, OracleAuthState, OracleReply, TextOracle};
pub use pipeline::{AskOutcome, AskRequest, AskResponse, QueryPipeline, QuerySource, SessionState};
pub use schema::{SchemaCache, SchemaSnapshot, SnapshotOptions};
pub use validator::{validate, AcceptedSql, ValidatedQuery, Verdict};
