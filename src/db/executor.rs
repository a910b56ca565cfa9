//! Read-only statement execution
//!
//! Executes validated statements against PostgreSQL inside a read-only
//! transaction, retrying transient network failures through the retry layer,
//! and decodes rows into JSON values.

use crate::db::retry::{RetryError, RetryPolicy};
use crate::error::{CopilotError, Result};
use crate::validator::AcceptedSql;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use sqlx::postgres::types::PgMoney;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::io::ErrorKind as IoErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rows returned by a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecutionResult {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    /// Column names in select-list order. Empty when no rows came back.
    pub columns: Vec<String>,
}

impl QueryExecutionResult {
    pub fn new(columns: Vec<String>, rows: Vec<Map<String, Value>>) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            columns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Executes statements that already passed validation.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &AcceptedSql) -> Result<QueryExecutionResult>;
}

/// Coarse class of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, refused, unreachable, reset: worth retrying.
    Transient,
    Syntax,
    UnknownIdentifier,
    Other,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::PoolTimedOut => ErrorClass::Transient,
        sqlx::Error::Io(io) => match io.kind() {
            IoErrorKind::TimedOut
            | IoErrorKind::ConnectionRefused
            | IoErrorKind::ConnectionReset
            | IoErrorKind::ConnectionAborted
            | IoErrorKind::NotConnected
            | IoErrorKind::BrokenPipe
            | IoErrorKind::UnexpectedEof => ErrorClass::Transient,
            _ => classify_message(&io.to_string()),
        },
        sqlx::Error::Database(db) => classify_database_error(db.code().as_deref(), db.message()),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => ErrorClass::Other,
        other => classify_message(&other.to_string()),
    }
}

/// Classify by SQLSTATE first, then by message text.
pub fn classify_database_error(code: Option<&str>, message: &str) -> ErrorClass {
    if let Some(code) = code {
        match code {
            // connection_exception class, admin/crash shutdown, cannot_connect_now, too_many_connections
            c if c.starts_with("08") => return ErrorClass::Transient,
            "57P01" | "57P02" | "57P03" | "53300" => return ErrorClass::Transient,
            // query_canceled (statement_timeout) and lock_not_available rerun the same work
            "57014" | "55P03" => return ErrorClass::Other,
            "42601" => return ErrorClass::Syntax,
            "42P01" | "42703" | "42883" | "42704" | "3F000" | "42P02" => {
                return ErrorClass::UnknownIdentifier
            }
            _ => {}
        }
    }
    classify_message(message)
}

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let transient_markers = [
        "timed out",
        "connection refused",
        "unreachable",
        "connection reset",
        "broken pipe",
    ];
    if transient_markers.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else if lower.contains("syntax error") {
        ErrorClass::Syntax
    } else if lower.contains("does not exist") {
        ErrorClass::UnknownIdentifier
    } else {
        ErrorClass::Other
    }
}

fn sqlx_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// Map a final execution failure onto the error taxonomy.
pub fn execution_error(sql: &str, err: RetryError<sqlx::Error>) -> CopilotError {
    match err {
        RetryError::Exhausted { attempts, last } => CopilotError::ConnectionExhausted {
            attempts,
            message: sqlx_message(&last),
        },
        RetryError::Permanent(err) => {
            let message = sqlx_message(&err);
            let sql = sql.to_string();
            match classify_sqlx_error(&err) {
                ErrorClass::Syntax => CopilotError::ExecutionSyntax { sql, message },
                ErrorClass::UnknownIdentifier => {
                    CopilotError::ExecutionUnknownIdentifier { sql, message }
                }
                ErrorClass::Transient => CopilotError::TransientConnection(message),
                ErrorClass::Other => CopilotError::Execution { sql, message },
            }
        }
    }
}

/// PostgreSQL executor backed by the shared pool.
pub struct PgExecutor {
    pool: PgPool,
    retry: RetryPolicy,
    statement_timeout: Duration,
}

impl PgExecutor {
    pub fn new(pool: PgPool, retry: RetryPolicy, statement_timeout: Duration) -> Self {
        Self {
            pool,
            retry,
            statement_timeout,
        }
    }

    async fn run_read_only(&self, sql: &str) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        let timeout = format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        );
        sqlx::query(&timeout).execute(&mut *tx).await?;
        // Extended protocol: a prepared statement holds exactly one command.
        let rows = sqlx::query(sql).fetch_all(&mut *tx).await?;
        tx.rollback().await?;
        Ok(rows)
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, query: &AcceptedSql) -> Result<QueryExecutionResult> {
        let sql = query.as_str();
        let start = Instant::now();
        debug!("Executing: {}", sql);

        let rows = self
            .retry
            .retry(
                || self.run_read_only(sql),
                |e| classify_sqlx_error(e) == ErrorClass::Transient,
            )
            .await
            .map_err(|e| execution_error(sql, e))?;

        let result = decode_rows(&rows)?;
        info!(
            "Query returned {} rows in {}ms",
            result.row_count,
            start.elapsed().as_millis()
        );
        Ok(result)
    }
}

fn decode_rows(rows: &[PgRow]) -> Result<QueryExecutionResult> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = Map::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let raw = row
                .try_get_raw(idx)
                .map_err(|e| CopilotError::Database(format!("Failed to read column {}: {}", column.name(), e)))?;
            let value = if raw.is_null() {
                Value::Null
            } else {
                decode_value(row, idx, column.type_info().name())
            };
            record.insert(column.name().to_string(), value);
        }
        decoded.push(record);
    }

    Ok(QueryExecutionResult::new(columns, decoded))
}

/// Decode one non-null column by its PostgreSQL type name.
fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get::<i32, _>(idx).map(Value::from),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| float_value(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(float_value),
        "NUMERIC" => row.try_get::<Decimal, _>(idx).map(decimal_value),
        "MONEY" => row.try_get::<PgMoney, _>(idx).map(|m| decimal_value(m.to_decimal(2))),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        "UUID" => row.try_get::<uuid::Uuid, _>(idx).map(|u| Value::String(u.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|t| Value::String(t.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::String(d.to_string())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|t| Value::String(t.to_string())),
        _ => row.try_get::<String, _>(idx).map(Value::String),
    };
    decoded.unwrap_or_else(|e| {
        debug!("Column {} of type {} not decoded: {}", idx, type_name, e);
        Value::String(format!("<{}>", type_name.to_lowercase()))
    })
}

/// NaN and infinities have no JSON number form.
fn float_value(v: f64) -> Value {
    Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

fn decimal_value(d: Decimal) -> Value {
    match d.to_f64() {
        Some(v) => float_value(v),
        None => Value::String(d.to_string()),
    }
}
