//! In-memory stand-ins for the catalog, the oracle and the database.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use sql_copilot::db::{QueryExecutionResult, QueryExecutor};
use sql_copilot::schema::{ExtensionInfo, ForeignKey, RawColumn, SchemaCache, SchemaSource, TableDetails};
use sql_copilot::{AcceptedSql, CopilotError, OracleReply, Result, TextOracle};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn raw(name: &str, data_type: &str) -> RawColumn {
    RawColumn {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: name != "id",
    }
}

fn fk(table: &str, column: &str, target: &str) -> ForeignKey {
    ForeignKey {
        constraint_name: format!("{}_{}_fkey", table, column),
        column: column.to_string(),
        references_table: target.to_string(),
        references_column: "id".to_string(),
    }
}

/// customers, delivery_orders, order_items, products.
pub fn shop_tables() -> Vec<(String, TableDetails)> {
    vec![
        (
            "customers".to_string(),
            TableDetails {
                row_count: 120,
                columns: vec![raw("id", "integer"), raw("full_name", "text"), raw("email", "text")],
                primary_key: vec!["id".to_string()],
                ..TableDetails::default()
            },
        ),
        (
            "delivery_orders".to_string(),
            TableDetails {
                row_count: 5400,
                columns: vec![
                    raw("id", "integer"),
                    raw("customer_id", "integer"),
                    raw("status", "character varying"),
                    raw("total_amount", "numeric"),
                    raw("created_at", "timestamp with time zone"),
                ],
                primary_key: vec!["id".to_string()],
                foreign_keys: vec![fk("delivery_orders", "customer_id", "customers")],
                ..TableDetails::default()
            },
        ),
        (
            "order_items".to_string(),
            TableDetails {
                row_count: 16000,
                columns: vec![
                    raw("id", "integer"),
                    raw("order_id", "integer"),
                    raw("product_id", "integer"),
                    raw("quantity", "integer"),
                ],
                primary_key: vec!["id".to_string()],
                foreign_keys: vec![
                    fk("order_items", "order_id", "delivery_orders"),
                    fk("order_items", "product_id", "products"),
                ],
                ..TableDetails::default()
            },
        ),
        (
            "products".to_string(),
            TableDetails {
                row_count: 300,
                columns: vec![raw("id", "integer"), raw("title", "text"), raw("price", "numeric")],
                primary_key: vec!["id".to_string()],
                ..TableDetails::default()
            },
        ),
    ]
}

/// Catalog served from memory. Tables listed in `denied` fail like a
/// permission error; `list_calls` counts full introspection runs.
pub struct MemorySchemaSource {
    tables: Mutex<Vec<(String, TableDetails)>>,
    denied: Vec<String>,
    pub list_calls: AtomicUsize,
    delay: Option<Duration>,
    fail_listing: bool,
}

impl MemorySchemaSource {
    pub fn new(tables: Vec<(String, TableDetails)>) -> Self {
        Self {
            tables: Mutex::new(tables),
            denied: Vec::new(),
            list_calls: AtomicUsize::new(0),
            delay: None,
            fail_listing: false,
        }
    }

    pub fn shop() -> Self {
        Self::new(shop_tables())
    }

    pub fn deny(mut self, table: &str) -> Self {
        self.denied.push(table.to_string());
        self
    }

    /// Slow down `list_tables` so a background refresh is observably in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_listing: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn add_table(&self, name: &str, details: TableDetails) {
        self.tables.lock().unwrap().push((name.to_string(), details));
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaSource for MemorySchemaSource {
    async fn database_name(&self) -> Result<String> {
        Ok("shop".to_string())
    }

    async fn extensions(&self) -> Result<Vec<ExtensionInfo>> {
        Ok(vec![ExtensionInfo {
            name: "plpgsql".to_string(),
            version: "1.0".to_string(),
        }])
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_listing {
            return Err(CopilotError::SchemaIntrospection("catalog unreachable".to_string()));
        }
        Ok(self.tables.lock().unwrap().iter().map(|(n, _)| n.clone()).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<TableDetails> {
        if self.denied.iter().any(|d| d == table) {
            return Err(CopilotError::Database(format!(
                "permission denied for table {}",
                table
            )));
        }
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == table)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| CopilotError::Database(format!("relation \"{}\" does not exist", table)))
    }
}

/// Oracle that replays scripted replies in order and records every prompt.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<OracleReply>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<OracleReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| {
                    Ok(OracleReply::Choices {
                        text: t.to_string(),
                        truncated: false,
                    })
                })
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TextOracle for ScriptedOracle {
    async fn complete(&self, prompt: &str) -> Result<OracleReply> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(OracleReply::Malformed("script exhausted".to_string())))
    }
}

/// How the fake database answers a statement.
#[derive(Clone)]
pub enum Answer {
    Rows(Vec<String>, Vec<Vec<Value>>),
    UnknownIdentifier(String),
    Exhausted,
}

/// Executor that records what it ran. Statements containing a key of
/// `answers` get that answer; everything else returns no rows.
#[derive(Default)]
pub struct RecordingExecutor {
    answers: HashMap<String, Answer>,
    pub executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, needle: &str, answer: Answer) -> Self {
        self.answers.insert(needle.to_string(), answer);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, query: &AcceptedSql) -> Result<QueryExecutionResult> {
        let sql = query.as_str().to_string();
        self.executed.lock().unwrap().push(sql.clone());
        let answer = self
            .answers
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, a)| a.clone());
        match answer {
            Some(Answer::Rows(columns, rows)) => {
                let rows = rows
                    .into_iter()
                    .map(|values| {
                        columns
                            .iter()
                            .cloned()
                            .zip(values)
                            .collect::<Map<String, Value>>()
                    })
                    .collect();
                Ok(QueryExecutionResult::new(columns, rows))
            }
            Some(Answer::UnknownIdentifier(message)) => {
                Err(CopilotError::ExecutionUnknownIdentifier { sql, message })
            }
            Some(Answer::Exhausted) => Err(CopilotError::ConnectionExhausted {
                attempts: 3,
                message: "connection reset by peer".to_string(),
            }),
            None => Ok(QueryExecutionResult::new(Vec::new(), Vec::new())),
        }
    }
}

pub fn temp_cache_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("sql-copilot-test-{}", uuid::Uuid::new_v4()))
        .join("schema_cache.json")
}

pub fn cache_over(source: Arc<MemorySchemaSource>, max_age_hours: f64) -> Arc<SchemaCache> {
    Arc::new(SchemaCache::new(source, temp_cache_path(), max_age_hours, 4))
}
