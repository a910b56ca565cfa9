//! Schema introspection
//!
//! Reads the catalog through a [`SchemaSource`] and assembles a
//! [`SchemaSnapshot`]. Each table is described by independent sub-queries
//! run concurrently; a table that fails is kept in the snapshot with an
//! `error` marker instead of aborting the whole run.

use crate::db::executor::{classify_sqlx_error, ErrorClass};
use crate::db::retry::RetryPolicy;
use crate::error::{CopilotError, Result};
use crate::schema::model::{
    Column, ExtensionInfo, ForeignKey, ForeignKeyRef, IndexInfo, SchemaSnapshot, Table,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Raw column row as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Everything known about one table before assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDetails {
    pub row_count: i64,
    pub columns: Vec<RawColumn>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
}

/// Catalog access used by introspection.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn database_name(&self) -> Result<String>;
    async fn extensions(&self) -> Result<Vec<ExtensionInfo>>;
    /// Base tables in the public namespace.
    async fn list_tables(&self) -> Result<Vec<String>>;
    async fn describe_table(&self, table: &str) -> Result<TableDetails>;
}

/// Build a snapshot from `source`, describing at most `concurrency` tables at once.
pub async fn introspect(source: Arc<dyn SchemaSource>, concurrency: usize) -> Result<SchemaSnapshot> {
    let table_names = source.list_tables().await?;
    let total_tables = table_names.len();
    info!("Introspecting {} tables", total_tables);

    let database_name = source.database_name().await.unwrap_or_else(|e| {
        warn!("Could not read database name: {}", e);
        String::from("unknown")
    });
    let pg_extension_info = source.extensions().await.unwrap_or_else(|e| {
        warn!("Could not read extension list: {}", e);
        Vec::new()
    });

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (position, name) in table_names.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let details = source.describe_table(&name).await;
            (position, name, details)
        });
    }

    let mut slots: Vec<Option<Table>> = vec![None; total_tables];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, name, Ok(details))) => {
                slots[position] = Some(assemble_table(&name, details));
            }
            Ok((position, name, Err(e))) => {
                warn!(table = %name, "Table introspection failed, flagging it: {}", e);
                slots[position] = Some(Table::failed(name, e.to_string()));
            }
            Err(e) => warn!("Introspection task did not finish: {}", e),
        }
    }

    let tables: Vec<Table> = slots
        .into_iter()
        .zip(table_names)
        .map(|(slot, name)| slot.unwrap_or_else(|| Table::failed(name, "introspection task aborted")))
        .collect();

    let failed = tables.iter().filter(|t| t.is_failed()).count();
    if failed > 0 {
        warn!("Snapshot is partial: {} of {} tables failed", failed, total_tables);
    }

    Ok(SchemaSnapshot {
        tables,
        total_tables,
        cached_at: Utc::now(),
        database_name,
        pg_extension_info,
    })
}

/// Merge catalog rows into a [`Table`], marking PK and FK columns.
pub fn assemble_table(name: &str, details: TableDetails) -> Table {
    let pk: HashSet<&str> = details.primary_key.iter().map(String::as_str).collect();

    let columns = details
        .columns
        .iter()
        .map(|raw| {
            let fk = details.foreign_keys.iter().find(|fk| fk.column == raw.name);
            Column {
                name: raw.name.clone(),
                data_type: raw.data_type.clone(),
                nullable: raw.nullable,
                is_primary_key: pk.contains(raw.name.as_str()),
                is_foreign_key: fk.is_some(),
                foreign_key_ref: fk.map(|fk| ForeignKeyRef {
                    table: fk.references_table.clone(),
                    column: fk.references_column.clone(),
                }),
            }
        })
        .collect();

    Table {
        name: name.to_string(),
        row_count: details.row_count.max(0),
        columns,
        primary_key: details.primary_key,
        foreign_keys: details.foreign_keys,
        indexes: details.indexes,
        error: None,
    }
}

const LIST_TABLES_SQL: &str = r#"
    SELECT table_name::text
    FROM information_schema.tables
    WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
    ORDER BY table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT column_name::text, data_type::text, is_nullable::text
    FROM information_schema.columns
    WHERE table_schema = 'public' AND table_name = $1
    ORDER BY ordinal_position
"#;

const PRIMARY_KEY_SQL: &str = r#"
    SELECT kcu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
      AND tc.table_schema = 'public'
      AND tc.table_name = $1
    ORDER BY kcu.ordinal_position
"#;

/// One row per referencing column. `conkey` and `confkey` are unnested
/// together so a composite key pairs each column with its own target.
const FOREIGN_KEYS_SQL: &str = r#"
    SELECT c.conname::text, a.attname::text,
           rt.relname::text, ra.attname::text
    FROM pg_constraint c
    JOIN pg_class t ON t.oid = c.conrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_class rt ON rt.oid = c.confrelid
    CROSS JOIN LATERAL unnest(c.conkey, c.confkey) WITH ORDINALITY AS k(attnum, refnum, ord)
    JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
    JOIN pg_attribute ra ON ra.attrelid = c.confrelid AND ra.attnum = k.refnum
    WHERE c.contype = 'f'
      AND n.nspname = 'public'
      AND t.relname = $1
    ORDER BY c.conname, k.ord
"#;

const INDEXES_SQL: &str = r#"
    SELECT indexname::text, indexdef::text
    FROM pg_indexes
    WHERE schemaname = 'public' AND tablename = $1
    ORDER BY indexname
"#;

const ROW_ESTIMATE_SQL: &str = r#"
    SELECT COALESCE(n_live_tup, 0)::bigint
    FROM pg_stat_user_tables
    WHERE schemaname = 'public' AND relname = $1
"#;

/// Catalog source reading `information_schema` and `pg_*` views.
pub struct PgSchemaSource {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgSchemaSource {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        self.retry
            .retry(operation, |e| classify_sqlx_error(e) == ErrorClass::Transient)
            .await
            .map_err(|e| CopilotError::SchemaIntrospection(format!("{}: {}", what, e.into_inner())))
    }

    async fn columns(&self, table: &str) -> Result<Vec<RawColumn>> {
        let rows: Vec<(String, String, String)> = self
            .with_retry("columns", || {
                sqlx::query_as::<_, (String, String, String)>(COLUMNS_SQL).bind(table).fetch_all(&self.pool)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable)| RawColumn {
                name,
                data_type,
                nullable: is_nullable.eq_ignore_ascii_case("YES"),
            })
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = self
            .with_retry("primary key", || {
                sqlx::query_as::<_, (String,)>(PRIMARY_KEY_SQL).bind(table).fetch_all(&self.pool)
            })
            .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let rows: Vec<(String, String, String, String)> = self
            .with_retry("foreign keys", || {
                sqlx::query_as::<_, (String, String, String, String)>(FOREIGN_KEYS_SQL).bind(table).fetch_all(&self.pool)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(constraint_name, column, references_table, references_column)| ForeignKey {
                constraint_name,
                column,
                references_table,
                references_column,
            })
            .collect())
    }

    async fn indexes(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let rows: Vec<(String, String)> = self
            .with_retry("indexes", || {
                sqlx::query_as::<_, (String, String)>(INDEXES_SQL).bind(table).fetch_all(&self.pool)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, definition)| IndexInfo {
                unique: definition.to_uppercase().starts_with("CREATE UNIQUE"),
                name,
                definition,
            })
            .collect())
    }

    async fn row_estimate(&self, table: &str) -> Result<i64> {
        let row: Option<(i64,)> = self
            .with_retry("row estimate", || {
                sqlx::query_as::<_, (i64,)>(ROW_ESTIMATE_SQL).bind(table).fetch_optional(&self.pool)
            })
            .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }
}

#[async_trait]
impl SchemaSource for PgSchemaSource {
    async fn database_name(&self) -> Result<String> {
        let (name,): (String,) = self
            .with_retry("database name", || {
                sqlx::query_as::<_, (String,)>("SELECT current_database()::text").fetch_one(&self.pool)
            })
            .await?;
        Ok(name)
    }

    async fn extensions(&self) -> Result<Vec<ExtensionInfo>> {
        let rows: Vec<(String, String)> = self
            .with_retry("extensions", || {
                sqlx::query_as::<_, (String, String)>("SELECT extname::text, extversion::text FROM pg_extension ORDER BY extname")
                    .fetch_all(&self.pool)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, version)| ExtensionInfo { name, version })
            .collect())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = self
            .with_retry("table list", || sqlx::query_as::<_, (String,)>(LIST_TABLES_SQL).fetch_all(&self.pool))
            .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<TableDetails> {
        let (columns, primary_key, foreign_keys, indexes, row_count) = tokio::try_join!(
            self.columns(table),
            self.primary_key(table),
            self.foreign_keys(table),
            self.indexes(table),
            self.row_estimate(table),
        )?;
        Ok(TableDetails {
            row_count,
            columns,
            primary_key,
            foreign_keys,
            indexes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_marks_keys() {
        let details = TableDetails {
            row_count: 12,
            columns: vec![
                RawColumn { name: "id".into(), data_type: "integer".into(), nullable: false },
                RawColumn { name: "customer_id".into(), data_type: "integer".into(), nullable: true },
                RawColumn { name: "note".into(), data_type: "text".into(), nullable: true },
            ],
            primary_key: vec!["id".into()],
            foreign_keys: vec![ForeignKey {
                constraint_name: "orders_customer_id_fkey".into(),
                column: "customer_id".into(),
                references_table: "customers".into(),
                references_column: "id".into(),
            }],
            indexes: vec![],
        };
        let table = assemble_table("orders", details);
        assert!(table.columns[0].is_primary_key);
        assert!(!table.columns[0].is_foreign_key);
        assert!(table.columns[1].is_foreign_key);
        assert_eq!(
            table.columns[1].foreign_key_ref,
            Some(ForeignKeyRef { table: "customers".into(), column: "id".into() })
        );
        assert!(!table.columns[2].is_primary_key && !table.columns[2].is_foreign_key);
        assert_eq!(table.row_count, 12);
        assert!(table.error.is_none());
    }

    #[test]
    fn test_foreign_key_columns_pair_by_position() {
        assert!(FOREIGN_KEYS_SQL.contains("unnest(c.conkey, c.confkey) WITH ORDINALITY"));
        assert!(!FOREIGN_KEYS_SQL.contains("constraint_column_usage"));
    }

    #[test]
    fn test_assemble_composite_foreign_key() {
        let key = |column: &str, target: &str| ForeignKey {
            constraint_name: "shipments_depot_fkey".into(),
            column: column.into(),
            references_table: "depots".into(),
            references_column: target.into(),
        };
        let details = TableDetails {
            columns: vec![
                RawColumn { name: "depot_region".into(), data_type: "text".into(), nullable: false },
                RawColumn { name: "depot_code".into(), data_type: "text".into(), nullable: false },
            ],
            foreign_keys: vec![key("depot_region", "region"), key("depot_code", "code")],
            ..Default::default()
        };
        let table = assemble_table("shipments", details);
        assert_eq!(table.foreign_keys.len(), 2);
        assert_eq!(
            table.column("depot_region").unwrap().foreign_key_ref,
            Some(ForeignKeyRef { table: "depots".into(), column: "region".into() })
        );
        assert_eq!(
            table.column("depot_code").unwrap().foreign_key_ref,
            Some(ForeignKeyRef { table: "depots".into(), column: "code".into() })
        );
    }

    #[test]
    fn test_negative_row_estimate_clamped() {
        let table = assemble_table("t", TableDetails { row_count: -1, ..Default::default() });
        assert_eq!(table.row_count, 0);
    }
}
