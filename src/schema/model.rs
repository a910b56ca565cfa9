//! Schema snapshot types
//!
//! A snapshot is an immutable description of every base table in the
//! `public` namespace. It is replaced wholesale on refresh, never mutated.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub tables: Vec<Table>,
    /// Number of base tables the catalog listed; every one has an entry in `tables`.
    pub total_tables: usize,
    pub cached_at: DateTime<Utc>,
    pub database_name: String,
    #[serde(default)]
    pub pg_extension_info: Vec<ExtensionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    /// Approximate, from live statistics.
    pub row_count: i64,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
    /// Set when this table could not be introspected; columns are then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key_ref: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub constraint_name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: String,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Names of tables flagged with an introspection error.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.error.is_some())
            .map(|t| t.name.as_str())
            .collect()
    }

    /// True when every catalog table was introspected without error.
    pub fn is_complete(&self) -> bool {
        self.tables.len() == self.total_tables && self.tables.iter().all(|t| t.error.is_none())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }

    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > max_age
    }

    /// Structural equality ignoring `cached_at`.
    pub fn same_structure(&self, other: &SchemaSnapshot) -> bool {
        self.tables == other.tables
            && self.total_tables == other.total_tables
            && self.database_name == other.database_name
    }

    pub fn relationship_graph(&self) -> RelationshipGraph {
        RelationshipGraph::build(self)
    }
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Placeholder entry for a table whose introspection failed.
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            row_count: 0,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            error: Some(error.into()),
        }
    }
}

impl Column {
    pub fn is_temporal(&self) -> bool {
        let t = self.data_type.to_lowercase();
        t.contains("timestamp") || t == "date"
    }

    pub fn is_numeric(&self) -> bool {
        let t = self.data_type.to_lowercase();
        [
            "integer", "bigint", "smallint", "numeric", "decimal", "real", "double", "money",
        ]
        .iter()
        .any(|n| t.contains(n))
    }

    pub fn is_textual(&self) -> bool {
        let t = self.data_type.to_lowercase();
        t.contains("char") || t == "text" || t.contains("user-defined")
    }
}

/// An FK seen from the referenced side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseForeignKey {
    pub from_table: String,
    pub from_column: String,
    /// Column on this table being referenced.
    pub column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRelations {
    pub outgoing: Vec<ForeignKey>,
    pub incoming: Vec<ReverseForeignKey>,
}

/// One hop of a join path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Adjacency map derived from foreign keys. Rebuilt on demand, never stored.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    relations: HashMap<String, TableRelations>,
}

impl RelationshipGraph {
    pub fn build(snapshot: &SchemaSnapshot) -> Self {
        let mut relations: HashMap<String, TableRelations> = snapshot
            .tables
            .iter()
            .map(|t| (t.name.clone(), TableRelations::default()))
            .collect();

        for table in &snapshot.tables {
            for fk in &table.foreign_keys {
                relations
                    .entry(table.name.clone())
                    .or_default()
                    .outgoing
                    .push(fk.clone());
                relations
                    .entry(fk.references_table.clone())
                    .or_default()
                    .incoming
                    .push(ReverseForeignKey {
                        from_table: table.name.clone(),
                        from_column: fk.column.clone(),
                        column: fk.references_column.clone(),
                    });
            }
        }

        Self { relations }
    }

    pub fn relations(&self, table: &str) -> Option<&TableRelations> {
        self.relations.get(table)
    }

    pub fn outgoing(&self, table: &str) -> &[ForeignKey] {
        self.relations
            .get(table)
            .map(|r| r.outgoing.as_slice())
            .unwrap_or(&[])
    }

    pub fn incoming(&self, table: &str) -> &[ReverseForeignKey] {
        self.relations
            .get(table)
            .map(|r| r.incoming.as_slice())
            .unwrap_or(&[])
    }

    /// Edge count, counting each FK once.
    pub fn edge_count(&self) -> usize {
        self.relations.values().map(|r| r.outgoing.len()).sum()
    }

    /// Shortest FK path between two tables, walking edges in either direction.
    pub fn join_path(&self, from: &str, to: &str) -> Option<Vec<JoinStep>> {
        if !self.relations.contains_key(from) || !self.relations.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(Vec::new());
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, Vec<JoinStep>)> = VecDeque::new();
        visited.insert(from);
        queue.push_back((from, Vec::new()));

        while let Some((current, path)) = queue.pop_front() {
            let Some(rel) = self.relations.get(current) else {
                continue;
            };
            let forward = rel.outgoing.iter().map(|fk| JoinStep {
                from_table: current.to_string(),
                from_column: fk.column.clone(),
                to_table: fk.references_table.clone(),
                to_column: fk.references_column.clone(),
            });
            let backward = rel.incoming.iter().map(|rfk| JoinStep {
                from_table: current.to_string(),
                from_column: rfk.column.clone(),
                to_table: rfk.from_table.clone(),
                to_column: rfk.from_column.clone(),
            });

            for step in forward.chain(backward) {
                let Some((next, _)) = self.relations.get_key_value(step.to_table.as_str()) else {
                    continue;
                };
                if !visited.insert(next.as_str()) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(step);
                if next == to {
                    return Some(next_path);
                }
                queue.push_back((next.as_str(), next_path));
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_graph_has_both_directions() {
        let snapshot = shop_snapshot();
        let graph = snapshot.relationship_graph();
        assert_eq!(graph.outgoing("order_items").len(), 2);
        assert_eq!(graph.incoming("delivery_orders").len(), 1);
        assert_eq!(graph.incoming("delivery_orders")[0].from_table, "order_items");
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_join_path_walks_reverse_edges() {
        let graph = shop_snapshot().relationship_graph();
        let path = graph.join_path("customers", "order_items").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].to_table, "delivery_orders");
        assert_eq!(path[0].to_column, "customer_id");
        assert_eq!(path[1].to_table, "order_items");
        assert!(graph.join_path("customers", "nowhere").is_none());
    }

    #[test]
    fn test_completeness_flags_failed_tables() {
        let mut snapshot = shop_snapshot();
        assert!(snapshot.is_complete());
        snapshot.tables[1] = Table::failed("delivery_orders", "permission denied");
        assert!(!snapshot.is_complete());
        assert_eq!(snapshot.failed_tables(), vec!["delivery_orders"]);
        assert_eq!(snapshot.tables.len(), snapshot.total_tables);
    }

    #[test]
    fn test_staleness() {
        let mut snapshot = shop_snapshot();
        let now = Utc::now();
        snapshot.cached_at = now - Duration::minutes(90);
        assert!(snapshot.is_stale(Duration::hours(1), now));
        assert!(!snapshot.is_stale(Duration::hours(2), now));
    }

    #[test]
    fn test_json_uses_camel_case_and_type_key() {
        let json = serde_json::to_value(shop_snapshot()).unwrap();
        assert!(json.get("cachedAt").is_some());
        assert!(json.get("totalTables").is_some());
        assert!(json.get("pgExtensionInfo").is_some());
        assert_eq!(json["tables"][0]["columns"][0]["type"], "integer");
        assert!(json["tables"][0].get("error").is_none());
    }
}
