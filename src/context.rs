//! Business Context Formatter
//!
//! Renders a snapshot as the self-contained schema briefing the synthesis
//! prompt receives. Tables are grouped into coarse business domains; every
//! column carries its PK/FK/NOT NULL markers and each table lists its forward
//! and reverse relationships.

use crate::schema::model::{RelationshipGraph, SchemaSnapshot, Table};
use itertools::Itertools;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Orders,
    Customers,
    Products,
    Inventory,
    Financial,
    Delivery,
    Discounts,
    Other,
}

impl Domain {
    pub fn label(self) -> &'static str {
        match self {
            Domain::Orders => "Orders",
            Domain::Customers => "Customers",
            Domain::Products => "Products",
            Domain::Inventory => "Inventory",
            Domain::Financial => "Financial",
            Domain::Delivery => "Delivery",
            Domain::Discounts => "Discounts",
            Domain::Other => "Other",
        }
    }
}

const DOMAIN_KEYWORDS: &[(Domain, &[&str])] = &[
    (Domain::Orders, &["order", "purchase", "cart", "checkout"]),
    (Domain::Customers, &["customer", "client", "user", "account", "member"]),
    (Domain::Products, &["product", "item", "catalog", "categor", "sku", "variant"]),
    (Domain::Inventory, &["inventory", "stock", "warehouse"]),
    (Domain::Financial, &["payment", "invoice", "transaction", "refund", "revenue", "billing", "wallet"]),
    (Domain::Delivery, &["deliver", "shipment", "shipping", "courier", "driver", "route"]),
    (Domain::Discounts, &["discount", "coupon", "promo", "voucher"]),
];

/// Business domain of a table, by substring match on its name.
pub fn domain_of(table_name: &str) -> Domain {
    let name = table_name.to_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
        .map(|(domain, _)| *domain)
        .unwrap_or(Domain::Other)
}

/// Render the schema briefing.
pub fn format_context(snapshot: &SchemaSnapshot) -> String {
    let graph = snapshot.relationship_graph();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "## Database: {} ({} tables)",
        snapshot.database_name, snapshot.total_tables
    );
    if !snapshot.pg_extension_info.is_empty() {
        let extensions = snapshot
            .pg_extension_info
            .iter()
            .map(|e| format!("{} {}", e.name, e.version))
            .join(", ");
        let _ = writeln!(out, "Extensions: {}", extensions);
    }
    let failed = snapshot.failed_tables();
    if !failed.is_empty() {
        let _ = writeln!(
            out,
            "Note: {} table(s) could not be inspected: {}",
            failed.len(),
            failed.join(", ")
        );
    }

    let grouped = snapshot
        .tables
        .iter()
        .map(|t| (domain_of(&t.name), t))
        .into_group_map();

    for domain in grouped.keys().copied().sorted() {
        let _ = writeln!(out, "\n### {}", domain.label());
        if let Some(tables) = grouped.get(&domain) {
            for table in tables {
                write_table(&mut out, table, &graph);
            }
        }
    }
    out
}

fn write_table(out: &mut String, table: &Table, graph: &RelationshipGraph) {
    if let Some(error) = &table.error {
        let _ = writeln!(out, "\nTable {} (structure unavailable: {})", table.name, error);
        return;
    }

    let _ = writeln!(out, "\nTable {} (~{} rows)", table.name, table.row_count);
    if !table.primary_key.is_empty() {
        let _ = writeln!(out, "  Primary key: {}", table.primary_key.join(", "));
    }

    let _ = writeln!(out, "  Columns:");
    for column in &table.columns {
        let mut markers = Vec::new();
        if column.is_primary_key {
            markers.push("PK".to_string());
        }
        if let Some(fk) = &column.foreign_key_ref {
            markers.push(format!("FK -> {}.{}", fk.table, fk.column));
        }
        if !column.nullable {
            markers.push("NOT NULL".to_string());
        }
        if markers.is_empty() {
            let _ = writeln!(out, "    - {} {}", column.name, column.data_type);
        } else {
            let _ = writeln!(out, "    - {} {} [{}]", column.name, column.data_type, markers.join(", "));
        }
    }

    let outgoing = graph.outgoing(&table.name);
    let incoming = graph.incoming(&table.name);
    if !outgoing.is_empty() || !incoming.is_empty() {
        let _ = writeln!(out, "  Relationships:");
        for fk in outgoing {
            let _ = writeln!(
                out,
                "    - {} -> {}.{}",
                fk.column, fk.references_table, fk.references_column
            );
        }
        for rev in incoming {
            let _ = writeln!(
                out,
                "    - {} <- {}.{}",
                rev.column, rev.from_table, rev.from_column
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::fixtures::*;
    use crate::schema::model::Table;

    #[test]
    fn test_domain_grouping() {
        assert_eq!(domain_of("delivery_orders"), Domain::Orders);
        assert_eq!(domain_of("Customers"), Domain::Customers);
        assert_eq!(domain_of("stock_levels"), Domain::Inventory);
        assert_eq!(domain_of("payments"), Domain::Financial);
        assert_eq!(domain_of("courier_shifts"), Domain::Delivery);
        assert_eq!(domain_of("coupon_codes"), Domain::Discounts);
        assert_eq!(domain_of("audit_log"), Domain::Other);
    }

    #[test]
    fn test_context_annotates_columns_and_relationships() {
        let text = format_context(&shop_snapshot());
        assert!(text.starts_with("## Database: shop (4 tables)"));
        assert!(text.contains("Extensions: plpgsql 1.0"));
        assert!(text.contains("### Orders"));
        assert!(text.contains("    - id integer [PK, NOT NULL]"));
        assert!(text.contains("    - customer_id integer [FK -> customers.id]"));
        assert!(text.contains("    - customer_id -> customers.id"));
        assert!(text.contains("    - id <- order_items.order_id"));
        assert!(text.contains("    - total_amount numeric\n"));
        // Orders group comes before Customers.
        assert!(text.find("### Orders").unwrap() < text.find("### Customers").unwrap());
    }

    #[test]
    fn test_failed_table_is_flagged() {
        let mut snapshot = shop_snapshot();
        snapshot.tables.push(Table::failed("payroll", "permission denied"));
        snapshot.total_tables += 1;
        let text = format_context(&snapshot);
        assert!(text.contains("could not be inspected: payroll"));
        assert!(text.contains("Table payroll (structure unavailable: permission denied)"));
    }
}
