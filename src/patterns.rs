//! Deterministic Pattern Fallback
//!
//! Template SQL for a fixed set of question shapes. Every template first
//! locates its table and columns in the snapshot by name heuristics and
//! yields nothing unless all of them were found.

use crate::schema::model::{Column, SchemaSnapshot, Table};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

lazy_static! {
    static ref GROWTH: Regex =
        Regex::new(r"\b(growth|month[- ]over[- ]month|mom|grew|increase per month)\b").expect("valid pattern");
    static ref MONTHLY: Regex =
        Regex::new(r"\b(by|per|each|every|grouped by) month\b|\bmonthly\b|\bmonth by month\b").expect("valid pattern");
    static ref DAILY: Regex =
        Regex::new(r"\b(by|per|each|every|grouped by) day\b|\bdaily\b|\bday by day\b").expect("valid pattern");
    static ref STATUS: Regex = Regex::new(r"\bstatus(es)?\b|\bstate\b").expect("valid pattern");
    static ref CUSTOMER: Regex =
        Regex::new(r"\b(customers?|clients?|users?|buyers?|accounts?)\b").expect("valid pattern");
    static ref MONEY: Regex =
        Regex::new(r"\b(revenue|spent|spend|spending|sales|amount|total|value)\b").expect("valid pattern");
    static ref ORDER_THRESHOLD: Regex = Regex::new(
        r"\b(more than|over|greater than|above|at least|>=?)\s*(\d+)\s+(orders?|purchases?)"
    )
    .expect("valid pattern");
    static ref QUANTITY_THRESHOLD: Regex = Regex::new(
        r"\b(quantity|quantities|qty|units?|items?)\b.*?\b(more than|over|greater than|above|at least|>=?)\s*(\d+)"
    )
    .expect("valid pattern");
}

const DATE_COLUMN_NAMES: &[&str] = &["created_at", "createdat", "order_date", "orderdate", "created", "ordered_at", "date"];
const AMOUNT_COLUMN_NAMES: &[&str] = &["total_amount", "amount", "grand_total", "total", "total_price", "revenue", "price", "value"];
const NAME_COLUMN_NAMES: &[&str] = &["full_name", "name", "customer_name", "display_name", "company_name", "email"];
const QUANTITY_COLUMN_NAMES: &[&str] = &["quantity", "qty", "units", "count"];

/// Comparison against a user-supplied threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Threshold {
    pub op: &'static str,
    pub value: u64,
}

impl Threshold {
    fn parse(comparator: &str, value: &str) -> Option<Self> {
        let value = value.parse().ok()?;
        let op = match comparator.trim() {
            "at least" | ">=" => ">=",
            _ => ">",
        };
        Some(Self { op, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "pattern", rename_all = "camelCase")]
pub enum PatternKind {
    MonthlyGrouping,
    DailyGrouping,
    StatusBreakdown,
    CustomerRevenue { min_orders: Option<Threshold> },
    MonthOverMonthGrowth,
    LineQuantityThreshold { min_quantity: Threshold },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternMatch {
    pub kind: PatternKind,
    pub table: String,
    pub sql: String,
}

/// Recognize a question shape. Shapes are tried from most to least specific.
pub fn detect_intent(question: &str) -> Option<PatternKind> {
    let q = question.to_lowercase();

    if GROWTH.is_match(&q) {
        return Some(PatternKind::MonthOverMonthGrowth);
    }
    if CUSTOMER.is_match(&q) && MONEY.is_match(&q) {
        let min_orders = ORDER_THRESHOLD
            .captures(&q)
            .and_then(|c| Threshold::parse(&c[1], &c[2]));
        return Some(PatternKind::CustomerRevenue { min_orders });
    }
    if let Some(c) = QUANTITY_THRESHOLD.captures(&q) {
        if let Some(min_quantity) = Threshold::parse(&c[2], &c[3]) {
            return Some(PatternKind::LineQuantityThreshold { min_quantity });
        }
    }
    if STATUS.is_match(&q) {
        return Some(PatternKind::StatusBreakdown);
    }
    if MONTHLY.is_match(&q) {
        return Some(PatternKind::MonthlyGrouping);
    }
    if DAILY.is_match(&q) {
        return Some(PatternKind::DailyGrouping);
    }
    None
}

/// Template SQL for `question`, if its shape is known and the schema has what it needs.
pub fn generate(snapshot: &SchemaSnapshot, question: &str) -> Option<PatternMatch> {
    let kind = detect_intent(question)?;
    let orders = find_orders_table(snapshot)?;

    let sql = match &kind {
        PatternKind::MonthlyGrouping => monthly(orders)?,
        PatternKind::DailyGrouping => daily(orders)?,
        PatternKind::StatusBreakdown => status_breakdown(orders)?,
        PatternKind::CustomerRevenue { min_orders } => customer_revenue(snapshot, orders, *min_orders)?,
        PatternKind::MonthOverMonthGrowth => month_over_month(orders)?,
        PatternKind::LineQuantityThreshold { min_quantity } => line_quantity(snapshot, orders, *min_quantity)?,
    };

    debug!("Pattern {:?} matched on table {}", kind, orders.name);
    Some(PatternMatch {
        kind,
        table: orders.name.clone(),
        sql,
    })
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn usable(snapshot: &SchemaSnapshot) -> impl Iterator<Item = &Table> {
    snapshot.tables.iter().filter(|t| !t.is_failed())
}

fn is_line_table(name: &str) -> bool {
    ["item", "line", "detail", "product"].iter().any(|k| name.contains(k))
}

/// Most likely orders table: exact `orders`, then `*_orders`, then any
/// `order` table that is not a line-item table; shortest name wins ties.
pub fn find_orders_table(snapshot: &SchemaSnapshot) -> Option<&Table> {
    usable(snapshot)
        .filter_map(|t| {
            let name = t.name.to_lowercase();
            let rank = if name == "orders" || name == "order" {
                0
            } else if name.ends_with("_orders") || name.starts_with("orders_") {
                1
            } else if name.contains("order") && !is_line_table(&name) {
                2
            } else {
                return None;
            };
            Some((rank, t.name.len(), t))
        })
        .min_by_key(|(rank, len, _)| (*rank, *len))
        .map(|(_, _, t)| t)
}

fn by_names<'a>(table: &'a Table, names: &[&str], accept: impl Fn(&Column) -> bool) -> Option<&'a Column> {
    names.iter().find_map(|wanted| {
        table
            .columns
            .iter()
            .find(|c| c.name.to_lowercase() == *wanted && accept(c))
    })
}

pub fn find_date_column(table: &Table) -> Option<&Column> {
    by_names(table, DATE_COLUMN_NAMES, |c| c.is_temporal() || c.data_type.is_empty())
        .or_else(|| table.columns.iter().find(|c| c.is_temporal()))
}

pub fn find_amount_column(table: &Table) -> Option<&Column> {
    by_names(table, AMOUNT_COLUMN_NAMES, Column::is_numeric).or_else(|| {
        table.columns.iter().find(|c| {
            let n = c.name.to_lowercase();
            c.is_numeric() && (n.contains("amount") || n.contains("total") || n.contains("revenue"))
        })
    })
}

pub fn find_status_column(table: &Table) -> Option<&Column> {
    table
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case("status"))
        .or_else(|| {
            table.columns.iter().find(|c| {
                let n = c.name.to_lowercase();
                (n.contains("status") || n.ends_with("state")) && !c.is_temporal()
            })
        })
}

/// The column pointing at the customer, preferring a real FK to a customer-like table.
pub fn find_account_column(table: &Table) -> Option<&Column> {
    const ACCOUNT_WORDS: &[&str] = &["customer", "client", "user", "account", "buyer", "member"];
    table
        .columns
        .iter()
        .find(|c| {
            c.foreign_key_ref
                .as_ref()
                .is_some_and(|r| ACCOUNT_WORDS.iter().any(|w| r.table.to_lowercase().contains(w)))
        })
        .or_else(|| {
            table.columns.iter().find(|c| {
                let n = c.name.to_lowercase();
                n.ends_with("_id") && ACCOUNT_WORDS.iter().any(|w| n.contains(w))
            })
        })
}

fn monthly(orders: &Table) -> Option<String> {
    let date = quote_ident(&find_date_column(orders)?.name);
    Some(format!(
        "SELECT EXTRACT(YEAR FROM {d})::int AS year, EXTRACT(MONTH FROM {d})::int AS month, COUNT(*) AS value\n\
         FROM {t}\n\
         GROUP BY EXTRACT(YEAR FROM {d}), EXTRACT(MONTH FROM {d})\n\
         ORDER BY year, month",
        d = date,
        t = quote_ident(&orders.name)
    ))
}

fn daily(orders: &Table) -> Option<String> {
    let date = quote_ident(&find_date_column(orders)?.name);
    Some(format!(
        "SELECT DATE({d}) AS name, COUNT(*) AS value\n\
         FROM {t}\n\
         WHERE {d} >= NOW() - INTERVAL '30 days'\n\
         GROUP BY DATE({d})\n\
         ORDER BY name",
        d = date,
        t = quote_ident(&orders.name)
    ))
}

fn status_breakdown(orders: &Table) -> Option<String> {
    let status = quote_ident(&find_status_column(orders)?.name);
    let date = quote_ident(&find_date_column(orders)?.name);
    Some(format!(
        "SELECT {s} AS name, COUNT(*) AS value\n\
         FROM {t}\n\
         WHERE {d} >= DATE_TRUNC('month', NOW())\n\
         GROUP BY {s}\n\
         ORDER BY value DESC",
        s = status,
        d = date,
        t = quote_ident(&orders.name)
    ))
}

fn customer_revenue(snapshot: &SchemaSnapshot, orders: &Table, min_orders: Option<Threshold>) -> Option<String> {
    let account = find_account_column(orders)?;
    let amount = quote_ident(&find_amount_column(orders)?.name);
    let having = min_orders
        .map(|t| format!("\nHAVING COUNT(*) {} {}", t.op, t.value))
        .unwrap_or_default();

    // Show a readable name when the customer table is one FK hop away.
    let named = account.foreign_key_ref.as_ref().and_then(|r| {
        let path = snapshot.relationship_graph().join_path(&orders.name, &r.table)?;
        let [step] = path.as_slice() else {
            return None;
        };
        let customers = snapshot.table(&step.to_table).filter(|t| !t.is_failed())?;
        let name_col = by_names(customers, NAME_COLUMN_NAMES, |_| true)?;
        Some((step.clone(), customers.name.clone(), name_col.name.clone()))
    });

    let sql = match named {
        Some((step, customers, name_col)) => format!(
            "SELECT c.{n} AS name, SUM(o.{a}) AS value, COUNT(*) AS order_count\n\
             FROM {o} o\n\
             JOIN {c} c ON o.{fc} = c.{tc}\n\
             GROUP BY c.{tc}, c.{n}{h}\n\
             ORDER BY value DESC\n\
             LIMIT 20",
            n = quote_ident(&name_col),
            a = amount,
            o = quote_ident(&orders.name),
            c = quote_ident(&customers),
            fc = quote_ident(&step.from_column),
            tc = quote_ident(&step.to_column),
            h = having
        ),
        None => format!(
            "SELECT o.{k} AS name, SUM(o.{a}) AS value, COUNT(*) AS order_count\n\
             FROM {o} o\n\
             GROUP BY o.{k}{h}\n\
             ORDER BY value DESC\n\
             LIMIT 20",
            k = quote_ident(&account.name),
            a = amount,
            o = quote_ident(&orders.name),
            h = having
        ),
    };
    Some(sql)
}

fn month_over_month(orders: &Table) -> Option<String> {
    let date = quote_ident(&find_date_column(orders)?.name);
    let measure = match find_amount_column(orders) {
        Some(amount) => format!("SUM({})", quote_ident(&amount.name)),
        None => "COUNT(*)".to_string(),
    };
    Some(format!(
        "WITH monthly AS (\n\
         \x20 SELECT DATE_TRUNC('month', {d}) AS month, {m} AS total\n\
         \x20 FROM {t}\n\
         \x20 GROUP BY DATE_TRUNC('month', {d})\n\
         )\n\
         SELECT TO_CHAR(month, 'YYYY-MM') AS name, total AS value,\n\
         \x20 ROUND(((total - LAG(total) OVER (ORDER BY month)) * 100.0 / NULLIF(LAG(total) OVER (ORDER BY month), 0))::numeric, 2) AS growth_pct\n\
         FROM monthly\n\
         ORDER BY month",
        d = date,
        m = measure,
        t = quote_ident(&orders.name)
    ))
}

fn line_quantity(snapshot: &SchemaSnapshot, orders: &Table, min_quantity: Threshold) -> Option<String> {
    let graph = snapshot.relationship_graph();
    let (lines, step, quantity) = usable(snapshot)
        .filter(|t| t.name != orders.name && is_line_table(&t.name.to_lowercase()))
        .find_map(|t| {
            let quantity = by_names(t, QUANTITY_COLUMN_NAMES, Column::is_numeric)?;
            let path = graph.join_path(&t.name, &orders.name)?;
            match path.as_slice() {
                [step] => Some((t, step.clone(), quantity)),
                _ => None,
            }
        })?;
    // Label rows by the primary key, or by the column the line table references.
    let order_key = orders.primary_key.first().unwrap_or(&step.to_column);

    Some(format!(
        "SELECT o.{k} AS name, i.{q} AS value\n\
         FROM {o} o\n\
         JOIN {l} i ON i.{fc} = o.{tc}\n\
         WHERE i.{q} {op} {n}\n\
         ORDER BY value DESC\n\
         LIMIT 100",
        k = quote_ident(order_key),
        q = quote_ident(&quantity.name),
        o = quote_ident(&orders.name),
        l = quote_ident(&lines.name),
        fc = quote_ident(&step.from_column),
        tc = quote_ident(&step.to_column),
        op = min_quantity.op,
        n = min_quantity.value
    ))
}
