//! Result Formatter
//!
//! Shapes an execution result for the downstream response generator: a
//! bounded, enumerated text briefing marked as authoritative, and
//! name/value tuples for charting.

use crate::db::executor::QueryExecutionResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write;

const LABEL_COLUMN_HINTS: &[&str] = &[
    "name", "label", "category", "status", "period", "month", "date", "day", "week", "year", "title",
];
const VALUE_COLUMN_HINTS: &[&str] = &["value", "count", "total", "sum", "amount", "revenue", "avg", "average"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub name: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChartTuples {
    Single(Vec<ChartPoint>),
    Multi(Vec<SeriesPoint>),
}

impl ChartTuples {
    pub fn len(&self) -> usize {
        match self {
            ChartTuples::Single(points) => points.len(),
            ChartTuples::Multi(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ResultFormatter {
    pub max_rows: usize,
    pub max_points: usize,
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self {
            max_rows: 30,
            max_points: 20,
        }
    }
}

impl ResultFormatter {
    pub fn new(max_rows: usize, max_points: usize) -> Self {
        Self { max_rows, max_points }
    }

    /// Enumerated text block for the response generator.
    pub fn format(&self, result: &QueryExecutionResult) -> String {
        let mut out = String::new();
        if result.is_empty() {
            out.push_str("QUERY RESULTS (authoritative): the query returned no rows. Say so directly; do not invent data.\n");
            return out;
        }

        let _ = writeln!(
            out,
            "QUERY RESULTS (authoritative - use this data directly, do not estimate or invent values): {} row(s)",
            result.row_count
        );
        if !result.columns.is_empty() {
            let _ = writeln!(out, "Columns: {}", result.columns.join(", "));
        }

        for (i, row) in result.rows.iter().take(self.max_rows).enumerate() {
            let fields: Vec<String> = ordered_fields(result, row)
                .map(|(key, value)| format!("{}: {}", key, render_value(value)))
                .collect();
            let _ = writeln!(out, "{}. {}", i + 1, fields.join(" | "));
        }
        if result.row_count > self.max_rows {
            let _ = writeln!(out, "(showing first {} of {} rows)", self.max_rows, result.row_count);
        }
        out
    }

    /// Label/value tuples, multi-series when several numeric columns qualify.
    pub fn to_chart_tuples(&self, result: &QueryExecutionResult) -> ChartTuples {
        let columns = column_names(result);
        if columns.is_empty() {
            return ChartTuples::Single(Vec::new());
        }

        let label = pick_label_column(result, &columns);
        let month_label = label.as_deref() == Some("month")
            && columns.iter().any(|c| c == "year")
            && columns.iter().any(|c| c == "month");

        let numeric: Vec<&String> = columns
            .iter()
            .filter(|c| Some(c.as_str()) != label.as_deref())
            .filter(|c| !(month_label && c.as_str() == "year"))
            .filter(|c| !is_identifier_column(c))
            .filter(|c| is_numeric_column(result, c))
            .collect();
        if numeric.is_empty() {
            return ChartTuples::Single(Vec::new());
        }

        let hinted: Vec<&String> = numeric
            .iter()
            .copied()
            .filter(|c| {
                let lower = c.to_lowercase();
                VALUE_COLUMN_HINTS.iter().any(|h| lower.contains(h))
            })
            .collect();

        let label_of = |index: usize, row: &Map<String, Value>| -> String {
            if month_label {
                let year = row.get("year").and_then(as_number).map(|y| y as i64);
                let month = row.get("month").and_then(as_number).map(|m| m as i64);
                if let (Some(y), Some(m)) = (year, month) {
                    return format!("{:04}-{:02}", y, m);
                }
            }
            match label.as_deref().and_then(|l| row.get(l)) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => format!("#{}", index + 1),
                Some(other) => other.to_string(),
            }
        };

        let rows = result.rows.iter().take(self.max_points).enumerate();

        if let Some(value_col) = numeric.iter().find(|c| c.as_str() == "value") {
            return ChartTuples::Single(
                rows.map(|(i, row)| ChartPoint {
                    name: label_of(i, row),
                    value: row.get(value_col.as_str()).and_then(as_number).unwrap_or(0.0),
                })
                .collect(),
            );
        }

        let series: Vec<&String> = if hinted.len() > 1 {
            hinted
        } else if let Some(first) = hinted.first() {
            vec![*first]
        } else {
            numeric
        };

        if series.len() == 1 {
            let col = series[0].as_str();
            ChartTuples::Single(
                rows.map(|(i, row)| ChartPoint {
                    name: label_of(i, row),
                    value: row.get(col).and_then(as_number).unwrap_or(0.0),
                })
                .collect(),
            )
        } else {
            ChartTuples::Multi(
                rows.map(|(i, row)| SeriesPoint {
                    name: label_of(i, row),
                    values: series
                        .iter()
                        .map(|c| (c.to_string(), row.get(c.as_str()).and_then(as_number).unwrap_or(0.0)))
                        .collect(),
                })
                .collect(),
            )
        }
    }
}

/// Column order from the result, or from the first row when the result has none.
fn column_names(result: &QueryExecutionResult) -> Vec<String> {
    if !result.columns.is_empty() {
        return result.columns.clone();
    }
    result
        .rows
        .first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default()
}

fn ordered_fields<'a>(
    result: &'a QueryExecutionResult,
    row: &'a Map<String, Value>,
) -> Box<dyn Iterator<Item = (&'a str, &'a Value)> + 'a> {
    if result.columns.is_empty() {
        Box::new(row.iter().map(|(k, v)| (k.as_str(), v)))
    } else {
        Box::new(
            result
                .columns
                .iter()
                .filter_map(move |c| row.get(c).map(|v| (c.as_str(), v))),
        )
    }
}

fn pick_label_column(result: &QueryExecutionResult, columns: &[String]) -> Option<String> {
    LABEL_COLUMN_HINTS
        .iter()
        .find_map(|hint| columns.iter().find(|c| c.to_lowercase() == *hint))
        .or_else(|| {
            LABEL_COLUMN_HINTS
                .iter()
                .find_map(|hint| columns.iter().find(|c| c.to_lowercase().contains(hint)))
        })
        .or_else(|| columns.iter().find(|c| !is_numeric_column(result, c)))
        .or_else(|| columns.first())
        .cloned()
}

fn is_identifier_column(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "id" || lower.ends_with("_id")
}

fn is_numeric_column(result: &QueryExecutionResult, column: &str) -> bool {
    let mut seen = false;
    for value in result.rows.iter().filter_map(|r| r.get(column)) {
        match value {
            Value::Null => continue,
            v if as_number(v).is_some() => seen = true,
            _ => return false,
        }
    }
    seen
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => match humanize_datetime(s) {
            Some(human) => format!("{} ({})", s, human),
            None => s.clone(),
        },
        other => other.to_string(),
    }
}

/// Human form of a date or timestamp string, if it is one.
pub fn humanize_datetime(text: &str) -> Option<String> {
    let text = text.trim();
    if text.len() < 10 || !text.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).format("%B %-d, %Y %H:%M UTC").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc).format("%B %-d, %Y %H:%M UTC").to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.format("%B %-d, %Y %H:%M").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(d.format("%B %-d, %Y").to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(columns: &[&str], rows: Vec<Value>) -> QueryExecutionResult {
        let rows = rows
            .into_iter()
            .map(|r| match r {
                Value::Object(map) => map,
                _ => panic!("row must be an object"),
            })
            .collect();
        QueryExecutionResult::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn test_briefing_is_enumerated_and_authoritative() {
        let r = result(
            &["name", "value"],
            vec![json!({"name": "Widget", "value": 12}), json!({"name": "Gadget", "value": 7})],
        );
        let text = ResultFormatter::default().format(&r);
        assert!(text.contains("authoritative"));
        assert!(text.contains("1. name: Widget | value: 12"));
        assert!(text.contains("2. name: Gadget | value: 7"));
    }

    #[test]
    fn test_briefing_is_bounded() {
        let rows = (0..50).map(|i| json!({"n": i})).collect();
        let text = ResultFormatter::new(30, 20).format(&result(&["n"], rows));
        assert!(text.contains("30. n: 29"));
        assert!(!text.contains("31. n: 30"));
        assert!(text.contains("(showing first 30 of 50 rows)"));
    }

    #[test]
    fn test_dates_rendered_both_ways() {
        assert_eq!(humanize_datetime("2024-03-05").as_deref(), Some("March 5, 2024"));
        assert_eq!(
            humanize_datetime("2024-03-05 14:30:00+00").as_deref(),
            Some("March 5, 2024 14:30 UTC")
        );
        assert_eq!(humanize_datetime("Widget"), None);
        assert_eq!(humanize_datetime("12"), None);
        let r = result(&["day"], vec![json!({"day": "2024-03-05"})]);
        assert!(ResultFormatter::default().format(&r).contains("2024-03-05 (March 5, 2024)"));
    }

    #[test]
    fn test_empty_result() {
        let text = ResultFormatter::default().format(&QueryExecutionResult::default());
        assert!(text.contains("no rows"));
        assert!(ResultFormatter::default().to_chart_tuples(&QueryExecutionResult::default()).is_empty());
    }

    #[test]
    fn test_single_series_tuples() {
        let r = result(
            &["status", "value"],
            vec![json!({"status": "paid", "value": 10}), json!({"status": "open", "value": "4.5"})],
        );
        assert_eq!(
            ResultFormatter::default().to_chart_tuples(&r),
            ChartTuples::Single(vec![
                ChartPoint { name: "paid".into(), value: 10.0 },
                ChartPoint { name: "open".into(), value: 4.5 },
            ])
        );
    }

    #[test]
    fn test_year_month_label_and_cap() {
        let rows = (1..=24)
            .map(|i| json!({"year": 2023 + (i - 1) / 12, "month": (i - 1) % 12 + 1, "value": i}))
            .collect();
        let tuples = ResultFormatter::default().to_chart_tuples(&result(&["year", "month", "value"], rows));
        let ChartTuples::Single(points) = tuples else {
            panic!("expected single series");
        };
        assert_eq!(points.len(), 20);
        assert_eq!(points[0].name, "2023-01");
        assert_eq!(points[13].name, "2024-02");
    }

    #[test]
    fn test_multi_series_for_year_over_year() {
        let r = result(
            &["month", "revenue_2023", "revenue_2024"],
            vec![json!({"month": "Jan", "revenue_2023": 100, "revenue_2024": 150})],
        );
        let tuples = ResultFormatter::default().to_chart_tuples(&r);
        let ChartTuples::Multi(points) = &tuples else {
            panic!("expected multi series");
        };
        assert_eq!(points[0].name, "Jan");
        assert_eq!(points[0].values["revenue_2024"], 150.0);
        let json = serde_json::to_value(&tuples).unwrap();
        assert_eq!(json[0]["revenue_2023"], json!(100.0));
    }

    #[test]
    fn test_id_columns_are_not_values() {
        let r = result(
            &["customer_id", "order_count"],
            vec![json!({"customer_id": 7, "order_count": 3})],
        );
        assert_eq!(
            ResultFormatter::default().to_chart_tuples(&r),
            ChartTuples::Single(vec![ChartPoint { name: "7".into(), value: 3.0 }])
        );
    }
}
