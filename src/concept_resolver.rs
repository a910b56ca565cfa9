//! Concept Resolver
//!
//! Maps business vocabulary ("customer", "revenue") onto table and column
//! names through small synonym sets, substring hits and Jaro-Winkler
//! near-misses. Suggestions only: nothing here rewrites the question, and an
//! empty result is a normal outcome.

use crate::schema::model::{SchemaSnapshot, Table};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strsim::jaro_winkler;

const SYNONYMS: &[&[&str]] = &[
    &["customer", "client", "account", "user", "member", "buyer"],
    &["order", "purchase", "transaction", "booking", "sale"],
    &["product", "item", "sku", "article", "goods", "catalog"],
    &["revenue", "amount", "total", "price", "payment", "income"],
    &["inventory", "stock", "warehouse", "quantity"],
    &["delivery", "shipment", "shipping", "courier", "dispatch"],
    &["discount", "coupon", "promo", "promotion", "voucher"],
    &["status", "state", "stage"],
    &["employee", "staff", "worker"],
    &["category", "segment", "type"],
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "by", "per", "each", "all", "show", "list", "give", "what",
    "which", "who", "how", "many", "much", "are", "is", "was", "were", "have", "has", "this",
    "that", "last", "than", "more", "less", "top", "most", "grouped", "group", "over", "into",
    "month", "months", "monthly", "day", "days", "daily", "week", "weeks", "year", "years", "count",
    "number", "between", "compare", "growth", "rate", "current", "their", "them", "they", "me",
];

const MAX_CANDIDATES: usize = 5;
const MAX_CONCEPTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTable {
    pub table: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevant_columns: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMatch {
    pub concept: String,
    pub candidate_tables: Vec<CandidateTable>,
}

/// How a table was matched; lower ranks sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HitRank {
    TableName,
    NearMiss,
    ColumnOnly,
}

pub struct ConceptResolver {
    /// Jaro-Winkler similarity needed for a near-miss table name.
    pub similarity_threshold: f64,
}

impl Default for ConceptResolver {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.88,
        }
    }
}

impl ConceptResolver {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Synonym set for a concept, the concept itself first.
    pub fn expand(&self, concept: &str) -> Vec<String> {
        let base = singular(&concept.trim().to_lowercase());
        let mut terms = vec![base.clone()];
        if let Some(set) = SYNONYMS.iter().find(|set| set.contains(&base.as_str())) {
            terms.extend(set.iter().filter(|t| **t != base).map(|t| t.to_string()));
        }
        terms
    }

    /// Candidate tables for one concept. Empty when nothing plausible exists.
    pub fn resolve(&self, snapshot: &SchemaSnapshot, concept: &str) -> Vec<ConceptMatch> {
        let terms = self.expand(concept);
        let Some(base) = terms.first().cloned() else {
            return Vec::new();
        };
        if base.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<(HitRank, CandidateTable)> = snapshot
            .tables
            .iter()
            .filter_map(|table| self.match_table(table, &base, &terms))
            .collect();
        if hits.is_empty() {
            return Vec::new();
        }
        hits.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.table.cmp(&b.1.table)));
        hits.truncate(MAX_CANDIDATES);

        vec![ConceptMatch {
            concept: base,
            candidate_tables: hits.into_iter().map(|(_, c)| c).collect(),
        }]
    }

    /// Resolve every content word of a question that has no exactly named table.
    pub fn resolve_question(&self, snapshot: &SchemaSnapshot, question: &str) -> Vec<ConceptMatch> {
        let table_names: HashSet<String> = snapshot
            .tables
            .iter()
            .flat_map(|t| {
                let lower = t.name.to_lowercase();
                [singular(&lower), lower]
            })
            .collect();

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for word in question
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|w| w.to_lowercase())
            .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
            .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        {
            let base = singular(&word);
            if table_names.contains(&base) || !seen.insert(base.clone()) {
                continue;
            }
            matches.extend(self.resolve(snapshot, &base));
            if matches.len() == MAX_CONCEPTS {
                break;
            }
        }
        matches
    }

    fn match_table(&self, table: &Table, base: &str, terms: &[String]) -> Option<(HitRank, CandidateTable)> {
        let name = table.name.to_lowercase();
        let describe = |term: &str| {
            if term == base {
                format!("\"{}\"", term)
            } else {
                format!("\"{}\", a synonym of \"{}\"", term, base)
            }
        };

        let relevant: Vec<String> = table
            .columns
            .iter()
            .filter(|c| {
                let col = c.name.to_lowercase();
                terms.iter().any(|t| col.contains(t.as_str()))
            })
            .map(|c| c.name.clone())
            .collect();
        let relevant_columns = (!relevant.is_empty()).then(|| relevant.clone());

        if let Some(term) = terms.iter().find(|t| name.contains(t.as_str())) {
            return Some((
                HitRank::TableName,
                CandidateTable {
                    table: table.name.clone(),
                    reason: format!("table name contains {}", describe(term)),
                    relevant_columns,
                },
            ));
        }

        let best = name
            .split('_')
            .filter(|token| token.len() >= 3)
            .map(|token| jaro_winkler(&singular(token), base))
            .fold(0.0_f64, f64::max);
        if best >= self.similarity_threshold {
            return Some((
                HitRank::NearMiss,
                CandidateTable {
                    table: table.name.clone(),
                    reason: format!("table name resembles \"{}\" (similarity {:.2})", base, best),
                    relevant_columns,
                },
            ));
        }

        if !relevant.is_empty() {
            let term = terms
                .iter()
                .find(|t| relevant.iter().any(|c| c.to_lowercase().contains(t.as_str())))
                .map(String::as_str)
                .unwrap_or(base);
            return Some((
                HitRank::ColumnOnly,
                CandidateTable {
                    table: table.name.clone(),
                    reason: format!("column {} matches {}", relevant.join(", "), describe(term)),
                    relevant_columns,
                },
            ));
        }
        None
    }
}

/// Render matches as prompt lines.
pub fn format_suggestions(matches: &[ConceptMatch]) -> String {
    matches
        .iter()
        .map(|m| {
            let candidates: Vec<String> = m
                .candidate_tables
                .iter()
                .map(|c| match &c.relevant_columns {
                    Some(cols) => format!("{} [{}] ({})", c.table, cols.join(", "), c.reason),
                    None => format!("{} ({})", c.table, c.reason),
                })
                .collect();
            format!("- \"{}\": {}", m.concept, candidates.join("; "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn singular(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}
