//! SQL extraction from free-form oracle replies
//!
//! Extraction is a small state machine:
//!
//! ```text
//! Scanning --query keyword--> FoundStart --first line--> TrackingBalance
//! TrackingBalance --block ends, balanced--> Complete
//! TrackingBalance --block ends, open literal/paren/dangling tail--> Incomplete
//! Incomplete --stitch continuation lines--> Complete | Incomplete
//! ```
//!
//! The first block ends at a blank line, a code fence, an explanation-like
//! line or a semicolon. An incomplete block is continued from the untouched
//! reply, skipping fences and blank lines, for a bounded number of lines.

use crate::sql_scan::{self, Lexer};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on lines appended while stitching a continuation.
pub const MAX_STITCH_LINES: usize = 10;

const EXPLANATION_PREFIXES: &[&str] = &[
    "This ", "This:", "The ", "Note", "Here ", "Here's", "Explanation", "In this", "It ",
];

lazy_static! {
    static ref SQL_LABEL: Regex = Regex::new(r"(?i)^\s*(sql(\s+query)?|query)\s*:\s*").expect("label pattern is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletenessState {
    Complete,
    Incomplete,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCandidate {
    pub raw_model_text: String,
    #[serde(rename = "extractedSQL")]
    pub extracted_sql: Option<String>,
    pub completeness_state: CompletenessState,
}

impl QueryCandidate {
    pub fn absent(raw_model_text: impl Into<String>) -> Self {
        Self {
            raw_model_text: raw_model_text.into(),
            extracted_sql: None,
            completeness_state: CompletenessState::Absent,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness_state == CompletenessState::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    Scanning,
    FoundStart,
    TrackingBalance,
    Complete,
    Incomplete,
}

/// Why the first block stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEnd {
    Semicolon,
    BlankOrFence,
    Explanation,
    EndOfReply,
}

struct Extractor {
    state: ExtractState,
    lexer: Lexer,
    stripped: String,
    sql: String,
    /// Index of the last line consumed, in reply line numbering.
    last_line: usize,
    history: Vec<ExtractState>,
}

impl Extractor {
    fn new() -> Self {
        Self {
            state: ExtractState::Scanning,
            lexer: Lexer::new(),
            stripped: String::new(),
            sql: String::new(),
            last_line: 0,
            history: vec![ExtractState::Scanning],
        }
    }

    fn transition(&mut self, next: ExtractState) {
        if self.state != next {
            debug!("extract: {:?} -> {:?}", self.state, next);
            self.state = next;
            self.history.push(next);
        }
    }

    /// Append one line; returns true when it carried the statement terminator.
    fn push_line(&mut self, index: usize, line: &str) -> bool {
        // Lines skipped since the last push mean the reply was cut and resumed.
        let resumed = !self.sql.is_empty() && index > self.last_line + 1;
        let separator = if self.sql.is_empty() {
            ""
        } else if resumed && self.lexer.in_literal() {
            // A literal cut by the truncation is rejoined without a newline.
            if self.sql.ends_with(|c: char| c == '\'' || c == '"' || c.is_whitespace()) {
                ""
            } else {
                " "
            }
        } else {
            "\n"
        };
        let mut out = String::new();
        self.lexer.feed(separator, &mut out);
        self.lexer.feed(line, &mut out);
        self.sql.push_str(separator);
        self.sql.push_str(line);
        self.stripped.push_str(&out);
        self.last_line = index;

        if out.contains(';') {
            if let Some(end) = sql_scan::statement_end(&self.sql) {
                self.sql.truncate(end);
                let (stripped, lexer) = sql_scan::strip(&self.sql);
                self.stripped = stripped;
                self.lexer = lexer;
            }
            return true;
        }
        false
    }

    fn looks_complete(&self) -> bool {
        self.lexer.is_balanced() && sql_scan::dangling_tail(&self.stripped).is_none()
    }

    fn settle(&mut self) {
        let next = if self.looks_complete() {
            ExtractState::Complete
        } else {
            ExtractState::Incomplete
        };
        self.transition(next);
    }
}

/// Remove a `SQL:` label and inline fence markers from one line.
fn clean_line(line: &str) -> String {
    let line = SQL_LABEL.replace(line, "");
    let line = line.trim_end();
    let line = line.strip_suffix("```").unwrap_or(line);
    line.trim_end().to_string()
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_explanation(line: &str) -> bool {
    let line = line.trim_start();
    EXPLANATION_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Extract one statement from an oracle reply.
pub fn extract(raw: &str) -> QueryCandidate {
    let (sql, state, _) = run(raw);
    match sql {
        Some(sql) if !sql.trim().is_empty() => QueryCandidate {
            raw_model_text: raw.to_string(),
            extracted_sql: Some(sql.trim().to_string()),
            completeness_state: if state == ExtractState::Complete {
                CompletenessState::Complete
            } else {
                CompletenessState::Incomplete
            },
        },
        _ => QueryCandidate::absent(raw),
    }
}

fn run(raw: &str) -> (Option<String>, ExtractState, Vec<ExtractState>) {
    let raw_lines: Vec<&str> = raw.lines().collect();
    // Cleaning is per line, so indices stay aligned with the untouched reply.
    let cleaned: Vec<Option<String>> = raw_lines
        .iter()
        .map(|l| if is_fence(l) { None } else { Some(clean_line(l)) })
        .collect();

    let mut ex = Extractor::new();

    let start = cleaned.iter().position(|l| {
        l.as_deref()
            .is_some_and(|l| sql_scan::starts_with_query_keyword(&sql_scan::strip(l).0))
    });
    let Some(start) = start else {
        return (None, ex.state, ex.history);
    };
    ex.transition(ExtractState::FoundStart);

    let mut end = BlockEnd::EndOfReply;
    for (index, line) in cleaned.iter().enumerate().skip(start) {
        let Some(line) = line.as_deref().filter(|l| !l.trim().is_empty()) else {
            end = BlockEnd::BlankOrFence;
            break;
        };
        if ex.state == ExtractState::TrackingBalance
            && !ex.lexer.in_literal()
            && is_explanation(line)
        {
            end = BlockEnd::Explanation;
            break;
        }
        let terminated = ex.push_line(index, line);
        ex.transition(ExtractState::TrackingBalance);
        if terminated {
            end = BlockEnd::Semicolon;
            break;
        }
    }
    ex.settle();

    if ex.state == ExtractState::Incomplete && end == BlockEnd::BlankOrFence {
        stitch(&mut ex, &raw_lines);
        ex.settle();
    }

    (Some(ex.sql.clone()), ex.state, ex.history)
}

/// Continue an incomplete statement from the reply lines after the block.
fn stitch(ex: &mut Extractor, raw_lines: &[&str]) {
    let mut appended = 0;
    for (index, raw_line) in raw_lines.iter().enumerate().skip(ex.last_line + 1) {
        let line = if is_fence(raw_line) { String::new() } else { clean_line(raw_line) };
        if line.trim().is_empty() {
            if ex.looks_complete() {
                break;
            }
            continue;
        }
        if !ex.lexer.in_literal() && is_explanation(&line) {
            break;
        }
        if appended == MAX_STITCH_LINES {
            debug!("extract: continuation capped at {} lines", MAX_STITCH_LINES);
            break;
        }
        appended += 1;
        if ex.push_line(index, &line) {
            break;
        }
    }
    if appended > 0 {
        debug!("extract: stitched {} continuation lines", appended);
    }
}
