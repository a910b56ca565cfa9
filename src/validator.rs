//! Safety Validator
//!
//! Only single, read-only `SELECT`/`WITH` statements pass. Keyword checks run
//! on text with comments and quoted literal contents removed, so a literal
//! containing "DELETE" or a column named `update_count` is inert.

use crate::error::CopilotError;
use crate::sql_scan::{self, Dangling, Imbalance};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::{debug, warn};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "TRUNCATE", "EXEC", "EXECUTE",
    "GRANT", "REVOKE", "INTO", "COPY", "MERGE", "CALL",
];

lazy_static! {
    static ref FORBIDDEN: Regex = Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|")))
        .expect("forbidden keyword pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason")]
pub enum Verdict {
    Accepted,
    RejectedUnsafe(String),
    RejectedMalformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedQuery {
    pub sql: String,
    pub verdict: Verdict,
}

/// SQL that passed validation. Only [`validate`] can produce one, and the
/// executor accepts nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSql(String);

impl AcceptedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AcceptedSql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ValidatedQuery {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }

    /// The executable form, if accepted.
    pub fn accepted(&self) -> Option<AcceptedSql> {
        match self.verdict {
            Verdict::Accepted => Some(AcceptedSql(self.sql.clone())),
            _ => None,
        }
    }

    /// Executable SQL or the matching validation error.
    pub fn into_result(self) -> Result<AcceptedSql, CopilotError> {
        match self.verdict {
            Verdict::Accepted => Ok(AcceptedSql(self.sql)),
            Verdict::RejectedUnsafe(reason) => Err(CopilotError::ValidationUnsafe { sql: self.sql, reason }),
            Verdict::RejectedMalformed(reason) => {
                Err(CopilotError::ValidationMalformed { sql: self.sql, reason })
            }
        }
    }
}

/// Validate one candidate statement.
pub fn validate(candidate: &str) -> ValidatedQuery {
    let sql = normalize(candidate);
    let verdict = verdict_for(&sql);
    match &verdict {
        Verdict::Accepted => debug!("Query accepted"),
        Verdict::RejectedUnsafe(reason) => warn!("Rejected unsafe query ({}): {}", reason, sql),
        Verdict::RejectedMalformed(reason) => warn!("Rejected malformed query ({}): {}", reason, sql),
    }
    ValidatedQuery { sql, verdict }
}

/// Trim whitespace and trailing semicolons.
fn normalize(candidate: &str) -> String {
    let mut sql = candidate.trim();
    while let Some(rest) = sql.strip_suffix(';') {
        sql = rest.trim_end();
    }
    sql.to_string()
}

fn verdict_for(sql: &str) -> Verdict {
    if sql.is_empty() {
        return Verdict::RejectedMalformed("empty statement".to_string());
    }

    let (stripped, lexer) = sql_scan::strip(sql);

    if let Some(hit) = FORBIDDEN.find(&stripped) {
        return Verdict::RejectedUnsafe(format!(
            "forbidden keyword {}",
            hit.as_str().to_uppercase()
        ));
    }
    if !sql_scan::starts_with_query_keyword(&stripped) {
        return Verdict::RejectedUnsafe("only SELECT or WITH statements may run".to_string());
    }
    if stripped.contains(';') {
        return Verdict::RejectedUnsafe("multiple statements".to_string());
    }
    if let Some(reason) = token_violation(sql) {
        return Verdict::RejectedUnsafe(reason);
    }

    if let Some(imbalance) = lexer.imbalance() {
        return Verdict::RejectedMalformed(describe_imbalance(imbalance));
    }
    let commentless = sql_scan::strip_comments(sql);
    for quote in ['\'', '"'] {
        if commentless.matches(quote).count() % 2 != 0 {
            return Verdict::RejectedMalformed(format!("odd number of {} quotes", quote));
        }
    }
    let last_line = stripped.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if let Some(dangling) = sql_scan::dangling_tail(last_line) {
        return Verdict::RejectedMalformed(match dangling {
            Dangling::Keyword(k) => format!("statement ends with dangling keyword {}", k),
            Dangling::Operator(op) => format!("statement ends with dangling operator '{}'", op),
        });
    }

    Verdict::Accepted
}

/// Second opinion from the PostgreSQL tokenizer. Text it cannot tokenize is
/// left to the scanner's verdict.
fn token_violation(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!("tokenizer gave up on candidate: {}", e);
            return None;
        }
    };
    tokens.iter().find_map(|token| match token {
        Token::SemiColon => Some("multiple statements".to_string()),
        Token::Word(word) if word.quote_style.is_none() => {
            let upper = word.value.to_uppercase();
            FORBIDDEN_KEYWORDS
                .contains(&upper.as_str())
                .then(|| format!("forbidden keyword {}", upper))
        }
        _ => None,
    })
}

fn describe_imbalance(imbalance: Imbalance) -> String {
    match imbalance {
        Imbalance::UnclosedSingleQuote => "unterminated string literal".to_string(),
        Imbalance::UnclosedDoubleQuote => "unterminated quoted identifier".to_string(),
        Imbalance::UnclosedDollarQuote => "unterminated dollar-quoted string".to_string(),
        Imbalance::UnclosedBlockComment => "unterminated block comment".to_string(),
        Imbalance::UnclosedParen(n) => format!("{} unclosed parenthesis", n),
        Imbalance::UnmatchedCloseParen => "unmatched closing parenthesis".to_string(),
    }
}
