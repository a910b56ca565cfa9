//! Lexical scanning shared by extraction and validation
//!
//! Not a parser: it only knows where comments and quoted literals begin and
//! end, how deep the parentheses go, and whether a statement's tail is a
//! dangling keyword or operator.

/// Incremental scanner state. Feed text in order; state carries across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lexer {
    depth: i32,
    underflow: bool,
    quote: Option<Quote>,
    escape_pending: bool,
    block_comment: bool,
    /// Length of the identifier run just before the cursor.
    word_len: usize,
    prev: Option<char>,
}

/// The literal the scanner is inside.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Quote {
    /// `'...'`, or `E'...'` when backslash escapes apply.
    Single { backslash_escapes: bool },
    Double,
    /// `$tag$...$tag$`; the tag may be empty.
    Dollar(String),
}

/// What one scanned span of text is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Code,
    Open,
    Body,
    Close,
    /// End of a comment; stands in for the whole comment.
    Comment,
    CommentBody,
}

/// What is still open after scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imbalance {
    UnclosedSingleQuote,
    UnclosedDoubleQuote,
    UnclosedDollarQuote,
    UnclosedBlockComment,
    UnclosedParen(i32),
    UnmatchedCloseParen,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Tag of a dollar-quote delimiter starting at `chars[i]`, if one starts there.
/// `$1` is a parameter, not a delimiter.
fn dollar_tag(chars: &[char], i: usize) -> Option<String> {
    if chars.get(i) != Some(&'$') {
        return None;
    }
    let tag: String = chars[i + 1..].iter().take_while(|c| is_ident_char(**c)).collect();
    if tag.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    match chars.get(i + 1 + tag.chars().count()) {
        Some('$') => Some(tag),
        _ => None,
    }
}

impl Lexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `chunk`, appending its comment-free, literal-free form to `out`.
    /// Quote delimiters are kept so `'DELETE'` becomes `''` and a dollar
    /// quoted body becomes `$$$$`.
    pub fn feed(&mut self, chunk: &str, out: &mut String) {
        self.scan(chunk, |start, end, class| match class {
            Class::Code => out.push_str(&chunk[start..end]),
            Class::Open | Class::Close if chunk[start..end].starts_with('$') => out.push_str("$$"),
            Class::Open | Class::Close => out.push_str(&chunk[start..end]),
            Class::Comment => out.push(' '),
            Class::Body | Class::CommentBody => {}
        });
    }

    /// Walk `chunk`, reporting each span as byte offsets with its class.
    /// A line comment ends at a newline or at the end of the chunk.
    fn scan(&mut self, chunk: &str, mut visit: impl FnMut(usize, usize, Class)) {
        let chars: Vec<char> = chunk.chars().collect();
        let offsets: Vec<usize> = chunk
            .char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(chunk.len()))
            .collect();
        let mut i = 0;
        while i < chars.len() {
            let (len, class) = if self.block_comment {
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    self.block_comment = false;
                    (2, Class::Comment)
                } else {
                    (1, Class::CommentBody)
                }
            } else if self.quote.is_some() {
                match self.literal_step(&chars, i) {
                    (len, true) => (len, Class::Close),
                    (len, false) => (len, Class::Body),
                }
            } else {
                self.code_step(&chars, i)
            };
            visit(offsets[i], offsets[i + len], class);
            i += len;
        }
    }

    /// One step inside a literal: chars consumed and whether it closed.
    fn literal_step(&mut self, chars: &[char], i: usize) -> (usize, bool) {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let step = match self.quote.as_ref() {
            None => (1, false),
            Some(Quote::Dollar(tag)) => match dollar_tag(chars, i) {
                Some(found) if &found == tag => (found.chars().count() + 2, true),
                _ => (1, false),
            },
            Some(Quote::Single { backslash_escapes }) => {
                if self.escape_pending {
                    self.escape_pending = false;
                    (1, false)
                } else if *backslash_escapes && c == '\\' {
                    self.escape_pending = true;
                    (1, false)
                } else if c == '\'' && next == Some('\'') {
                    (2, false)
                } else {
                    (1, c == '\'')
                }
            }
            Some(Quote::Double) => {
                if c == '"' && next == Some('"') {
                    (2, false)
                } else {
                    (1, c == '"')
                }
            }
        };
        if step.1 {
            self.quote = None;
        }
        step
    }

    /// One step outside literals and comments.
    fn code_step(&mut self, chars: &[char], i: usize) -> (usize, Class) {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let in_word = self.word_len > 0;
        let e_prefix = self.word_len == 1 && matches!(self.prev, Some('e') | Some('E'));
        let step = match c {
            '-' if next == Some('-') => {
                let len = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .unwrap_or(chars.len() - i);
                (len, Class::Comment)
            }
            '/' if next == Some('*') => {
                self.block_comment = true;
                (2, Class::CommentBody)
            }
            '\'' => {
                self.quote = Some(Quote::Single {
                    backslash_escapes: e_prefix,
                });
                (1, Class::Open)
            }
            '"' => {
                self.quote = Some(Quote::Double);
                (1, Class::Open)
            }
            // `$` inside an identifier is part of the name.
            '$' if !in_word => match dollar_tag(chars, i) {
                Some(tag) => {
                    let len = tag.chars().count() + 2;
                    self.quote = Some(Quote::Dollar(tag));
                    (len, Class::Open)
                }
                None => (1, Class::Code),
            },
            '(' => {
                self.depth += 1;
                (1, Class::Code)
            }
            ')' => {
                self.depth -= 1;
                if self.depth < 0 {
                    self.underflow = true;
                }
                (1, Class::Code)
            }
            _ => (1, Class::Code),
        };
        if step.1 == Class::Code && (is_ident_char(c) || (c == '$' && in_word)) {
            self.word_len += 1;
        } else {
            self.word_len = 0;
        }
        self.prev = Some(c);
        step
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn in_literal(&self) -> bool {
        self.quote.is_some()
    }

    pub fn in_block_comment(&self) -> bool {
        self.block_comment
    }

    /// First thing left open, if any.
    pub fn imbalance(&self) -> Option<Imbalance> {
        if self.underflow {
            return Some(Imbalance::UnmatchedCloseParen);
        }
        match self.quote {
            Some(Quote::Single { .. }) => return Some(Imbalance::UnclosedSingleQuote),
            Some(Quote::Double) => return Some(Imbalance::UnclosedDoubleQuote),
            Some(Quote::Dollar(_)) => return Some(Imbalance::UnclosedDollarQuote),
            None => {}
        }
        if self.block_comment {
            return Some(Imbalance::UnclosedBlockComment);
        }
        if self.depth > 0 {
            return Some(Imbalance::UnclosedParen(self.depth));
        }
        None
    }

    pub fn is_balanced(&self) -> bool {
        self.imbalance().is_none()
    }
}

/// Strip comments and literal contents from a whole statement.
pub fn strip(text: &str) -> (String, Lexer) {
    let mut lexer = Lexer::new();
    let mut out = String::with_capacity(text.len());
    lexer.feed(text, &mut out);
    (out, lexer)
}

/// Remove comments only, keeping literals intact.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    Lexer::new().scan(text, |start, end, class| match class {
        Class::Comment => out.push(' '),
        Class::CommentBody => {}
        _ => out.push_str(&text[start..end]),
    });
    out
}

/// Byte offset of the first `;` outside comments and literals.
pub fn statement_end(text: &str) -> Option<usize> {
    let mut found = None;
    Lexer::new().scan(text, |start, end, class| {
        if found.is_none() && class == Class::Code && &text[start..end] == ";" {
            found = Some(start);
        }
    });
    found
}

/// A statement tail that cannot end a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dangling {
    Keyword(String),
    Operator(char),
}

const DANGLING_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "JOIN", "INNER", "LEFT", "RIGHT", "FULL",
    "OUTER", "CROSS", "ON", "GROUP", "ORDER", "BY", "HAVING", "LIMIT", "OFFSET", "AS", "IN",
    "IS", "LIKE", "ILIKE", "BETWEEN", "INTERVAL", "CASE", "WHEN", "THEN", "ELSE", "UNION",
    "INTERSECT", "EXCEPT", "WITH", "DISTINCT", "OVER", "PARTITION", "USING", "ALL", "ANY",
    "EXISTS", "FILTER", "WITHIN",
];

const DANGLING_OPERATORS: &[char] = &[',', '=', '<', '>', '+', '-', '*', '/', '(', '|', '%', '.', '!', '^', ':'];

/// Check whether already-stripped statement text ends mid-keyword or mid-operator.
pub fn dangling_tail(stripped: &str) -> Option<Dangling> {
    let trimmed = stripped.trim_end().trim_end_matches(';').trim_end();
    let last = trimmed.chars().last()?;
    if DANGLING_OPERATORS.contains(&last) {
        return Some(Dangling::Operator(last));
    }
    let word: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let upper = word.to_uppercase();
    if DANGLING_KEYWORDS.contains(&upper.as_str()) {
        return Some(Dangling::Keyword(upper));
    }
    None
}

/// Whether `text` (already stripped) begins with `SELECT` or `WITH` as a whole word.
pub fn starts_with_query_keyword(text: &str) -> bool {
    let trimmed = text.trim_start().trim_start_matches('(').trim_start();
    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    matches!(word.to_uppercase().as_str(), "SELECT" | "WITH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_blanks_literals_and_comments() {
        let (out, lexer) = strip("SELECT 'it''s DELETE' AS x -- drop it\nFROM t /* update */ WHERE a = \"Insert\"");
        assert_eq!(out, "SELECT '' AS x  \nFROM t   WHERE a = \"\"");
        assert!(lexer.is_balanced());
    }

    #[test]
    fn test_lexer_carries_state_across_chunks() {
        let mut lexer = Lexer::new();
        let mut out = String::new();
        lexer.feed("SELECT * FROM t WHERE d > NOW() - INTERVAL '", &mut out);
        assert!(lexer.in_literal());
        assert_eq!(lexer.imbalance(), Some(Imbalance::UnclosedSingleQuote));
        lexer.feed("7 days'", &mut out);
        assert!(lexer.is_balanced());
    }

    #[test]
    fn test_paren_tracking() {
        assert_eq!(strip("SELECT COUNT(* FROM t").1.imbalance(), Some(Imbalance::UnclosedParen(1)));
        assert_eq!(strip("SELECT 1) FROM t (").1.imbalance(), Some(Imbalance::UnmatchedCloseParen));
        assert!(strip("SELECT ')' FROM t").1.is_balanced());
    }

    #[test]
    fn test_dangling_tail() {
        assert_eq!(dangling_tail("SELECT a FROM t WHERE"), Some(Dangling::Keyword("WHERE".into())));
        assert_eq!(dangling_tail("SELECT a FROM t WHERE x ="), Some(Dangling::Operator('=')));
        assert_eq!(dangling_tail("SELECT a,"), Some(Dangling::Operator(',')));
        assert_eq!(dangling_tail("SELECT a FROM t ORDER BY a DESC;"), None);
        assert_eq!(dangling_tail("SELECT COUNT(*) FROM orders_and"), None);
        assert_eq!(dangling_tail(""), None);
    }

    #[test]
    fn test_query_keyword_detection() {
        assert!(starts_with_query_keyword("  select 1"));
        assert!(starts_with_query_keyword("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(starts_with_query_keyword("(SELECT 1)"));
        assert!(!starts_with_query_keyword("SELECTED"));
        assert!(!starts_with_query_keyword("DROP TABLE t"));
    }

    #[test]
    fn test_statement_end_skips_literals_and_comments() {
        assert_eq!(statement_end("SELECT 1; SELECT 2"), Some(8));
        assert_eq!(statement_end("SELECT ';' -- ;\n/* ; */ FROM t;"), Some(30));
        assert_eq!(statement_end("SELECT 'a'';'"), None);
    }

    #[test]
    fn test_strip_comments_keeps_literals() {
        assert_eq!(strip_comments("SELECT '--x' -- note\n, 1"), "SELECT '--x'  \n, 1");
    }

    #[test]
    fn test_escape_string_hides_backslash_quote() {
        let (out, lexer) = strip(r"SELECT E'\'', 1; COMMIT; DROP TABLE users; --'");
        assert_eq!(out, "SELECT E'', 1; COMMIT; DROP TABLE users;  ");
        assert!(lexer.is_balanced());
        assert_eq!(statement_end(r"SELECT E'\';', 1; SELECT 2"), Some(16));
        // Outside an E prefix the backslash is an ordinary character.
        assert_eq!(strip(r"SELECT '\', 1").0, "SELECT '', 1");
        assert_eq!(strip(r"SELECT type'\', 1").0, "SELECT type'', 1");
    }

    #[test]
    fn test_dollar_quoting() {
        let (out, lexer) = strip("SELECT $a$ ' $a$, 1; COMMIT; DROP TABLE users; --'");
        assert_eq!(out, "SELECT $$$$, 1; COMMIT; DROP TABLE users;  ");
        assert!(lexer.is_balanced());
        assert_eq!(strip("SELECT $$a;b$$ AS x").0, "SELECT $$$$ AS x");
        assert_eq!(statement_end("SELECT $q$ $$; $q$; SELECT 2"), Some(18));
        assert_eq!(strip("SELECT $body$ never closed").1.imbalance(), Some(Imbalance::UnclosedDollarQuote));
    }

    #[test]
    fn test_dollar_parameters_and_identifiers_are_code() {
        assert_eq!(strip("SELECT * FROM t WHERE id = $1 AND x = $2").0, "SELECT * FROM t WHERE id = $1 AND x = $2");
        let (out, lexer) = strip("SELECT price$usd$ FROM t");
        assert_eq!(out, "SELECT price$usd$ FROM t");
        assert!(lexer.is_balanced());
    }

    #[test]
    fn test_escape_state_carries_across_chunks() {
        let mut lexer = Lexer::new();
        let mut out = String::new();
        lexer.feed(r"SELECT E'abc\", &mut out);
        lexer.feed("'; still inside'", &mut out);
        assert!(lexer.is_balanced());
        assert_eq!(out, "SELECT E''");
    }
}
