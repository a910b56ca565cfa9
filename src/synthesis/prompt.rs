//! Synthesis prompt - the single instruction block sent to the oracle
//!
//! The block carries the business context (the only schema information the
//! oracle sees), concept suggestions, numbered generation rules and the
//! question verbatim.

/// Generation rules, numbered so the oracle can be told which one it broke.
pub const SQL_GENERATION_RULES: &str = r#"## Rules

1. Generate exactly ONE read-only statement that starts with SELECT or WITH. Never use INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, TRUNCATE, GRANT, REVOKE, COPY or SELECT INTO.
2. Use table and column names exactly as written in the schema above. Names are case-sensitive; wrap any name containing capitals in double quotes.
3. Only reference tables and columns that appear in the schema. If a concept has no exact match, use the closest suggestion listed under "Possible matches".
4. Prefer JOINs that follow the listed relationships (column -> other_table.column) over guessing join keys.
5. When the question implies a chart, ranking or breakdown, return two columns: a label aliased AS name and a number aliased AS value.
6. Ranking questions ("top", "most", "highest") use GROUP BY, ORDER BY value DESC and a LIMIT (default 10).
7. Time-bucketed questions (by day, week, month, year) group on EXTRACT(...) or DATE_TRUNC(...) of the date column and ORDER BY the bucket ascending.
8. Use PostgreSQL syntax. Date arithmetic uses NOW() and INTERVAL literals such as INTERVAL '30 days'.
9. Always return a LIMIT of at most 1000 rows unless the query aggregates to a single row.
10. Reply with the SQL only: no explanation, no markdown, no trailing prose. End the statement with a semicolon."#;

/// Appended on the retry after an unusable first reply.
pub const STRICT_RETRY_INSTRUCTION: &str = r#"## IMPORTANT

Your previous answer could not be used because it was empty, cut off or malformed.
Return ONLY one complete SQL statement on as few lines as possible. Close every parenthesis and every quoted string. Do not stop in the middle of a keyword, operator or INTERVAL literal. Do not add any text before or after the statement."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Standard,
    Strict,
}

/// Build the instruction block for one synthesis attempt.
pub fn build_prompt(question: &str, context_text: &str, suggestions: &str, mode: PromptMode) -> String {
    let mut prompt = String::with_capacity(context_text.len() + suggestions.len() + 2048);
    prompt.push_str("You translate business questions into PostgreSQL queries for the database described below.\n\n");
    prompt.push_str(context_text.trim_end());
    prompt.push_str("\n\n");

    if !suggestions.trim().is_empty() {
        prompt.push_str("## Possible matches\n\n");
        prompt.push_str(suggestions.trim_end());
        prompt.push_str("\n\n");
    }

    prompt.push_str(SQL_GENERATION_RULES);
    prompt.push_str("\n\n");

    if mode == PromptMode::Strict {
        prompt.push_str(STRICT_RETRY_INSTRUCTION);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Question\n\n");
    prompt.push_str(question.trim());
    prompt.push_str("\n\nSQL:");
    prompt
}
