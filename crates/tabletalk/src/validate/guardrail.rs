//! Read-only statement guardrail over rendered SQL text.

use thiserror::Error;

const MUTATING_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "create", "alter", "drop", "replace", "truncate", "attach",
    "detach", "pragma", "vacuum", "reindex", "analyze", "begin", "commit", "rollback",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardrailViolation {
    #[error("statement is empty")]
    Empty,

    #[error("multiple statements are not allowed")]
    MultiStatement,

    #[error("mutating keyword `{keyword}` is not allowed")]
    Mutating { keyword: String },

    #[error("only SELECT and WITH ... SELECT statements are allowed, found `{keyword}`")]
    Unsupported { keyword: String },
}

impl GuardrailViolation {
    /// Operation name reported back to the planner.
    #[must_use]
    pub fn operation(&self) -> String {
        match self {
            Self::Empty => "empty".to_string(),
            Self::MultiStatement => "multi_statement".to_string(),
            Self::Mutating { keyword } | Self::Unsupported { keyword } => keyword.clone(),
        }
    }
}

/// Accepts exactly one `SELECT` or `WITH ... SELECT` statement.
///
/// Quoted identifiers, string literals and comments are masked first, so a column called
/// `"Update"` or a literal containing `;` never trips the keyword scan.
pub fn check_read_only_sql(raw_sql: &str) -> Result<(), GuardrailViolation> {
    let masked = mask_quoted(raw_sql);
    let candidate = strip_trailing_semicolons(&masked);
    if candidate.is_empty() {
        return Err(GuardrailViolation::Empty);
    }
    if candidate.contains(';') {
        return Err(GuardrailViolation::MultiStatement);
    }

    let normalized = candidate.to_ascii_lowercase();
    if let Some(keyword) = first_mutating_keyword(&normalized) {
        return Err(GuardrailViolation::Mutating { keyword });
    }

    let leading = leading_keyword(&normalized);
    if leading != "select" && leading != "with" {
        return Err(GuardrailViolation::Unsupported { keyword: leading });
    }
    Ok(())
}

fn strip_trailing_semicolons(raw_sql: &str) -> &str {
    let mut candidate = raw_sql.trim();
    while let Some(stripped) = candidate.strip_suffix(';') {
        candidate = stripped.trim_end();
    }
    candidate
}

fn first_mutating_keyword(normalized_sql: &str) -> Option<String> {
    words(normalized_sql).find_map(|token| {
        MUTATING_KEYWORDS
            .contains(&token)
            .then_some(token.to_string())
    })
}

fn leading_keyword(normalized_sql: &str) -> String {
    words(normalized_sql)
        .next()
        .unwrap_or("unknown")
        .to_string()
}

fn words(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .filter(|token| !token.is_empty())
}

/// Replaces quoted spans and comments with a single space each.
fn mask_quoted(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' | '[' => {
                let close = if ch == '[' { ']' } else { ch };
                while let Some(inner) = chars.next() {
                    if inner == close {
                        // Doubled delimiters escape themselves inside the span.
                        if close != ']' && chars.peek() == Some(&close) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                masked.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                masked.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
                masked.push(' ');
            }
            other => masked.push(other),
        }
    }
    masked
}
