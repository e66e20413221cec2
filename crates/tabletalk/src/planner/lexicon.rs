use std::sync::OnceLock;

use regex::Regex;
use time::Date;

use crate::models::{FilterOp, WriteKind};
use crate::utils::text::stem;
use crate::utils::time::parse_calendar_date;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Word {
        text: String,
        lower: String,
        stem: String,
    },
    Integer(i64),
    Decimal(f64),
    Date(Date),
    Quoted(String),
}

impl Token {
    pub(crate) fn lower(&self) -> Option<&str> {
        match self {
            Self::Word { lower, .. } => Some(lower),
            _ => None,
        }
    }

    /// Original spelling of a word or quoted phrase.
    pub(crate) fn text(&self) -> Option<&str> {
        match self {
            Self::Word { text, .. } | Self::Quoted(text) => Some(text),
            _ => None,
        }
    }

    pub(crate) fn stem(&self) -> Option<&str> {
        match self {
            Self::Word { stem, .. } => Some(stem),
            _ => None,
        }
    }

    pub(crate) fn is(&self, word: &str) -> bool {
        self.lower() == Some(word)
    }

    pub(crate) fn is_any(&self, words: &[&str]) -> bool {
        self.lower().is_some_and(|lower| words.contains(&lower))
    }

    pub(crate) const fn integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Capitalised word that is not a known function word: a likely proper name.
    pub(crate) fn is_proper_noun(&self) -> bool {
        match self {
            Self::Word { text, lower, .. } => {
                text.chars().next().is_some_and(char::is_uppercase)
                    && !STOPWORDS.contains(&lower.as_str())
                    && month_number(lower).is_none()
            }
            _ => false,
        }
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"“([^”]+)”|"([^"]+)"|(\d{4}-\d{2}-\d{2})|(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)|([A-Za-z][A-Za-z0-9_]*)"#,
        )
        .unwrap_or_else(|error| panic!("token pattern must compile: {error}"))
    })
}

pub(crate) fn tokenize(question: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for captures in token_pattern().captures_iter(question) {
        if let Some(quoted) = captures.get(1).or_else(|| captures.get(2)) {
            let quoted = quoted.as_str().trim();
            if !quoted.is_empty() {
                tokens.push(Token::Quoted(quoted.to_string()));
            }
        } else if let Some(date) = captures.get(3) {
            if let Ok(date) = parse_calendar_date(date.as_str()) {
                tokens.push(Token::Date(date));
            }
        } else if let Some(number) = captures.get(4) {
            let digits = number.as_str().replace(',', "");
            if let Ok(integer) = digits.parse::<i64>() {
                tokens.push(Token::Integer(integer));
            } else if let Ok(decimal) = digits.parse::<f64>() {
                tokens.push(Token::Decimal(decimal));
            }
        } else if let Some(word) = captures.get(5) {
            let text = word.as_str().to_string();
            let lower = text.to_ascii_lowercase();
            let stem = word_stem(&lower);
            tokens.push(Token::Word { text, lower, stem });
        }
    }
    tokens
}

/// Stem of a question or schema word after synonym folding, so both sides compare equal.
pub(crate) fn word_stem(word: &str) -> String {
    stem(&canonical_word(&word.to_ascii_lowercase()))
}

/// Folds everyday synonyms onto the words schemas tend to use.
fn canonical_word(lower: &str) -> String {
    match lower {
        "people" | "person" | "persons" | "staff" | "worker" | "workers" => {
            "employee".to_string()
        }
        "customer" | "customers" => "client".to_string(),
        "vendor" | "vendors" => "supplier".to_string(),
        "dept" | "depts" => "department".to_string(),
        other => other.to_string(),
    }
}

pub(crate) const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "at", "for", "to", "from", "by", "with", "and", "or",
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "do", "does", "did", "what",
    "which", "who", "whom", "whose", "where", "when", "how", "many", "much", "me", "my", "our",
    "us", "i", "you", "your", "show", "list", "find", "get", "display", "tell", "all", "any",
    "each", "every", "per", "there", "that", "those", "these", "this", "it", "its", "their",
    "them", "they", "than", "as", "please", "can", "could", "would", "give", "between",
    "after", "before", "since", "until", "during", "about", "over", "under", "above", "below",
    "more", "less", "most", "least", "top", "first", "last", "latest", "oldest", "newest",
    "number", "count", "total", "sum", "average", "avg", "mean", "chart", "plot", "graph",
    "by", "not", "no", "same", "also", "only", "just", "some", "than", "but", "if", "into",
    "across", "within", "month", "year", "monthly", "yearly", "trend", "compare",
];

pub(crate) const ANAPHORA_CUES: &[&str] = &[
    "that", "those", "these", "same", "them", "it", "its", "their", "this", "previous", "above",
    "they", "he", "she", "him", "her", "his",
];

pub(crate) const COUNT_CUES: &[&str] = &["count", "many"];
pub(crate) const SUM_CUES: &[&str] = &["total", "sum", "overall"];
pub(crate) const AVG_CUES: &[&str] = &["average", "avg", "mean"];
pub(crate) const MAX_CUES: &[&str] = &[
    "highest", "maximum", "max", "largest", "biggest", "most", "top", "best", "greatest",
];
pub(crate) const MIN_CUES: &[&str] = &[
    "lowest", "minimum", "min", "smallest", "least", "fewest", "worst", "cheapest",
];
pub(crate) const GROUP_CUES: &[&str] = &["by", "per", "each", "every"];
pub(crate) const RECENT_CUES: &[&str] = &["latest", "newest", "recent", "last"];
pub(crate) const EARLY_CUES: &[&str] = &["oldest", "earliest", "first"];
pub(crate) const VISUAL_CUES: &[&str] = &[
    "chart", "plot", "graph", "visualize", "visualise", "compare", "comparison", "trend",
    "trends", "distribution", "breakdown", "pie", "histogram",
];
/// Whether `lower` belongs to any question-shape cue list above.
pub(crate) fn is_cue_word(lower: &str) -> bool {
    [
        ANAPHORA_CUES, COUNT_CUES, SUM_CUES, AVG_CUES, MAX_CUES, MIN_CUES, GROUP_CUES,
        RECENT_CUES, EARLY_CUES, VISUAL_CUES, MONTH_CUES, YEAR_CUES,
    ]
    .iter()
    .any(|cues| cues.contains(&lower))
}

pub(crate) const MONTH_NAMES: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// 1-based month number for a month name or its three-letter abbreviation.
pub(crate) fn month_number(word: &str) -> Option<u8> {
    let lower = word.to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTH_NAMES
        .iter()
        .position(|name| *name == lower || (lower.len() == 3 && name.starts_with(&lower)))
        .and_then(|index| u8::try_from(index + 1).ok())
}

pub(crate) const MONTH_CUES: &[&str] = &["month", "months", "monthly"];
pub(crate) const YEAR_CUES: &[&str] = &["year", "years", "yearly", "annual", "annually"];

/// Imperative verbs that ask for a change when they open the request.
const IMPERATIVE_UPDATE: &[&str] = &[
    "give", "set", "change", "modify", "increase", "decrease", "raise", "lower", "rename",
    "mark", "assign", "cancel", "approve", "reject", "promote", "reassign", "move",
];
const IMPERATIVE_INSERT: &[&str] = &["add", "hire", "create", "register", "enroll", "record"];
const IMPERATIVE_DELETE: &[&str] = &["remove", "fire", "erase", "purge", "terminate"];
pub(crate) const LEADING_FILLER: &[&str] = &["please", "can", "could", "would", "you", "kindly", "now", "go", "ahead", "and"];

/// Statement keywords that are always a request to write, wherever they appear.
const WRITE_KEYWORDS: &[(&str, WriteKind)] = &[
    ("insert", WriteKind::Insert),
    ("update", WriteKind::Update),
    ("delete", WriteKind::Delete),
    ("drop", WriteKind::Drop),
    ("truncate", WriteKind::Delete),
    ("alter", WriteKind::Alter),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WriteIntent {
    pub verb: WriteKind,
    pub position: usize,
    pub scale: Option<f64>,
}

pub(crate) fn write_intent(tokens: &[Token]) -> Option<WriteIntent> {
    let scale_for = |word: &str| match word {
        "give" | "increase" | "raise" | "promote" => Some(1.1),
        "decrease" | "lower" => Some(0.9),
        _ => None,
    };

    for (position, token) in tokens.iter().enumerate() {
        let Some(lower) = token.lower() else {
            continue;
        };
        if let Some((_, verb)) = WRITE_KEYWORDS.iter().find(|(keyword, _)| *keyword == lower) {
            return Some(WriteIntent {
                verb: *verb,
                position,
                scale: None,
            });
        }
    }

    let position = tokens
        .iter()
        .position(|token| !token.is_any(LEADING_FILLER))?;
    let lower = tokens[position].lower()?;
    let next = tokens.get(position + 1);
    // "give me", "show us": a request for data, not a change.
    if next.is_some_and(|next| next.is_any(&["me", "us"])) {
        return None;
    }
    // "create a chart", "add a plot": presentation, not a change.
    if tokens.iter().any(|token| token.is_any(VISUAL_CUES)) {
        return None;
    }
    let verb = if IMPERATIVE_UPDATE.contains(&lower) {
        WriteKind::Update
    } else if IMPERATIVE_INSERT.contains(&lower) {
        WriteKind::Insert
    } else if IMPERATIVE_DELETE.contains(&lower) {
        WriteKind::Delete
    } else {
        return None;
    };
    Some(WriteIntent {
        verb,
        position,
        scale: scale_for(lower),
    })
}

/// Comparison implied by the word(s) right before a date or number.
pub(crate) fn comparison_before(tokens: &[Token], position: usize) -> Option<FilterOp> {
    let previous = position.checked_sub(1).and_then(|index| tokens.get(index))?;
    let before_previous = position.checked_sub(2).and_then(|index| tokens.get(index));
    let pair = before_previous.and_then(Token::lower).zip(previous.lower());
    if let Some(pair) = pair {
        let op = match pair {
            ("more" | "greater" | "higher" | "larger", "than") => Some(FilterOp::Gt),
            ("less" | "fewer" | "lower" | "smaller", "than") => Some(FilterOp::Lt),
            ("at", "least") => Some(FilterOp::Ge),
            ("at", "most") => Some(FilterOp::Le),
            ("no", "later") | ("no", "more") => Some(FilterOp::Le),
            _ => None,
        };
        if op.is_some() {
            return op;
        }
    }
    match previous.lower()? {
        "after" | "above" | "over" | "exceeding" => Some(FilterOp::Gt),
        "since" | "from" => Some(FilterOp::Ge),
        "before" | "below" | "under" => Some(FilterOp::Lt),
        "until" | "through" | "till" | "by" => Some(FilterOp::Le),
        "on" | "equals" | "is" | "of" => Some(FilterOp::Eq),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Token, comparison_before, month_number, tokenize, word_stem, write_intent};
    use crate::models::{FilterOp, WriteKind};

    #[test]
    fn tokenizes_words_numbers_dates_and_quotes() {
        let tokens = tokenize("Employees hired after 2022-01-01 earning over 50,000 in \"R&D\"");
        assert!(matches!(tokens[0], Token::Word { ref lower, .. } if lower == "employees"));
        assert!(matches!(tokens[3], Token::Date(_)));
        assert_eq!(tokens[6], Token::Integer(50_000));
        assert_eq!(tokens[8], Token::Quoted("R&D".to_string()));
    }

    #[test]
    fn impossible_dates_are_dropped() {
        let tokens = tokenize("after 2022-02-30");
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn synonyms_share_stems_with_schema_words() {
        let tokens = tokenize("staff customers");
        assert_eq!(tokens[0].stem(), Some("employ"));
        assert_eq!(tokens[1].stem(), Some("client"));
    }

    #[test]
    fn month_names_are_not_proper_nouns() {
        let tokens = tokenize("March Acme");
        assert!(!tokens[0].is_proper_noun());
        assert!(tokens[1].is_proper_noun());
        assert_eq!(month_number("Sep"), Some(9));
        assert_eq!(month_number("may"), Some(5));
        assert_eq!(month_number("ma"), None);
        assert_eq!(word_stem("Customers"), word_stem("client"));
    }

    #[test]
    fn detects_imperative_and_keyword_writes() {
        let raise = write_intent(&tokenize("give employee 5 a raise")).expect("raise is a write");
        assert_eq!(raise.verb, WriteKind::Update);
        assert_eq!(raise.scale, Some(1.1));

        assert_eq!(
            write_intent(&tokenize("Please delete all payroll rows")).map(|intent| intent.verb),
            Some(WriteKind::Delete)
        );
        assert!(write_intent(&tokenize("give me the employees in Sales")).is_none());
        assert!(write_intent(&tokenize("create a chart of invoices per month")).is_none());
        assert!(write_intent(&tokenize("how many employees were hired in 2023")).is_none());
    }

    #[test]
    fn reads_comparison_words_before_values() {
        let tokens = tokenize("salary more than 5000 hired after 2020-01-01");
        assert_eq!(comparison_before(&tokens, 3), Some(FilterOp::Gt));
        assert_eq!(comparison_before(&tokens, 6), Some(FilterOp::Gt));
        let tokens = tokenize("at least 3");
        assert_eq!(comparison_before(&tokens, 2), Some(FilterOp::Ge));
    }
}
