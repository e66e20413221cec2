use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionIssue {
    Empty,
    TooLong { chars: usize, max_chars: usize },
    NullByte,
    ScriptTag,
}

impl QuestionIssue {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Empty => "question must not be empty".to_string(),
            Self::TooLong { chars, max_chars } => {
                format!("question has {chars} characters; at most {max_chars} are allowed")
            }
            Self::NullByte => "question contains null bytes".to_string(),
            Self::ScriptTag => "question contains potentially harmful script tags".to_string(),
        }
    }
}

fn script_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<script.*?>.*?</script>").unwrap_or_else(|error| {
            panic!("script tag pattern must compile: {error}");
        })
    })
}

pub fn check_question(question: &str, max_chars: usize) -> Result<(), QuestionIssue> {
    if question.trim().is_empty() {
        return Err(QuestionIssue::Empty);
    }
    let chars = question.chars().count();
    if chars > max_chars {
        return Err(QuestionIssue::TooLong { chars, max_chars });
    }
    if question.contains('\0') {
        return Err(QuestionIssue::NullByte);
    }
    if script_tag_pattern().is_match(question) {
        return Err(QuestionIssue::ScriptTag);
    }
    Ok(())
}

/// Splits an identifier such as `HireDate`, `first_name` or `VATNumber` into lowercase words.
#[must_use]
pub fn identifier_words(identifier: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let chars = identifier.chars().collect::<Vec<_>>();

    for (index, ch) in chars.iter().copied().enumerate() {
        if !ch.is_ascii_alphanumeric() {
            flush_word(&mut words, &mut current);
            continue;
        }
        let boundary = if let Some(previous) = index.checked_sub(1).map(|i| chars[i]) {
            let next = chars.get(index + 1).copied();
            (ch.is_ascii_uppercase() && previous.is_ascii_lowercase())
                || (ch.is_ascii_uppercase()
                    && previous.is_ascii_uppercase()
                    && next.is_some_and(|next| next.is_ascii_lowercase()))
                || (ch.is_ascii_digit() != previous.is_ascii_digit() && previous.is_ascii_alphanumeric())
        } else {
            false
        };
        if boundary {
            flush_word(&mut words, &mut current);
        }
        current.push(ch.to_ascii_lowercase());
    }
    flush_word(&mut words, &mut current);
    words
}

fn flush_word(words: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        words.push(std::mem::take(current));
    }
}

/// Light suffix stripping so that `employees`/`employee` and `hired`/`HireDate` meet.
#[must_use]
pub fn stem(word: &str) -> String {
    let mut stem = word.to_ascii_lowercase();
    if stem.len() > 4 && stem.ends_with("ies") {
        stem.truncate(stem.len() - 3);
        stem.push('y');
    } else if stem.len() > 3 && stem.ends_with("es") {
        stem.truncate(stem.len() - 2);
    } else if stem.len() > 3
        && stem.ends_with('s')
        && !(stem.ends_with("ss") || stem.ends_with("us") || stem.ends_with("is"))
    {
        stem.truncate(stem.len() - 1);
    }

    if stem.len() > 5 && stem.ends_with("ing") {
        stem.truncate(stem.len() - 3);
    } else if stem.len() > 3 && stem.ends_with("ed") {
        stem.truncate(stem.len() - 2);
    }

    while stem.len() > 3 && stem.ends_with('e') {
        stem.truncate(stem.len() - 1);
    }
    stem
}

/// Rough token count used to keep grounding documents within a budget.
#[must_use]
pub fn approx_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[must_use]
pub fn humanize_identifier(identifier: &str) -> String {
    identifier_words(identifier).join(" ")
}

#[cfg(test)]
mod tests {
    use super::{QuestionIssue, check_question, humanize_identifier, identifier_words, stem};

    #[test]
    fn splits_camel_snake_and_acronym_identifiers() {
        assert_eq!(identifier_words("HireDate"), vec!["hire", "date"]);
        assert_eq!(identifier_words("first_name"), vec!["first", "name"]);
        assert_eq!(identifier_words("DepartmentID"), vec!["department", "id"]);
        assert_eq!(identifier_words("VATNumber"), vec!["vat", "number"]);
        assert_eq!(humanize_identifier("AmountGross"), "amount gross");
    }

    #[test]
    fn stems_plural_and_past_forms_to_shared_roots() {
        assert_eq!(stem("employees"), stem("employee"));
        assert_eq!(stem("hired"), stem("hire"));
        assert_eq!(stem("invoices"), stem("invoice"));
        assert_eq!(stem("departments"), stem("department"));
        assert_eq!(stem("statuses"), stem("status"));
        assert_eq!(stem("categories"), stem("category"));
        assert_eq!(stem("hiring"), stem("hire"));
    }

    #[test]
    fn rejects_unsafe_questions() {
        assert_eq!(check_question("   ", 100), Err(QuestionIssue::Empty));
        assert_eq!(check_question("a\0b", 100), Err(QuestionIssue::NullByte));
        assert_eq!(
            check_question("hi <SCRIPT>alert(1)</script>", 100),
            Err(QuestionIssue::ScriptTag)
        );
        assert!(matches!(
            check_question("abcdef", 3),
            Err(QuestionIssue::TooLong { chars: 6, max_chars: 3 })
        ));
        assert!(check_question("How many employees are there?", 100).is_ok());
    }
}
