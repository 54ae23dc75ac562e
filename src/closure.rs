use std::sync::LazyLock;

use regex::Regex;

const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december";

/// Ordered closure phrases; first match wins.
static CLOSURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"closed for the (?:season|winter|year)".to_string(),
        r"closed for (?:winter|the off[- ]?season)".to_string(),
        r"seasonally closed".to_string(),
        r"temporarily closed".to_string(),
        r"permanently closed".to_string(),
        r"closed until further notice".to_string(),
        format!(r"reopening (?:in|on) (?:{MONTHS})"),
        format!(r"re-?opens (?:in|on) (?:{MONTHS})"),
        r"see you (?:next|in the) (?:season|spring|summer)".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureSignal {
    pub phrase: String,
}

pub struct ClosureClassifier {
    scan_chars: usize,
}

impl ClosureClassifier {
    pub fn new(scan_chars: usize) -> Self {
        ClosureClassifier { scan_chars }
    }

    /// Scan the first `scan_chars` characters for a closure phrase.
    pub fn classify(&self, text: &str) -> Option<ClosureSignal> {
        let prefix = char_prefix(text, self.scan_chars);
        CLOSURE_PATTERNS.iter().find_map(|re| {
            re.find(prefix).map(|m| ClosureSignal {
                phrase: m.as_str().to_string(),
            })
        })
    }
}

fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
