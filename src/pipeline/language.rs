//! Script-based language detection.
//!
//! Good enough for allow/deny filtering and for skipping translation of text
//! already in the target language. Returns ISO 639-1 codes or `"unknown"`.

pub const UNKNOWN: &str = "unknown";

/// Share of alphabetic characters a script needs to win.
const SCRIPT_THRESHOLD: f64 = 0.3;

const LATIN_HINTS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "to", "of", "that", "with"]),
    ("es", &["el", "los", "que", "y", "una", "es", "por"]),
    ("fr", &["le", "les", "et", "est", "une", "il", "être"]),
    ("de", &["der", "die", "und", "den", "von", "zu", "das"]),
    ("it", &["il", "di", "che", "gli", "per", "sono"]),
    ("pt", &["o", "do", "da", "em", "um", "não"]),
];

/// Detect the dominant language of `text`.
pub fn detect_language(text: &str) -> &'static str {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return UNKNOWN;
    }

    let count = |pred: fn(char) -> bool| letters.iter().filter(|c| pred(**c)).count();
    let threshold = letters.len() as f64 * SCRIPT_THRESHOLD;

    let scripts: [(&'static str, usize); 5] = [
        ("ar", count(|c| ('\u{0600}'..='\u{06FF}').contains(&c))),
        ("ru", count(|c| ('\u{0400}'..='\u{04FF}').contains(&c))),
        ("zh", count(|c| ('\u{4E00}'..='\u{9FFF}').contains(&c))),
        (
            "ja",
            count(|c| ('\u{3040}'..='\u{309F}').contains(&c) || ('\u{30A0}'..='\u{30FF}').contains(&c)),
        ),
        ("ko", count(|c| ('\u{AC00}'..='\u{D7AF}').contains(&c))),
    ];
    for (code, n) in scripts {
        if n as f64 > threshold {
            return code;
        }
    }

    let latin = count(|c| c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&c));
    if latin as f64 <= threshold {
        return UNKNOWN;
    }

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();

    // Highest hint count wins; ties go to the earlier entry.
    let mut best = ("en", 0usize);
    for (code, hints) in LATIN_HINTS {
        let hits = words.iter().filter(|w| hints.contains(w)).count();
        if hits > best.1 {
            best = (code, hits);
        }
    }
    best.0
}
