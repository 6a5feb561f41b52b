//! Text cleaning rules.
//!
//! Each rule is a pure string rewrite. `clean_text` applies the enabled ones
//! in a fixed order so the same input always produces the same output.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\p{Extended_Pictographic}\x{1F1E6}-\x{1F1FF}\x{1F3FB}-\x{1F3FF}\x{FE0F}\x{200D}\x{20E3}]+",
    )
    .expect("static regex")
});

static LINK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:https?|ftp)://\S+",
        r"(?i)\bwww\.\S+",
        r"(?i)\b(?:t\.me|telegram\.me|telegram\.dog)/\S+",
        // domain with a path, subdomains included
        r"\b[a-zA-Z0-9][a-zA-Z0-9.-]*[a-zA-Z0-9]\.[a-zA-Z]{2,}/\S*",
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
        r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}:[0-9]+\b",
        // bare domain
        r"\b[a-zA-Z0-9][a-zA-Z0-9.-]*[a-zA-Z0-9]\.[a-zA-Z]{2,}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("static regex"));

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@[a-zA-Z0-9_]{1,32}").expect("static regex"));

static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\w+").expect("static regex"));

static EXTRA_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").expect("static regex"));

static SPACES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("static regex"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>]*>").expect("static regex"));

/// Per-task cleaning toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub remove_emojis: bool,
    pub remove_links: bool,
    pub remove_mentions: bool,
    pub remove_emails: bool,
    pub remove_hashtags: bool,
    /// Drop every line containing any of these words (case-insensitive).
    pub remove_lines_with: Vec<String>,
    pub remove_empty_lines: bool,
    /// Collapse runs of blank lines into one and trim the ends.
    pub remove_extra_lines: bool,
    pub normalize_whitespace: bool,
    pub remove_duplicate_lines: bool,
    /// Strip the source message's inline keyboard when copying.
    pub remove_inline_buttons: bool,
}

impl CleaningConfig {
    /// Whether any rule touches the text.
    pub fn rewrites_text(&self) -> bool {
        self.remove_emojis
            || self.remove_links
            || self.remove_mentions
            || self.remove_emails
            || self.remove_hashtags
            || !self.remove_lines_with.is_empty()
            || self.remove_empty_lines
            || self.remove_extra_lines
            || self.normalize_whitespace
            || self.remove_duplicate_lines
    }
}

/// Apply every enabled cleaning rule.
pub fn clean_text(text: &str, config: &CleaningConfig) -> String {
    clean_lines(clean_inline(text, config), config)
}

/// Like [`clean_text`], but for HTML: inline rules only touch the text
/// between tags, so attribute values and tag names survive. With
/// `remove_links` set, `<a>` anchors are unwrapped and keep their content.
pub fn clean_html(html: &str, config: &CleaningConfig) -> String {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for tag in TAG_RE.find_iter(html) {
        out.push_str(&clean_inline(&html[last..tag.start()], config));
        if !(config.remove_links && is_anchor(tag.as_str())) {
            out.push_str(tag.as_str());
        }
        last = tag.end();
    }
    out.push_str(&clean_inline(&html[last..], config));
    clean_lines(out, config)
}

fn is_anchor(tag: &str) -> bool {
    let name = tag
        .trim_start_matches('<')
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '>')
        .next()
        .unwrap_or_default();
    name.eq_ignore_ascii_case("a")
}

fn clean_inline(text: &str, config: &CleaningConfig) -> String {
    let mut out = text.to_string();

    if config.remove_emojis {
        out = EMOJI_RE.replace_all(&out, "").into_owned();
    }
    if config.remove_links {
        for re in LINK_RES.iter() {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    if config.remove_mentions {
        out = MENTION_RE.replace_all(&out, "").into_owned();
    }
    if config.remove_emails {
        out = EMAIL_RE.replace_all(&out, "").into_owned();
    }
    if config.remove_hashtags {
        out = HASHTAG_RE.replace_all(&out, "").into_owned();
    }
    out
}

fn clean_lines(mut out: String, config: &CleaningConfig) -> String {
    if !config.remove_lines_with.is_empty() {
        out = remove_lines_with(&out, &config.remove_lines_with);
    }
    if config.remove_empty_lines {
        out = out
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
    }
    if config.remove_extra_lines {
        out = EXTRA_LINES_RE
            .replace_all(&out, "\n\n")
            .trim()
            .to_string();
    }
    if config.normalize_whitespace {
        out = normalize_whitespace(&out);
    }
    if config.remove_duplicate_lines {
        let mut seen = HashSet::new();
        out = out
            .split('\n')
            .filter(|line| seen.insert(*line))
            .collect::<Vec<_>>()
            .join("\n");
    }

    out
}

fn remove_lines_with(text: &str, words: &[String]) -> String {
    let words: Vec<String> = words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    text.split('\n')
        .filter(|line| {
            let lower = line.to_lowercase();
            !words.iter().any(|w| lower.contains(w.as_str()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_whitespace(text: &str) -> String {
    let text = text.replace('\t', " ");
    let text = SPACES_RE.replace_all(&text, " ");
    text.split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_enabled_is_identity() {
        let config = CleaningConfig::default();
        assert!(!config.rewrites_text());
        assert_eq!(clean_text("  a \n\n\n b 🎉", &config), "  a \n\n\n b 🎉");
    }

    #[test]
    fn removes_emojis() {
        let config = CleaningConfig {
            remove_emojis: true,
            ..Default::default()
        };
        assert_eq!(clean_text("hi 🎉👍🏽 there 🇩🇪!", &config), "hi  there !");
        assert_eq!(clean_text("family 👨‍👩‍👧 done", &config), "family  done");
    }

    #[test]
    fn removes_links() {
        let config = CleaningConfig {
            remove_links: true,
            ..Default::default()
        };
        assert_eq!(
            clean_text("read https://example.com/a?b=1 now", &config),
            "read  now"
        );
        assert_eq!(clean_text("join t.me/somechannel", &config), "join ");
        assert_eq!(clean_text("visit news.example.org today", &config), "visit  today");
        assert_eq!(clean_text("mail me@example.com", &config), "mail ");
    }

    #[test]
    fn removes_mentions_hashtags_emails() {
        let config = CleaningConfig {
            remove_mentions: true,
            remove_hashtags: true,
            ..Default::default()
        };
        assert_eq!(clean_text("hey @bob see #news", &config), "hey  see ");

        let config = CleaningConfig {
            remove_emails: true,
            ..Default::default()
        };
        assert_eq!(clean_text("write to a.b@c.io", &config), "write to ");
    }

    #[test]
    fn removes_lines_with_words() {
        let config = CleaningConfig {
            remove_lines_with: vec!["Advert".into()],
            ..Default::default()
        };
        assert_eq!(
            clean_text("news\nADVERT: buy\nmore news", &config),
            "news\nmore news"
        );
    }

    #[test]
    fn line_rules() {
        let config = CleaningConfig {
            remove_empty_lines: true,
            ..Default::default()
        };
        assert_eq!(clean_text("a\n\n  \nb", &config), "a\nb");

        let config = CleaningConfig {
            remove_extra_lines: true,
            ..Default::default()
        };
        assert_eq!(clean_text("\na\n\n\n\nb\n", &config), "a\n\nb");

        let config = CleaningConfig {
            remove_duplicate_lines: true,
            ..Default::default()
        };
        assert_eq!(clean_text("x\ny\nx\nz\ny", &config), "x\ny\nz");
    }

    #[test]
    fn html_cleaning_keeps_tags_intact() {
        let config = CleaningConfig {
            remove_links: true,
            remove_mentions: true,
            ..Default::default()
        };
        assert_eq!(
            clean_html("<a href=\"https://x.org\">hello</a>", &config),
            "hello"
        );
        assert_eq!(
            clean_html("<b>see https://x.org/a @bob now</b>", &config),
            "<b>see   now</b>"
        );

        let config = CleaningConfig {
            remove_hashtags: true,
            ..Default::default()
        };
        // Anchors survive when links are kept.
        assert_eq!(
            clean_html("<a href=\"https://x.org/#top\">#tag go</a>", &config),
            "<a href=\"https://x.org/#top\"> go</a>"
        );
    }

    #[test]
    fn normalizes_whitespace() {
        let config = CleaningConfig {
            normalize_whitespace: true,
            ..Default::default()
        };
        assert_eq!(clean_text("a   b\tc  \nd ", &config), "a b c\nd");
    }
}
