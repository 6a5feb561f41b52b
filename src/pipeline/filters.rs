//! Filter chain: decides whether a message is forwarded at all.
//!
//! `FilterConfig` is the stored, serializable form. `FilterChain::build`
//! compiles it into a list of `Filter` variants, each a pure predicate over
//! the message and a `FilterContext`. A message passes only if every filter
//! passes, so evaluation order affects cost, never the result.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::language::detect_language;
use crate::pipeline::types::{InboundMessage, MediaKind};

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://|t\.me/|@\w+|#\w+|www\.|\.(com|org|net|edu|gov)\b")
        .expect("static regex")
});

// ── Stored configuration ────────────────────────────────────────────

/// Allow/deny pair. An empty allow list means "anything not denied".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter<T> {
    pub allow: Vec<T>,
    pub deny: Vec<T>,
}

// Written out so `T` needs no `Default` of its own.
impl<T> Default for ListFilter<T> {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

impl<T> ListFilter<T> {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Match whole words only instead of substrings.
    pub whole_word: bool,
}

/// What to do with text longer than the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthAction {
    /// Reject the message.
    #[default]
    Block,
    /// Forward the first `max` characters followed by an ellipsis.
    Truncate,
    /// Forward a short excerpt with a note pointing at the source.
    Summarize,
}

/// Inclusive length bounds in characters; zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthConfig {
    pub min: usize,
    pub max: usize,
    pub action: LengthAction,
}

/// Hour-of-day window in the task timezone. `start > end` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&hour)
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// Per-task filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub media: ListFilter<MediaKind>,
    pub keywords: KeywordConfig,
    /// Reject messages containing links, mentions or hashtags.
    pub block_links: bool,
    pub block_forwarded: bool,
    pub block_inline_buttons: bool,
    /// Enables the dedup stage for this task.
    pub duplicates: bool,
    /// Sender ids or usernames.
    pub senders: ListFilter<String>,
    /// ISO 639-1 codes as produced by `detect_language`.
    pub languages: ListFilter<String>,
    pub length: Option<LengthConfig>,
    pub hours: Option<HourWindow>,
    /// Days on which forwarding is allowed; `None` means every day.
    pub days: Option<Vec<Weekday>>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            media: ListFilter::default(),
            keywords: KeywordConfig::default(),
            block_links: false,
            block_forwarded: false,
            block_inline_buttons: false,
            duplicates: true,
            senders: ListFilter::default(),
            languages: ListFilter::default(),
            length: None,
            hours: None,
            days: None,
        }
    }
}

// ── Compiled filters ────────────────────────────────────────────────

/// Evaluation inputs that are not part of the message.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext {
    pub now: DateTime<Utc>,
    pub tz: Tz,
}

impl FilterContext {
    pub fn new(now: DateTime<Utc>, tz: Tz) -> Self {
        Self { now, tz }
    }
}

/// Result of evaluating a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject { filter: &'static str, reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    fn reject(filter: &'static str, reason: impl Into<String>) -> Self {
        Self::Reject {
            filter,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum KeywordMatcher {
    /// Lowercased needle.
    Substring(String),
    WholeWord { keyword: String, regex: Regex },
}

impl KeywordMatcher {
    pub fn new(keyword: &str, whole_word: bool) -> Result<Self, PipelineError> {
        if !whole_word {
            return Ok(Self::Substring(keyword.to_lowercase()));
        }
        // `\b` only works next to word characters, so "c++" or "#tag" need
        // an explicit non-word neighbour instead.
        let pattern = format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(keyword));
        let regex = Regex::new(&pattern).map_err(|e| PipelineError::InvalidPattern {
            pattern,
            reason: e.to_string(),
        })?;
        Ok(Self::WholeWord {
            keyword: keyword.to_string(),
            regex,
        })
    }

    /// `lower` must be `text.to_lowercase()`.
    fn matches(&self, text: &str, lower: &str) -> bool {
        match self {
            Self::Substring(needle) => lower.contains(needle.as_str()),
            Self::WholeWord { regex, .. } => regex.is_match(text),
        }
    }

    fn keyword(&self) -> &str {
        match self {
            Self::Substring(k) => k,
            Self::WholeWord { keyword, .. } => keyword,
        }
    }
}

/// A sender reference: numeric id or lowercased username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderRef {
    Id(i64),
    Username(String),
}

impl SenderRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Username(raw.trim_start_matches('@').to_lowercase()),
        }
    }

    fn matches(&self, message: &InboundMessage) -> bool {
        match self {
            Self::Id(id) => message.sender_id == Some(*id),
            Self::Username(name) => message
                .sender_username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(name)),
        }
    }
}

/// One compiled filter.
#[derive(Debug, Clone)]
pub enum Filter {
    Media {
        allow: HashSet<MediaKind>,
        deny: HashSet<MediaKind>,
    },
    Keywords {
        allow: Vec<KeywordMatcher>,
        deny: Vec<KeywordMatcher>,
    },
    Links,
    Forwarded,
    InlineButtons,
    Senders {
        allow: Vec<SenderRef>,
        deny: Vec<SenderRef>,
    },
    Languages {
        allow: Vec<String>,
        deny: Vec<String>,
    },
    Length {
        min: usize,
        max: usize,
        action: LengthAction,
    },
    Hours(HourWindow),
    Days(Vec<Weekday>),
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Media { .. } => "media",
            Self::Keywords { .. } => "keywords",
            Self::Links => "links",
            Self::Forwarded => "forwarded",
            Self::InlineButtons => "inline_buttons",
            Self::Senders { .. } => "senders",
            Self::Languages { .. } => "languages",
            Self::Length { .. } => "length",
            Self::Hours(_) => "hours",
            Self::Days(_) => "days",
        }
    }

    /// Evaluate against a message. Pure: no I/O, no state.
    pub fn evaluate(&self, message: &InboundMessage, ctx: &FilterContext) -> Verdict {
        let name = self.name();
        match self {
            Self::Media { allow, deny } => {
                let kind = message.kind();
                if deny.contains(&kind) {
                    return Verdict::reject(name, format!("{kind} is denied"));
                }
                if !allow.is_empty() && !allow.contains(&kind) {
                    return Verdict::reject(name, format!("{kind} is not allowed"));
                }
                Verdict::Pass
            }
            Self::Keywords { allow, deny } => {
                let Some(text) = message.text.as_deref() else {
                    return Verdict::Pass;
                };
                let lower = text.to_lowercase();
                if let Some(hit) = deny.iter().find(|m| m.matches(text, &lower)) {
                    return Verdict::reject(name, format!("denied keyword {:?}", hit.keyword()));
                }
                if !allow.is_empty() && !allow.iter().any(|m| m.matches(text, &lower)) {
                    return Verdict::reject(name, "no allowed keyword present");
                }
                Verdict::Pass
            }
            Self::Links => {
                if LINK_RE.is_match(message.body()) {
                    Verdict::reject(name, "contains a link or mention")
                } else {
                    Verdict::Pass
                }
            }
            Self::Forwarded => {
                if message.forwarded {
                    Verdict::reject(name, "message is forwarded")
                } else {
                    Verdict::Pass
                }
            }
            Self::InlineButtons => {
                if message.has_inline_buttons {
                    Verdict::reject(name, "message has inline buttons")
                } else {
                    Verdict::Pass
                }
            }
            Self::Senders { allow, deny } => {
                if deny.iter().any(|s| s.matches(message)) {
                    return Verdict::reject(name, "sender is denied");
                }
                if !allow.is_empty() && !allow.iter().any(|s| s.matches(message)) {
                    return Verdict::reject(name, "sender is not allowed");
                }
                Verdict::Pass
            }
            Self::Languages { allow, deny } => {
                let Some(text) = message.text.as_deref() else {
                    return Verdict::Pass;
                };
                let lang = detect_language(text);
                if deny.iter().any(|l| l == lang) {
                    return Verdict::reject(name, format!("language {lang} is denied"));
                }
                if !allow.is_empty() && !allow.iter().any(|l| l == lang) {
                    return Verdict::reject(name, format!("language {lang} is not allowed"));
                }
                Verdict::Pass
            }
            Self::Length { min, max, action } => {
                let Some(text) = message.text.as_deref() else {
                    return Verdict::Pass;
                };
                let len = text.chars().count();
                if *min > 0 && len < *min {
                    return Verdict::reject(name, format!("length {len} below minimum {min}"));
                }
                if *max > 0 && len > *max && *action == LengthAction::Block {
                    return Verdict::reject(name, format!("length {len} above maximum {max}"));
                }
                Verdict::Pass
            }
            Self::Hours(window) => {
                let hour = ctx.now.with_timezone(&ctx.tz).hour();
                if window.contains(hour) {
                    Verdict::Pass
                } else {
                    Verdict::reject(
                        name,
                        format!(
                            "hour {hour} outside {}-{} {}",
                            window.start, window.end, ctx.tz
                        ),
                    )
                }
            }
            Self::Days(days) => {
                let day = ctx.now.with_timezone(&ctx.tz).weekday();
                if days.contains(&day) {
                    Verdict::Pass
                } else {
                    Verdict::reject(name, format!("{day} is not an active day"))
                }
            }
        }
    }
}

/// Compiled set of filters for one task.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Compile a stored configuration. Disabled filters are left out.
    ///
    /// Cheap checks come first so rejected messages short-circuit early.
    pub fn build(config: &FilterConfig) -> Result<Self, PipelineError> {
        let mut filters = Vec::new();

        if let Some(days) = &config.days {
            filters.push(Filter::Days(days.clone()));
        }
        if let Some(window) = config.hours {
            if window.start > 23 || window.end > 23 {
                return Err(PipelineError::InvalidFilter {
                    filter: "hours",
                    reason: format!("hours must be 0-23, got {}-{}", window.start, window.end),
                });
            }
            filters.push(Filter::Hours(window));
        }
        if !config.media.is_empty() {
            filters.push(Filter::Media {
                allow: config.media.allow.iter().copied().collect(),
                deny: config.media.deny.iter().copied().collect(),
            });
        }
        if config.block_forwarded {
            filters.push(Filter::Forwarded);
        }
        if config.block_inline_buttons {
            filters.push(Filter::InlineButtons);
        }
        if !config.senders.is_empty() {
            filters.push(Filter::Senders {
                allow: config.senders.allow.iter().map(|s| SenderRef::parse(s)).collect(),
                deny: config.senders.deny.iter().map(|s| SenderRef::parse(s)).collect(),
            });
        }
        if let Some(length) = config.length {
            if length.min > 0 && length.max > 0 && length.min > length.max {
                return Err(PipelineError::InvalidFilter {
                    filter: "length",
                    reason: format!("min {} exceeds max {}", length.min, length.max),
                });
            }
            if length.min > 0 || length.max > 0 {
                filters.push(Filter::Length {
                    min: length.min,
                    max: length.max,
                    action: length.action,
                });
            }
        }
        if config.block_links {
            filters.push(Filter::Links);
        }
        if !config.keywords.allow.is_empty() || !config.keywords.deny.is_empty() {
            let compile = |words: &[String]| -> Result<Vec<KeywordMatcher>, PipelineError> {
                words
                    .iter()
                    .filter(|w| !w.trim().is_empty())
                    .map(|w| KeywordMatcher::new(w.trim(), config.keywords.whole_word))
                    .collect()
            };
            filters.push(Filter::Keywords {
                allow: compile(&config.keywords.allow)?,
                deny: compile(&config.keywords.deny)?,
            });
        }
        if !config.languages.is_empty() {
            let normalize = |codes: &[String]| -> Vec<String> {
                codes.iter().map(|c| c.trim().to_lowercase()).collect()
            };
            filters.push(Filter::Languages {
                allow: normalize(&config.languages.allow),
                deny: normalize(&config.languages.deny),
            });
        }

        Ok(Self { filters })
    }

    /// Chain over an explicit filter list, evaluated in the given order.
    pub fn from_filters(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluate all filters, stopping at the first rejection.
    pub fn evaluate(&self, message: &InboundMessage, ctx: &FilterContext) -> Verdict {
        for filter in &self.filters {
            let verdict = filter.evaluate(message, ctx);
            if let Verdict::Reject { filter, reason } = &verdict {
                debug!(
                    source = message.source_id,
                    message_id = message.message_id,
                    filter,
                    reason = %reason,
                    "Message rejected by filter"
                );
                return verdict;
            }
        }
        Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Reject { filter, reason } => write!(f, "{filter}: {reason}"),
        }
    }
}
