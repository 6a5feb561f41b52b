//! Transform chain: rewrites message content before delivery.
//!
//! Stages always run in this order, whatever order the configuration lists
//! them in:
//!
//! 1. replacement rules (list order; a matching `stop` rule ends the stage)
//! 2. length truncate / summarize
//! 3. prefix and suffix
//! 4. formatting: existing markup stripped, then rendered to HTML
//! 5. text cleaning (tag-aware once the text is HTML)
//! 6. translation
//! 7. inline buttons

use std::borrow::Cow;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channels::Translator;
use crate::error::PipelineError;
use crate::pipeline::buttons::{ButtonsConfig, TemplateVars, render_buttons};
use crate::pipeline::cleaning::{CleaningConfig, clean_html, clean_text};
use crate::pipeline::filters::{LengthAction, LengthConfig};
use crate::pipeline::language::detect_language;
use crate::pipeline::types::{InboundMessage, OutboundMessage, ParseMode};

const SUMMARY_NOTE: &str = "\n\n[Message shortened, full text in source]";
const SUMMARY_CHARS: usize = 200;

static MARKUP_RES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"<[^>]+>", ""),
        (r"(?s)```([^`]*)```", "$1"),
        (r"`([^`]+)`", "$1"),
        (r"\*\*([^*]+)\*\*", "$1"),
        (r"\*([^*]+)\*", "$1"),
        (r"__([^_]+)__", "$1"),
        (r"~~([^~]+)~~", "$1"),
        (r"\|\|([^|]+)\|\|", "$1"),
        (r"(?m)^> ?", ""),
        (r"\[([^\]]+)\]\([^)]+\)", "$1"),
    ]
    .into_iter()
    .map(|(p, r)| (Regex::new(p).expect("static regex"), r))
    .collect()
});

// ── Stored configuration ────────────────────────────────────────────

/// Search and replace rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub find: String,
    #[serde(default)]
    pub replace: String,
    /// Treat `find` as a regular expression; `replace` may use `$1` groups.
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Stop applying later rules once this one has matched.
    #[serde(default)]
    pub stop: bool,
}

impl ReplacementRule {
    pub fn literal(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            regex: false,
            case_insensitive: false,
            stop: false,
        }
    }
}

/// Formatting toggles. Block styles are exclusive with priority
/// `mono > code > quote`; inline styles combine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Strip existing HTML and markdown markup first.
    pub strip_all: bool,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub spoiler: bool,
    pub code: bool,
    pub mono: bool,
    pub quote: bool,
    /// Wrap the whole text in a link to this URL.
    pub link_url: Option<String>,
}

impl FormatConfig {
    fn wrap(&self) -> Option<Wrap> {
        let block = if self.mono {
            Some(Block::Pre)
        } else if self.code {
            Some(Block::Code)
        } else if self.quote {
            Some(Block::Quote)
        } else {
            None
        };
        let mut inline = Vec::new();
        if block.is_none() {
            for (on, tag) in [
                (self.bold, "b"),
                (self.italic, "i"),
                (self.underline, "u"),
                (self.strikethrough, "s"),
                (self.spoiler, "tg-spoiler"),
            ] {
                if on {
                    inline.push(tag);
                }
            }
        }
        let link = self
            .link_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        if block.is_none() && inline.is_empty() && link.is_none() {
            return None;
        }
        Some(Wrap {
            block,
            inline,
            link,
        })
    }
}

/// Per-task content transforms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub replacements: Vec<ReplacementRule>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub format: FormatConfig,
    pub cleaning: CleaningConfig,
    /// ISO 639-1 target language.
    pub translate_to: Option<String>,
    pub buttons: ButtonsConfig,
}

// ── Compiled chain ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Pre,
    Code,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Wrap {
    block: Option<Block>,
    inline: Vec<&'static str>,
    link: Option<String>,
}

impl Wrap {
    fn render(&self, text: &str) -> String {
        let escaped = escape_html(text);
        let mut out = match self.block {
            Some(Block::Pre) => format!("<pre>{escaped}</pre>"),
            Some(Block::Code) => format!("<code>{escaped}</code>"),
            Some(Block::Quote) => escaped
                .split('\n')
                .map(|line| format!("<blockquote>{line}</blockquote>"))
                .collect::<Vec<_>>()
                .join("\n"),
            None => escaped,
        };
        for tag in &self.inline {
            out = format!("<{tag}>{out}</{tag}>");
        }
        if let Some(url) = &self.link {
            out = format!("<a href=\"{}\">{out}</a>", escape_html(url));
        }
        out
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: Matcher,
    replace: String,
    expand: bool,
    stop: bool,
}

impl CompiledRule {
    fn compile(rule: &ReplacementRule) -> Result<Self, PipelineError> {
        let matcher = if rule.regex || rule.case_insensitive {
            let pattern = if rule.regex {
                rule.find.clone()
            } else {
                regex::escape(&rule.find)
            };
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(rule.case_insensitive)
                .build()
                .map_err(|e| PipelineError::InvalidPattern {
                    pattern: rule.find.clone(),
                    reason: e.to_string(),
                })?;
            Matcher::Pattern(regex)
        } else {
            Matcher::Literal(rule.find.clone())
        };
        Ok(Self {
            matcher,
            replace: rule.replace.clone(),
            expand: rule.regex,
            stop: rule.stop,
        })
    }

    /// Returns the rewritten text when the rule matched.
    fn apply(&self, text: &str) -> Option<String> {
        match &self.matcher {
            Matcher::Literal(find) => {
                (!find.is_empty() && text.contains(find.as_str()))
                    .then(|| text.replace(find.as_str(), &self.replace))
            }
            Matcher::Pattern(re) => {
                if !re.is_match(text) {
                    return None;
                }
                let out = if self.expand {
                    re.replace_all(text, self.replace.as_str())
                } else {
                    re.replace_all(text, NoExpand(&self.replace))
                };
                Some(out.into_owned())
            }
        }
    }
}

/// Inputs to `TransformChain::apply` that are not part of the message.
pub struct TransformContext<'a> {
    pub task_name: &'a str,
    pub source_title: Option<&'a str>,
    pub translator: Option<&'a dyn Translator>,
    /// Upper bound on one translator call; `None` waits indefinitely.
    pub translate_timeout: Option<Duration>,
}

/// Compiled transform pipeline for one task.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    rules: Vec<CompiledRule>,
    length: Option<LengthConfig>,
    prefix: Option<String>,
    suffix: Option<String>,
    strip_all: bool,
    wrap: Option<Wrap>,
    cleaning: CleaningConfig,
    translate_to: Option<String>,
    buttons: ButtonsConfig,
}

impl TransformChain {
    /// Compile the transform config. `length` comes from the task's filter
    /// config; only the truncate and summarize actions rewrite text.
    pub fn build(config: &TransformConfig, length: Option<LengthConfig>) -> Result<Self, PipelineError> {
        let rules = config
            .replacements
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let length = length.filter(|l| l.max > 0 && l.action != LengthAction::Block);
        let nonblank = |s: &Option<String>| s.as_ref().filter(|s| !s.trim().is_empty()).cloned();

        Ok(Self {
            rules,
            length,
            prefix: nonblank(&config.prefix),
            suffix: nonblank(&config.suffix),
            strip_all: config.format.strip_all,
            wrap: config.format.wrap(),
            cleaning: config.cleaning.clone(),
            translate_to: config
                .translate_to
                .as_deref()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty()),
            buttons: config.buttons.clone(),
        })
    }

    /// Run every stage over `message`.
    ///
    /// Without a translator this is a pure function of its inputs.
    pub async fn apply(&self, message: &InboundMessage, ctx: &TransformContext<'_>) -> OutboundMessage {
        let mut out = OutboundMessage::copy_of(message);
        out.strip_source_buttons = self.cleaning.remove_inline_buttons;

        if let Some(original) = message.text.as_deref() {
            let mut text = self.replace(original);
            text = self.shorten(text);
            text = self.affix(text, message, ctx);
            if self.strip_all {
                text = strip_markup(&text).into_owned();
            }
            if let Some(wrap) = self.wrap.as_ref().filter(|_| !text.is_empty()) {
                text = wrap.render(&text);
                out.parse_mode = ParseMode::Html;
            }
            if self.cleaning.rewrites_text() {
                text = match out.parse_mode {
                    ParseMode::Html => clean_html(&text, &self.cleaning),
                    _ => clean_text(&text, &self.cleaning),
                };
            }
            text = self.translate(text, ctx).await;
            out.text = Some(text);
        }

        if !self.buttons.is_empty() {
            let rows = {
                let plain = match out.parse_mode {
                    ParseMode::Html => unescape_html(&strip_markup(out.body())),
                    _ => out.body().to_string(),
                };
                let vars = TemplateVars {
                    message_text: &plain,
                    source_id: message.source_id,
                    message_id: message.message_id,
                    task_name: ctx.task_name,
                    source_title: ctx.source_title,
                };
                render_buttons(&self.buttons, &vars)
            };
            out.buttons = rows;
        }

        out
    }

    fn replace(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            if let Some(next) = rule.apply(&current) {
                current = next;
                if rule.stop {
                    break;
                }
            }
        }
        current
    }

    fn shorten(&self, text: String) -> String {
        let Some(length) = self.length else {
            return text;
        };
        if text.chars().count() <= length.max {
            return text;
        }
        match length.action {
            LengthAction::Truncate => {
                let mut cut: String = text.chars().take(length.max).collect();
                cut.push_str("...");
                cut
            }
            LengthAction::Summarize => {
                let keep = SUMMARY_CHARS.min(length.max.saturating_sub(50)).max(1);
                let mut cut: String = text.chars().take(keep).collect();
                cut.push_str(SUMMARY_NOTE);
                cut
            }
            LengthAction::Block => text,
        }
    }

    fn affix(&self, text: String, message: &InboundMessage, ctx: &TransformContext<'_>) -> String {
        if text.trim().is_empty() || (self.prefix.is_none() && self.suffix.is_none()) {
            return text;
        }
        let vars = TemplateVars {
            message_text: &text,
            source_id: message.source_id,
            message_id: message.message_id,
            task_name: ctx.task_name,
            source_title: ctx.source_title,
        };
        let mut parts = Vec::with_capacity(3);
        if let Some(prefix) = &self.prefix {
            parts.push(vars.substitute(prefix));
        }
        parts.push(text.clone());
        if let Some(suffix) = &self.suffix {
            parts.push(vars.substitute(suffix));
        }
        parts.join("\n")
    }

    async fn translate(&self, text: String, ctx: &TransformContext<'_>) -> String {
        let (Some(target), Some(translator)) = (self.translate_to.as_deref(), ctx.translator) else {
            return text;
        };
        if text.trim().is_empty() || detect_language(&text) == target {
            return text;
        }
        let call = translator.translate(&text, target);
        let result = match ctx.translate_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        language = target,
                        translator = translator.name(),
                        timeout_ms = limit.as_millis() as u64,
                        "Translation timed out, keeping original text"
                    );
                    return text;
                }
            },
            None => call.await,
        };
        match result {
            Ok(translated) => {
                debug!(language = target, translator = translator.name(), "Translated message text");
                translated
            }
            Err(e) => {
                warn!(language = target, error = %e, "Translation failed, keeping original text");
                text
            }
        }
    }
}

/// Remove HTML tags and common markdown markers.
pub fn strip_markup(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (re, rep) in MARKUP_RES.iter() {
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, *rep).into_owned());
        }
    }
    out
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
