//! Inline button rendering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::pipeline::types::{ButtonAction, InlineButton};

const DEFAULT_SHARE_BASE: &str = "https://t.me/share/url";

/// Button behaviour as configured by the task owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonKind {
    /// `value` is the URL to open.
    Url,
    /// `value` is the text shown in a popup; rendered as callback data.
    Popup,
    /// Opens a share dialog prefilled with `value` (or the message text).
    Share,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub text: String,
    pub kind: ButtonKind,
    #[serde(default)]
    pub value: String,
}

/// Button rows to attach to every forwarded message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonsConfig {
    pub rows: Vec<Vec<ButtonSpec>>,
    /// Base URL of the share dialog; defaults to the Telegram share endpoint.
    pub share_base: Option<String>,
}

impl ButtonsConfig {
    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }
}

/// Values substituted into button labels, button values and prefix/suffix templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    pub message_text: &'a str,
    pub source_id: i64,
    pub message_id: i64,
    pub task_name: &'a str,
    pub source_title: Option<&'a str>,
}

impl TemplateVars<'_> {
    pub fn substitute(&self, template: &str) -> String {
        if !template.contains('{') {
            return template.to_string();
        }
        let source = self
            .source_title
            .map(str::to_string)
            .unwrap_or_else(|| self.source_id.to_string());
        template
            .replace("{message_text}", self.message_text)
            .replace("{source_id}", &self.source_id.to_string())
            .replace("{message_id}", &self.message_id.to_string())
            .replace("{task_name}", self.task_name)
            .replace("{source}", &source)
    }
}

/// Render configured rows. Invalid buttons are skipped with a warning and
/// empty rows are dropped.
pub fn render_buttons(config: &ButtonsConfig, vars: &TemplateVars<'_>) -> Vec<Vec<InlineButton>> {
    let share_base = config.share_base.as_deref().unwrap_or(DEFAULT_SHARE_BASE);
    config
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|spec| render_button(spec, vars, share_base))
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect()
}

fn render_button(spec: &ButtonSpec, vars: &TemplateVars<'_>, share_base: &str) -> Option<InlineButton> {
    let text = vars.substitute(&spec.text);
    if text.trim().is_empty() {
        return None;
    }
    let value = vars.substitute(&spec.value);

    let action = match spec.kind {
        ButtonKind::Url => match Url::parse(&value) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ButtonAction::Url(url.into()),
            _ => {
                warn!(button = %text, url = %value, "Skipping button with invalid URL");
                return None;
            }
        },
        ButtonKind::Popup => ButtonAction::Callback(popup_callback(&value)),
        ButtonKind::Share => {
            let content = if value.is_empty() {
                vars.message_text.to_string()
            } else {
                value
            };
            match Url::parse_with_params(share_base, &[("url", ""), ("text", content.as_str())]) {
                Ok(url) => ButtonAction::Url(url.into()),
                Err(e) => {
                    warn!(button = %text, error = %e, "Skipping share button");
                    return None;
                }
            }
        }
    };

    Some(InlineButton { text, action })
}

/// Stable callback data for a popup: the host resolves it back to the text.
pub fn popup_callback(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("popup:{}", &hex::encode(digest)[..12])
}
