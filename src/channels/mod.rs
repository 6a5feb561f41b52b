//! Edges of the engine: where messages leave and where text is translated.
//!
//! The chat-platform clients live outside this crate. They implement
//! [`DeliverySink`] (and optionally [`Translator`]) and feed inbound events
//! through [`crate::engine::ForwardingEngine::dispatch`].

pub mod cli;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{DeliveryError, PipelineError};
use crate::pipeline::types::{DeliveryOptions, OutboundMessage, ParseMode};
use crate::task::TaskMode;

pub use cli::CliListener;

/// Outcome of one delivery attempt, as classified by the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Delivered {
        message_id: i64,
    },
    /// Worth retrying. `retry_after` is the platform's flood-wait hint.
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent {
        reason: String,
    },
}

impl DeliveryResult {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Sends a rendered message to one target chat.
///
/// An `Err` is outside the three-way contract and is treated as permanent.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        target_id: i64,
        message: &OutboundMessage,
        options: &DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError>;
}

/// Machine translation backend.
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(&self, text: &str, target: &str) -> Result<String, PipelineError>;
}

/// Translator that returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    fn name(&self) -> &str {
        "noop"
    }

    async fn translate(&self, text: &str, _target: &str) -> Result<String, PipelineError> {
        Ok(text.to_string())
    }
}

/// The sink used for each delivery mode.
#[derive(Clone)]
pub struct Sinks {
    pub bot: Arc<dyn DeliverySink>,
    pub account: Arc<dyn DeliverySink>,
}

impl Sinks {
    /// Same sink for both modes.
    pub fn single(sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            bot: sink.clone(),
            account: sink,
        }
    }

    pub fn for_mode(&self, mode: TaskMode) -> Arc<dyn DeliverySink> {
        match mode {
            TaskMode::Bot => self.bot.clone(),
            TaskMode::Account => self.account.clone(),
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("bot", &self.bot.name())
            .field("account", &self.account.name())
            .finish()
    }
}

/// Prints every delivery to stdout. Used by the binary for local runs.
#[derive(Debug, Default)]
pub struct StdoutSink {
    next_id: std::sync::atomic::AtomicI64,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliverySink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(
        &self,
        target_id: i64,
        message: &OutboundMessage,
        options: &DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;

        let media = message
            .media
            .as_ref()
            .map(|m| format!(" [{}]", m.kind))
            .unwrap_or_default();
        let html = if message.parse_mode == ParseMode::Html { " (html)" } else { "" };
        println!("\n-> {target_id}{media}{html}\n{}\n", message.body());
        for row in &message.buttons {
            let labels: Vec<&str> = row.iter().map(|b| b.text.as_str()).collect();
            println!("   [{}]", labels.join("] ["));
        }

        info!(
            target = target_id,
            source = message.source_id,
            mode = %options.mode,
            silent = options.silent,
            "Delivered to stdout"
        );
        Ok(DeliveryResult::Delivered { message_id: id })
    }
}
