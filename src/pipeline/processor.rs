//! Message pipeline: filter then transform, compiled once per task.
//!
//! Built from a `Task` when its worker starts or reloads. Compilation
//! errors (bad regex, bad timezone, inverted bounds) surface here so the
//! engine can mark the task inert instead of failing per message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::channels::Translator;
use crate::error::PipelineError;
use crate::pipeline::filters::{FilterChain, FilterContext, Verdict};
use crate::pipeline::transforms::{TransformChain, TransformContext};
use crate::pipeline::types::{InboundMessage, OutboundMessage};
use crate::task::Task;

/// Outcome of running a message through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// A filter rejected the message.
    Filtered { filter: &'static str, reason: String },
    /// Transforms left nothing to send.
    Empty,
    /// Ready for dedup and delivery.
    Ready(OutboundMessage),
}

/// Compiled filter and transform stages for one task.
pub struct MessagePipeline {
    task_name: String,
    tz: Tz,
    filters: FilterChain,
    transforms: TransformChain,
    translator: Option<Arc<dyn Translator>>,
    translate_timeout: Option<Duration>,
    source_titles: HashMap<i64, String>,
}

impl MessagePipeline {
    pub fn build(task: &Task, translator: Option<Arc<dyn Translator>>) -> Result<Self, PipelineError> {
        let tz = task
            .limits
            .tz()
            .map_err(|reason| PipelineError::InvalidFilter {
                filter: "timezone",
                reason,
            })?;
        let filters = FilterChain::build(&task.filters)?;
        let transforms = TransformChain::build(&task.transforms, task.filters.length)?;
        let source_titles = task
            .sources
            .iter()
            .filter_map(|s| s.title.clone().map(|t| (s.chat_id, t)))
            .collect();

        debug!(
            task_id = task.id,
            filters = filters.len(),
            tz = %tz,
            "Compiled message pipeline"
        );

        Ok(Self {
            task_name: task.name.clone(),
            tz,
            filters,
            transforms,
            translator,
            translate_timeout: None,
            source_titles,
        })
    }

    /// Bound each translator call. A call that runs over keeps the text as is.
    pub fn with_translate_timeout(mut self, limit: Duration) -> Self {
        self.translate_timeout = Some(limit);
        self
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Filter, then transform. `now` drives the time-of-day and weekday filters.
    pub async fn process(&self, message: &InboundMessage, now: DateTime<Utc>) -> Processed {
        let ctx = FilterContext::new(now, self.tz);
        if let Verdict::Reject { filter, reason } = self.filters.evaluate(message, &ctx) {
            return Processed::Filtered { filter, reason };
        }

        let tctx = TransformContext {
            task_name: &self.task_name,
            source_title: self.source_titles.get(&message.source_id).map(String::as_str),
            translator: self.translator.as_deref(),
            translate_timeout: self.translate_timeout,
        };
        let out = self.transforms.apply(message, &tctx).await;

        // A text-only message cleaned down to nothing is not worth sending.
        if out.media.is_none() && out.body().trim().is_empty() {
            return Processed::Empty;
        }
        Processed::Ready(out)
    }
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("task_name", &self.task_name)
            .field("tz", &self.tz)
            .field("filters", &self.filters.len())
            .field("translator", &self.translator.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}
