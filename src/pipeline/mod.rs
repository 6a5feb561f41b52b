//! Per-message processing pipeline.
//!
//! Every inbound message routed to a task flows through:
//! 1. `FilterChain::evaluate()`: pure pass/reject predicates
//! 2. `TransformChain::apply()`: fixed-order content rewrite
//!
//! `MessagePipeline` bundles both for one task. Dedup, rate limiting and
//! delivery happen afterwards in the task worker.

pub mod buttons;
pub mod cleaning;
pub mod filters;
pub mod language;
pub mod processor;
pub mod transforms;
pub mod types;

pub use filters::{FilterChain, FilterConfig, FilterContext, Verdict};
pub use processor::{MessagePipeline, Processed};
pub use transforms::{TransformChain, TransformConfig};
pub use types::{DeliveryOptions, InboundMessage, MediaKind, MessagePayload, OutboundMessage};
