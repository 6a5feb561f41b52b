//! Relay engine: multi-tenant message forwarding.

pub mod channels;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod store;
pub mod task;
pub mod worker;
