//! Error types for the relay engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors raised by a `ConfigStore`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors a delivery sink may return outside its three-way result contract.
///
/// The worker treats every one of these as a permanent failure.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Sink {sink} failed: {reason}")]
    SinkFailed { sink: String, reason: String },

    #[error("Unexpected response from sink {sink}: {reason}")]
    UnexpectedResponse { sink: String, reason: String },

    #[error("Target {target_id} is not known to sink {sink}")]
    UnknownTarget { sink: String, target_id: i64 },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} configuration invalid: {reason}")]
    ConfigurationInvalid { task_id: i64, reason: String },

    #[error("Task {task_id} not found")]
    NotFound { task_id: i64 },

    #[error("Worker for task {task_id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        task_id: i64,
        state: String,
        target: String,
    },

    #[error("Worker for task {task_id} did not stop within {timeout:?}")]
    DrainTimeout { task_id: i64, timeout: Duration },
}

/// Errors building or running the filter and transform stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid {filter} filter: {reason}")]
    InvalidFilter {
        filter: &'static str,
        reason: String,
    },

    #[error("Translation to {language} failed: {reason}")]
    Translation { language: String, reason: String },
}

/// Result type alias for the relay engine.
pub type Result<T> = std::result::Result<T, Error>;
