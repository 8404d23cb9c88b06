use http::StatusCode;
use thiserror::Error;

pub use relay_common::store::StoreError;

/// Enumeration of errors related to receiving and checkpointing records.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("the event source is closed")]
    Closed,
}

/// Enumeration of errors related to querying the utilization signal.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("metrics endpoint is not configured")]
    Unconfigured,
    #[error("metric query failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Enumeration of errors surfaced by the downstream inference call.
///
/// `RateLimited` and `Upstream` leave the record un-checkpointed so the
/// broker redelivers it; `Configuration` is fatal at construction time and
/// never reported per call.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("invalid inference configuration: {0}")]
    Configuration(String),
    #[error("downstream signalled capacity exhaustion (429)")]
    RateLimited,
    #[error("downstream request failed with status {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("failed to reach the inference endpoint: {0}")]
    Request(#[from] reqwest::Error),
}

/// Errors that are fatal at worker startup, before the consume loop runs.
/// Per-record failures never surface here; they are logged and resolved by
/// broker redelivery.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
