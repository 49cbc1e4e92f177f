//! Shared error, config, and wire types for the distributed inference runtime.

pub mod batch;
pub mod config;
pub mod sampling;

pub use batch::{SegmentSpan, SeqBatch};
pub use config::RuntimeConfig;
pub use sampling::SamplingParams;

pub type RequestId = String;

pub type Result<T> = core::result::Result<T, RuntimeError>;

/// Error kinds from spec §7, propagated as typed results up to the worker's
/// `Forward` handler and the coordinator's request-level failure states.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("shape error: {0}")]
    ShapeError(String),
    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),
    #[error("layer sequence violation: {0}")]
    LayerSequence(String),
    #[error("rpc timeout after {0:?}")]
    RpcTimeout(std::time::Duration),
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("no covering path over layers")]
    NoCoveringPath,
    #[error("request cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
}

/// Terminal reason a sample stopped generating, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Length,
    Stop,
    Error,
    Cancelled,
}
