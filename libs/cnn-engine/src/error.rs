//! Error type shared by every layer of the engine.
//!
//! Caller-usage errors (bad shapes, batch id misuse, unknown parameter
//! names) are raised synchronously at the offending call, before any module
//! state changes. Device faults are reported as [`Error::Device`] and are
//! never retried.

use crate::scheduler::BatchId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A host buffer or shape descriptor disagrees with what the call expects.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// Per-call batch size exceeds the capacity fixed at init.
    #[error("batch of {requested} samples exceeds configured capacity {capacity}")]
    BatchTooLarge { requested: usize, capacity: usize },

    #[error("batch must contain at least one sample")]
    EmptyBatch,

    /// A loss label is not an integral class index in `[0, classes)`.
    #[error("invalid label {value} at position {index}: expected a class index below {classes}")]
    InvalidLabel {
        index: usize,
        value: f32,
        classes: usize,
    },

    #[error("batch id {0} is already active")]
    DuplicateBatchId(BatchId),

    #[error("batch id {0} is not active")]
    UnknownBatchId(BatchId),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("unknown network id {0}")]
    UnknownNetwork(i32),

    #[error("unknown updater id {0}")]
    UnknownUpdater(i32),

    #[error("module has no updater configured")]
    NoUpdater,

    /// Backward was requested without a preceding training-mode forward pass.
    #[error("backward pass requires a preceding training-mode forward pass")]
    MissingForwardPass,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn shape(what: &'static str, expected: impl ToString, got: impl ToString) -> Self {
        Error::ShapeMismatch {
            what,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = Error::shape("input", "[4, 32, 32, 3]", "[4, 32, 32, 1]");
        assert_eq!(
            err.to_string(),
            "shape mismatch for input: expected [4, 32, 32, 3], got [4, 32, 32, 1]"
        );
    }

    #[test]
    fn test_batch_id_messages() {
        assert_eq!(Error::DuplicateBatchId(7).to_string(), "batch id 7 is already active");
        assert_eq!(Error::UnknownBatchId(-1).to_string(), "batch id -1 is not active");
    }

    #[test]
    fn test_json_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
