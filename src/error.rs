//! Error types for the training engine.
//!
//! Every fallible operation in the crate returns [`Result<T>`]. Shape and
//! configuration problems are surfaced when a model is bound, not while it
//! runs; numeric edge cases (log of zero, zero variance) are absorbed with a
//! small epsilon instead of being reported.

use thiserror::Error;

/// All error conditions raised by the engine.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Non-positive or mutually incompatible dimensions, raised at bind time.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A batch size of zero was passed to forward/backward.
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(usize),

    /// A layer/cost/activation pairing that has no defined derivative.
    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),

    /// Malformed, truncated or unrecognised model file.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A flat buffer does not have `batch * shape.size()` elements.
    #[error("dimension mismatch: expected {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Operation called in the wrong lifecycle state (e.g. backward before forward).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid training or architecture configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Checks that a buffer holds exactly `expected` values.
pub(crate) fn check_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(NetworkError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Rejects a zero batch size.
pub(crate) fn check_batch(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(NetworkError::InvalidBatchSize(batch_size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(check_len(4, 4).is_ok());
        match check_len(3, 4) {
            Err(NetworkError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_check_batch_rejects_zero() {
        assert!(matches!(
            check_batch(0),
            Err(NetworkError::InvalidBatchSize(0))
        ));
        assert!(check_batch(1).is_ok());
    }

    #[test]
    fn test_error_messages() {
        let err = NetworkError::InvalidShape("filter larger than input".to_string());
        assert_eq!(err.to_string(), "invalid shape: filter larger than input");
    }
}
