//! Error types for grid belief filtering.
//!
//! Errors here are deliberately coarse: the filters recover locally from
//! numerical degeneracy (a near-zero Bayes normalizer is a policy, not a
//! failure), so the only fallible paths are contract violations at component
//! boundaries — wrong shapes, invalid configuration, a replay buffer that is
//! too short to sample from, or a parameter set that does not fit the network
//! it is being loaded into. All of these are fatal to the call that raised
//! them and are surfaced as explicit `Result`s rather than panics.

use thiserror::Error;

/// The error type for all fallible filter operations.
#[derive(Debug, Error)]
pub enum FilterError {
    /// An observation, mask, or belief buffer does not match the configured
    /// grid dimensions or state/observation arity.
    #[error("shape mismatch in {context}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        /// Which argument or buffer was mis-sized.
        context: &'static str,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        actual: usize,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The trajectory memory does not hold enough consecutive frames to
    /// sample a window of the requested length.
    #[error("insufficient history: need {required} frames, buffer holds {available}")]
    InsufficientHistory {
        /// Window length requested.
        required: usize,
        /// Frames currently stored.
        available: usize,
    },

    /// A saved parameter set does not match the network it is being loaded
    /// into. There is no partial-load path; the load is rejected whole.
    #[error("incompatible parameter set: tensor `{name}` expected shape {expected:?}, got {actual:?}")]
    IncompatibleParameters {
        /// Name of the offending tensor.
        name: String,
        /// Shape required by the receiving network.
        expected: Vec<usize>,
        /// Shape found in the parameter set.
        actual: Vec<usize>,
    },
}

/// Result alias used throughout the crate.
pub type FilterResult<T> = Result<T, FilterError>;

impl FilterError {
    /// Convenience constructor for shape checks at call boundaries.
    pub(crate) fn shape(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FilterError::shape("observation", 48, 12);
        let msg = err.to_string();
        assert!(msg.contains("observation"));
        assert!(msg.contains("48"));
        assert!(msg.contains("12"));
    }

    #[test]
    fn test_insufficient_history_display() {
        let err = FilterError::InsufficientHistory {
            required: 10,
            available: 3,
        };
        assert!(err.to_string().contains("10"));
    }
}
