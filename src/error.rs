/// Error types for history engine operations.
///
/// Configuration mistakes surface immediately to the caller, while geometry
/// failures for a single record are logged and absorbed by the iterator. The
/// enum below covers both so that capability implementations can report
/// through the same channel.
use thiserror::Error;

/// The main error type for engine operations.
///
/// All fallible operations return `Result<T, EngineError>`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A pipeline or aggregator was configured in an illegal order
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the rejected call
        reason: String,
    },

    /// A timestamp or period could not be parsed
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Entity history data is malformed
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Description of why the data is invalid
        reason: String,
    },

    /// Geometry construction or a topology operation failed
    #[error("Geometry error: {0}")]
    Geometry(String),

    /// The reduction ran past its deadline
    #[error("Query timed out after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds spent before the deadline check fired
        elapsed_ms: u128,
    },

    /// A type-erased stage received an element of the wrong type
    #[error("Stage expected an element of type {expected}")]
    StageTypeMismatch {
        /// Name of the type the stage was built for
        expected: &'static str,
    },

    /// Invalid regular expression in a tag filter
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Serialization error when reading configuration
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for an [`EngineError::InvalidConfiguration`].
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Whether this error is the cooperative cancellation failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
