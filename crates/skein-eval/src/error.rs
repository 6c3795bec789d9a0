//! Error types for datasets and evaluations.

use thiserror::Error;

/// Result type alias for evaluation operations.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors raised while loading datasets.
///
/// Model and scorer failures are not errors of the evaluation: they are
/// recorded per row and counted in the summary.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A dataset line is not valid JSON.
    #[error("Invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A dataset line is valid JSON but not an object.
    #[error("Row on line {line} is not a JSON object")]
    NotAnObject { line: usize },
}
