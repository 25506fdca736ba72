use thiserror::Error;

/// Typed error hierarchy for cadence.
///
/// Use at module boundaries (scheduling requests, config validation, persistence).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Invalid schedule: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CadenceError {
    /// Whether the error was caused by a malformed request from the caller.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Convenience alias for results using `CadenceError`.
pub type CadenceResult<T> = std::result::Result<T, CadenceError>;
