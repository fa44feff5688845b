/// Core error type for trawler
///
/// Variants are classification tags, not a type hierarchy: callers match on
/// the kind to decide whether an error is a caller mistake (`Validation`),
/// lock contention to skip over (`Conflict`), a transient store problem to
/// retry next tick (`Database`), a job failure subject to the retry policy
/// (`Runner`), a cooperative stop (`Cancelled`), or a bug (`Invariant`).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Crawler error: {0}")]
    Runner(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error represents cooperative cancellation rather than a
    /// failure. Cancellation does not count against a job's retry budget.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
