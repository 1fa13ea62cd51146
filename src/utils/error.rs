use std::io;
use thiserror::Error;

/// Conflux global error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// A value in the database did not have the shape the reader expected.
    #[error("Database corruption detected: {0}")]
    BadDatabase(&'static str),

    /// Backend failure, wrapped with a contextual prefix identifying the
    /// failing query.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    BadConfig(&'static str),

    /// The request driving this read was cancelled; partial results are
    /// discarded by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        tracing::error!("Bad database: {}", message);
        Self::BadDatabase(message)
    }

    /// True for lookups that returned zero rows where at least one was
    /// required. The delta engine recovers these at room granularity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Conflux global result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recoverable() {
        assert!(Error::NotFound("no topology row").is_not_found());
        assert!(!Error::Database("select failed".to_owned()).is_not_found());
    }

    #[test]
    fn database_error_carries_context() {
        let error = Error::Database("events.select_recent_events: disk on fire".to_owned());
        assert!(error.to_string().contains("select_recent_events"));
    }
}
