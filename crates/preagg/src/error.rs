// Error types for pre-aggregation loading and refresh
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving or rebuilding a pre-aggregation.
///
/// Cloneable: a single in-flight listing fetch or queue job hands the same
/// outcome to every waiter, and the refresh-error registry keeps the last
/// failure to re-raise it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing collaborator, e.g. no external driver factory for an external pre-aggregation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Driver lacks an operation the selected refresh strategy needs
    #[error("Can't load external pre-aggregation: {0}")]
    Capability(String),

    /// Queue asks the caller to re-attempt resolution; not a failure
    #[error("Continue waiting for pre-aggregation rebuild")]
    ContinueWait,

    #[error(
        "Pre-aggregation table is not found for {table_name} after it was successfully created. \
         It usually means database silently truncates table names due to max name length."
    )]
    TableNotFoundAfterBuild { table_name: String },

    #[error("Driver error: {0}")]
    Driver(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Cache backend error: {0}")]
    Cache(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Query cache error: {0}")]
    QueryCache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl Error {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Error::Configuration(message.into())
    }

    pub fn capability<S: Into<String>>(message: S) -> Self {
        Error::Capability(message.into())
    }

    /// Wrap any driver-level error
    pub fn driver<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Driver(Arc::new(err))
    }

    /// Driver error from a plain message
    pub fn driver_message<S: Into<String>>(message: S) -> Self {
        Error::Driver(Arc::new(DriverMessage(message.into())))
    }

    #[must_use]
    pub fn is_continue_wait(&self) -> bool {
        matches!(self, Error::ContinueWait)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Join(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DriverMessage(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_wait_is_not_a_failure_kind() {
        assert!(Error::ContinueWait.is_continue_wait());
        assert!(!Error::driver_message("boom").is_continue_wait());
    }

    #[test]
    fn test_driver_error_display_and_clone() {
        let err = Error::driver_message("relation does not exist");
        let copy = err.clone();
        assert_eq!(err.to_string(), "Driver error: relation does not exist");
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_not_found_after_build_mentions_table() {
        let err = Error::TableNotFoundAfterBuild {
            table_name: "stb.orders".to_string(),
        };
        assert!(err.to_string().contains("stb.orders"));
    }
}
