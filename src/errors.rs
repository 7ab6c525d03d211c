use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    /// Corrupt or inconsistent table of contents. Never retried.
    #[error("Backup integrity error: {0}")]
    Integrity(String),

    /// A user-named schema or relation cannot be resolved against the backup
    /// set or the target database.
    #[error("Filter resolution error: {0}")]
    Filter(String),

    #[error("Failed to execute statement: {0}")]
    Execution(String),

    /// Remote agent, pipe or helper problems detected on the cluster.
    #[error("Cluster transport error: {0}")]
    Transport(String),

    #[error("Restore terminated: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl RestoreError {
    /// A terminated run has its own exit path and is never reported as a
    /// critical failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RestoreError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancelled_is_cancellation() {
        assert!(RestoreError::Cancelled("signal".into()).is_cancellation());
        assert!(!RestoreError::Execution("boom".into()).is_cancellation());
        assert!(!RestoreError::Integrity("bad range".into()).is_cancellation());
    }

    #[test]
    fn test_io_error_converts() {
        let err: RestoreError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, RestoreError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
