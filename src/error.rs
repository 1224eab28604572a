//! Custom error types for groundsql

use thiserror::Error;

/// Main error type for groundsql operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid DDL: {0}")]
    InvalidDdl(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index partition is empty: {0}")]
    EmptyIndex(String),

    #[error("No schema indexed for database '{0}'")]
    NoSchemaIndexed(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[cfg(feature = "pgvector")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Absence of data rather than a fault; callers should treat it as "no results".
    pub fn is_no_results(&self) -> bool {
        matches!(self, Error::EmptyIndex(_) | Error::NoSchemaIndexed(_))
    }

    /// Failures of an external dependency that the caller may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::EmbeddingUnavailable(_) => true,
            #[cfg(feature = "pgvector")]
            Error::Database(_) => true,
            _ => false,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", err))
    }
}

/// Result type alias for groundsql
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::EmptyIndex("db/table".to_string()).is_no_results());
        assert!(Error::NoSchemaIndexed("db".to_string()).is_no_results());
        assert!(!Error::NotFound("x".to_string()).is_no_results());

        assert!(Error::EmbeddingUnavailable("timeout".to_string()).is_transient());
        assert!(!Error::InvalidDdl("bad".to_string()).is_transient());
    }

    #[test]
    fn test_url_error_maps_to_config() {
        let err: Error = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
