use thiserror::Error;

#[derive(Error, Debug)]
pub enum OssatureError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Invalid key '{key}': {reason}")]
    BadKey { key: String, reason: String },
    #[error("Schema definition error: {0}")]
    Definition(String),
    #[error("Unknown skeleton '{0}'")]
    UnknownKind(String),
    #[error("Unknown sub-skeleton '{name}' for skeleton '{kind}'")]
    UnknownSubSkeleton { kind: String, name: String },
    #[error("Query for kind '{found}' used with a skeleton of kind '{expected}'")]
    KindMismatch { expected: String, found: String },
    #[error("The value of property {field} has been recently claimed: {message}")]
    UniqueConflict { field: String, message: String },
    #[error("This skeleton is not in the database (anymore?)")]
    NotPersisted,
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl OssatureError {
    /// Conflicts are reported back to the user like any other field error,
    /// everything else aborts the operation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UniqueConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, OssatureError>;

// Helper conversions
impl From<rusqlite::Error> for OssatureError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for OssatureError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for OssatureError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for OssatureError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
