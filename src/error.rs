//! Error types for the Backup Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error, surfaced on the BackupJob status
    #[error("Validation error: {0}")]
    Validation(String),

    /// Owner reference could not be established yet
    #[error("Owner reference error: {0}")]
    OwnerReference(String),

    /// A kind needed for ownership is not in the type registry
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Object is missing a field the operator relies on
    #[error("Object is missing {0}")]
    MissingField(&'static str),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an owner reference error
    pub fn owner_reference(msg: impl Into<String>) -> Self {
        Error::OwnerReference(msg.into())
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Error::SchemaMismatch(msg.into())
    }

    /// HTTP status code of an API error response, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Optimistic-concurrency conflict on write
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409) && !self.is_already_exists()
    }

    /// Create lost a race against an object with the same name
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Errors retried by the controller rather than reported on status
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::OwnerReference(_) | Error::MissingField(_)
        )
    }
}
