//! Request error model.

use thiserror::Error;

/// Result type used across request construction.
pub type RequestResult<T> = Result<T, RequestError>;

/// Failure to turn raw submission fields into a [`crate::JobRequest`].
///
/// Every variant here is caused by caller input; none of them indicate an
/// infrastructure fault.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// A field failed validation (empty query, bad alphabet, bad mode).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested database is not in the catalog.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// A ticket could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl RequestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_database(name: impl Into<String>) -> Self {
        Self::UnknownDatabase(name.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
