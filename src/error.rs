//! Typed failure kinds for the reconciliation engine.
//!
//! Plumbing code (storage, HTTP, config files) uses `anyhow`; these variants
//! exist where a caller needs to branch on *what* went wrong.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A configuration value failed validation. Only the offending key is
    /// affected; it keeps its previous value.
    #[error("invalid value for {key}: {message}")]
    ConfigValidation { key: String, message: String },

    /// A backend could not be reached or returned garbage during fetch.
    #[error("backend {backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// A single dispatched request failed.
    #[error("request to {backend} for item {item_id} failed: {message}")]
    RequestFailure {
        backend: String,
        item_id: String,
        message: String,
    },

    /// The item has no guid or no backend-local id for the operation.
    #[error("unmatched entity: {0}")]
    UnmatchedEntity(String),

    /// An observation was missing a required field.
    #[error("malformed observation from {backend}: {message}")]
    Malformed { backend: String, message: String },

    /// No configured backend survived the fetch phase.
    #[error("no backends available for this run")]
    NoBackends,

    /// The dispatch batch hit the run-level deadline.
    #[error("request cancelled by run timeout")]
    Cancelled,
}

impl SyncError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::ConfigValidation {
            key: key.into(),
            message: message.into(),
        }
    }
}
