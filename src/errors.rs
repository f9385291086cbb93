//! Error taxonomy for EggDesk.
//!
//! `StoreError` is produced at the remote-store boundary and carries enough
//! structure for the write paths to decide between "queue it" (transport
//! failures) and "surface it now" (validation, duplicates, schema drift).
//! `AppError` is what the service layer hands back to an embedding shell.

use thiserror::Error;

/// Errors from the hosted table store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transport-layer failure: DNS, refused connection, timeout, or the
    /// client already knows it is offline. These are the only errors the
    /// write boundary converts into offline-queue entries.
    #[error("network error: {0}")]
    Network(String),

    #[error("store credentials rejected")]
    Unauthorized,

    /// Unique-constraint violation (e.g. duplicate invoice number).
    #[error("duplicate row: {0}")]
    Duplicate(String),

    /// The remote schema does not match what we sent (unknown column and
    /// friends). Candidates for the reduced-payload retry.
    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("store endpoint not found: {0}")]
    NotFound(String),

    #[error("store server error (HTTP {code}): {message}")]
    Server { code: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// True when the failure should route the action into the offline queue
    /// rather than surfacing as an error.
    pub fn is_network(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }

    pub fn is_schema(&self) -> bool {
        matches!(self, StoreError::Schema(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate(_))
    }
}

/// Classify an opaque error message the way the write boundary does when all
/// it has is a string: transport keywords mean "network".
pub fn message_looks_like_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("network")
        || lower.contains("fetch")
        || lower.contains("connection")
        || lower.contains("connect")
        || lower.contains("offline")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("dns")
}

/// Service-layer errors surfaced to the embedding shell.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Bad user input; never queued, never written.
    #[error("{0}")]
    Validation(String),

    /// Record is past its edit window for this role.
    #[error("record can no longer be edited")]
    EditLocked,

    #[error("duplicate invoice number {0}")]
    DuplicateInvoice(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("local database error: {0}")]
    Local(String),
}

/// Fatal bootstrap failures. These halt initialization entirely instead of
/// letting the app start in a degraded state.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("missing required connection secret {0}")]
    MissingSecret(&'static str),

    #[error("local database init failed: {0}")]
    Database(String),

    #[error("logging init failed: {0}")]
    Logging(String),
}
