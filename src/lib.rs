//! EchoSync - local-first synchronization and presence engine
//!
//! This library keeps an on-device persistent cache consistent with a
//! remote, multi-writer, real-time-notifying backend, layering client-only
//! semantics (soft deletion, pinning, unread counters, read receipts,
//! online/last-seen presence) on top of a backend that offers no
//! server-side business logic.
//!
//! The engine is split into five independently testable components:
//! - [`store`] - durable local tables that serve the UI when offline
//! - [`remote`] - live-query subscriptions and writes against the document store
//! - [`presence`] - online/offline state with a server-side disconnect hook
//! - [`sync`] - the reconciliation loop and all client-driven mutations
//! - [`view`] - pure derivation of the conversation list and timelines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod paths;
pub mod presence;
pub mod remote;
pub mod store;
pub mod sync;
pub mod view;

/// Result type alias for EchoSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for EchoSync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No authenticated identity is available for the operation
    #[error("Not authenticated")]
    NotAuthenticated,

    /// A referenced user, group, conversation or message is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted to write outside the caller's owned scope
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Optimistic-concurrency retries were exhausted
    #[error("Transaction aborted after retry limit")]
    TransactionAborted,

    /// The backend cannot currently be reached
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Some writes in a fan-out batch succeeded, others did not
    #[error("Partial batch failure: {failed:?}")]
    PartialBatchFailure {
        /// Paths of the writes that failed
        failed: Vec<String>,
    },

    /// Storage operation error
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize the EchoSync library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
