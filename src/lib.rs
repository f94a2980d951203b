//! WaCRM sync - real-time ticket and chat synchronization client
//!
//! This library keeps a client-side view of a WhatsApp CRM inbox consistent
//! with its backend: the ticket list of the active status tab, the message
//! stream of the selected conversation, and the optimistic edits a user makes
//! before the backend confirms them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod messages;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod sync;
pub mod tickets;
pub mod transport;

#[cfg(test)]
mod tests;

/// Result type alias for WaCRM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for WaCRM operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Real-time channel error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code returned by the backend
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// HTTP client error (connect, timeout, body decoding)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed packet or event payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Referenced ticket or message is not held locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation was abandoned because the session shut down
    #[error("Operation cancelled")]
    Cancelled,

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// How a fetch ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The response replaced the local state
    Applied,
    /// A newer request was issued meanwhile; the response was discarded
    Superseded,
}

/// Await `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T, F>(cancel: &tokio_util::sync::CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Initialize logging for the WaCRM library
///
/// Honours `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
