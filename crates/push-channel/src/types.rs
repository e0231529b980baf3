//! Public types shared across the push-channel crate.

/// A boxed error type for collaborator callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle state of the shared transport connection.
///
/// `Idle` only before the first start; a stopped connection rests in
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Broken,
    Closed,
    Disconnecting,
}

/// What a channel does after dispatching an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepollPolicy {
    /// Invite the next poll before returning.
    Immediate,
    /// The handler was handed a [`DeferredRepoll`](crate::DeferredRepoll)
    /// and owns the decision.
    Deferred,
    /// Do not poll again; the caller decides if and when.
    Suppressed,
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bayeux protocol error: {0}")]
    Protocol(String),

    #[error("transport has no client id (handshake not completed)")]
    NotHandshaken,

    #[error("watchdog already configured")]
    WatchdogConfigured,

    #[error("watchdog not configured")]
    WatchdogNotConfigured,

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
