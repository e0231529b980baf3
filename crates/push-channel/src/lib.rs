//! Long-poll server-push event channel with watchdog-driven recovery.
//!
//! A print-management client holds one long-poll connection to its server
//! and multiplexes three event channels over it: the user channel (new print
//! jobs, account changes, maintenance shutdown), the card-reader channel and
//! the print-completion channel.
//!
//! # Features
//! - Bayeux-over-HTTP long-polling transport with server advice and backoff
//! - Connection lifecycle distinguishing broken from closed connections
//! - Idempotent channel subscription with at most one outstanding poll
//! - Pause/resume of live updates, with maintenance events always delivered
//! - Heartbeat watchdog detecting a suspended runtime
//! - Interactive and silent wake-up recovery
//!
//! # Example
//! ```no_run
//! # async fn example(
//! #     session: std::sync::Arc<dyn push_channel::Session>,
//! #     ui: std::sync::Arc<dyn push_channel::Ui>,
//! # ) -> Result<(), push_channel::Error> {
//! use std::sync::Arc;
//! use push_channel::{BayeuxTransport, ClientConfig, RepollPolicy, SessionContext};
//!
//! let config = ClientConfig::new("https://print.example.com/cometd");
//! let transport = Arc::new(BayeuxTransport::new(&config)?);
//! let ctx = SessionContext::new(transport, session, ui, &config)?;
//!
//! ctx.user().on_print_in(|event, repoll| {
//!     println!("new jobs: {:?}", event.data);
//!     repoll.repoll();
//! });
//! ctx.user().on_event_error(|message| {
//!     eprintln!("server error: {message}");
//!     RepollPolicy::Suppressed
//! });
//! ctx.configure_watchdog()?;
//! ctx.login();
//! # Ok(())
//! # }
//! ```

mod bayeux;
mod channel;
mod config;
mod connection;
pub mod protocol;
mod recovery;
mod session;
mod transport;
mod types;
mod watchdog;

#[cfg(test)]
mod test_support;

pub use bayeux::BayeuxTransport;
pub use channel::device::{CardSwipe, DeviceChannel, DeviceEvent, DeviceHandlers, DevicePollArgs};
pub use channel::proxy_print::{
    PrintCompleted, ProxyPrintChannel, ProxyPrintEvent, ProxyPrintHandlers, ProxyPrintPollArgs,
};
pub use channel::user::{PrintIn, UserChannel, UserEvent, UserHandlers, UserPollArgs};
pub use channel::{ChannelKind, ChannelSubscription, DeferredRepoll, RepollSource};
pub use config::{ChannelNames, ClientConfig, ServerConfig, TransportTiming, WatchdogSettings, load};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use recovery::WakeUpCoordinator;
pub use session::{Session, SessionContext, Ui};
pub use transport::{Delivery, ListenerHandle, MessageCallback, MetaCallback, MetaEvent, Transport};
pub use types::{BoxError, ConnectionState, Error, RepollPolicy, Result};
pub use watchdog::{Clock, ManualClock, SystemClock, Watchdog};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
