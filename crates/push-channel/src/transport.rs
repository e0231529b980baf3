//! The long-poll transport contract consumed by the connection manager and
//! channel subscriptions.
//!
//! Every method is non-blocking: outcomes of network work arrive later through
//! the registered listener callbacks, on whatever task the transport drives
//! them from.

use std::sync::Arc;

use crate::types::Error;

/// Opaque handle to a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Something delivered to a channel listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A data message published by the server on the channel.
    Message(serde_json::Value),
    /// A publish on this channel failed after [`Transport::publish`] returned.
    PublishFailed(String),
}

/// Lifecycle notifications from the transport's meta channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaEvent {
    Handshake {
        successful: bool,
        error: Option<String>,
    },
    Connect {
        successful: bool,
        error: Option<String>,
    },
    Disconnect {
        successful: bool,
    },
    /// A non-fatal rejected message.
    Unsuccessful {
        channel: String,
        error: Option<String>,
    },
}

pub type MessageCallback = Arc<dyn Fn(Delivery) + Send + Sync>;
pub type MetaCallback = Arc<dyn Fn(MetaEvent) + Send + Sync>;

/// Server-push transport multiplexing named channels over one connection.
pub trait Transport: Send + Sync {
    /// Begin negotiating a connection. The outcome arrives as
    /// [`MetaEvent::Handshake`].
    fn handshake(&self, ext: serde_json::Value);

    /// Tear the connection down. With `sync`, [`MetaEvent::Disconnect`] is
    /// emitted before this returns.
    fn disconnect(&self, sync: bool);

    fn add_listener(&self, channel: &str, on_message: MessageCallback) -> ListenerHandle;

    /// Remove a channel or meta listener. Unknown handles are ignored.
    fn remove_listener(&self, handle: ListenerHandle);

    fn add_meta_listener(&self, on_meta: MetaCallback) -> ListenerHandle;

    /// Issue a publish and return as soon as it is on its way.
    fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), Error>;
}
