//! Connection lifecycle over the shared transport.
//!
//! Translates the transport's meta events into [`ConnectionState`]
//! transitions and lifecycle callbacks. The one distinction that matters to
//! the rest of the crate is broken versus closed: a broken connection (it was
//! up and a connect failed) warrants recovery, a closed one (we asked for it)
//! does not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::transport::{ListenerHandle, MetaCallback, MetaEvent, Transport};
use crate::types::ConnectionState;

/// Read-only view of the connection intent, handed to channels so they can
/// check it without being able to start or stop the shared transport.
#[derive(Debug, Clone)]
pub struct ConnectionStatus(Arc<AtomicBool>);

impl ConnectionStatus {
    pub(crate) fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    /// True between `start()` and `stop()`, whatever the network is doing.
    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, on: bool) {
        self.0.store(on, Ordering::SeqCst);
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type FailureCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connecting: Vec<Callback>,
    handshake_success: Vec<Callback>,
    handshake_failure: Vec<FailureCallback>,
    reconnect: Vec<Callback>,
    broken: Vec<Callback>,
    closed: Vec<Callback>,
    disconnecting: Vec<Callback>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    /// A connect has succeeded since the last `start()`.
    was_connected: bool,
}

/// What a meta event asks the manager to announce once the lock is released.
#[derive(Debug, Default, PartialEq, Eq)]
struct Effects {
    handshake: Option<Result<(), Option<String>>>,
    reconnect: bool,
    broken: bool,
    closed: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    status: ConnectionStatus,
    inner: Mutex<Inner>,
    callbacks: Mutex<Callbacks>,
    meta_handle: Mutex<Option<ListenerHandle>>,
}

impl Shared {
    fn on_meta(&self, event: MetaEvent) {
        let (from, to, effects) = {
            let mut inner = lock(&self.inner);
            let from = inner.state;
            let effects = transition(&mut inner, event);
            (from, inner.state, effects)
        };
        if from != to {
            tracing::info!(from = ?from, to = ?to, "Connection state changed");
        }
        self.announce(effects);
    }

    fn announce(&self, effects: Effects) {
        let callbacks = lock(&self.callbacks);
        let handshake_success = callbacks.handshake_success.clone();
        let handshake_failure = callbacks.handshake_failure.clone();
        let reconnect = callbacks.reconnect.clone();
        let broken = callbacks.broken.clone();
        let closed = callbacks.closed.clone();
        drop(callbacks);

        match effects.handshake {
            Some(Ok(())) => handshake_success.iter().for_each(|f| f()),
            Some(Err(error)) => handshake_failure.iter().for_each(|f| f(error.as_deref())),
            None => {}
        }
        if effects.reconnect {
            reconnect.iter().for_each(|f| f());
        }
        if effects.broken {
            broken.iter().for_each(|f| f());
        }
        if effects.closed {
            closed.iter().for_each(|f| f());
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.meta_handle).take() {
            self.transport.remove_listener(handle);
        }
    }
}

fn close(inner: &mut Inner, effects: &mut Effects) {
    // Rests here until the next start().
    inner.state = ConnectionState::Closed;
    inner.was_connected = false;
    effects.closed = true;
}

fn transition(inner: &mut Inner, event: MetaEvent) -> Effects {
    use ConnectionState::*;

    let mut effects = Effects::default();
    let current = inner.state;
    match event {
        MetaEvent::Handshake { successful, error } => {
            if matches!(current, Idle | Closed | Disconnecting) {
                tracing::debug!(state = ?current, "Late handshake reply ignored");
                return effects;
            }
            if successful {
                effects.handshake = Some(Ok(()));
            } else {
                tracing::warn!(error = ?error, "Handshake failed");
                effects.handshake = Some(Err(error));
                match current {
                    Connected => {
                        inner.state = Broken;
                        effects.broken = true;
                    }
                    Broken => inner.state = Reconnecting,
                    _ => {}
                }
            }
        }
        MetaEvent::Connect { successful, error } => match current {
            Disconnecting => close(inner, &mut effects),
            Idle | Closed => {
                tracing::debug!("Connect reply after close ignored");
            }
            state if successful => {
                if state != Connected {
                    if inner.was_connected {
                        effects.reconnect = true;
                    }
                    inner.state = Connected;
                    inner.was_connected = true;
                }
            }
            state => {
                tracing::debug!(error = ?error, "Connect failed");
                match state {
                    Connected => {
                        inner.state = Broken;
                        effects.broken = true;
                    }
                    Broken => inner.state = Reconnecting,
                    _ => {}
                }
            }
        },
        MetaEvent::Disconnect { successful } => {
            if !matches!(current, Idle | Closed) {
                tracing::debug!(successful, "Disconnect acknowledged");
                close(inner, &mut effects);
            }
        }
        MetaEvent::Unsuccessful { channel, error } => {
            tracing::debug!(channel = %channel, error = ?error, "Unsuccessful message swallowed");
        }
    }
    effects
}

/// Owns the start/stop intent of the shared transport and reports its
/// lifecycle.
///
/// Cheap to clone; clones share the same state and callbacks.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            transport,
            status: ConnectionStatus::new(false),
            inner: Mutex::new(Inner::default()),
            callbacks: Mutex::new(Callbacks::default()),
            meta_handle: Mutex::new(None),
        });
        let weak = Arc::downgrade(&shared);
        let on_meta: MetaCallback = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_meta(event);
            }
        });
        let handle = shared.transport.add_meta_listener(on_meta);
        *lock(&shared.meta_handle) = Some(handle);
        Self { shared }
    }

    /// Switch the connection on and begin the handshake. Not guarded against
    /// a second call.
    pub fn start(&self, auth_token: &str) {
        self.shared.status.set(true);
        {
            let mut inner = lock(&self.shared.inner);
            inner.state = ConnectionState::Connecting;
            inner.was_connected = false;
        }
        tracing::info!("Connecting");
        let connecting = lock(&self.shared.callbacks).connecting.clone();
        connecting.iter().for_each(|f| f());
        self.shared
            .transport
            .handshake(serde_json::json!({ "authToken": auth_token }));
    }

    /// Switch the connection off. The transport has disconnected by the time
    /// this returns.
    pub fn stop(&self) {
        let disconnecting = lock(&self.shared.callbacks).disconnecting.clone();
        disconnecting.iter().for_each(|f| f());
        self.shared.status.set(false);
        {
            let mut inner = lock(&self.shared.inner);
            if !matches!(inner.state, ConnectionState::Idle | ConnectionState::Closed) {
                inner.state = ConnectionState::Disconnecting;
            }
        }
        tracing::info!("Disconnecting");
        self.shared.transport.disconnect(true);
    }

    pub fn is_on(&self) -> bool {
        self.shared.status.is_on()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.clone()
    }

    pub fn on_connecting(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).connecting.push(Arc::new(f));
    }

    pub fn on_handshake_success(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).handshake_success.push(Arc::new(f));
    }

    pub fn on_handshake_failure(&self, f: impl Fn(Option<&str>) + Send + Sync + 'static) {
        lock(&self.shared.callbacks).handshake_failure.push(Arc::new(f));
    }

    /// Connected again after having been connected and lost it.
    pub fn on_reconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).reconnect.push(Arc::new(f));
    }

    /// Was connected, and a connect failed.
    pub fn on_connection_broken(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).broken.push(Arc::new(f));
    }

    pub fn on_connection_closed(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).closed.push(Arc::new(f));
    }

    pub fn on_disconnecting(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).disconnecting.push(Arc::new(f));
    }
}
