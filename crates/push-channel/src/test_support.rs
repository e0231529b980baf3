//! In-crate doubles for the transport, session and UI collaborators.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::ChannelDeps;
use crate::connection::ConnectionStatus;
use crate::session::{Session, Ui};
use crate::transport::{
    Delivery, ListenerHandle, MessageCallback, MetaCallback, MetaEvent, Transport,
};
use crate::types::{BoxError, Error};

/// Records every call and lets tests push deliveries and meta events.
/// Callbacks are always invoked with no lock held, like the real transport.
pub(crate) struct MockTransport {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, (String, MessageCallback)>>,
    meta_listeners: Mutex<HashMap<u64, MetaCallback>>,
    add_listener_calls: AtomicUsize,
    publishes: Mutex<Vec<(String, serde_json::Value)>>,
    delivered: Mutex<HashMap<String, usize>>,
    handshakes: Mutex<Vec<serde_json::Value>>,
    disconnect_calls: AtomicUsize,
    fail_publish: AtomicBool,
    sync_disconnect_ack: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            meta_listeners: Mutex::new(HashMap::new()),
            add_listener_calls: AtomicUsize::new(0),
            publishes: Mutex::new(Vec::new()),
            delivered: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(Vec::new()),
            disconnect_calls: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            sync_disconnect_ack: AtomicBool::new(true),
        }
    }
}

impl MockTransport {
    pub fn deliver(&self, channel: &str, delivery: Delivery) {
        *self
            .delivered
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default() += 1;
        let callbacks: Vec<MessageCallback> = self
            .listeners
            .lock()
            .unwrap()
            .values()
            .filter(|(name, _)| name == channel)
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(delivery.clone());
        }
    }

    pub fn emit_meta(&self, event: MetaEvent) {
        let callbacks: Vec<MetaCallback> =
            self.meta_listeners.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// With `false`, `disconnect(true)` does not acknowledge on its own.
    pub fn set_sync_disconnect_ack(&self, ack: bool) {
        self.sync_disconnect_ack.store(ack, Ordering::SeqCst);
    }

    pub fn add_listener_calls(&self) -> usize {
        self.add_listener_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .values()
            .filter(|(name, _)| name == channel)
            .count()
    }

    pub fn meta_listener_count(&self) -> usize {
        self.meta_listeners.lock().unwrap().len()
    }

    pub fn publish_count(&self, channel: &str) -> usize {
        self.publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == channel)
            .count()
    }

    pub fn delivered_count(&self, channel: &str) -> usize {
        self.delivered
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    pub fn last_publish(&self) -> Option<(String, serde_json::Value)> {
        self.publishes.lock().unwrap().last().cloned()
    }

    pub fn last_handshake(&self) -> Option<serde_json::Value> {
        self.handshakes.lock().unwrap().last().cloned()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn next_handle(&self) -> ListenerHandle {
        ListenerHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Transport for MockTransport {
    fn handshake(&self, ext: serde_json::Value) {
        self.handshakes.lock().unwrap().push(ext);
    }

    fn disconnect(&self, sync: bool) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if sync && self.sync_disconnect_ack.load(Ordering::SeqCst) {
            self.emit_meta(MetaEvent::Disconnect { successful: true });
        }
    }

    fn add_listener(&self, channel: &str, on_message: MessageCallback) -> ListenerHandle {
        self.add_listener_calls.fetch_add(1, Ordering::SeqCst);
        let handle = self.next_handle();
        self.listeners
            .lock()
            .unwrap()
            .insert(handle.id(), (channel.to_string(), on_message));
        handle
    }

    fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().unwrap().remove(&handle.id());
        self.meta_listeners.lock().unwrap().remove(&handle.id());
    }

    fn add_meta_listener(&self, on_meta: MetaCallback) -> ListenerHandle {
        let handle = self.next_handle();
        self.meta_listeners
            .lock()
            .unwrap()
            .insert(handle.id(), on_meta);
        handle
    }

    fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), Error> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::NotHandshaken);
        }
        self.publishes
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }
}

pub(crate) struct MockSession {
    logged_in: AtomicBool,
    interrupts: AtomicUsize,
}

impl MockSession {
    pub fn logged_in() -> Self {
        Self {
            logged_in: AtomicBool::new(true),
            interrupts: AtomicUsize::new(0),
        }
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for MockSession {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn auth_token(&self) -> String {
        "test-token".to_string()
    }

    async fn interrupt_event_poll(&self) -> Result<(), BoxError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Acknowledges wake-ups immediately unless told to hold the prompt open.
#[derive(Default)]
pub(crate) struct MockUi {
    prompts: AtomicUsize,
    hold: AtomicBool,
    answer: Mutex<Option<bool>>,
    answered: tokio::sync::Notify,
    busy_shown: AtomicUsize,
    busy_hidden: AtomicUsize,
}

impl MockUi {
    pub fn hold_acknowledgement(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_acknowledgement(&self, acknowledged: bool) {
        *self.answer.lock().unwrap() = Some(acknowledged);
        self.answered.notify_one();
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn busy_shown(&self) -> usize {
        self.busy_shown.load(Ordering::SeqCst)
    }

    pub fn busy_hidden(&self) -> usize {
        self.busy_hidden.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ui for MockUi {
    async fn acknowledge_wake_up(&self) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if !self.hold.load(Ordering::SeqCst) {
            return true;
        }
        loop {
            let answer = self.answer.lock().unwrap().take();
            if let Some(answer) = answer {
                return answer;
            }
            self.answered.notified().await;
        }
    }

    fn show_busy(&self) {
        self.busy_shown.fetch_add(1, Ordering::SeqCst);
    }

    fn hide_busy(&self) {
        self.busy_hidden.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn deps(transport: Arc<MockTransport>, on: bool) -> ChannelDeps {
    deps_with(
        transport,
        on,
        Arc::new(MockSession::logged_in()),
        Arc::new(MockUi::default()),
    )
}

pub(crate) fn deps_with(
    transport: Arc<MockTransport>,
    on: bool,
    session: Arc<MockSession>,
    ui: Arc<MockUi>,
) -> ChannelDeps {
    ChannelDeps {
        transport,
        status: ConnectionStatus::new(on),
        session,
        ui,
    }
}
