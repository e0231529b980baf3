//! Bayeux long-polling transport over HTTP.
//!
//! A driver task owns the connection: it handshakes, then keeps one
//! `/meta/connect` long poll outstanding, splitting every reply batch into
//! the connect reply (reported as a [`MetaEvent`]) and data messages
//! (dispatched to channel listeners). Publishes go out on their own requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, TransportTiming};
use crate::lock;
use crate::protocol::{self, Advice, Message, channel, error_code, reconnect};
use crate::transport::{
    Delivery, ListenerHandle, MessageCallback, MetaCallback, MetaEvent, Transport,
};
use crate::types::{Error, Result};

const MAX_JITTER: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: initial, 2x, 4x, ... capped at `max_retry`.
fn backoff(timing: &TransportTiming, retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(30);
    timing
        .initial_retry()
        .saturating_mul(1u32 << exp)
        .min(timing.max_retry())
}

/// Sub-second jitter, never larger than the backoff it is added to.
fn jitter(backoff: Duration) -> Duration {
    let ceiling = backoff.min(MAX_JITTER).as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % ceiling)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    endpoint: url::Url,
    http: reqwest::Client,
    timing: TransportTiming,
    next_message_id: AtomicU64,
    next_handle: AtomicU64,
    client_id: Mutex<Option<String>>,
    listeners: Mutex<Vec<(ListenerHandle, String, MessageCallback)>>,
    meta_listeners: Mutex<Vec<(ListenerHandle, MetaCallback)>>,
    driver: Mutex<Option<Driver>>,
}

impl Shared {
    fn message_id(&self) -> String {
        self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn handle(&self) -> ListenerHandle {
        ListenerHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: MetaEvent) {
        let callbacks: Vec<MetaCallback> = lock(&self.meta_listeners)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    fn deliver(&self, name: &str, delivery: Delivery) {
        let callbacks: Vec<MessageCallback> = lock(&self.listeners)
            .iter()
            .filter(|(_, pattern, _)| protocol::channel_matches(pattern, name))
            .map(|(_, _, callback)| callback.clone())
            .collect();
        if callbacks.is_empty() {
            tracing::debug!(channel = name, "No listener for message");
        }
        for callback in callbacks {
            callback(delivery.clone());
        }
    }

    /// Hand data messages to listeners; acks and meta replies are skipped.
    fn dispatch(&self, messages: Vec<Message>, cancel: &CancellationToken) {
        for message in messages {
            if cancel.is_cancelled() {
                return;
            }
            if message.is_meta() {
                continue;
            }
            match message.data {
                Some(data) => self.deliver(&message.channel, Delivery::Message(data)),
                None if message.successful == Some(false) => {
                    let error = message
                        .error
                        .unwrap_or_else(|| "publish rejected".to_string());
                    self.emit(MetaEvent::Unsuccessful {
                        channel: message.channel.clone(),
                        error: Some(error.clone()),
                    });
                    self.deliver(&message.channel, Delivery::PublishFailed(error));
                }
                None => {}
            }
        }
    }

    async fn post(&self, messages: &[Message], timeout: Duration) -> Result<Vec<Message>> {
        let body = protocol::encode_batch(messages)?;
        let text = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json;charset=UTF-8")
            .timeout(timeout)
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        protocol::decode_batch(&text)
    }

    /// Split a reply batch into the reply on `meta` and everything else.
    fn take_reply(messages: Vec<Message>, meta: &str) -> Result<(Message, Vec<Message>)> {
        let (replies, rest): (Vec<_>, Vec<_>) =
            messages.into_iter().partition(|m| m.channel == meta);
        let reply = replies
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol(format!("no {meta} reply in batch")))?;
        Ok((reply, rest))
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Next {
    Connect,
    Handshake,
    Stop,
}

/// What the server advised after an unsuccessful reply.
fn advised(reply: &Message, advice: &Advice) -> Next {
    if reply.error_code() == Some(error_code::UNKNOWN_CLIENT) {
        return Next::Handshake;
    }
    match advice.reconnect.as_deref() {
        Some(reconnect::NONE) => Next::Stop,
        Some(reconnect::HANDSHAKE) => Next::Handshake,
        _ => Next::Connect,
    }
}

fn merge_advice(current: &mut Advice, update: Option<Advice>) {
    if let Some(update) = update {
        if update.reconnect.is_some() {
            current.reconnect = update.reconnect;
        }
        if update.interval.is_some() {
            current.interval = update.interval;
        }
        if update.timeout.is_some() {
            current.timeout = update.timeout;
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

async fn run_driver(shared: Arc<Shared>, ext: serde_json::Value, cancel: CancellationToken) {
    let mut retry_count: u32 = 0;
    let mut advice = Advice::default();

    'handshake: loop {
        let request = [Message::handshake(shared.message_id(), ext.clone())];
        let result = tokio::select! {
            r = shared.post(&request, shared.timing.connect_timeout()) => r,
            _ = cancel.cancelled() => return,
        };
        let reply = result.and_then(|batch| Shared::take_reply(batch, channel::HANDSHAKE));
        match reply {
            Ok((reply, rest)) if reply.is_successful() => {
                let Some(client_id) = reply.client_id.clone() else {
                    tracing::warn!("Handshake reply without client id");
                    shared.emit(MetaEvent::Handshake {
                        successful: false,
                        error: Some("handshake reply without clientId".into()),
                    });
                    retry_count += 1;
                    let delay = backoff(&shared.timing, retry_count);
                    if !pause(&cancel, delay + jitter(delay)).await {
                        return;
                    }
                    continue 'handshake;
                };
                tracing::info!(client_id = %client_id, "Handshake successful");
                *lock(&shared.client_id) = Some(client_id);
                merge_advice(&mut advice, reply.advice);
                retry_count = 0;
                shared.emit(MetaEvent::Handshake {
                    successful: true,
                    error: None,
                });
                shared.dispatch(rest, &cancel);
            }
            Ok((reply, _)) => {
                tracing::warn!(error = ?reply.error, "Handshake rejected");
                merge_advice(&mut advice, reply.advice.clone());
                shared.emit(MetaEvent::Handshake {
                    successful: false,
                    error: reply.error.clone(),
                });
                if matches!(advised(&reply, &advice), Next::Stop) {
                    tracing::warn!("Server advised not to reconnect");
                    return;
                }
                retry_count += 1;
                let delay = backoff(&shared.timing, retry_count);
                if !pause(&cancel, delay + jitter(delay)).await {
                    return;
                }
                continue 'handshake;
            }
            Err(e) => {
                tracing::warn!("Handshake attempt {} failed: {e}", retry_count + 1);
                shared.emit(MetaEvent::Handshake {
                    successful: false,
                    error: Some(e.to_string()),
                });
                retry_count += 1;
                let delay = backoff(&shared.timing, retry_count);
                if !pause(&cancel, delay + jitter(delay)).await {
                    return;
                }
                continue 'handshake;
            }
        }

        let mut first = true;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(client_id) = lock(&shared.client_id).clone() else {
                return;
            };
            let request = [Message::connect(shared.message_id(), &client_id, first)];
            let hold = advice
                .timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| shared.timing.connect_timeout());
            let result = tokio::select! {
                r = shared.post(&request, hold + shared.timing.long_poll_margin()) => r,
                _ = cancel.cancelled() => return,
            };
            first = false;

            let reply = result.and_then(|batch| Shared::take_reply(batch, channel::CONNECT));
            match reply {
                Ok((reply, rest)) => {
                    merge_advice(&mut advice, reply.advice.clone());
                    shared.dispatch(rest, &cancel);
                    if cancel.is_cancelled() {
                        return;
                    }
                    if reply.is_successful() {
                        retry_count = 0;
                        shared.emit(MetaEvent::Connect {
                            successful: true,
                            error: None,
                        });
                        let interval = Duration::from_millis(advice.interval.unwrap_or(0));
                        if !pause(&cancel, interval).await {
                            return;
                        }
                        continue;
                    }
                    tracing::warn!(error = ?reply.error, "Connect rejected");
                    shared.emit(MetaEvent::Connect {
                        successful: false,
                        error: reply.error.clone(),
                    });
                    retry_count += 1;
                    let delay = backoff(&shared.timing, retry_count);
                    match advised(&reply, &advice) {
                        Next::Stop => {
                            tracing::warn!("Server advised not to reconnect");
                            return;
                        }
                        Next::Handshake => {
                            *lock(&shared.client_id) = None;
                            if !pause(&cancel, delay + jitter(delay)).await {
                                return;
                            }
                            continue 'handshake;
                        }
                        Next::Connect => {
                            if !pause(&cancel, delay + jitter(delay)).await {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    retry_count += 1;
                    tracing::warn!("Connect attempt {retry_count} failed: {e}");
                    shared.emit(MetaEvent::Connect {
                        successful: false,
                        error: Some(e.to_string()),
                    });
                    let delay = backoff(&shared.timing, retry_count);
                    if !pause(&cancel, delay + jitter(delay)).await {
                        return;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public transport
// ---------------------------------------------------------------------------

/// [`Transport`] speaking Bayeux long polling to `server.url`.
pub struct BayeuxTransport {
    shared: Arc<Shared>,
}

impl BayeuxTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.server.url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.transport.connect_timeout())
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                http,
                timing: config.transport,
                next_message_id: AtomicU64::new(1),
                next_handle: AtomicU64::new(1),
                client_id: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                meta_listeners: Mutex::new(Vec::new()),
                driver: Mutex::new(None),
            }),
        })
    }

    /// The server-assigned client id, once a handshake succeeded.
    pub fn client_id(&self) -> Option<String> {
        lock(&self.shared.client_id).clone()
    }

    /// The task returns at its next cancellation check.
    fn cancel_driver(&self) {
        if let Some(driver) = lock(&self.shared.driver).take() {
            driver.cancel.cancel();
            drop(driver.task);
        }
    }

    fn current_cancel(&self) -> CancellationToken {
        lock(&self.shared.driver)
            .as_ref()
            .map(|driver| driver.cancel.clone())
            .unwrap_or_default()
    }
}

impl Transport for BayeuxTransport {
    fn handshake(&self, ext: serde_json::Value) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.shared.emit(MetaEvent::Handshake {
                    successful: false,
                    error: Some(Error::NoRuntime.to_string()),
                });
                return;
            }
        };
        self.cancel_driver();
        *lock(&self.shared.client_id) = None;

        // Held across the spawn so publishes from the new driver see its token.
        let mut driver = lock(&self.shared.driver);
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_driver(self.shared.clone(), ext, cancel.clone()));
        *driver = Some(Driver { cancel, task });
        drop(driver);
        tracing::debug!(endpoint = %self.shared.endpoint, "Handshake started");
    }

    fn disconnect(&self, sync: bool) {
        self.cancel_driver();
        let client_id = lock(&self.shared.client_id).take();

        let runtime = tokio::runtime::Handle::try_current().ok();
        match (client_id, runtime) {
            (Some(client_id), Some(runtime)) => {
                let shared = self.shared.clone();
                let request = [Message::disconnect(shared.message_id(), &client_id)];
                runtime.spawn(async move {
                    let result = shared
                        .post(&request, shared.timing.connect_timeout())
                        .await
                        .and_then(|batch| Shared::take_reply(batch, channel::DISCONNECT));
                    let successful = match result {
                        Ok((reply, _)) => reply.is_successful(),
                        Err(e) => {
                            tracing::debug!("Disconnect request failed: {e}");
                            false
                        }
                    };
                    if !sync {
                        shared.emit(MetaEvent::Disconnect { successful });
                    }
                });
            }
            _ if !sync => self.shared.emit(MetaEvent::Disconnect { successful: true }),
            _ => {}
        }
        if sync {
            self.shared.emit(MetaEvent::Disconnect { successful: true });
        }
        tracing::info!("Disconnected");
    }

    fn add_listener(&self, channel: &str, on_message: MessageCallback) -> ListenerHandle {
        let handle = self.shared.handle();
        lock(&self.shared.listeners).push((handle, channel.to_string(), on_message));
        handle
    }

    fn remove_listener(&self, handle: ListenerHandle) {
        lock(&self.shared.listeners).retain(|(h, _, _)| *h != handle);
        lock(&self.shared.meta_listeners).retain(|(h, _)| *h != handle);
    }

    fn add_meta_listener(&self, on_meta: MetaCallback) -> ListenerHandle {
        let handle = self.shared.handle();
        lock(&self.shared.meta_listeners).push((handle, on_meta));
        handle
    }

    fn publish(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let client_id = lock(&self.shared.client_id)
            .clone()
            .ok_or(Error::NotHandshaken)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let request = [Message::publish(self.shared.message_id(), &client_id, name, payload)];
        let shared = self.shared.clone();
        let cancel = self.current_cancel();
        let name = name.to_string();
        runtime.spawn(async move {
            let result = tokio::select! {
                r = shared.post(&request, shared.timing.connect_timeout()) => r,
                _ = cancel.cancelled() => return,
            };
            match result {
                Ok(batch) => shared.dispatch(batch, &cancel),
                Err(e) => {
                    tracing::warn!(channel = %name, "Publish failed: {e}");
                    shared.deliver(&name, Delivery::PublishFailed(e.to_string()));
                }
            }
        });
        Ok(())
    }
}

impl Drop for BayeuxTransport {
    fn drop(&mut self) {
        self.cancel_driver();
    }
}
