//! Channel subscriptions: one server-side publish target each, multiplexed
//! over the shared transport.
//!
//! The single correctness property everything here protects is that a
//! channel never has more than one poll outstanding. `poll_pending` is set
//! under the state lock before the publish goes out and cleared by whatever
//! resolves the poll: an event, a failed publish, an unsubscribe, or
//! recovery declaring the poll lost.

pub mod device;
pub mod proxy_print;
pub mod user;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::ConnectionStatus;
use crate::lock;
use crate::session::{Session, Ui};
use crate::transport::{Delivery, ListenerHandle, MessageCallback, Transport};
use crate::types::RepollPolicy;

/// Channel-specific vocabulary and dispatch rules.
pub trait ChannelKind: Send + Sync + Sized + 'static {
    type Event: DeserializeOwned + std::fmt::Debug + Send;
    type PollArgs: Serialize + Default + Send + Sync + 'static;
    type Handlers: Clone + Default + Send + Sync + 'static;

    const LABEL: &'static str;
    /// While paused, events that are not [`forced`](Self::is_forced) are
    /// dropped without dispatch or repoll.
    const PAUSE_SUPPRESSES_DISPATCH: bool;
    /// Pausing asks the server to drop its side of the outstanding poll.
    const SIGNALS_PAUSE: bool = false;
    /// Show the UI busy indicator while a poll is outstanding.
    const SHOWS_BUSY: bool = false;

    fn is_forced(_event: &Self::Event) -> bool {
        false
    }

    fn dispatch(
        handlers: &Self::Handlers,
        event: Self::Event,
        repoll: &RepollSource,
    ) -> RepollPolicy;
}

// ---------------------------------------------------------------------------
// Deferred repoll
// ---------------------------------------------------------------------------

trait Repoll: Send + Sync {
    fn invite_poll(&self);
    fn label(&self) -> &'static str;
}

/// Hands out [`DeferredRepoll`] tokens to dispatchers that delegate the next
/// poll to a handler.
pub struct RepollSource {
    channel: Weak<dyn Repoll>,
}

impl RepollSource {
    pub fn defer(&self) -> DeferredRepoll {
        DeferredRepoll {
            channel: self.channel.clone(),
            decided: false,
        }
    }
}

/// The obligation to invite the next poll, handed to a handler whose own
/// follow-up work (e.g. preloading page images) must finish first.
///
/// Dropping the token without calling [`repoll`](Self::repoll) or
/// [`skip`](Self::skip) logs a warning and invites the poll.
#[must_use = "the channel stalls until the next poll is invited; call repoll() or skip()"]
pub struct DeferredRepoll {
    channel: Weak<dyn Repoll>,
    decided: bool,
}

impl DeferredRepoll {
    pub fn repoll(mut self) {
        self.decided = true;
        if let Some(channel) = self.channel.upgrade() {
            channel.invite_poll();
        }
    }

    /// Explicitly leave the channel without a poll.
    pub fn skip(mut self) {
        self.decided = true;
    }
}

impl Drop for DeferredRepoll {
    fn drop(&mut self) {
        if self.decided {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            tracing::warn!(
                channel = channel.label(),
                "Deferred repoll dropped without a decision, inviting poll"
            );
            channel.invite_poll();
        }
    }
}

impl std::fmt::Debug for DeferredRepoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredRepoll")
            .field("decided", &self.decided)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

type ExceptionHandler = Arc<dyn Fn(&str) + Send + Sync>;
type InvitationHandler<A> = Arc<dyn Fn() -> A + Send + Sync>;

struct CommonHandlers<K: ChannelKind> {
    on_exception: Option<ExceptionHandler>,
    on_poll_invitation: Option<InvitationHandler<K::PollArgs>>,
}

impl<K: ChannelKind> Default for CommonHandlers<K> {
    fn default() -> Self {
        Self {
            on_exception: None,
            on_poll_invitation: None,
        }
    }
}

#[derive(Default)]
struct State {
    handle: Option<ListenerHandle>,
    poll_pending: Option<Instant>,
    /// The last poll was lost to a transport failure and nothing replaced it.
    poll_failed: bool,
    paused: bool,
}

/// Collaborators a channel needs. The connection is visible only through
/// its read-only status.
#[derive(Clone)]
pub(crate) struct ChannelDeps {
    pub transport: Arc<dyn Transport>,
    pub status: ConnectionStatus,
    pub session: Arc<dyn Session>,
    pub ui: Arc<dyn Ui>,
}

struct Shared<K: ChannelKind> {
    name: String,
    deps: ChannelDeps,
    state: Mutex<State>,
    handlers: Mutex<K::Handlers>,
    common: Mutex<CommonHandlers<K>>,
}

impl<K: ChannelKind> Shared<K> {
    fn poll(&self, args: K::PollArgs) {
        let payload = match serde_json::to_value(&args) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_exception(&format!("encode poll arguments: {e}"));
                return;
            }
        };
        {
            let mut state = lock(&self.state);
            if state.poll_pending.is_some() {
                tracing::debug!(channel = K::LABEL, "Poll already pending, skipping");
                return;
            }
            state.poll_pending = Some(Instant::now());
            state.poll_failed = false;
        }
        if K::SHOWS_BUSY {
            self.deps.ui.show_busy();
        }
        tracing::debug!(channel = K::LABEL, name = %self.name, "Poll issued");
        if let Err(e) = self.deps.transport.publish(&self.name, payload) {
            self.poll_lost_to_failure();
            self.report_exception(&e.to_string());
        }
    }

    /// Invite the next poll if the channel is live: subscribed, not paused,
    /// nothing outstanding, and the connection switched on.
    fn invite_poll(&self) {
        let ready = {
            let state = lock(&self.state);
            state.handle.is_some() && !state.paused && state.poll_pending.is_none()
        };
        if !ready || !self.deps.status.is_on() {
            tracing::debug!(channel = K::LABEL, "Poll invitation ignored");
            return;
        }
        let provider = lock(&self.common).on_poll_invitation.clone();
        let args = provider.map(|provide| provide()).unwrap_or_default();
        self.poll(args);
    }

    /// Returns whether a poll was outstanding.
    fn clear_pending(&self) -> bool {
        let was_pending = lock(&self.state).poll_pending.take().is_some();
        if K::SHOWS_BUSY && was_pending {
            self.deps.ui.hide_busy();
        }
        was_pending
    }

    fn poll_lost_to_failure(&self) {
        self.clear_pending();
        lock(&self.state).poll_failed = true;
    }

    fn report_exception(&self, message: &str) {
        let handler = lock(&self.common).on_exception.clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::warn!(channel = K::LABEL, "Unhandled channel exception: {message}"),
        }
    }

    fn on_delivery(self: &Arc<Self>, delivery: Delivery) {
        let value = match delivery {
            Delivery::Message(value) => {
                self.clear_pending();
                value
            }
            Delivery::PublishFailed(message) => {
                self.poll_lost_to_failure();
                self.report_exception(&message);
                return;
            }
        };
        let event: K::Event = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                self.report_exception(&format!("undecodable event: {e}"));
                return;
            }
        };

        let paused = lock(&self.state).paused;
        if paused && K::PAUSE_SUPPRESSES_DISPATCH && !K::is_forced(&event) {
            tracing::debug!(channel = K::LABEL, ?event, "Channel paused, event dropped");
            return;
        }

        tracing::debug!(channel = K::LABEL, ?event, "Dispatching event");
        let handlers = lock(&self.handlers).clone();
        let weak = Arc::downgrade(self);
        let channel: Weak<dyn Repoll> = weak;
        let policy = K::dispatch(&handlers, event, &RepollSource { channel });
        if policy == RepollPolicy::Immediate {
            self.invite_poll();
        }
    }
}

impl<K: ChannelKind> Repoll for Shared<K> {
    fn invite_poll(&self) {
        Shared::invite_poll(self);
    }

    fn label(&self) -> &'static str {
        K::LABEL
    }
}

/// One logical event channel over the shared transport.
///
/// Cheap to clone; clones share the same subscription.
pub struct ChannelSubscription<K: ChannelKind> {
    shared: Arc<Shared<K>>,
}

impl<K: ChannelKind> Clone for ChannelSubscription<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: ChannelKind> ChannelSubscription<K> {
    pub(crate) fn new(name: impl Into<String>, deps: ChannelDeps) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                deps,
                state: Mutex::new(State::default()),
                handlers: Mutex::new(K::Handlers::default()),
                common: Mutex::new(CommonHandlers::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Subscribe. Calling it while subscribed is a no-op; the first call
    /// also invites the first poll (deferred to `resume()` while paused).
    pub fn add_listener(&self) {
        let paused = {
            let mut state = lock(&self.shared.state);
            if state.handle.is_some() {
                tracing::debug!(channel = K::LABEL, "Already subscribed");
                return;
            }
            let weak = Arc::downgrade(&self.shared);
            let on_message: MessageCallback = Arc::new(move |delivery| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_delivery(delivery);
                }
            });
            state.handle = Some(
                self.shared
                    .deps
                    .transport
                    .add_listener(&self.shared.name, on_message),
            );
            state.paused
        };
        tracing::info!(channel = K::LABEL, name = %self.shared.name, "Subscribed");
        if !paused {
            self.shared.invite_poll();
        }
    }

    /// Unsubscribe if subscribed. Any outstanding poll is forgotten.
    pub fn remove_listener(&self) {
        let handle = {
            let mut state = lock(&self.shared.state);
            state.poll_failed = false;
            state.handle.take()
        };
        self.shared.clear_pending();
        if let Some(handle) = handle {
            self.shared.deps.transport.remove_listener(handle);
            tracing::info!(channel = K::LABEL, "Unsubscribed");
        }
    }

    /// Ask for the next event. A no-op while a poll is outstanding.
    pub fn poll(&self, args: K::PollArgs) {
        self.shared.poll(args);
    }

    pub fn pause(&self) {
        let was_paused = std::mem::replace(&mut lock(&self.shared.state).paused, true);
        if was_paused {
            return;
        }
        tracing::debug!(channel = K::LABEL, "Paused");
        if K::SIGNALS_PAUSE {
            self.signal_pause();
        }
    }

    /// Fire-and-forget: the server call runs on its own task.
    fn signal_pause(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(channel = K::LABEL, "No runtime, server-side poll not interrupted");
            return;
        };
        let session = self.shared.deps.session.clone();
        runtime.spawn(async move {
            if let Err(e) = session.interrupt_event_poll().await {
                tracing::warn!(channel = K::LABEL, "Failed to interrupt server-side poll: {e}");
            }
        });
    }

    pub fn resume(&self) {
        let idle = {
            let mut state = lock(&self.shared.state);
            state.paused = false;
            state.poll_pending.is_none()
        };
        tracing::debug!(channel = K::LABEL, "Resumed");
        if idle && self.shared.deps.status.is_on() {
            self.shared.invite_poll();
        }
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.shared.state).handle.is_some()
    }

    pub fn is_poll_pending(&self) -> bool {
        lock(&self.shared.state).poll_pending.is_some()
    }

    /// Re-issue a poll that a transport failure swallowed. Channels idle by
    /// choice (caller-driven repoll, suppressed events) are left alone.
    pub fn retry_failed_poll(&self) {
        let failed = lock(&self.shared.state).poll_failed;
        if failed {
            tracing::debug!(channel = K::LABEL, "Retrying poll lost to a transport failure");
            self.shared.invite_poll();
        }
    }

    /// Forget the outstanding poll without unsubscribing.
    pub fn mark_poll_lost(&self) {
        if self.shared.clear_pending() {
            tracing::debug!(channel = K::LABEL, "Outstanding poll marked lost");
        }
    }

    /// Called with the message of a failed publish or an undecodable event.
    pub fn on_exception(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.shared.common).on_exception = Some(Arc::new(handler));
    }

    /// Supplies the arguments of polls the channel issues on its own (first
    /// poll, resume, repoll). Without it, `PollArgs::default()` is used.
    pub fn on_poll_invitation(&self, provider: impl Fn() -> K::PollArgs + Send + Sync + 'static) {
        lock(&self.shared.common).on_poll_invitation = Some(Arc::new(provider));
    }

    pub(crate) fn set_handler(&self, set: impl FnOnce(&mut K::Handlers)) {
        set(&mut lock(&self.shared.handlers));
    }

    /// How long the outstanding poll has been waiting, if any.
    pub fn poll_pending_for(&self) -> Option<Duration> {
        lock(&self.shared.state)
            .poll_pending
            .map(|started| started.elapsed())
    }
}

/// Type-erased view used by recovery to drive every channel alike.
pub(crate) trait Recoverable: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn add_listener(&self);
    fn remove_listener(&self);
    fn mark_poll_lost(&self);
    fn is_subscribed(&self) -> bool;
    fn label(&self) -> &'static str;
}

impl<K: ChannelKind> Recoverable for ChannelSubscription<K> {
    fn pause(&self) {
        ChannelSubscription::pause(self);
    }

    fn resume(&self) {
        ChannelSubscription::resume(self);
    }

    fn add_listener(&self) {
        ChannelSubscription::add_listener(self);
    }

    fn remove_listener(&self) {
        ChannelSubscription::remove_listener(self);
    }

    fn mark_poll_lost(&self) {
        ChannelSubscription::mark_poll_lost(self);
    }

    fn is_subscribed(&self) -> bool {
        ChannelSubscription::is_subscribed(self)
    }

    fn label(&self) -> &'static str {
        K::LABEL
    }
}
