//! Collaborator contracts and the per-login context wiring everything
//! together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::channel::device::DeviceChannel;
use crate::channel::proxy_print::ProxyPrintChannel;
use crate::channel::user::UserChannel;
use crate::channel::{ChannelDeps, ChannelSubscription, Recoverable};
use crate::config::{ClientConfig, WatchdogSettings};
use crate::connection::ConnectionManager;
use crate::recovery::WakeUpCoordinator;
use crate::transport::Transport;
use crate::types::{BoxError, Result};
use crate::watchdog::{Clock, SystemClock, Watchdog};

/// The authenticated user session, as far as the event channels care.
#[async_trait]
pub trait Session: Send + Sync {
    fn is_logged_in(&self) -> bool;

    fn auth_token(&self) -> String;

    /// Ask the server to release the user channel's held poll, so a paused
    /// client does not keep a request parked. Runs on a spawned task.
    async fn interrupt_event_poll(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
pub trait Ui: Send + Sync {
    /// Tell the user the application was asleep and wait until they confirm.
    /// Returns false if they dismissed the prompt instead.
    async fn acknowledge_wake_up(&self) -> bool;

    fn show_busy(&self) {}

    fn hide_busy(&self) {}
}

struct Inner {
    session: Arc<dyn Session>,
    connection: ConnectionManager,
    user: ChannelSubscription<UserChannel>,
    device: ChannelSubscription<DeviceChannel>,
    proxy_print: ChannelSubscription<ProxyPrintChannel>,
    watchdog: Watchdog,
    coordinator: Arc<WakeUpCoordinator>,
    watchdog_settings: WatchdogSettings,
    active: AtomicBool,
}

impl Inner {
    fn on_handshake_success(&self) {
        self.user.add_listener();
        if self.watchdog.is_configured()
            && let Err(e) = self.watchdog.start(false)
        {
            tracing::warn!("Watchdog not started: {e}");
        }
        self.retry_failed_polls();
    }

    /// Polls issued while the transport was down fail; re-issue them once it
    /// is back.
    fn retry_failed_polls(&self) {
        self.user.retry_failed_poll();
        self.device.retry_failed_poll();
        self.proxy_print.retry_failed_poll();
    }

    fn logout(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!("Already logged out");
            return;
        }
        tracing::info!("Logging out");
        self.watchdog.stop();
        self.user.remove_listener();
        self.device.remove_listener();
        self.proxy_print.remove_listener();
        self.connection.stop();
    }
}

/// Everything one login needs: the connection, the three channels, the
/// watchdog and the recovery coordinator.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    /// Must be called inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<dyn Session>,
        ui: Arc<dyn Ui>,
        config: &ClientConfig,
    ) -> Result<Self> {
        Self::with_clock(transport, session, ui, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn Transport>,
        session: Arc<dyn Session>,
        ui: Arc<dyn Ui>,
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let connection = ConnectionManager::new(transport.clone());
        let deps = ChannelDeps {
            transport,
            status: connection.status(),
            session: session.clone(),
            ui: ui.clone(),
        };
        let user = ChannelSubscription::new(&config.channels.user, deps.clone());
        let device = ChannelSubscription::new(&config.channels.device, deps.clone());
        let proxy_print = ChannelSubscription::new(&config.channels.proxy_print, deps);

        let watchdog = Watchdog::new(clock);
        let channels: Vec<Arc<dyn Recoverable>> = vec![
            Arc::new(user.clone()) as Arc<dyn Recoverable>,
            Arc::new(device.clone()),
            Arc::new(proxy_print.clone()),
        ];
        let coordinator = Arc::new(WakeUpCoordinator::new(
            watchdog.clone(),
            channels,
            session.clone(),
            ui,
        )?);

        let inner = Arc::new(Inner {
            session,
            connection,
            user,
            device,
            proxy_print,
            watchdog,
            coordinator,
            watchdog_settings: config.watchdog,
            active: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.connection.on_handshake_success(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_handshake_success();
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.connection.on_reconnect(move || {
            if let Some(inner) = weak.upgrade() {
                inner.retry_failed_polls();
            }
        });
        let weak = Arc::downgrade(&inner.coordinator);
        inner.connection.on_connection_broken(move || {
            if let Some(coordinator) = weak.upgrade() {
                tracing::info!("Connection broken, restoring channels");
                coordinator.on_wake_up_auto_restore(false);
            }
        });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.user.on_forced_logout(move || {
            if let Some(inner) = weak.upgrade() {
                tracing::warn!("Server maintenance, forcing logout");
                inner.logout();
            }
        });

        Ok(Self { inner })
    }

    /// Arm the watchdog with the configured heartbeat and timeout, routing
    /// its wake-ups to the recovery coordinator. One-time.
    pub fn configure_watchdog(&self) -> Result<()> {
        let settings = self.inner.watchdog_settings;
        let on_wake = Arc::downgrade(&self.inner.coordinator);
        let on_auto_restore = on_wake.clone();
        self.inner.watchdog.configure(
            move |_delta_ms| {
                if let Some(coordinator) = on_wake.upgrade() {
                    coordinator.on_wake_up();
                }
            },
            std::time::Duration::from_secs(settings.heartbeat_secs),
            std::time::Duration::from_secs(settings.timeout_secs),
            move |defer| {
                if let Some(coordinator) = on_auto_restore.upgrade() {
                    coordinator.on_wake_up_auto_restore(defer);
                }
            },
        )
    }

    /// Start the connection. The user channel subscribes and the watchdog
    /// starts once the handshake succeeds.
    pub fn login(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
        let token = self.inner.session.auth_token();
        self.inner.connection.start(&token);
    }

    /// Tear everything down. Safe to call repeatedly.
    pub fn logout(&self) {
        self.inner.logout();
    }

    pub fn user(&self) -> &ChannelSubscription<UserChannel> {
        &self.inner.user
    }

    pub fn device(&self) -> &ChannelSubscription<DeviceChannel> {
        &self.inner.device
    }

    pub fn proxy_print(&self) -> &ChannelSubscription<ProxyPrintChannel> {
        &self.inner.proxy_print
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.inner.watchdog
    }

    pub fn coordinator(&self) -> &Arc<WakeUpCoordinator> {
        &self.inner.coordinator
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::test_support::{MockSession, MockTransport, MockUi};
    use crate::transport::{Delivery, MetaEvent};
    use crate::types::{ConnectionState, Error};
    use crate::watchdog::ManualClock;

    const USER: &str = "/service/user";
    const DEVICE: &str = "/service/device";

    struct Fixture {
        transport: Arc<MockTransport>,
        session: Arc<MockSession>,
        clock: ManualClock,
        ctx: SessionContext,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let session = Arc::new(MockSession::logged_in());
        let clock = ManualClock::new(1_000);
        let ctx = SessionContext::with_clock(
            transport.clone(),
            session.clone(),
            Arc::new(MockUi::default()),
            &ClientConfig::new("https://print.example.com/cometd"),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Fixture {
            transport,
            session,
            clock,
            ctx,
        }
    }

    fn establish(f: &Fixture) {
        f.ctx.login();
        f.transport.emit_meta(MetaEvent::Handshake {
            successful: true,
            error: None,
        });
        f.transport.emit_meta(MetaEvent::Connect {
            successful: true,
            error: None,
        });
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn login_subscribes_user_channel_after_handshake() {
        let f = fixture();
        f.ctx.configure_watchdog().unwrap();
        f.ctx.login();
        assert_eq!(
            f.transport.last_handshake(),
            Some(json!({"authToken": f.session.auth_token()}))
        );
        assert!(!f.ctx.user().is_subscribed());

        f.transport.emit_meta(MetaEvent::Handshake {
            successful: true,
            error: None,
        });
        assert!(f.ctx.user().is_subscribed());
        assert!(!f.ctx.device().is_subscribed());
        assert!(f.ctx.watchdog().is_running());
        assert_eq!(f.transport.publish_count(USER), 1);
    }

    #[tokio::test]
    async fn login_without_watchdog_still_subscribes() {
        let f = fixture();
        establish(&f);
        assert!(f.ctx.user().is_subscribed());
        assert!(!f.ctx.watchdog().is_running());
    }

    #[tokio::test]
    async fn configure_watchdog_is_one_time() {
        let f = fixture();
        f.ctx.configure_watchdog().unwrap();
        assert!(matches!(
            f.ctx.configure_watchdog(),
            Err(Error::WatchdogConfigured)
        ));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let f = fixture();
        f.ctx.configure_watchdog().unwrap();
        establish(&f);
        f.ctx.device().add_listener();

        f.ctx.logout();
        f.ctx.logout();
        assert_eq!(f.transport.disconnect_calls(), 1);
        assert!(!f.ctx.user().is_subscribed());
        assert!(!f.ctx.device().is_subscribed());
        assert!(!f.ctx.watchdog().is_running());
        assert!(!f.ctx.connection().is_on());
        assert_eq!(f.ctx.connection().state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn maintenance_forces_logout_after_handler() {
        let f = fixture();
        establish(&f);
        let order = Arc::new(AtomicUsize::new(0));
        let o = order.clone();
        let disconnects_seen = f.transport.clone();
        f.ctx.user().on_maintenance(move |_| {
            // The handler runs before the teardown.
            assert_eq!(disconnects_seen.disconnect_calls(), 0);
            o.fetch_add(1, Ordering::SeqCst);
        });

        f.ctx.user().pause();
        f.transport.deliver(
            USER,
            Delivery::Message(json!({"event": "SYS_MAINTENANCE", "msg": "upgrade"})),
        );
        assert_eq!(order.load(Ordering::SeqCst), 1);
        assert_eq!(f.transport.disconnect_calls(), 1);
        assert!(!f.ctx.user().is_subscribed());
        assert!(!f.ctx.connection().is_on());
    }

    #[tokio::test]
    async fn broken_connection_restores_silently() {
        let f = fixture();
        f.ctx.configure_watchdog().unwrap();
        establish(&f);
        assert_eq!(f.transport.publish_count(USER), 1);

        f.transport.emit_meta(MetaEvent::Connect {
            successful: false,
            error: Some("502".into()),
        });
        assert_eq!(f.ctx.connection().state(), ConnectionState::Broken);
        assert!(!f.ctx.user().is_subscribed());

        settle().await;
        assert!(f.ctx.user().is_subscribed());
        assert!(f.ctx.watchdog().is_running());
        assert!(!f.ctx.watchdog().is_deferred());
        assert_eq!(f.transport.publish_count(USER), 2);
    }

    #[tokio::test]
    async fn restore_poll_lost_during_outage_is_reissued_on_reconnect() {
        let f = fixture();
        establish(&f);
        f.transport.emit_meta(MetaEvent::Connect {
            successful: false,
            error: None,
        });
        settle().await;
        assert_eq!(f.transport.publish_count(USER), 2);

        // The restored poll went out while the server was unreachable.
        f.transport
            .deliver(USER, Delivery::PublishFailed("connection refused".into()));
        assert!(!f.ctx.user().is_poll_pending());

        f.transport.emit_meta(MetaEvent::Connect {
            successful: true,
            error: None,
        });
        settle().await;
        assert_eq!(f.ctx.connection().state(), ConnectionState::Connected);
        assert!(f.ctx.user().is_poll_pending());
        assert_eq!(f.transport.publish_count(USER), 3);
    }

    #[tokio::test]
    async fn poll_rejected_before_rehandshake_is_reissued() {
        let f = fixture();
        establish(&f);
        f.transport.emit_meta(MetaEvent::Connect {
            successful: false,
            error: Some("402::Unknown client".into()),
        });
        // No client id until the new handshake completes.
        f.transport.fail_publish(true);
        settle().await;
        assert!(f.ctx.user().is_subscribed());
        assert!(!f.ctx.user().is_poll_pending());

        f.transport.fail_publish(false);
        f.transport.emit_meta(MetaEvent::Handshake {
            successful: true,
            error: None,
        });
        assert!(f.ctx.user().is_poll_pending());
        assert_eq!(f.transport.publish_count(USER), 2);
    }

    #[tokio::test]
    async fn reconnect_leaves_caller_driven_channels_idle() {
        let f = fixture();
        establish(&f);
        f.ctx.device().add_listener();
        f.transport.deliver(
            DEVICE,
            Delivery::Message(json!({"event": "CARD_SWIPE", "cardNumber": "0042"})),
        );
        assert!(!f.ctx.device().is_poll_pending());

        f.transport.emit_meta(MetaEvent::Connect {
            successful: false,
            error: None,
        });
        f.transport.emit_meta(MetaEvent::Connect {
            successful: true,
            error: None,
        });
        assert_eq!(f.transport.publish_count(DEVICE), 1);
    }

    #[tokio::test]
    async fn late_check_auto_restores() {
        let f = fixture();
        f.ctx.configure_watchdog().unwrap();
        establish(&f);

        f.clock.advance(Duration::from_secs(90));
        assert!(f.ctx.coordinator().check_late_auto_restore());
        settle().await;
        assert!(f.ctx.user().is_subscribed());
        assert_eq!(f.ctx.watchdog().last_heartbeat_ms(), 91_000);
        assert_eq!(f.transport.publish_count(USER), 2);
    }
}
