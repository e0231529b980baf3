//! Heartbeat watchdog.
//!
//! A repeating timer records a heartbeat on every tick. Timers do not fire
//! while the process is frozen (backgrounded, device asleep), so a tick that
//! finds the last heartbeat far in the past on the wall clock means the
//! runtime was suspended and every long poll may be dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lock;
use crate::types::{Error, Result};

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub type WakeCallback = Arc<dyn Fn(u64) + Send + Sync>;
pub type AutoRestoreCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct WatchdogConfig {
    heartbeat: Duration,
    timeout: Duration,
    on_wake: WakeCallback,
    on_wake_auto_restore: AutoRestoreCallback,
}

#[derive(Default)]
struct RuntimeState {
    last_heartbeat_ms: u64,
    defer: bool,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    config: OnceLock<WatchdogConfig>,
    state: std::sync::Mutex<RuntimeState>,
}

/// Outcome of comparing the wall clock with the last heartbeat.
enum Check {
    Alive,
    Deferred,
    Woke(u64),
}

impl Shared {
    fn check(&self) -> Option<(Check, &WatchdogConfig)> {
        let config = self.config.get()?;
        let now = self.clock.now_ms();
        let mut state = lock(&self.state);
        let delta_ms = now.saturating_sub(state.last_heartbeat_ms);
        if delta_ms > config.timeout.as_millis() as u64 {
            if state.defer {
                // Baseline kept: the condition re-fires until defer is lifted.
                return Some((Check::Deferred, config));
            }
            state.last_heartbeat_ms = now;
            return Some((Check::Woke(delta_ms), config));
        }
        state.last_heartbeat_ms = now;
        Some((Check::Alive, config))
    }

    fn tick(&self) {
        match self.check() {
            Some((Check::Woke(delta_ms), config)) => {
                tracing::info!(delta_ms, "Heartbeat overdue, runtime was suspended");
                (config.on_wake)(delta_ms);
            }
            Some((Check::Deferred, _)) => {
                tracing::debug!("Heartbeat overdue, wake-up deferred");
            }
            Some((Check::Alive, _)) | None => {}
        }
    }
}

/// Periodic wall-clock check detecting a suspended runtime.
///
/// Cheap to clone; clones share the same timer and state.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<Shared>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Watchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                config: OnceLock::new(),
                state: std::sync::Mutex::new(RuntimeState::default()),
            }),
        }
    }

    /// One-time setup; must happen before the first [`start`](Self::start).
    pub fn configure(
        &self,
        on_wake: impl Fn(u64) + Send + Sync + 'static,
        heartbeat: Duration,
        timeout: Duration,
        on_wake_auto_restore: impl Fn(bool) + Send + Sync + 'static,
    ) -> Result<()> {
        if heartbeat.is_zero() {
            return Err(Error::Config("watchdog heartbeat must be > 0".into()));
        }
        self.shared
            .config
            .set(WatchdogConfig {
                heartbeat,
                timeout,
                on_wake: Arc::new(on_wake),
                on_wake_auto_restore: Arc::new(on_wake_auto_restore),
            })
            .map_err(|_| Error::WatchdogConfigured)
    }

    pub fn is_configured(&self) -> bool {
        self.shared.config.get().is_some()
    }

    /// Record a fresh heartbeat and arm the repeating timer. Any timer from a
    /// previous start is cancelled first.
    pub fn start(&self, defer: bool) -> Result<()> {
        let config = self
            .shared
            .config
            .get()
            .ok_or(Error::WatchdogNotConfigured)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut state = lock(&self.shared.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.last_heartbeat_ms = self.shared.clock.now_ms();
        state.defer = defer;
        state.timer = Some(runtime.spawn(run_timer(
            Arc::downgrade(&self.shared),
            config.heartbeat,
        )));
        tracing::debug!(defer, "Watchdog started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(timer) = lock(&self.shared.state).timer.take() {
            timer.abort();
            tracing::debug!("Watchdog stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).timer.is_some()
    }

    /// Postpone interactive recovery, e.g. while a native file chooser is open.
    pub fn set_defer(&self, defer: bool) {
        lock(&self.shared.state).defer = defer;
    }

    pub fn is_deferred(&self) -> bool {
        lock(&self.shared.state).defer
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        lock(&self.shared.state).last_heartbeat_ms
    }

    /// Run one heartbeat check. Called by the timer; public so callers can
    /// drive the watchdog from their own schedule.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Companion check for flows re-entering the foreground outside the timer
    /// cadence. Invokes `on_wake_auto_restore` instead of `on_wake`. Returns
    /// whether the wake-up condition tripped.
    pub fn check_wake_up(&self) -> bool {
        let defer = self.is_deferred();
        let config = match self.shared.config.get() {
            Some(config) => config,
            None => return false,
        };
        let now = self.shared.clock.now_ms();
        let delta_ms = {
            let mut state = lock(&self.shared.state);
            let delta_ms = now.saturating_sub(state.last_heartbeat_ms);
            if delta_ms <= config.timeout.as_millis() as u64 {
                return false;
            }
            state.last_heartbeat_ms = now;
            delta_ms
        };
        tracing::info!(delta_ms, defer, "Late wake-up detected, auto-restoring");
        (config.on_wake_auto_restore)(defer);
        true
    }
}

async fn run_timer(shared: Weak<Shared>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.tick();
    }
}
