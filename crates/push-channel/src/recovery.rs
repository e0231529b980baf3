//! Wake-up recovery: bring the channels back after the runtime was suspended
//! or the connection broke.
//!
//! Both flows share one prelude: stop the watchdog, pause every channel and
//! unsubscribe it. The interactive flow then waits for the user to
//! acknowledge; the silent flow restores straight away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::Recoverable;
use crate::lock;
use crate::session::{Session, Ui};
use crate::types::{Error, Result};
use crate::watchdog::Watchdog;

/// The recovery in flight. Each trigger starts a new generation; a restore
/// only runs if no later trigger superseded it.
#[derive(Default)]
struct Pending {
    generation: u64,
    /// Indices into `channels` of those to re-subscribe once restored. A
    /// superseded recovery hands its set on to the next one.
    channels: Vec<usize>,
}

pub struct WakeUpCoordinator {
    watchdog: Watchdog,
    channels: Vec<Arc<dyn Recoverable>>,
    session: Arc<dyn Session>,
    ui: Arc<dyn Ui>,
    runtime: tokio::runtime::Handle,
    acknowledging: AtomicBool,
    pending: Mutex<Pending>,
}

impl WakeUpCoordinator {
    pub(crate) fn new(
        watchdog: Watchdog,
        channels: Vec<Arc<dyn Recoverable>>,
        session: Arc<dyn Session>,
        ui: Arc<dyn Ui>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self {
            watchdog,
            channels,
            session,
            ui,
            runtime,
            acknowledging: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
        })
    }

    /// Interactive recovery after the watchdog detected a suspension.
    ///
    /// Returns false when nobody is logged in and recovery was abandoned.
    pub fn on_wake_up(self: &Arc<Self>) -> bool {
        if self.acknowledging.load(Ordering::SeqCst) {
            tracing::debug!("Wake-up acknowledgement already pending");
            return true;
        }
        let generation = self.quiesce();
        if !self.session.is_logged_in() {
            tracing::info!("Wake-up while logged out, recovery abandoned");
            self.abandon(generation);
            return false;
        }
        if self.acknowledging.swap(true, Ordering::SeqCst) {
            return true;
        }

        tracing::info!("Waiting for wake-up acknowledgement");
        let this = self.clone();
        self.runtime.spawn(async move {
            let acknowledged = this.ui.acknowledge_wake_up().await;
            this.acknowledging.store(false, Ordering::SeqCst);
            if !acknowledged {
                tracing::info!("Wake-up not acknowledged, channels stay down");
                this.abandon(generation);
                return;
            }
            if !this.session.is_logged_in() {
                tracing::info!("Logged out while waiting for acknowledgement");
                this.abandon(generation);
                return;
            }
            let Some(subscribed) = this.take_current(generation) else {
                tracing::debug!("Acknowledged recovery superseded");
                return;
            };
            this.restart_watchdog(false);
            this.mark_polls_lost();
            this.restore(&subscribed);
        });
        true
    }

    /// Silent recovery: used for late wake-ups detected outside the timer and
    /// for broken connections.
    ///
    /// Returns false when nobody is logged in and recovery was abandoned.
    pub fn on_wake_up_auto_restore(self: &Arc<Self>, defer: bool) -> bool {
        if self.acknowledging.load(Ordering::SeqCst) {
            tracing::debug!("Interactive recovery in progress, auto-restore skipped");
            return true;
        }
        let generation = self.quiesce();
        if !self.session.is_logged_in() {
            tracing::info!("Auto-restore while logged out, recovery abandoned");
            self.abandon(generation);
            return false;
        }
        tracing::info!(defer, "Auto-restoring channels");
        self.restart_watchdog(defer);
        self.mark_polls_lost();
        let this = self.clone();
        self.runtime.spawn(async move {
            if this.acknowledging.load(Ordering::SeqCst) {
                tracing::debug!("Auto-restore superseded by interactive recovery");
                return;
            }
            match this.take_current(generation) {
                Some(subscribed) => this.restore(&subscribed),
                None => tracing::debug!("Auto-restore superseded"),
            }
        });
        true
    }

    /// Run the watchdog's late wake-up check; recovery, if any, goes through
    /// [`on_wake_up_auto_restore`](Self::on_wake_up_auto_restore).
    pub fn check_late_auto_restore(&self) -> bool {
        self.watchdog.check_wake_up()
    }

    pub fn is_acknowledging(&self) -> bool {
        self.acknowledging.load(Ordering::SeqCst)
    }

    /// Stop, pause and unsubscribe everything, opening a new recovery
    /// generation. Channels subscribed now, or still waiting on a superseded
    /// restore, are recorded for re-subscription.
    fn quiesce(&self) -> u64 {
        self.watchdog.stop();
        let generation = {
            let mut pending = lock(&self.pending);
            let carried = std::mem::take(&mut pending.channels);
            pending.channels = self
                .channels
                .iter()
                .enumerate()
                .filter(|(index, channel)| channel.is_subscribed() || carried.contains(index))
                .map(|(index, _)| index)
                .collect();
            pending.generation += 1;
            pending.generation
        };
        for channel in &self.channels {
            channel.pause();
        }
        for channel in &self.channels {
            channel.remove_listener();
        }
        generation
    }

    /// Claim the channels of `generation` if no later recovery started.
    fn take_current(&self, generation: u64) -> Option<Vec<Arc<dyn Recoverable>>> {
        let mut pending = lock(&self.pending);
        if pending.generation != generation {
            return None;
        }
        let indices = std::mem::take(&mut pending.channels);
        Some(
            indices
                .into_iter()
                .filter_map(|index| self.channels.get(index).cloned())
                .collect(),
        )
    }

    fn abandon(&self, generation: u64) {
        let mut pending = lock(&self.pending);
        if pending.generation == generation {
            pending.channels.clear();
        }
    }

    fn restart_watchdog(&self, defer: bool) {
        if let Err(e) = self.watchdog.start(defer) {
            tracing::warn!("Watchdog not restarted: {e}");
        }
    }

    fn mark_polls_lost(&self) {
        for channel in &self.channels {
            channel.mark_poll_lost();
        }
    }

    fn restore(&self, subscribed: &[Arc<dyn Recoverable>]) {
        for channel in subscribed {
            tracing::debug!(channel = channel.label(), "Re-subscribing");
            channel.add_listener();
        }
        for channel in &self.channels {
            channel.resume();
        }
    }
}
