//! Drift watchdog
//!
//! Background task that re-verifies the live rules every
//! [`CHECK_INTERVAL`] and runs a full clean + reinstall cycle when they
//! drifted. It stops on an explicit signal and acknowledges by finishing its
//! task, which [`Watchdog::stop`] awaits.
//!
//! ```text
//! Idle --tick--> Checking --loaded--> Idle
//!                Checking --drift---> Reloading --done--> Idle
//! any state --stop--> Exited
//! ```

use crate::core::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the live rules are verified.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WatchdogState {
    Idle,
    Checking,
    Reloading,
    Exited,
}

/// What the watchdog keeps consistent.
pub trait DriftTarget: Send + Sync + 'static {
    /// Whether the desired rules are live.
    fn is_loaded(&self) -> impl Future<Output = bool> + Send;

    /// Cleans everything and reinstalls baseline and configured rules.
    fn reload(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Handle on a running watchdog task.
pub struct Watchdog {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WatchdogState>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Spawns the watchdog on the current runtime.
    ///
    /// `cycles` counts completed reload cycles. A fatal reload error ends the
    /// task and is sent on `fatal`.
    pub fn spawn<T: DriftTarget>(
        target: Arc<T>,
        period: Duration,
        cycles: Arc<AtomicU64>,
        fatal: mpsc::UnboundedSender<Error>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WatchdogState::Idle);
        let handle = tokio::spawn(run(target, period, stop_rx, state_tx, cycles, fatal));
        Self {
            stop_tx,
            state_rx,
            handle,
        }
    }

    pub fn state(&self) -> WatchdogState {
        *self.state_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the task to exit and waits until it has.
    pub async fn stop(self) {
        // The task may already be gone after a fatal error
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Watchdog task ended abnormally: {e}");
        }
    }
}

async fn run<T: DriftTarget>(
    target: Arc<T>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<WatchdogState>,
    cycles: Arc<AtomicU64>,
    fatal: mpsc::UnboundedSender<Error>,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        state.send_replace(WatchdogState::Checking);
        let loaded = target.is_loaded().await;
        if *stop.borrow() {
            break;
        }

        if loaded {
            debug!("Firewall rules verified");
        } else {
            state.send_replace(WatchdogState::Reloading);
            warn!("Firewall rules changed, reloading");

            match target.reload().await {
                Ok(()) => {
                    cycles.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) if e.is_fatal() => {
                    error!("Could not restore firewall rules: {e}");
                    let _ = fatal.send(e);
                    break;
                }
                Err(e) => warn!("Firewall reload incomplete: {e}"),
            }
        }

        state.send_replace(WatchdogState::Idle);
    }

    state.send_replace(WatchdogState::Exited);
    info!("Exit checking firewall rules");
}
