//! Idle watchdog.
//!
//! A liveness timer, not a deadline: every [`ActivityMonitor::touch`] restarts
//! the window, and [`IdleTimer::expired`] resolves only once a full window
//! passes with no activity. Used at run level by the supervisor and at task
//! level by the pipeline engine.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable handle that records activity.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    tx: Arc<watch::Sender<u64>>,
}

/// The waiting half of the watchdog.
#[derive(Debug)]
pub struct IdleTimer {
    rx: watch::Receiver<u64>,
}

/// Creates a connected monitor/timer pair.
pub fn idle_watchdog() -> (ActivityMonitor, IdleTimer) {
    let (tx, rx) = watch::channel(0);
    (ActivityMonitor { tx: Arc::new(tx) }, IdleTimer { rx })
}

impl ActivityMonitor {
    /// Records activity, restarting the idle window.
    pub fn touch(&self) {
        self.tx.send_modify(|ticks| *ticks = ticks.wrapping_add(1));
    }
}

impl IdleTimer {
    /// Resolves after `timeout` elapses with no activity.
    ///
    /// Cancel-safe: dropping the future loses nothing, and a later call starts
    /// a fresh window.
    pub async fn expired(&mut self, timeout: Duration) {
        loop {
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Every monitor is gone, so nothing can reset the window again.
                        tokio::time::sleep(timeout).await;
                        return;
                    }
                }
                () = tokio::time::sleep(timeout) => return,
            }
        }
    }

    /// Like [`IdleTimer::expired`], but never resolves when `timeout` is `None`.
    pub async fn expired_or_never(&mut self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => self.expired(timeout).await,
            None => std::future::pending().await,
        }
    }
}
