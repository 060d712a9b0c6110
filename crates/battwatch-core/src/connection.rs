// ── Connection supervision ──
//
// Owns the observable connection state and the reconnect-with-backoff
// timer. The timer is single-shot and replaced, never stacked: every
// scheduling call and the teardown path cancel any pending timer first,
// so two reconnect attempts can never run concurrently.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry cap reached. Terminal until an explicit refresh re-arms the
    /// attempt counter.
    Offline,
}

// ── ReconnectPolicy ──────────────────────────────────────────────────

/// Fixed backoff schedule in seconds, indexed by `min(attempt, len - 1)`.
const BACKOFF_SCHEDULE_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Session-level reconnect schedule.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub schedule: Vec<Duration>,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            schedule: BACKOFF_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// cap is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts || self.schedule.is_empty() {
            return None;
        }
        let idx = usize::try_from(attempt).unwrap_or(usize::MAX);
        Some(self.schedule[idx.min(self.schedule.len() - 1)])
    }
}

// ── ConnectionSupervisor ─────────────────────────────────────────────

pub(crate) struct ConnectionSupervisor {
    state: watch::Sender<ConnectionState>,
    policy: ReconnectPolicy,
    attempt: std::sync::Mutex<u32>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub(crate) fn new(policy: ReconnectPolicy, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            policy,
            attempt: std::sync::Mutex::new(0),
            timer: std::sync::Mutex::new(None),
            cancel,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn mark_connecting(&self) {
        let _ = self.state.send(ConnectionState::Connecting);
    }

    /// Successful (re)connection: reset the attempt counter and drop any
    /// pending timer.
    pub(crate) fn mark_connected(&self) {
        *self.attempt_guard() = 0;
        self.cancel_timer();
        let _ = self.state.send(ConnectionState::Connected);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.cancel_timer();
        let _ = self.state.send(ConnectionState::Disconnected);
    }

    /// Re-arm after terminal Offline (manual refresh / reload).
    pub(crate) fn rearm(&self) {
        *self.attempt_guard() = 0;
        self.cancel_timer();
        debug!("reconnect counter re-armed");
    }

    /// Schedule `retry` after the backoff delay for the current attempt.
    ///
    /// Returns `false` when the attempt cap is reached; the state is then
    /// Offline and nothing was scheduled.
    pub(crate) fn schedule_reconnect(&self, retry: BoxFuture<'static, ()>) -> bool {
        self.cancel_timer();

        let attempt_now = {
            let mut attempt = self.attempt_guard();
            if self.policy.delay_for(*attempt).is_none() {
                drop(attempt);
                warn!(
                    max_attempts = self.policy.max_attempts,
                    "reconnect cap reached, going offline"
                );
                let _ = self.state.send(ConnectionState::Offline);
                return false;
            }
            let current = *attempt;
            *attempt += 1;
            current
        };

        // delay_for was Some above; re-read outside the lock.
        let Some(delay) = self.policy.delay_for(attempt_now) else {
            return false;
        };

        let _ = self.state.send(ConnectionState::Reconnecting {
            attempt: attempt_now + 1,
        });
        info!(
            attempt = attempt_now + 1,
            delay_secs = delay.as_secs(),
            "reconnect scheduled"
        );

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => retry.await,
            }
        });
        *self.timer_guard() = Some(handle);
        true
    }

    /// Drop the pending timer, if any. Called before every reschedule and
    /// on teardown so a stale timer can never fire against new state.
    pub(crate) fn cancel_timer(&self) {
        if let Some(handle) = self.timer_guard().take() {
            handle.abort();
        }
    }

    fn attempt_guard(&self) -> std::sync::MutexGuard<'_, u32> {
        self.attempt
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn timer_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

// ── Tests ────────────────────────────────────────────────────────────
