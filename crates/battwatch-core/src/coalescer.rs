// ── Filter coalescing ──
//
// Translates rapid filter toggles into a minimal number of queries.
// Toggles update the active set immediately (chips render from it) but
// defer the network apply behind a debounce timer; each toggle within
// the window replaces the timer, and the single fire carries the latest
// state. Chip removal and clear-all express explicit intent and apply
// immediately. A staged working copy supports the deferred-apply flow:
// commit promotes and applies once, discard drops the copy untouched.
//
// Applies are emitted as messages on an mpsc channel; the engine task
// consuming them resets pagination before issuing the query.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{FilterCategory, FilterSet};

/// Debounce window for filter toggles.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

struct CoalescerState {
    active: FilterSet,
    staged: Option<FilterSet>,
}

pub struct FilterCoalescer {
    /// Shared with the debounce timer task, which reads the active set
    /// at fire time.
    state: Arc<std::sync::Mutex<CoalescerState>>,
    apply_tx: mpsc::UnboundedSender<FilterSet>,
    window: Duration,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl FilterCoalescer {
    /// Returns the coalescer and the receiver carrying apply requests,
    /// one message per query the engine should issue.
    pub fn new(
        window: Duration,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<FilterSet>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let coalescer = Self {
            state: Arc::new(std::sync::Mutex::new(CoalescerState {
                active: FilterSet::default(),
                staged: None,
            })),
            apply_tx,
            window,
            timer: std::sync::Mutex::new(None),
            cancel,
        };
        (coalescer, apply_rx)
    }

    // ── Active set ───────────────────────────────────────────────────

    pub fn active(&self) -> FilterSet {
        self.state_guard().active.clone()
    }

    /// Install a restored filter set without emitting an apply. Used at
    /// attach time for persisted state.
    pub fn replace_active(&self, filters: FilterSet) {
        self.state_guard().active = filters;
    }

    /// Toggle one value in the active set; the apply is debounced.
    pub fn toggle(&self, category: FilterCategory, value: &str) {
        self.state_guard().active.toggle(category, value);
        self.restart_debounce();
    }

    /// Remove one value (chip deletion): applies immediately.
    pub fn remove_value(&self, category: FilterCategory, value: &str) {
        if self.state_guard().active.remove(category, value) {
            self.flush_now();
        }
    }

    /// Clear every selection: applies immediately.
    pub fn clear_all(&self) {
        if self.state_guard().active.clear() {
            self.flush_now();
        }
    }

    // ── Staged flow ──────────────────────────────────────────────────

    /// Open the deferred-apply flow with a working copy of the active set.
    pub fn open_staged(&self) {
        let mut st = self.state_guard();
        let copy = st.active.clone();
        st.staged = Some(copy);
    }

    pub fn staged(&self) -> Option<FilterSet> {
        self.state_guard().staged.clone()
    }

    /// Toggle a value in the staged copy; the active set is untouched.
    pub fn staged_toggle(&self, category: FilterCategory, value: &str) {
        let mut st = self.state_guard();
        match st.staged.as_mut() {
            Some(staged) => {
                staged.toggle(category, value);
            }
            None => warn!("staged toggle without an open staged set, ignoring"),
        }
    }

    /// Promote staged -> active and apply once.
    pub fn commit_staged(&self) {
        let promoted = {
            let mut st = self.state_guard();
            match st.staged.take() {
                Some(staged) => {
                    st.active = staged;
                    true
                }
                None => false,
            }
        };
        if promoted {
            self.flush_now();
        }
    }

    /// Drop the staged copy. No query, no mutation of the active set.
    pub fn discard_staged(&self) {
        if self.state_guard().staged.take().is_some() {
            debug!("staged filter edits discarded");
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────

    pub fn teardown(&self) {
        self.cancel_timer();
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Cancel and restart the debounce timer. The fire reads the active
    /// set at fire time, so one apply reflects every toggle in the
    /// window.
    fn restart_debounce(&self) {
        self.cancel_timer();

        let state = Arc::clone(&self.state);
        let apply_tx = self.apply_tx.clone();
        let cancel = self.cancel.clone();
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    let filters = state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .active
                        .clone();
                    let _ = apply_tx.send(filters);
                }
            }
        });
        *self.timer_guard() = Some(handle);
    }

    /// Apply the current active set immediately, cancelling any pending
    /// debounce so the same change cannot fire twice.
    fn flush_now(&self) {
        self.cancel_timer();
        let filters = self.active();
        let _ = self.apply_tx.send(filters);
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer_guard().take() {
            handle.abort();
        }
    }

    fn state_guard(&self) -> std::sync::MutexGuard<'_, CoalescerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn timer_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for FilterCoalescer {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

// ── Tests ────────────────────────────────────────────────────────────
