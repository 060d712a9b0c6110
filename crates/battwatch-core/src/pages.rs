// ── Cursor-based pagination over the device list ──
//
// Owns the accumulated list buffer. Pages are fetched by opaque cursor:
// the first page replaces the buffer wholesale, subsequent pages append
// in issue order. A boolean in-flight guard keeps at most one request
// outstanding, so rapid near-end triggers cannot duplicate a fetch and
// out-of-order appends are impossible. A generation counter invalidates
// any in-flight fetch when the buffer is reset or reloaded, so a stale
// reply can never land in a new query's list.
//
// Push events patch records in place by id; they never add, remove, or
// reorder entries.

use std::collections::HashMap;
use std::sync::Arc;

use battwatch_api::proto::DeviceChange;
use battwatch_api::{Transport, calls};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::convert::apply_device_change;
use crate::error::CoreError;
use crate::model::{DeviceQuery, DeviceRecord, StatusCounts};

type Snapshot = Arc<Vec<Arc<DeviceRecord>>>;

#[derive(Default)]
struct PagerState {
    records: Vec<Arc<DeviceRecord>>,
    /// id -> position in `records`.
    index: HashMap<String, usize>,
    next_cursor: Option<String>,
    has_more: bool,
    in_flight: bool,
    /// Bumped on every reset/reload; a completed fetch from an older
    /// generation is discarded.
    generation: u64,
}

pub struct DevicePager {
    state: std::sync::Mutex<PagerState>,
    snapshot: watch::Sender<Snapshot>,
    counts: watch::Sender<StatusCounts>,
}

impl DevicePager {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        let (counts, _) = watch::channel(StatusCounts::default());
        Self {
            state: std::sync::Mutex::new(PagerState::default()),
            snapshot,
            counts,
        }
    }

    // ── Fetching ─────────────────────────────────────────────────────

    /// Fetch the first page for `query`, replacing the entire buffer.
    ///
    /// Supersedes any fetch already in flight. On failure the buffer is
    /// cleared rather than left partially updated.
    pub async fn load_first(
        &self,
        transport: &dyn Transport,
        query: &DeviceQuery,
    ) -> Result<(), CoreError> {
        let generation = {
            let mut st = self.state_guard();
            st.generation += 1;
            st.next_cursor = None;
            st.in_flight = true;
            st.generation
        };

        let request = query.to_request(None);
        let result = calls::query_devices(transport, &request).await;

        let mut guard = self.state_guard();
        let st = &mut *guard;
        if st.generation != generation {
            debug!("first-page fetch superseded, discarding reply");
            return Ok(());
        }
        st.in_flight = false;

        match result {
            Ok(page) => {
                st.records = page
                    .devices
                    .into_iter()
                    .map(|dto| Arc::new(DeviceRecord::from(dto)))
                    .collect();
                st.index = st
                    .records
                    .iter()
                    .enumerate()
                    .map(|(pos, r)| (r.id.clone(), pos))
                    .collect();
                st.has_more = page.has_more;
                st.next_cursor = if page.has_more { page.next_cursor } else { None };
                let counts = StatusCounts::from(page.device_statuses);
                self.publish(st, Some(counts));
                Ok(())
            }
            Err(e) => {
                // Do not show stale data silently.
                st.records.clear();
                st.index.clear();
                st.has_more = false;
                st.next_cursor = None;
                self.publish(st, Some(StatusCounts::default()));
                warn!(error = %e, "first-page fetch failed, list cleared");
                Err(e.into())
            }
        }
    }

    /// Fetch the next page and append it, preserving order.
    ///
    /// No-op (returns `Ok(false)`) when the list is exhausted or a fetch
    /// is already in flight.
    pub async fn load_next(
        &self,
        transport: &dyn Transport,
        query: &DeviceQuery,
    ) -> Result<bool, CoreError> {
        let (generation, cursor) = {
            let mut st = self.state_guard();
            if st.in_flight || !st.has_more {
                return Ok(false);
            }
            let Some(cursor) = st.next_cursor.clone() else {
                return Ok(false);
            };
            st.in_flight = true;
            (st.generation, cursor)
        };

        let request = query.to_request(Some(cursor));
        let result = calls::query_devices(transport, &request).await;

        let mut guard = self.state_guard();
        let st = &mut *guard;
        if st.generation != generation {
            debug!("next-page fetch superseded, discarding reply");
            return Ok(false);
        }
        st.in_flight = false;

        match result {
            Ok(page) => {
                for dto in page.devices {
                    let record = Arc::new(DeviceRecord::from(dto));
                    if let Some(&pos) = st.index.get(&record.id) {
                        // Server resent a row we already hold; refresh it
                        // in place instead of duplicating.
                        st.records[pos] = record;
                    } else {
                        let pos = st.records.len();
                        st.index.insert(record.id.clone(), pos);
                        st.records.push(record);
                    }
                }
                st.has_more = page.has_more;
                st.next_cursor = if page.has_more { page.next_cursor } else { None };
                let counts = StatusCounts::from(page.device_statuses);
                self.publish(st, Some(counts));
                Ok(true)
            }
            Err(e) => {
                st.records.clear();
                st.index.clear();
                st.has_more = false;
                st.next_cursor = None;
                self.publish(st, Some(StatusCounts::default()));
                warn!(error = %e, "next-page fetch failed, list cleared");
                Err(e.into())
            }
        }
    }

    /// Discard the buffer and cursor ahead of a query change. Any fetch
    /// in flight is invalidated.
    pub fn reset(&self) {
        let mut guard = self.state_guard();
        let st = &mut *guard;
        st.generation += 1;
        st.records.clear();
        st.index.clear();
        st.next_cursor = None;
        st.has_more = false;
        st.in_flight = false;
        self.publish(st, Some(StatusCounts::default()));
    }

    // ── Push patches ─────────────────────────────────────────────────

    /// Patch one record in place. Returns `false` (and does nothing) for
    /// an id that is not in the buffer.
    pub fn apply_change(&self, change: &DeviceChange) -> bool {
        let mut guard = self.state_guard();
        let st = &mut *guard;
        let Some(&pos) = st.index.get(&change.entity_id) else {
            debug!(entity_id = %change.entity_id, "change for unknown record ignored");
            return false;
        };
        let mut record = (*st.records[pos]).clone();
        apply_device_change(&mut record, change);
        st.records[pos] = Arc::new(record);
        self.publish(st, None);
        true
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_counts(&self) -> watch::Receiver<StatusCounts> {
        self.counts.subscribe()
    }

    pub fn status_counts(&self) -> StatusCounts {
        *self.counts.borrow()
    }

    pub fn has_more(&self) -> bool {
        self.state_guard().has_more
    }

    pub fn len(&self) -> usize {
        self.state_guard().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn publish(&self, st: &PagerState, counts: Option<StatusCounts>) {
        let values = st.records.clone();
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
        if let Some(counts) = counts {
            self.counts.send_modify(|c| *c = counts);
        }
    }

    fn state_guard(&self) -> std::sync::MutexGuard<'_, PagerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for DevicePager {
    fn default() -> Self {
        Self::new()
    }
}
