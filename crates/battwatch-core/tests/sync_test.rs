// Engine behavior tests against a scripted in-process transport.
//
// Every test runs on a paused clock, so backoff and debounce timing are
// asserted deterministically.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use battwatch_api::proto::{
    CMD_GET_FILTER_OPTIONS, CMD_QUERY_DEVICES, CMD_SET_THRESHOLD, CMD_SUBSCRIBE, PushEvent,
    SessionStatus,
};
use battwatch_api::{Error, Transport};
use battwatch_core::{
    ConnectionState, CoreError, EngineConfig, FilterCategory, PanelState, SortKey, SortOrder,
    StateSink, SyncEngine, ThresholdPrefs,
};

// ── Scripted transport ───────────────────────────────────────────────

enum Reply {
    Ok(Value),
    Socket,
    Timeout,
}

impl Reply {
    fn materialize(self) -> Result<Value, Error> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Socket => Err(Error::Socket("connection reset by peer".into())),
            Self::Timeout => Err(Error::Timeout { timeout_secs: 10 }),
        }
    }
}

#[derive(Clone)]
struct FakeTransport {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    calls: Mutex<Vec<(String, Value)>>,
    scripted: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    failing: Mutex<HashSet<&'static str>>,
    latency: Mutex<Option<Duration>>,
    event_tx: broadcast::Sender<Arc<PushEvent>>,
}

impl FakeTransport {
    fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(FakeInner {
                calls: Mutex::new(Vec::new()),
                scripted: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                latency: Mutex::new(None),
                event_tx,
            }),
        }
    }

    fn enqueue(&self, command: &'static str, reply: Reply) {
        lock(&self.inner.scripted)
            .entry(command)
            .or_default()
            .push_back(reply);
    }

    fn set_failing(&self, command: &'static str, failing: bool) {
        let mut set = lock(&self.inner.failing);
        if failing {
            set.insert(command);
        } else {
            set.remove(command);
        }
    }

    fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = Some(latency);
    }

    fn emit(&self, event: PushEvent) {
        let _ = self.inner.event_tx.send(Arc::new(event));
    }

    fn calls_for(&self, command: &str) -> Vec<Value> {
        lock(&self.inner.calls)
            .iter()
            .filter(|(cmd, _)| cmd == command)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn call_count(&self, command: &str) -> usize {
        self.calls_for(command).len()
    }

    /// Built-in defaults so tests only script deviations.
    fn default_reply(command: &str) -> Value {
        match command {
            CMD_QUERY_DEVICES => empty_page(),
            CMD_SUBSCRIBE => json!({ "subscription_id": "sub_test", "status": "subscribed" }),
            CMD_GET_FILTER_OPTIONS => json!({
                "manufacturers": ["Aqara", "Philips"],
                "device_classes": ["battery"],
                "areas": [
                    { "id": "kitchen", "name": "Kitchen" },
                    { "id": "office", "name": "Office" },
                ],
                "statuses": ["critical", "warning", "healthy", "unavailable"],
            }),
            _ => json!({}),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for FakeTransport {
    fn call(
        &self,
        command: &'static str,
        payload: Value,
    ) -> BoxFuture<'static, Result<Value, Error>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            lock(&inner.calls).push((command.to_owned(), payload));

            let latency = *lock(&inner.latency);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            if lock(&inner.failing).contains(command) {
                return Err(Error::Socket("connection reset by peer".into()));
            }

            let scripted = lock(&inner.scripted)
                .get_mut(command)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(reply) => reply.materialize(),
                None => Ok(FakeTransport::default_reply(command)),
            }
        })
    }

    fn events(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.inner.event_tx.subscribe()
    }
}

// ── In-memory state sink ─────────────────────────────────────────────

#[derive(Default)]
struct MemorySink {
    state: Mutex<Option<PanelState>>,
    persist_count: Mutex<usize>,
}

impl MemorySink {
    fn preloaded(state: PanelState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Some(state)),
            persist_count: Mutex::new(0),
        })
    }

    fn last(&self) -> Option<PanelState> {
        lock(&self.state).clone()
    }
}

impl StateSink for MemorySink {
    fn load(&self) -> Option<PanelState> {
        lock(&self.state).clone()
    }

    fn persist(&self, state: &PanelState) {
        *lock(&self.state) = Some(state.clone());
        *lock(&self.persist_count) += 1;
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

fn device(id: &str, level: f64) -> Value {
    json!({
        "entity_id": id,
        "device_name": format!("Device {id}"),
        "battery_level": level,
        "available": true,
        "status": if level <= 15.0 { "critical" } else { "healthy" },
        "manufacturer": "Aqara",
        "area_id": "kitchen",
        "area_name": "Kitchen",
    })
}

fn page(devices: Vec<Value>, next_cursor: Option<&str>, has_more: bool) -> Value {
    json!({
        "devices": devices,
        "device_statuses": { "critical": 0, "warning": 0, "healthy": 0, "unavailable": 0 },
        "next_cursor": next_cursor,
        "has_more": has_more,
    })
}

fn empty_page() -> Value {
    page(Vec::new(), None, false)
}

fn devices_range(from: usize, to: usize) -> Vec<Value> {
    (from..to)
        .map(|i| device(&format!("sensor.dev_{i}"), 50.0))
        .collect()
}

fn engine_with(transport: &FakeTransport, sink: Option<Arc<MemorySink>>) -> SyncEngine {
    SyncEngine::new(
        EngineConfig::default(),
        Arc::new(transport.clone()),
        sink.map(|s| s as Arc<dyn StateSink>),
    )
}

/// Let spawned tasks drain their queues.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// ── Pagination ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_a_two_pages_append_without_duplicates() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 50), Some("c1"), true)),
    );
    let engine = engine_with(&transport, None);

    engine.attach().await.unwrap();
    assert_eq!(engine.current_connection_state(), ConnectionState::Connected);
    assert_eq!(engine.devices_snapshot().len(), 50);

    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(50, 100), None, false)),
    );
    assert!(engine.near_end().await.unwrap());

    let snapshot = engine.devices_snapshot();
    assert_eq!(snapshot.len(), 100);
    let distinct: HashSet<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(distinct.len(), 100, "no duplicates across pages");

    // Second page used the stored cursor.
    let queries = transport.calls_for(CMD_QUERY_DEVICES);
    assert_eq!(queries[1]["cursor"], "c1");

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p3_exhausted_list_ignores_near_end_triggers() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 20), None, false)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    assert!(!engine.near_end().await.unwrap());
    assert!(!engine.near_end().await.unwrap());
    assert_eq!(
        transport.call_count(CMD_QUERY_DEVICES),
        1,
        "no fetches past the declared end"
    );

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p4_overlapping_near_end_triggers_issue_one_request() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 50), Some("c1"), true)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    transport.set_latency(Duration::from_millis(100));
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(50, 100), None, false)),
    );

    let (first, second) = tokio::join!(engine.near_end(), engine.near_end());
    let appended = [first.unwrap(), second.unwrap()];
    assert!(
        appended.contains(&true) && appended.contains(&false),
        "one trigger fetches, the other is guarded out"
    );
    assert_eq!(
        transport.call_count(CMD_QUERY_DEVICES),
        2,
        "initial load plus exactly one next-page fetch"
    );
    assert_eq!(engine.devices_snapshot().len(), 100);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_page_clears_the_list_and_surfaces() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 10), None, false)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();
    assert_eq!(engine.devices_snapshot().len(), 10);

    transport.enqueue(CMD_QUERY_DEVICES, Reply::Ok(json!({ "devices": "nope" })));
    let err = engine
        .set_sort(SortKey::Alphabetical, SortOrder::Asc)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidResponse { .. }));
    assert!(
        engine.devices_snapshot().is_empty(),
        "no stale rows after a malformed page"
    );

    engine.detach().await;
}

// ── Filters ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn p5_toggle_burst_coalesces_into_one_query() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();
    let baseline = transport.call_count(CMD_QUERY_DEVICES);

    engine.toggle_filter(FilterCategory::Status, "critical");
    engine.toggle_filter(FilterCategory::Status, "warning");
    engine.toggle_filter(FilterCategory::Manufacturer, "Aqara");
    engine.toggle_filter(FilterCategory::Manufacturer, "Philips");
    engine.toggle_filter(FilterCategory::Area, "kitchen");

    settle().await;
    assert_eq!(
        transport.call_count(CMD_QUERY_DEVICES),
        baseline,
        "nothing fires inside the debounce window"
    );

    tokio::time::sleep(Duration::from_millis(310)).await;
    settle().await;

    let queries = transport.calls_for(CMD_QUERY_DEVICES);
    assert_eq!(queries.len(), baseline + 1, "exactly one coalesced query");
    let last = queries.last().unwrap();
    assert_eq!(last["filter_status"], json!(["critical", "warning"]));
    assert_eq!(last["filter_manufacturer"], json!(["Aqara", "Philips"]));
    assert_eq!(last["filter_area"], json!(["kitchen"]));

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p6_committed_filter_change_resets_to_first_page() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 50), Some("c1"), true)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(50, 100), Some("c2"), true)),
    );
    engine.near_end().await.unwrap();
    assert_eq!(engine.devices_snapshot().len(), 100);

    engine.open_staged_filters();
    engine.staged_toggle(FilterCategory::Status, "critical");
    engine.commit_staged_filters();
    settle().await;

    let queries = transport.calls_for(CMD_QUERY_DEVICES);
    let last = queries.last().unwrap();
    assert!(
        last.get("cursor").is_none(),
        "committed filter change restarts at the first page"
    );
    assert_eq!(last["filter_status"], json!(["critical"]));
    // Fallback reply was an empty page; the old list is gone.
    assert!(engine.devices_snapshot().is_empty());

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p8_staged_discard_changes_nothing_and_queries_nothing() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();
    let baseline = transport.call_count(CMD_QUERY_DEVICES);
    let before = engine.active_filters();

    engine.open_staged_filters();
    engine.staged_toggle(FilterCategory::Status, "critical");
    engine.staged_toggle(FilterCategory::Area, "office");
    engine.discard_staged_filters();

    tokio::time::sleep(Duration::from_millis(500)).await;
    settle().await;

    assert_eq!(engine.active_filters(), before);
    assert_eq!(engine.staged_filters(), None);
    assert_eq!(transport.call_count(CMD_QUERY_DEVICES), baseline);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn chip_removal_applies_without_debounce() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    engine.toggle_filter(FilterCategory::Status, "critical");
    tokio::time::sleep(Duration::from_millis(310)).await;
    settle().await;
    let baseline = transport.call_count(CMD_QUERY_DEVICES);

    engine.remove_filter_value(FilterCategory::Status, "critical");
    settle().await;

    assert_eq!(
        transport.call_count(CMD_QUERY_DEVICES),
        baseline + 1,
        "chip removal fires immediately"
    );

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn stale_persisted_filters_are_pruned_and_persisted_back() {
    let mut filters = battwatch_core::FilterSet::default();
    filters.toggle(FilterCategory::Manufacturer, "Aqara");
    filters.toggle(FilterCategory::Manufacturer, "Sonoff"); // not in vocabulary
    filters.toggle(FilterCategory::Area, "attic"); // not in vocabulary
    let sink = MemorySink::preloaded(PanelState {
        filters,
        ..PanelState::default()
    });

    let transport = FakeTransport::new();
    let engine = engine_with(&transport, Some(Arc::clone(&sink)));
    engine.attach().await.unwrap();

    let active = engine.active_filters();
    assert!(active.values(FilterCategory::Manufacturer).contains("Aqara"));
    assert!(!active.values(FilterCategory::Manufacturer).contains("Sonoff"));
    assert!(active.values(FilterCategory::Area).is_empty());

    let persisted = sink.last().unwrap();
    assert_eq!(persisted.filters, active, "pruned state written back");

    // The initial query already used the pruned set.
    let first_query = &transport.calls_for(CMD_QUERY_DEVICES)[0];
    assert_eq!(first_query["filter_manufacturer"], json!(["Aqara"]));
    assert!(first_query.get("filter_area").is_none());

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn filter_options_are_fetched_once_and_shared() {
    let transport = FakeTransport::new();
    transport.set_latency(Duration::from_millis(50));
    let engine = engine_with(&transport, None);

    let (a, b) = tokio::join!(engine.filter_options(), engine.filter_options());
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(
        transport.call_count(CMD_GET_FILTER_OPTIONS),
        1,
        "concurrent fetches share one request"
    );

    // Cached thereafter.
    engine.filter_options().await.unwrap();
    assert_eq!(transport.call_count(CMD_GET_FILTER_OPTIONS), 1);
}

// ── Reconnection ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_b_backoff_schedule_walks_one_two_four() {
    let transport = FakeTransport::new();
    transport.enqueue(CMD_SUBSCRIBE, Reply::Socket);
    transport.enqueue(CMD_SUBSCRIBE, Reply::Socket);
    transport.enqueue(CMD_SUBSCRIBE, Reply::Socket);
    let engine = engine_with(&transport, None);

    engine.attach().await.unwrap();
    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Reconnecting { attempt: 1 }
    );
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), 1);

    // First retry after 1s.
    tokio::time::sleep(Duration::from_millis(1050)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), 2);
    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Reconnecting { attempt: 2 }
    );

    // Second retry after 2s more.
    tokio::time::sleep(Duration::from_millis(1050)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), 2, "2s not yet elapsed");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), 3);

    // Third retry after 4s more; the scripted failures are exhausted, so
    // this one succeeds and the counter resets.
    tokio::time::sleep(Duration::from_millis(4050)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), 4);
    assert_eq!(engine.current_connection_state(), ConnectionState::Connected);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p2_disconnect_after_success_starts_backoff_over() {
    let transport = FakeTransport::new();
    transport.enqueue(CMD_SUBSCRIBE, Reply::Socket);
    transport.enqueue(CMD_SUBSCRIBE, Reply::Socket);
    let engine = engine_with(&transport, None);

    engine.attach().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1050)).await;
    settle().await;
    tokio::time::sleep(Duration::from_millis(2050)).await;
    settle().await;
    assert_eq!(engine.current_connection_state(), ConnectionState::Connected);

    // Server-side session drop arrives as a push event.
    transport.emit(PushEvent::ConnectionStatus(SessionStatus::Disconnected));
    settle().await;
    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Reconnecting { attempt: 1 },
        "attempt counter restarted after a successful connection"
    );
    assert_eq!(engine.subscription_id(), None);

    // And the first retry lands after 1s again.
    tokio::time::sleep(Duration::from_millis(1050)).await;
    settle().await;
    assert_eq!(engine.current_connection_state(), ConnectionState::Connected);
    assert_eq!(engine.subscription_id().as_deref(), Some("sub_test"));

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn p1_cap_reached_goes_offline_until_manual_refresh() {
    let transport = FakeTransport::new();
    transport.set_failing(CMD_SUBSCRIBE, true);
    let engine = engine_with(&transport, None);

    engine.attach().await.unwrap();
    // Walk the whole schedule: 1+2+4+8+16+30*5 = 181s of backoff.
    tokio::time::sleep(Duration::from_secs(400)).await;
    settle().await;

    assert_eq!(engine.current_connection_state(), ConnectionState::Offline);
    let calls_at_cap = transport.call_count(CMD_SUBSCRIBE);
    assert_eq!(calls_at_cap, 11, "initial try plus ten scheduled retries");

    // No further automatic attempts.
    tokio::time::sleep(Duration::from_secs(600)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), calls_at_cap);

    // Manual refresh re-arms and reconnects.
    transport.set_failing(CMD_SUBSCRIBE, false);
    engine.refresh().await;
    assert_eq!(engine.current_connection_state(), ConnectionState::Connected);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn restored_channel_short_circuits_the_backoff_wait() {
    let transport = FakeTransport::new();
    transport.set_failing(CMD_SUBSCRIBE, true);
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    // Burn a few attempts so the pending delay is long (4s, fires at t=7).
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Reconnecting { attempt: 3 }
    );

    transport.set_failing(CMD_SUBSCRIBE, false);
    transport.emit(PushEvent::ConnectionStatus(SessionStatus::Connected));
    settle().await;

    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Connected,
        "no need to sit out the remaining backoff"
    );

    engine.detach().await;
}

// ── Push events ──────────────────────────────────────────────────────

fn device_changed(id: &str, level: f64, status: &str) -> PushEvent {
    PushEvent::DeviceChanged(
        serde_json::from_value(json!({
            "entity_id": id,
            "battery_level": level,
            "available": true,
            "status": status,
            "last_updated": "2026-03-01T10:00:00Z",
        }))
        .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn record_changed_patches_in_place_without_reordering() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 5), None, false)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    let order_before: Vec<String> = engine
        .devices_snapshot()
        .iter()
        .map(|r| r.id.clone())
        .collect();

    transport.emit(device_changed("sensor.dev_2", 9.0, "critical"));
    settle().await;

    let snapshot = engine.devices_snapshot();
    let order_after: Vec<String> = snapshot.iter().map(|r| r.id.clone()).collect();
    assert_eq!(order_before, order_after, "push events never reorder");

    let patched = snapshot.iter().find(|r| r.id == "sensor.dev_2").unwrap();
    assert_eq!(patched.level, Some(9));
    assert_eq!(patched.status, battwatch_core::BatteryStatus::Critical);
    assert!(
        engine.last_update().borrow().is_some(),
        "applied patch bumps the update marker"
    );

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_c_change_for_unknown_id_is_ignored() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 5), None, false)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    transport.emit(device_changed("sensor.never_heard_of_it", 1.0, "critical"));
    settle().await;

    let snapshot = engine.devices_snapshot();
    assert_eq!(snapshot.len(), 5, "no insertion");
    assert!(snapshot.iter().all(|r| r.id != "sensor.never_heard_of_it"));
    assert_eq!(
        *engine.last_update().borrow(),
        None,
        "ignored event does not bump the update marker"
    );

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn threshold_push_updates_cache_and_refetches() {
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 5), None, false)),
    );
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();
    let baseline = transport.call_count(CMD_QUERY_DEVICES);

    transport.emit(PushEvent::ThresholdUpdated(
        serde_json::from_value(json!({
            "global_threshold": 30,
            "device_rules": { "sensor.dev_1": 50 },
        }))
        .unwrap(),
    ));
    settle().await;

    let prefs = engine.threshold_prefs();
    assert_eq!(prefs.global_threshold, 30);
    assert_eq!(prefs.threshold_for("sensor.dev_1"), 50);
    assert_eq!(
        transport.call_count(CMD_QUERY_DEVICES),
        baseline + 1,
        "membership may have changed, so the list is refetched"
    );
    let last = transport.calls_for(CMD_QUERY_DEVICES);
    assert!(last.last().unwrap().get("cursor").is_none());

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn notification_history_is_bounded_and_newest_first() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    for i in 0..25 {
        transport.emit(PushEvent::NotificationSent(
            serde_json::from_value(json!({
                "device_name": format!("Device {i}"),
                "battery_level": 10.0,
                "timestamp": "2026-03-01T10:00:00Z",
            }))
            .unwrap(),
        ));
    }
    settle().await;

    let history = engine.notification_history();
    assert_eq!(history.len(), 20, "capped at 20 entries");
    assert_eq!(history[0].device_name, "Device 24", "newest first");
    assert_eq!(history[19].device_name, "Device 5", "oldest beyond the cap dropped");

    engine.detach().await;
}

// ── User-initiated saves ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn threshold_save_timeout_surfaces_and_is_not_retried() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    transport.enqueue(CMD_SET_THRESHOLD, Reply::Timeout);
    let err = engine
        .set_threshold(ThresholdPrefs {
            global_threshold: 25,
            ..ThresholdPrefs::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(
        transport.call_count(CMD_SET_THRESHOLD),
        1,
        "user-initiated saves are never auto-retried"
    );
    // The cached prefs keep their old value.
    assert_eq!(engine.threshold_prefs().global_threshold, 15);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_threshold_is_rejected_before_the_wire() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    let err = engine
        .set_threshold(ThresholdPrefs {
            global_threshold: 2,
            ..ThresholdPrefs::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
    assert_eq!(transport.call_count(CMD_SET_THRESHOLD), 0);

    engine.detach().await;
}

// ── Sorting / persistence ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sort_change_persists_and_reloads_from_page_one() {
    let sink = MemorySink::preloaded(PanelState::default());
    let transport = FakeTransport::new();
    transport.enqueue(
        CMD_QUERY_DEVICES,
        Reply::Ok(page(devices_range(0, 50), Some("c1"), true)),
    );
    let engine = engine_with(&transport, Some(Arc::clone(&sink)));
    engine.attach().await.unwrap();

    engine
        .set_sort(SortKey::LevelDesc, SortOrder::Desc)
        .await
        .unwrap();

    let persisted = sink.last().unwrap();
    assert_eq!(persisted.sort_key, SortKey::LevelDesc);
    assert_eq!(persisted.sort_order, SortOrder::Desc);

    let queries = transport.calls_for(CMD_QUERY_DEVICES);
    let last = queries.last().unwrap();
    assert_eq!(last["sort_key"], "level_desc");
    assert!(last.get("cursor").is_none(), "sort change restarts paging");

    // Unchanged sort is a no-op.
    let baseline = queries.len();
    engine
        .set_sort(SortKey::LevelDesc, SortOrder::Desc)
        .await
        .unwrap();
    assert_eq!(transport.call_count(CMD_QUERY_DEVICES), baseline);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn restored_sort_drives_the_initial_query() {
    let sink = MemorySink::preloaded(PanelState {
        sort_key: SortKey::Alphabetical,
        scroll_offset: 800.0,
        ..PanelState::default()
    });
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, Some(sink));
    engine.attach().await.unwrap();

    let first = &transport.calls_for(CMD_QUERY_DEVICES)[0];
    assert_eq!(first["sort_key"], "alphabetical");
    assert_eq!(engine.current_sort().0, SortKey::Alphabetical);

    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn scroll_offset_is_persisted_on_change() {
    let sink = MemorySink::preloaded(PanelState::default());
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, Some(Arc::clone(&sink)));
    engine.attach().await.unwrap();

    engine.record_scroll_offset(1234.0);
    let persisted = sink.last().unwrap();
    assert!((persisted.scroll_offset - 1234.0).abs() < f64::EPSILON);

    engine.detach().await;
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn double_attach_is_rejected() {
    let transport = FakeTransport::new();
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();
    assert!(engine.attach().await.is_err());
    engine.detach().await;
}

#[tokio::test(start_paused = true)]
async fn detach_stops_timers_and_event_delivery() {
    let transport = FakeTransport::new();
    transport.set_failing(CMD_SUBSCRIBE, true);
    let engine = engine_with(&transport, None);
    engine.attach().await.unwrap();

    let calls_before = transport.call_count(CMD_SUBSCRIBE);
    engine.detach().await;
    assert_eq!(
        engine.current_connection_state(),
        ConnectionState::Disconnected
    );

    // Pending reconnect timer is dead; pushes go nowhere.
    transport.emit(PushEvent::ConnectionStatus(SessionStatus::Disconnected));
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(transport.call_count(CMD_SUBSCRIBE), calls_before);
    assert_eq!(engine.subscription_id(), None);
}
