// ── Engine facade ──
//
// Composes the connection supervisor, message router, subscription
// client, pager, and filter coalescer into the panel's data engine.
// Consumers construct one engine per panel attachment, observe its
// watch channels, and call the operation methods below; everything
// network-facing flows through the injected Transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use battwatch_api::proto::{
    EventKind, PushEvent, SessionStatus, SetThresholdRequest, ThresholdUpdate,
};
use battwatch_api::{Transport, calls};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coalescer::FilterCoalescer;
use crate::config::EngineConfig;
use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::error::CoreError;
use crate::model::prefs::NOTIFICATION_HISTORY_MAX;
use crate::model::{
    DeviceQuery, DeviceRecord, FilterCategory, FilterOptions, FilterSet, NotificationEntry,
    NotificationPrefs, PanelState, SortKey, SortOrder, StatusCounts, ThresholdPrefs,
};
use crate::pages::DevicePager;
use crate::persist::StateSink;
use crate::router::MessageRouter;
use crate::subscription::SubscriptionClient;

/// The panel's data-synchronization engine.
///
/// Cheaply cloneable. Create with [`SyncEngine::new`], start with
/// [`attach`](Self::attach), stop with [`detach`](Self::detach). One
/// engine serves one attachment; build a fresh engine to re-attach.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    supervisor: ConnectionSupervisor,
    router: MessageRouter,
    subscription: SubscriptionClient,
    pager: DevicePager,
    filters: FilterCoalescer,
    /// Taken by the filter-apply task at attach.
    apply_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<FilterSet>>>,

    sort: std::sync::Mutex<(SortKey, SortOrder)>,
    scroll_offset: std::sync::Mutex<f64>,
    threshold: std::sync::Mutex<ThresholdPrefs>,

    notifications: std::sync::Mutex<VecDeque<NotificationEntry>>,
    notifications_tx: watch::Sender<Vec<NotificationEntry>>,
    last_update: watch::Sender<Option<DateTime<Utc>>>,

    /// Vocabulary cache. The async lock held across the fetch also
    /// collapses concurrent fetch attempts into one request.
    options: tokio::sync::Mutex<Option<FilterOptions>>,

    sink: Option<Arc<dyn StateSink>>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    attached: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        sink: Option<Arc<dyn StateSink>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (filters, apply_rx) = FilterCoalescer::new(config.debounce_window, cancel.clone());
        let supervisor = ConnectionSupervisor::new(config.reconnect.clone(), cancel.clone());
        let (notifications_tx, _) = watch::channel(Vec::new());
        let (last_update, _) = watch::channel(None);

        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                supervisor,
                router: MessageRouter::new(cancel.clone()),
                subscription: SubscriptionClient::new(),
                pager: DevicePager::new(),
                filters,
                apply_rx: std::sync::Mutex::new(Some(apply_rx)),
                sort: std::sync::Mutex::new((SortKey::default(), SortOrder::default())),
                scroll_offset: std::sync::Mutex::new(0.0),
                threshold: std::sync::Mutex::new(ThresholdPrefs::default()),
                notifications: std::sync::Mutex::new(VecDeque::new()),
                notifications_tx,
                last_update,
                options: tokio::sync::Mutex::new(None),
                sink,
                cancel,
                tasks: std::sync::Mutex::new(Vec::new()),
                attached: AtomicBool::new(false),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach the engine: restore durable state, install event routing,
    /// fetch the filter vocabulary, then run the load sequence (first
    /// page + subscribe).
    ///
    /// Load failures do not fail `attach` — they enter the reconnect
    /// path, observable through [`connection_state`](Self::connection_state).
    pub async fn attach(&self) -> Result<(), CoreError> {
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Internal("engine already attached".into()));
        }

        self.restore_state();

        self.inner.router.install(self.inner.transport.as_ref());
        self.spawn_event_pump();
        self.spawn_filter_apply();

        // Vocabulary fetch is non-fatal: a failure leaves persisted
        // filters unpruned and is retryable through filter_options().
        match self.filter_options().await {
            Ok(options) => {
                let mut active = self.inner.filters.active();
                if active.prune(&options) {
                    info!("pruned stale filter selections against fetched vocabulary");
                    self.inner.filters.replace_active(active);
                    self.persist_state();
                }
            }
            Err(e) => {
                warn!(error = %e, "filter vocabulary unavailable at attach");
            }
        }

        self.run_load_sequence().await;
        Ok(())
    }

    /// Detach: cancel every task and timer, drop the subscription and
    /// dispatch installation. The engine is spent afterwards.
    pub async fn detach(&self) {
        self.inner.cancel.cancel();
        self.inner.filters.teardown();
        self.inner.supervisor.cancel_timer();

        let handles: Vec<JoinHandle<()>> = self.tasks_guard().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.subscription.clear();
        self.inner.router.teardown();
        self.inner.supervisor.mark_disconnected();
        // `attached` stays set: the engine is spent, a re-attach must
        // build a fresh engine.
        debug!("engine detached");
    }

    // ── Load sequence / reconnect ────────────────────────────────────

    /// Run the full load sequence: first page fetch, then subscribe.
    /// On failure, hand the retry to the connection supervisor.
    async fn run_load_sequence(&self) {
        self.inner.supervisor.mark_connecting();
        match self.load_and_subscribe().await {
            Ok(()) => {
                self.inner.supervisor.mark_connected();
                info!("load sequence complete");
            }
            Err(e) => {
                warn!(error = %e, "load sequence failed");
                self.schedule_reconnect();
            }
        }
    }

    async fn load_and_subscribe(&self) -> Result<(), CoreError> {
        let query = self.current_query();
        self.inner
            .pager
            .load_first(self.inner.transport.as_ref(), &query)
            .await?;
        self.inner
            .subscription
            .subscribe(self.inner.transport.as_ref())
            .await?;
        Ok(())
    }

    fn schedule_reconnect(&self) {
        let engine = self.clone();
        let retry: BoxFuture<'static, ()> =
            Box::pin(async move { engine.run_load_sequence().await });
        self.inner.supervisor.schedule_reconnect(retry);
    }

    /// Manual refresh: re-arms the attempt counter (the only way out of
    /// Offline) and re-runs the load sequence.
    pub async fn refresh(&self) {
        self.inner.supervisor.rearm();
        self.run_load_sequence().await;
    }

    // ── Background tasks ─────────────────────────────────────────────

    fn spawn_event_pump(&self) {
        let mut device_rx = self.inner.router.register(EventKind::DeviceChanged);
        let mut status_rx = self.inner.router.register(EventKind::ConnectionStatus);
        let mut threshold_rx = self.inner.router.register(EventKind::ThresholdUpdated);
        let mut notify_rx = self.inner.router.register(EventKind::NotificationSent);

        let engine = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    maybe = device_rx.recv() => match maybe {
                        Some(event) => engine.on_device_event(&event),
                        None => break,
                    },
                    maybe = status_rx.recv() => match maybe {
                        Some(event) => engine.on_status_event(&event).await,
                        None => break,
                    },
                    maybe = threshold_rx.recv() => match maybe {
                        Some(event) => engine.on_threshold_event(&event).await,
                        None => break,
                    },
                    maybe = notify_rx.recv() => match maybe {
                        Some(event) => engine.on_notification_event(&event),
                        None => break,
                    },
                }
            }
        });
        self.tasks_guard().push(handle);
    }

    fn spawn_filter_apply(&self) {
        let Some(mut apply_rx) = self.apply_rx_guard().take() else {
            return;
        };

        let engine = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    maybe = apply_rx.recv() => {
                        let Some(_filters) = maybe else { break };
                        engine.persist_state();
                        if let Err(e) = engine.reload_active_query().await {
                            warn!(error = %e, "filter apply reload failed");
                        }
                    }
                }
            }
        });
        self.tasks_guard().push(handle);
    }

    // ── Push-event handlers ──────────────────────────────────────────

    fn on_device_event(&self, event: &PushEvent) {
        if let PushEvent::DeviceChanged(change) = event {
            if self.inner.pager.apply_change(change) {
                let _ = self.inner.last_update.send(Some(Utc::now()));
            }
        }
    }

    async fn on_status_event(&self, event: &PushEvent) {
        let PushEvent::ConnectionStatus(status) = event else {
            return;
        };
        match status {
            SessionStatus::Disconnected => {
                self.inner.subscription.clear();
                if self.inner.supervisor.current() == ConnectionState::Connected {
                    info!("session dropped, entering reconnect");
                    self.schedule_reconnect();
                }
            }
            SessionStatus::Connected => {
                // The channel is back before the backoff timer fired:
                // skip the remaining wait and retry now.
                if matches!(
                    self.inner.supervisor.current(),
                    ConnectionState::Reconnecting { .. }
                ) {
                    info!("channel restored, retrying immediately");
                    self.inner.supervisor.cancel_timer();
                    self.run_load_sequence().await;
                }
            }
        }
    }

    async fn on_threshold_event(&self, event: &PushEvent) {
        let PushEvent::ThresholdUpdated(update) = event else {
            return;
        };
        self.store_threshold(update);

        // A threshold move can change which devices the query matches,
        // and a patch event does not re-evaluate membership. Refetch.
        if let Err(e) = self.reload_active_query().await {
            warn!(error = %e, "refetch after threshold update failed");
        }
    }

    fn store_threshold(&self, update: &ThresholdUpdate) {
        let mut threshold = self.threshold_guard();
        threshold.global_threshold = update.global_threshold;
        threshold.device_rules = update.device_rules.clone();
    }

    fn on_notification_event(&self, event: &PushEvent) {
        let PushEvent::NotificationSent(push) = event else {
            return;
        };
        let entry = NotificationEntry::from(push.clone());
        let snapshot: Vec<NotificationEntry> = {
            let mut history = self.notifications_guard();
            history.push_front(entry);
            history.truncate(NOTIFICATION_HISTORY_MAX);
            history.iter().cloned().collect()
        };
        let _ = self.inner.notifications_tx.send(snapshot);
    }

    // ── Pagination ───────────────────────────────────────────────────

    /// Near-end-of-list trigger. Fetches the next page unless the list
    /// is exhausted or a fetch is already in flight.
    pub async fn near_end(&self) -> Result<bool, CoreError> {
        if !self.inner.pager.has_more() {
            return Ok(false);
        }
        let query = self.current_query();
        match self
            .inner
            .pager
            .load_next(self.inner.transport.as_ref(), &query)
            .await
        {
            Ok(appended) => Ok(appended),
            Err(e) => {
                if e.is_transport_failure() {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    // ── Sorting ──────────────────────────────────────────────────────

    /// Change the sort method: persists, resets pagination, reloads.
    pub async fn set_sort(&self, key: SortKey, order: SortOrder) -> Result<(), CoreError> {
        {
            let mut sort = self.sort_guard();
            if *sort == (key, order) {
                return Ok(());
            }
            *sort = (key, order);
        }
        self.persist_state();
        self.reload_active_query().await
    }

    pub fn current_sort(&self) -> (SortKey, SortOrder) {
        *self.sort_guard()
    }

    // ── Filters ──────────────────────────────────────────────────────

    /// Toggle a filter value. The chip state updates immediately; the
    /// query is debounced.
    pub fn toggle_filter(&self, category: FilterCategory, value: &str) {
        self.inner.filters.toggle(category, value);
    }

    /// Remove one selected value (chip deletion). Applies immediately.
    pub fn remove_filter_value(&self, category: FilterCategory, value: &str) {
        self.inner.filters.remove_value(category, value);
    }

    /// Clear all filters. Applies immediately.
    pub fn clear_filters(&self) {
        self.inner.filters.clear_all();
    }

    pub fn open_staged_filters(&self) {
        self.inner.filters.open_staged();
    }

    pub fn staged_toggle(&self, category: FilterCategory, value: &str) {
        self.inner.filters.staged_toggle(category, value);
    }

    pub fn commit_staged_filters(&self) {
        self.inner.filters.commit_staged();
    }

    pub fn discard_staged_filters(&self) {
        self.inner.filters.discard_staged();
    }

    pub fn active_filters(&self) -> FilterSet {
        self.inner.filters.active()
    }

    pub fn staged_filters(&self) -> Option<FilterSet> {
        self.inner.filters.staged()
    }

    /// Fetch the filter vocabulary, once per session. Concurrent calls
    /// share one request; a failed fetch is retryable by calling again.
    pub async fn filter_options(&self) -> Result<FilterOptions, CoreError> {
        let mut cache = self.inner.options.lock().await;
        if let Some(options) = cache.as_ref() {
            return Ok(options.clone());
        }
        let dto = calls::get_filter_options(self.inner.transport.as_ref()).await?;
        let options = FilterOptions::from(dto);
        *cache = Some(options.clone());
        Ok(options)
    }

    // ── Preferences ──────────────────────────────────────────────────

    /// Save threshold settings. User-initiated: failures surface to the
    /// caller and are never auto-retried.
    pub async fn set_threshold(&self, prefs: ThresholdPrefs) -> Result<(), CoreError> {
        prefs.validate()?;
        let request = SetThresholdRequest {
            global_threshold: prefs.global_threshold,
            device_rules: prefs.device_rules.clone(),
        };
        calls::set_threshold(self.inner.transport.as_ref(), &request).await?;
        *self.threshold_guard() = prefs;
        Ok(())
    }

    pub fn threshold_prefs(&self) -> ThresholdPrefs {
        self.threshold_guard().clone()
    }

    pub async fn notification_preferences(&self) -> Result<NotificationPrefs, CoreError> {
        let dto = calls::get_notification_preferences(self.inner.transport.as_ref()).await?;
        Ok(NotificationPrefs::from(dto))
    }

    /// Save notification preferences. User-initiated: failures surface
    /// to the caller and are never auto-retried.
    pub async fn set_notification_preferences(
        &self,
        prefs: NotificationPrefs,
    ) -> Result<NotificationPrefs, CoreError> {
        prefs.validate()?;
        let stored = calls::set_notification_preferences(
            self.inner.transport.as_ref(),
            &(&prefs).into(),
        )
        .await?;
        Ok(NotificationPrefs::from(stored))
    }

    // ── Scroll position ──────────────────────────────────────────────

    pub fn record_scroll_offset(&self, offset: f64) {
        *self.scroll_guard() = offset;
        self.persist_state();
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.subscribe()
    }

    pub fn current_connection_state(&self) -> ConnectionState {
        self.inner.supervisor.current()
    }

    pub fn devices(&self) -> watch::Receiver<Arc<Vec<Arc<DeviceRecord>>>> {
        self.inner.pager.subscribe()
    }

    pub fn devices_snapshot(&self) -> Arc<Vec<Arc<DeviceRecord>>> {
        self.inner.pager.snapshot()
    }

    pub fn status_counts(&self) -> watch::Receiver<StatusCounts> {
        self.inner.pager.subscribe_counts()
    }

    pub fn notifications(&self) -> watch::Receiver<Vec<NotificationEntry>> {
        self.inner.notifications_tx.subscribe()
    }

    pub fn notification_history(&self) -> Vec<NotificationEntry> {
        self.notifications_guard().iter().cloned().collect()
    }

    pub fn last_update(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.inner.last_update.subscribe()
    }

    pub fn subscription_id(&self) -> Option<String> {
        self.inner.subscription.current()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn current_query(&self) -> DeviceQuery {
        let (key, order) = *self.sort_guard();
        DeviceQuery::new(
            key,
            order,
            self.inner.filters.active(),
            self.inner.config.page_size,
        )
    }

    /// Reset pagination and fetch the first page of the current query.
    /// Transport failures also enter the reconnect path.
    async fn reload_active_query(&self) -> Result<(), CoreError> {
        self.inner.pager.reset();
        let query = self.current_query();
        match self
            .inner
            .pager
            .load_first(self.inner.transport.as_ref(), &query)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_transport_failure() {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    fn restore_state(&self) {
        let Some(sink) = self.inner.sink.as_ref() else {
            return;
        };
        let Some(state) = sink.load() else {
            debug!("no durable panel state, using defaults");
            return;
        };
        *self.sort_guard() = (state.sort_key, state.sort_order);
        *self.scroll_guard() = state.scroll_offset;
        self.inner.filters.replace_active(state.filters);
        debug!("durable panel state restored");
    }

    fn persist_state(&self) {
        let Some(sink) = self.inner.sink.as_ref() else {
            return;
        };
        let (sort_key, sort_order) = *self.sort_guard();
        let state = PanelState {
            sort_key,
            sort_order,
            filters: self.inner.filters.active(),
            scroll_offset: *self.scroll_guard(),
        };
        sink.persist(&state);
    }

    fn sort_guard(&self) -> std::sync::MutexGuard<'_, (SortKey, SortOrder)> {
        self.inner
            .sort
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn scroll_guard(&self) -> std::sync::MutexGuard<'_, f64> {
        self.inner
            .scroll_offset
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn threshold_guard(&self) -> std::sync::MutexGuard<'_, ThresholdPrefs> {
        self.inner
            .threshold
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notifications_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<NotificationEntry>> {
        self.inner
            .notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply_rx_guard(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<FilterSet>>> {
        self.inner
            .apply_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn tasks_guard(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
