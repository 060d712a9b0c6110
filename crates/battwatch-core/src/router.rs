// ── Push-event routing ──
//
// An explicit observer registry over the transport's push stream.
// Listeners register per event kind and receive events over unbounded
// mpsc channels; unregistering is dropping the receiver (dead senders
// are pruned at dispatch). The dispatch task is installed at most once
// per transport instance no matter how often `install` is called, so a
// re-subscribe after reconnect can never double-deliver events.

use std::collections::HashMap;
use std::sync::Arc;

use battwatch_api::Transport;
use battwatch_api::proto::{EventKind, PushEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ListenerMap = HashMap<EventKind, Vec<mpsc::UnboundedSender<Arc<PushEvent>>>>;

pub struct MessageRouter {
    listeners: Arc<std::sync::Mutex<ListenerMap>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MessageRouter {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            listeners: Arc::new(std::sync::Mutex::new(HashMap::new())),
            pump: std::sync::Mutex::new(None),
            cancel,
        }
    }

    /// Register interest in one event kind. Drop the receiver to
    /// unregister.
    pub fn register(&self, kind: EventKind) -> mpsc::UnboundedReceiver<Arc<PushEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners_guard().entry(kind).or_default().push(tx);
        rx
    }

    /// Install the dispatch task over the transport's push stream.
    ///
    /// Idempotent: returns `false` without side effects if a dispatch
    /// task is already installed for this router.
    pub fn install(&self, transport: &dyn Transport) -> bool {
        let mut pump = self.pump_guard();
        if pump.is_some() {
            debug!("dispatch already installed, skipping");
            return false;
        }

        let mut events = transport.events();
        let listeners = Arc::clone(&self.listeners);
        let cancel = self.cancel.clone();

        *pump = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = events.recv() => {
                        match result {
                            Ok(event) => dispatch(&listeners, &event),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event dispatch fell behind");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        }));
        true
    }

    pub fn installed(&self) -> bool {
        self.pump_guard().is_some()
    }

    /// Remove the dispatch task and drop all listener registrations.
    pub fn teardown(&self) {
        if let Some(handle) = self.pump_guard().take() {
            handle.abort();
        }
        self.listeners_guard().clear();
    }

    fn listeners_guard(&self) -> std::sync::MutexGuard<'_, ListenerMap> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn pump_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Deliver one event to every live listener for its kind, pruning
/// listeners whose receiver has been dropped.
fn dispatch(listeners: &std::sync::Mutex<ListenerMap>, event: &Arc<PushEvent>) {
    let mut map = listeners
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(senders) = map.get_mut(&event.kind()) {
        senders.retain(|tx| tx.send(Arc::clone(event)).is_ok());
    }
}
