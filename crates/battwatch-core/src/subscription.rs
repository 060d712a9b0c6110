// ── Live-update subscription ──
//
// Holds the server-issued subscription identifier for the current
// connection: at most one live subscription per transport instance.
// Failures are not retried here; the connection supervisor owns the
// retry schedule.

use battwatch_api::{Transport, calls};
use tracing::{debug, info};

use crate::error::CoreError;

pub struct SubscriptionClient {
    id: std::sync::Mutex<Option<String>>,
}

impl SubscriptionClient {
    pub fn new() -> Self {
        Self {
            id: std::sync::Mutex::new(None),
        }
    }

    /// Request a live-update subscription and store its identifier,
    /// replacing any previous one from before a reconnect.
    pub async fn subscribe(&self, transport: &dyn Transport) -> Result<String, CoreError> {
        let reply = calls::subscribe(transport).await?;
        info!(subscription_id = %reply.subscription_id, "subscribed to live updates");
        *self.id_guard() = Some(reply.subscription_id.clone());
        Ok(reply.subscription_id)
    }

    /// Forget the subscription (teardown or fatal disconnect).
    pub fn clear(&self) {
        if self.id_guard().take().is_some() {
            debug!("subscription cleared");
        }
    }

    pub fn current(&self) -> Option<String> {
        self.id_guard().clone()
    }

    fn id_guard(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SubscriptionClient {
    fn default() -> Self {
        Self::new()
    }
}
