// ── Runtime engine configuration ──
//
// Tuning knobs for one engine instance. Carries no credentials and
// never touches disk; the consumer constructs it and hands it in.

use std::time::Duration;

use crate::coalescer::DEBOUNCE_WINDOW;
use crate::connection::ReconnectPolicy;
use crate::model::DEFAULT_PAGE_SIZE;

/// Configuration for one [`crate::engine::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Devices requested per page.
    pub page_size: u32,
    /// Quiet period before coalesced filter toggles become one query.
    pub debounce_window: Duration,
    /// Session-level reconnect schedule.
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            debounce_window: DEBOUNCE_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
