// ── Durable state boundary ──
//
// Core never touches disk. Consumers hand the engine a `StateSink` and
// decide where panel state actually lives (the `battwatch-config` crate
// provides a TOML-backed implementation).

use crate::model::PanelState;

/// Where durable panel state is read at attach and written on every
/// user-driven change.
///
/// Both operations are infallible from the engine's point of view:
/// `load` answers `None` for missing or unreadable state (the engine
/// falls back to defaults without surfacing an error), and `persist`
/// failures are the sink's to log.
pub trait StateSink: Send + Sync {
    fn load(&self) -> Option<PanelState>;
    fn persist(&self, state: &PanelState);
}
