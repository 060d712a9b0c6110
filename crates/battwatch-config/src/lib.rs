//! Durable panel state for Battwatch.
//!
//! Persists the slice of UI state that survives a reload — last sort
//! method, active filter set, scroll offset — as TOML under the platform
//! config directory. Loading is tolerant by design: missing files,
//! unreadable TOML, or unknown fields all degrade to defaults without
//! surfacing an error, per the engine's `StateSink` contract.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use thiserror::Error;
use tracing::{debug, warn};

use battwatch_core::{PanelState, StateSink};

const STATE_FILE: &str = "panel_state.toml";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no config directory available on this platform")]
    NoConfigDir,

    #[error("failed to serialize panel state: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── StateStore ──────────────────────────────────────────────────────

/// TOML-backed [`StateSink`] implementation.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store under the platform config directory
    /// (e.g. `~/.config/battwatch/panel_state.toml`).
    pub fn new() -> Result<Self, StateError> {
        let dirs = ProjectDirs::from("", "", "battwatch").ok_or(StateError::NoConfigDir)?;
        Ok(Self {
            path: dirs.config_dir().join(STATE_FILE),
        })
    }

    /// Store at an explicit path. Used by tests and embedders that manage
    /// their own directories.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state, falling back to defaults field-by-field.
    ///
    /// A corrupt file is reported via `warn!` and replaced by defaults —
    /// never an error to the caller.
    pub fn load_state(&self) -> PanelState {
        let figment = Figment::from(Serialized::defaults(PanelState::default()))
            .merge(Toml::file(&self.path));

        match figment.extract() {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable panel state, using defaults");
                PanelState::default()
            }
        }
    }

    /// Write the state, creating parent directories as needed.
    pub fn save_state(&self, state: &PanelState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = toml::to_string_pretty(state)?;
        std::fs::write(&self.path, body)?;
        debug!(path = %self.path.display(), "panel state saved");
        Ok(())
    }
}

impl StateSink for StateStore {
    fn load(&self) -> Option<PanelState> {
        if !self.path.exists() {
            return None;
        }
        Some(self.load_state())
    }

    fn persist(&self, state: &PanelState) {
        if let Err(e) = self.save_state(state) {
            warn!(path = %self.path.display(), error = %e, "failed to persist panel state");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
