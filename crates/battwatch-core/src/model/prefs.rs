// ── Preferences and durable panel state ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::CoreError;
use crate::model::filters::FilterSet;
use crate::model::{SortKey, SortOrder};

// ── Threshold configuration ──────────────────────────────────────────

pub const DEFAULT_THRESHOLD: u8 = 15;
pub const THRESHOLD_MIN: u8 = 5;
pub const THRESHOLD_MAX: u8 = 100;
/// Upper bound on per-device rule count.
pub const MAX_DEVICE_RULES: usize = 10;

/// Battery thresholds: one global value plus per-device overrides.
///
/// Cached client-side; refreshed whenever the server pushes a
/// threshold-updated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdPrefs {
    pub global_threshold: u8,
    #[serde(default)]
    pub device_rules: BTreeMap<String, u8>,
}

impl Default for ThresholdPrefs {
    fn default() -> Self {
        Self {
            global_threshold: DEFAULT_THRESHOLD,
            device_rules: BTreeMap::new(),
        }
    }
}

impl ThresholdPrefs {
    /// Effective threshold for one device.
    pub fn threshold_for(&self, entity_id: &str) -> u8 {
        self.device_rules
            .get(entity_id)
            .copied()
            .unwrap_or(self.global_threshold)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let in_range = |v: u8| (THRESHOLD_MIN..=THRESHOLD_MAX).contains(&v);
        if !in_range(self.global_threshold) {
            return Err(CoreError::Validation {
                message: format!(
                    "global threshold {} outside {THRESHOLD_MIN}..={THRESHOLD_MAX}",
                    self.global_threshold
                ),
            });
        }
        if self.device_rules.len() > MAX_DEVICE_RULES {
            return Err(CoreError::Validation {
                message: format!(
                    "{} device rules exceed the limit of {MAX_DEVICE_RULES}",
                    self.device_rules.len()
                ),
            });
        }
        if let Some((entity_id, value)) =
            self.device_rules.iter().find(|(_, v)| !in_range(**v))
        {
            return Err(CoreError::Validation {
                message: format!(
                    "rule for {entity_id} ({value}) outside {THRESHOLD_MIN}..={THRESHOLD_MAX}"
                ),
            });
        }
        Ok(())
    }
}

// ── Notification preferences ─────────────────────────────────────────

pub const FREQUENCY_CAP_OPTIONS_HOURS: [u32; 5] = [1, 2, 6, 12, 24];
/// Bound on the client-side notification history ring.
pub const NOTIFICATION_HISTORY_MAX: usize = 20;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeverityFilter {
    All,
    #[default]
    CriticalOnly,
    CriticalAndWarning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub enabled: bool,
    pub frequency_cap_hours: u32,
    pub severity_filter: SeverityFilter,
    #[serde(default)]
    pub per_device: BTreeMap<String, PerDevicePref>,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_cap_hours: 6,
            severity_filter: SeverityFilter::default(),
            per_device: BTreeMap::new(),
        }
    }
}

impl NotificationPrefs {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !FREQUENCY_CAP_OPTIONS_HOURS.contains(&self.frequency_cap_hours) {
            return Err(CoreError::Validation {
                message: format!(
                    "frequency cap {}h is not one of {FREQUENCY_CAP_OPTIONS_HOURS:?}",
                    self.frequency_cap_hours
                ),
            });
        }
        if let Some((entity_id, pref)) = self
            .per_device
            .iter()
            .find(|(_, p)| {
                p.frequency_cap_hours
                    .is_some_and(|h| !FREQUENCY_CAP_OPTIONS_HOURS.contains(&h))
            })
        {
            return Err(CoreError::Validation {
                message: format!(
                    "per-device cap {:?} for {entity_id} is not one of {FREQUENCY_CAP_OPTIONS_HOURS:?}",
                    pref.frequency_cap_hours
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerDevicePref {
    #[serde(default)]
    pub frequency_cap_hours: Option<u32>,
}

// ── Notification history ─────────────────────────────────────────────

/// One entry in the client-side notification history.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEntry {
    pub device_name: String,
    pub level: Option<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

// ── Durable panel state ──────────────────────────────────────────────

/// The slice of UI state that survives a reload: last sort method, the
/// active filter set, and the last scroll offset.
///
/// Every field defaults independently so a partially corrupt file
/// degrades to defaults instead of erroring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelState {
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
    pub filters: FilterSet,
    pub scroll_offset: f64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn per_device_rule_overrides_global() {
        let prefs = ThresholdPrefs {
            global_threshold: 15,
            device_rules: BTreeMap::from([("sensor.lock_battery".to_owned(), 40)]),
        };
        assert_eq!(prefs.threshold_for("sensor.lock_battery"), 40);
        assert_eq!(prefs.threshold_for("sensor.other"), 15);
    }

    #[test]
    fn threshold_validation_bounds() {
        let mut prefs = ThresholdPrefs::default();
        assert!(prefs.validate().is_ok());

        prefs.global_threshold = 4;
        assert!(prefs.validate().is_err());

        prefs.global_threshold = 15;
        prefs.device_rules = (0..11)
            .map(|i| (format!("sensor.rule_{i}"), 20))
            .collect();
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn rule_value_out_of_range_is_rejected() {
        let prefs = ThresholdPrefs {
            global_threshold: 15,
            device_rules: BTreeMap::from([("sensor.bad".to_owned(), 3)]),
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn notification_prefs_validation() {
        let mut prefs = NotificationPrefs::default();
        assert!(prefs.validate().is_ok());

        prefs.frequency_cap_hours = 5;
        assert!(prefs.validate().is_err());

        prefs.frequency_cap_hours = 24;
        prefs.per_device.insert(
            "sensor.a".into(),
            PerDevicePref {
                frequency_cap_hours: Some(3),
            },
        );
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn panel_state_defaults() {
        let state = PanelState::default();
        assert_eq!(state.sort_key, SortKey::Priority);
        assert_eq!(state.sort_order, SortOrder::Asc);
        assert!(state.filters.is_empty());
        assert_eq!(state.scroll_offset, 0.0);
    }
}
