//! Canonical domain model for the panel engine.
//!
//! Wire DTOs from `battwatch-api` are converted into these types at the
//! boundary (see [`crate::convert`]); everything above the transport
//! works exclusively with this module.

pub mod filters;
pub mod prefs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub use filters::{AreaOption, FilterCategory, FilterOptions, FilterSet};
pub use prefs::{
    NotificationEntry, NotificationPrefs, PanelState, PerDevicePref, SeverityFilter,
    ThresholdPrefs,
};

// ── Pagination constants ─────────────────────────────────────────────

/// Page size requested when the consumer does not override it.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Hard server-side page cap; larger requests are clamped client-side.
pub const MAX_PAGE_SIZE: u32 = 100;

// ── Status classification ────────────────────────────────────────────

/// Health classification of one battery device.
///
/// Variant order doubles as display priority: critical devices sort
/// before warnings, warnings before healthy, unavailable last.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BatteryStatus {
    Critical,
    Warning,
    Healthy,
    Unavailable,
}

/// Levels within this many points above the threshold classify as Warning.
pub const WARNING_BUFFER: u8 = 10;

/// Classify a battery level against a threshold.
pub fn classify(level: Option<u8>, available: bool, threshold: u8) -> BatteryStatus {
    if !available {
        return BatteryStatus::Unavailable;
    }
    match level {
        None => BatteryStatus::Unavailable,
        Some(l) if l <= threshold => BatteryStatus::Critical,
        Some(l) if l <= threshold.saturating_add(WARNING_BUFFER) => BatteryStatus::Warning,
        Some(_) => BatteryStatus::Healthy,
    }
}

// ── Sorting ──────────────────────────────────────────────────────────

/// Server-side sort method for device queries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortKey {
    #[default]
    Priority,
    Alphabetical,
    LevelAsc,
    LevelDesc,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ── DeviceRecord ─────────────────────────────────────────────────────

/// One battery device as held in the local list buffer.
///
/// Identity is `id`; push events patch records in place and never change
/// list membership or order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    /// 0–100, `None` when the level cannot be read.
    pub level: Option<u8>,
    pub available: bool,
    pub status: BatteryStatus,
    pub last_changed: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub area_id: Option<String>,
    pub area_name: Option<String>,
}

// ── StatusCounts ─────────────────────────────────────────────────────

/// Per-status totals for the active query, reported with every page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub critical: u32,
    pub warning: u32,
    pub healthy: u32,
    pub unavailable: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.critical + self.warning + self.healthy + self.unavailable
    }
}

// ── DeviceQuery ──────────────────────────────────────────────────────

/// The effective query: sort plus active filters. Any change to this
/// resets pagination back to the first page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceQuery {
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
    pub filters: FilterSet,
    pub limit: u32,
}

impl DeviceQuery {
    pub fn new(sort_key: SortKey, sort_order: SortOrder, filters: FilterSet, limit: u32) -> Self {
        Self {
            sort_key,
            sort_order,
            filters,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Build the wire request for a page at the given cursor.
    pub fn to_request(&self, cursor: Option<String>) -> battwatch_api::proto::QueryDevicesRequest {
        battwatch_api::proto::QueryDevicesRequest {
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
            cursor,
            sort_key: self.sort_key.to_string(),
            sort_order: self.sort_order.to_string(),
            filter_manufacturer: self.filters.manufacturers.iter().cloned().collect(),
            filter_device_class: self.filters.device_classes.iter().cloned().collect(),
            filter_status: self.filters.statuses.iter().cloned().collect(),
            filter_area: self.filters.areas.iter().cloned().collect(),
        }
    }
}
