// ── Wire-to-domain conversions ──
//
// DTO shapes from battwatch-api become canonical model types here, in
// one place, so the rest of the crate never sees raw wire values.

use std::str::FromStr;

use battwatch_api::proto::{
    AreaDto, DeviceChange, DeviceDto, FilterOptionsDto, NotificationPrefsDto, NotificationPush,
    PerDevicePrefDto, StatusCountsDto, ThresholdUpdate,
};

use crate::model::prefs::DEFAULT_THRESHOLD;
use crate::model::{
    AreaOption, BatteryStatus, DeviceRecord, FilterOptions, NotificationEntry, NotificationPrefs,
    PerDevicePref, SeverityFilter, StatusCounts, ThresholdPrefs, classify,
};

/// Normalize a wire battery level: 0–100 rounds to a percentage, anything
/// negative (the server's "cannot read" marker) or absent is unknown.
pub(crate) fn level_from_wire(raw: Option<f64>) -> Option<u8> {
    let value = raw?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
    Some(value.round().clamp(0.0, 100.0) as u8)
}

impl From<DeviceDto> for DeviceRecord {
    fn from(dto: DeviceDto) -> Self {
        let level = level_from_wire(dto.battery_level);
        let status = dto
            .status
            .as_deref()
            .and_then(|s| BatteryStatus::from_str(s).ok())
            .unwrap_or_else(|| classify(level, dto.available, DEFAULT_THRESHOLD));

        Self {
            name: dto.device_name.unwrap_or_else(|| dto.entity_id.clone()),
            id: dto.entity_id,
            level,
            available: dto.available,
            status,
            last_changed: dto.last_changed,
            last_updated: dto.last_updated,
            manufacturer: dto.manufacturer,
            model: dto.model,
            area_id: dto.area_id,
            area_name: dto.area_name,
        }
    }
}

/// Patch one record from a push event. Only fields present in the frame
/// are written; membership and position never change here.
pub(crate) fn apply_device_change(record: &mut DeviceRecord, change: &DeviceChange) {
    if change.battery_level.is_some() {
        record.level = level_from_wire(change.battery_level);
    }
    if let Some(available) = change.available {
        record.available = available;
    }
    if let Some(status) = change
        .status
        .as_deref()
        .and_then(|s| BatteryStatus::from_str(s).ok())
    {
        record.status = status;
    }
    if change.last_changed.is_some() {
        record.last_changed = change.last_changed;
    }
    if change.last_updated.is_some() {
        record.last_updated = change.last_updated;
    }
}

impl From<StatusCountsDto> for StatusCounts {
    fn from(dto: StatusCountsDto) -> Self {
        Self {
            critical: dto.critical,
            warning: dto.warning,
            healthy: dto.healthy,
            unavailable: dto.unavailable,
        }
    }
}

impl From<AreaDto> for AreaOption {
    fn from(dto: AreaDto) -> Self {
        Self {
            id: dto.id,
            name: dto.name,
        }
    }
}

impl From<FilterOptionsDto> for FilterOptions {
    fn from(dto: FilterOptionsDto) -> Self {
        Self {
            manufacturers: dto.manufacturers,
            device_classes: dto.device_classes,
            areas: dto.areas.into_iter().map(AreaOption::from).collect(),
            statuses: dto.statuses,
        }
    }
}

impl From<ThresholdUpdate> for ThresholdPrefs {
    fn from(update: ThresholdUpdate) -> Self {
        Self {
            global_threshold: update.global_threshold,
            device_rules: update.device_rules,
        }
    }
}

impl From<NotificationPrefsDto> for NotificationPrefs {
    fn from(dto: NotificationPrefsDto) -> Self {
        Self {
            enabled: dto.enabled,
            frequency_cap_hours: dto.frequency_cap_hours,
            // Unknown wire values degrade to the default filter rather
            // than failing the whole prefs payload.
            severity_filter: SeverityFilter::from_str(&dto.severity_filter).unwrap_or_default(),
            per_device: dto
                .per_device
                .into_iter()
                .map(|(id, p)| {
                    (
                        id,
                        PerDevicePref {
                            frequency_cap_hours: p.frequency_cap_hours,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<&NotificationPrefs> for NotificationPrefsDto {
    fn from(prefs: &NotificationPrefs) -> Self {
        Self {
            enabled: prefs.enabled,
            frequency_cap_hours: prefs.frequency_cap_hours,
            severity_filter: prefs.severity_filter.to_string(),
            per_device: prefs
                .per_device
                .iter()
                .map(|(id, p)| {
                    (
                        id.clone(),
                        PerDevicePrefDto {
                            frequency_cap_hours: p.frequency_cap_hours,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<NotificationPush> for NotificationEntry {
    fn from(push: NotificationPush) -> Self {
        Self {
            device_name: push.device_name,
            level: level_from_wire(push.battery_level),
            timestamp: push.timestamp,
        }
    }
}
