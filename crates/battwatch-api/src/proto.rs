//! Wire shapes for the panel command channel.
//!
//! Commands ride the websocket as `{ id, type, ...payload }` request frames
//! answered by `{ id, type: "result", success, result | error }`. Push
//! events arrive unsolicited as `{ type: "<event name>", data: {...} }`.
//! Everything crossing the boundary is decoded into the typed shapes below;
//! a frame that does not match produces [`Error::Decode`], never a silently
//! half-populated value.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Command names ────────────────────────────────────────────────────

pub const CMD_QUERY_DEVICES: &str = "battwatch/query_devices";
pub const CMD_SUBSCRIBE: &str = "battwatch/subscribe";
pub const CMD_GET_FILTER_OPTIONS: &str = "battwatch/get_filter_options";
pub const CMD_SET_THRESHOLD: &str = "battwatch/set_threshold";
pub const CMD_GET_NOTIFICATION_PREFERENCES: &str = "battwatch/get_notification_preferences";
pub const CMD_SET_NOTIFICATION_PREFERENCES: &str = "battwatch/set_notification_preferences";

// ── Push event names ─────────────────────────────────────────────────

pub const EVENT_DEVICE_CHANGED: &str = "battwatch/device_changed";
pub const EVENT_STATUS: &str = "battwatch/status";
pub const EVENT_THRESHOLD_UPDATED: &str = "battwatch/threshold_updated";
pub const EVENT_NOTIFICATION_SENT: &str = "battwatch/notification_sent";

// ── Requests ─────────────────────────────────────────────────────────

/// Parameters for `battwatch/query_devices`.
///
/// Filter vectors are omitted from the frame entirely when empty — the
/// server treats a missing category as "no restriction".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryDevicesRequest {
    pub limit: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    pub sort_key: String,
    pub sort_order: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_manufacturer: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_device_class: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_status: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_area: Vec<String>,
}

/// Parameters for `battwatch/set_threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetThresholdRequest {
    pub global_threshold: u8,
    #[serde(default)]
    pub device_rules: BTreeMap<String, u8>,
}

// ── Replies ──────────────────────────────────────────────────────────

/// One device row as the server reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDto {
    pub entity_id: String,

    #[serde(default)]
    pub device_name: Option<String>,

    /// Percentage 0–100; the server reports a negative value (or omits the
    /// field) when the level cannot be read.
    #[serde(default)]
    pub battery_level: Option<f64>,

    #[serde(default = "default_true")]
    pub available: bool,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub area_name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Per-status totals for the active query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCountsDto {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub warning: u32,
    #[serde(default)]
    pub healthy: u32,
    #[serde(default)]
    pub unavailable: u32,
}

/// Reply to `battwatch/query_devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePageDto {
    pub devices: Vec<DeviceDto>,

    #[serde(default)]
    pub device_statuses: StatusCountsDto,

    #[serde(default)]
    pub next_cursor: Option<String>,

    #[serde(default)]
    pub has_more: bool,
}

/// Reply to `battwatch/subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeReply {
    pub subscription_id: String,

    #[serde(default)]
    pub status: Option<String>,
}

/// One selectable area, id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaDto {
    pub id: String,
    pub name: String,
}

/// Reply to `battwatch/get_filter_options` — the selectable vocabulary
/// per filter category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptionsDto {
    #[serde(default)]
    pub manufacturers: Vec<String>,
    #[serde(default)]
    pub device_classes: Vec<String>,
    #[serde(default)]
    pub areas: Vec<AreaDto>,
    #[serde(default)]
    pub statuses: Vec<String>,
}

/// Notification preferences, both directions of the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPrefsDto {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_frequency_cap")]
    pub frequency_cap_hours: u32,

    #[serde(default = "default_severity_filter")]
    pub severity_filter: String,

    /// Per-device overrides, keyed by entity id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_device: BTreeMap<String, PerDevicePrefDto>,
}

fn default_frequency_cap() -> u32 {
    6
}

fn default_severity_filter() -> String {
    "critical_only".into()
}

impl Default for NotificationPrefsDto {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_cap_hours: default_frequency_cap(),
            severity_filter: default_severity_filter(),
            per_device: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerDevicePrefDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_cap_hours: Option<u32>,
}

// ── Push events ──────────────────────────────────────────────────────

/// Routing key for a push event. Used by consumers to register interest
/// in one category without matching on the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceChanged,
    ConnectionStatus,
    ThresholdUpdated,
    NotificationSent,
}

/// Partial update for a single device. Only fields present in the frame
/// are `Some`; absent fields leave the local record untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChange {
    pub entity_id: String,

    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Server-side session health, also synthesized by the transport around
/// socket loss and re-establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    pub global_threshold: u8,
    #[serde(default)]
    pub device_rules: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPush {
    pub device_name: String,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A decoded push event from the command channel.
#[derive(Debug, Clone)]
pub enum PushEvent {
    DeviceChanged(DeviceChange),
    ConnectionStatus(SessionStatus),
    ThresholdUpdated(ThresholdUpdate),
    NotificationSent(NotificationPush),
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceChanged(_) => EventKind::DeviceChanged,
            Self::ConnectionStatus(_) => EventKind::ConnectionStatus,
            Self::ThresholdUpdated(_) => EventKind::ThresholdUpdated,
            Self::NotificationSent(_) => EventKind::NotificationSent,
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────

/// Error payload inside a failed `result` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Everything the server can send in one frame, before demultiplexing.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<CallError>,

    /// Push event payload.
    #[serde(default)]
    data: Option<serde_json::Value>,

    #[serde(default)]
    message: Option<String>,
}

/// A demultiplexed inbound frame.
#[derive(Debug)]
pub enum ServerFrame {
    AuthRequired,
    AuthOk,
    AuthInvalid { message: String },
    /// Reply to a pending command call.
    Result {
        id: u64,
        outcome: Result<serde_json::Value, Error>,
    },
    Event(PushEvent),
    /// A frame we do not understand. Logged and dropped by the caller.
    Unknown { kind: String },
}

/// Decode one inbound text frame.
///
/// Unknown *event* names map to [`ServerFrame::Unknown`]; a known event
/// whose payload does not match its shape is a hard [`Error::Decode`].
pub fn decode_frame(text: &str) -> Result<ServerFrame, Error> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| Error::decode(&e, text))?;

    match raw.kind.as_str() {
        "auth_required" => Ok(ServerFrame::AuthRequired),
        "auth_ok" => Ok(ServerFrame::AuthOk),
        "auth_invalid" => Ok(ServerFrame::AuthInvalid {
            message: raw.message.unwrap_or_else(|| "invalid access token".into()),
        }),
        "result" => {
            let id = raw.id.ok_or_else(|| Error::Decode {
                message: "result frame without id".into(),
                body: text.to_owned(),
            })?;
            let outcome = if raw.success == Some(true) {
                Ok(raw.result.unwrap_or(serde_json::Value::Null))
            } else {
                let err = raw.error.unwrap_or_default();
                Err(Error::CallFailed {
                    code: err.code,
                    message: err.message,
                })
            };
            Ok(ServerFrame::Result { id, outcome })
        }
        EVENT_DEVICE_CHANGED => decode_event(raw.data, text, PushEvent::DeviceChanged),
        EVENT_STATUS => {
            let data = raw.data.unwrap_or_default();
            let status: StatusPayload =
                serde_json::from_value(data).map_err(|e| Error::decode(&e, text))?;
            Ok(ServerFrame::Event(PushEvent::ConnectionStatus(status.status)))
        }
        EVENT_THRESHOLD_UPDATED => decode_event(raw.data, text, PushEvent::ThresholdUpdated),
        EVENT_NOTIFICATION_SENT => decode_event(raw.data, text, PushEvent::NotificationSent),
        other => Ok(ServerFrame::Unknown {
            kind: other.to_owned(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: SessionStatus,
}

fn decode_event<T: serde::de::DeserializeOwned>(
    data: Option<serde_json::Value>,
    text: &str,
    wrap: impl FnOnce(T) -> PushEvent,
) -> Result<ServerFrame, Error> {
    let data = data.ok_or_else(|| Error::Decode {
        message: "event frame without data".into(),
        body: text.to_owned(),
    })?;
    let payload: T = serde_json::from_value(data).map_err(|e| Error::decode(&e, text))?;
    Ok(ServerFrame::Event(wrap(payload)))
}

/// Decode a command reply body into its typed shape.
pub fn decode_reply<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, Error> {
    let body = value.to_string();
    serde_json::from_value(value).map_err(|e| Error::decode(&e, body))
}

// ── Tests ────────────────────────────────────────────────────────────
