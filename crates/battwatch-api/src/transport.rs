//! The command-channel abstraction consumed by `battwatch-core`.
//!
//! The engine never talks to a socket directly: it issues request/response
//! calls and drinks from a push-event stream through the [`Transport`]
//! trait. Production code uses [`crate::socket::WsTransport`]; tests plug
//! in an in-process fake.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use tokio::sync::broadcast;
use url::Url;

use crate::error::Error;
use crate::proto::{
    CMD_GET_FILTER_OPTIONS, CMD_GET_NOTIFICATION_PREFERENCES, CMD_QUERY_DEVICES,
    CMD_SET_NOTIFICATION_PREFERENCES, CMD_SET_THRESHOLD, CMD_SUBSCRIBE, DevicePageDto,
    FilterOptionsDto, NotificationPrefsDto, PushEvent, QueryDevicesRequest, SetThresholdRequest,
    SubscribeReply, decode_reply,
};

// ── Configuration ────────────────────────────────────────────────────

/// Socket re-dial backoff. This is the transport's own affair — the
/// engine layers its session-level reconnect schedule on top.
#[derive(Debug, Clone)]
pub struct RedialConfig {
    /// Delay before the first re-dial attempt. Default: 1s.
    pub initial_delay: Duration,
    /// Upper bound on re-dial delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for RedialConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Connection settings for the websocket command channel.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Websocket endpoint, e.g. `wss://host:8123/api/websocket`.
    pub url: Url,
    /// Access token presented during the auth handshake. Issued by the
    /// host platform; this crate never mints or stores it.
    pub access_token: SecretString,
    /// Per-call timeout. Expiry is reported as [`Error::Timeout`] and is
    /// indistinguishable from a transport rejection to callers.
    pub call_timeout: Duration,
    pub redial: RedialConfig,
}

impl TransportConfig {
    pub fn new(url: Url, access_token: SecretString) -> Self {
        Self {
            url,
            access_token,
            call_timeout: Duration::from_secs(10),
            redial: RedialConfig::default(),
        }
    }
}

// ── Transport trait ──────────────────────────────────────────────────

/// A persistent, authenticated, bidirectional command channel.
///
/// `call` issues one request/response command and resolves with the
/// server's `result` payload; `events` hands out a receiver for the
/// unsolicited push stream. Implementations must deliver push events in
/// arrival order and match replies to the call that issued them.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        command: &'static str,
        payload: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, Error>>;

    fn events(&self) -> broadcast::Receiver<Arc<PushEvent>>;
}

// ── Typed calls ──────────────────────────────────────────────────────

/// Typed wrappers over [`Transport::call`]: build the payload, issue the
/// command, decode the reply.
pub mod calls {
    use super::{
        CMD_GET_FILTER_OPTIONS, CMD_GET_NOTIFICATION_PREFERENCES, CMD_QUERY_DEVICES,
        CMD_SET_NOTIFICATION_PREFERENCES, CMD_SET_THRESHOLD, CMD_SUBSCRIBE, DevicePageDto, Error,
        FilterOptionsDto, NotificationPrefsDto, QueryDevicesRequest, SetThresholdRequest,
        SubscribeReply, Transport, decode_reply,
    };

    fn encode<T: serde::Serialize>(request: &T) -> Result<serde_json::Value, Error> {
        serde_json::to_value(request).map_err(|e| Error::Decode {
            message: e.to_string(),
            body: String::new(),
        })
    }

    /// Fetch one page of devices for the given query.
    pub async fn query_devices(
        transport: &dyn Transport,
        request: &QueryDevicesRequest,
    ) -> Result<DevicePageDto, Error> {
        let reply = transport
            .call(CMD_QUERY_DEVICES, encode(request)?)
            .await?;
        decode_reply(reply)
    }

    /// Request a live-update subscription.
    pub async fn subscribe(transport: &dyn Transport) -> Result<SubscribeReply, Error> {
        let reply = transport
            .call(CMD_SUBSCRIBE, serde_json::json!({}))
            .await?;
        decode_reply(reply)
    }

    /// Fetch the selectable filter vocabulary.
    pub async fn get_filter_options(
        transport: &dyn Transport,
    ) -> Result<FilterOptionsDto, Error> {
        let reply = transport
            .call(CMD_GET_FILTER_OPTIONS, serde_json::json!({}))
            .await?;
        decode_reply(reply)
    }

    /// Persist threshold settings server-side.
    pub async fn set_threshold(
        transport: &dyn Transport,
        request: &SetThresholdRequest,
    ) -> Result<(), Error> {
        transport
            .call(CMD_SET_THRESHOLD, encode(request)?)
            .await?;
        Ok(())
    }

    /// Fetch notification preferences.
    pub async fn get_notification_preferences(
        transport: &dyn Transport,
    ) -> Result<NotificationPrefsDto, Error> {
        let reply = transport
            .call(CMD_GET_NOTIFICATION_PREFERENCES, serde_json::json!({}))
            .await?;
        decode_reply(reply)
    }

    /// Persist notification preferences; the server echoes the stored set.
    pub async fn set_notification_preferences(
        transport: &dyn Transport,
        prefs: &NotificationPrefsDto,
    ) -> Result<NotificationPrefsDto, Error> {
        let reply = transport
            .call(
                CMD_SET_NOTIFICATION_PREFERENCES,
                serde_json::json!({ "preferences": prefs }),
            )
            .await?;
        decode_reply(reply)
    }
}
