//! Websocket command channel with auto re-dial.
//!
//! Owns one socket to the host platform's websocket endpoint. A background
//! task dials, performs the auth handshake, then pumps frames: replies are
//! matched to pending calls by request id, push events are decoded and
//! broadcast. When the socket drops, every pending call fails, a synthetic
//! `disconnected` status event is emitted, and the task re-dials with
//! capped exponential backoff + jitter.
//!
//! The re-dial loop is transport-internal plumbing; session-level reconnect
//! (re-fetch + re-subscribe) is owned by the engine, which observes socket
//! loss through the synthetic status events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::proto::{PushEvent, ServerFrame, SessionStatus, decode_frame};
use crate::transport::{RedialConfig, Transport, TransportConfig};

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── WsTransport ──────────────────────────────────────────────────────

/// Handle to a running command channel.
///
/// Cheaply cloneable. Call [`shutdown`](Self::shutdown) to tear down the
/// background task; dropping all handles does not stop it.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    config: TransportConfig,
    next_id: AtomicU64,
    /// Calls awaiting their `result` frame, keyed by request id.
    pending: DashMap<u64, oneshot::Sender<Result<serde_json::Value, Error>>>,
    /// Writer for the current connection; `None` while the socket is down.
    outbound: std::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    event_tx: broadcast::Sender<Arc<PushEvent>>,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Spawn the connection loop and return immediately.
    ///
    /// The first dial happens asynchronously; calls issued before the
    /// handshake completes fail with [`Error::NotConnected`].
    pub fn connect(config: TransportConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SocketInner {
            config,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound: std::sync::Mutex::new(None),
            event_tx,
            cancel: CancellationToken::new(),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run_loop(&task_inner).await;
        });

        Self { inner }
    }

    /// Signal the background task to shut down and fail pending calls.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.drop_writer();
        self.inner.fail_pending();
    }
}

impl Transport for WsTransport {
    fn call(
        &self,
        command: &'static str,
        payload: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, Error>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.call(command, payload).await })
    }

    fn events(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.inner.event_tx.subscribe()
    }
}

// ── Inner: call path ─────────────────────────────────────────────────

impl SocketInner {
    async fn call(
        &self,
        command: &'static str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let Some(writer) = self.current_writer() else {
            return Err(Error::NotConnected);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = build_request_frame(id, command, payload)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        if writer.send(Message::Text(frame.into())).is_err() {
            self.pending.remove(&id);
            return Err(Error::NotConnected);
        }

        match tokio::time::timeout(self.config.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the socket died while we were waiting.
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout {
                    timeout_secs: self.config.call_timeout.as_secs(),
                })
            }
        }
    }

    fn current_writer(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_writer(&self, writer: Option<mpsc::UnboundedSender<Message>>) {
        *self
            .outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = writer;
    }

    fn drop_writer(&self) {
        self.set_writer(None);
    }

    /// Fail every pending call. Used on socket loss and shutdown.
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::NotConnected));
            }
        }
    }

    fn emit_status(&self, status: SessionStatus) {
        // Ignore send errors — just means no active subscribers right now.
        let _ = self
            .event_tx
            .send(Arc::new(PushEvent::ConnectionStatus(status)));
    }

    /// Handle one inbound text frame: resolve a pending call, broadcast a
    /// push event, or log and drop.
    fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Ok(ServerFrame::Result { id, outcome }) => {
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let _ = tx.send(outcome);
                } else {
                    tracing::warn!(id, "reply for unknown request id");
                }
            }
            Ok(ServerFrame::Event(event)) => {
                let _ = self.event_tx.send(Arc::new(event));
            }
            Ok(ServerFrame::Unknown { kind }) => {
                tracing::debug!(kind, "ignoring unrecognized frame");
            }
            Ok(
                ServerFrame::AuthRequired | ServerFrame::AuthOk | ServerFrame::AuthInvalid { .. },
            ) => {
                tracing::debug!("auth frame outside handshake, ignoring");
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
        }
    }
}

// ── Request frame assembly ───────────────────────────────────────────

/// Merge `id` and `type` into the command payload.
///
/// Payloads must serialize to a JSON object (or `null` for parameterless
/// commands) so the fields have somewhere to land.
fn build_request_frame(
    id: u64,
    command: &str,
    payload: serde_json::Value,
) -> Result<String, Error> {
    let mut map = match payload {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(Error::Decode {
                message: "command payload must be a JSON object".into(),
                body: other.to_string(),
            });
        }
    };
    map.insert("id".into(), serde_json::Value::from(id));
    map.insert("type".into(), serde_json::Value::from(command));
    Ok(serde_json::Value::Object(map).to_string())
}

// ── Connection loop ──────────────────────────────────────────────────

/// Main loop: dial → authenticate → pump → on error, backoff → re-dial.
async fn run_loop(inner: &Arc<SocketInner>) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = dial_and_pump(inner, &mut attempt) => {
                match result {
                    // Server close frame or stream end: re-dial immediately.
                    Ok(()) => {
                        tracing::info!("socket closed cleanly, re-dialing");
                        attempt = 0;
                    }
                    Err(e @ Error::Authentication { .. }) => {
                        // A rejected token will not heal on retry.
                        tracing::error!(error = %e, "auth handshake failed, giving up");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "socket error");

                        let delay = redial_backoff(attempt, &inner.config.redial);
                        tracing::debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "waiting before re-dial");

                        tokio::select! {
                            biased;
                            () = inner.cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    inner.drop_writer();
    inner.fail_pending();
    tracing::debug!("socket loop exiting");
}

/// Establish one connection: dial, authenticate, pump frames until the
/// socket drops. Resets `attempt` once the handshake succeeds.
async fn dial_and_pump(inner: &Arc<SocketInner>, attempt: &mut u32) -> Result<(), Error> {
    let url = inner.config.url.as_str();
    tracing::info!(url, "dialing command channel");

    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| Error::Socket(e.to_string()))?;

    let (mut write, mut read) = stream.split();

    // ── Auth handshake ───────────────────────────────────────────────
    loop {
        let frame = read
            .next()
            .await
            .ok_or_else(|| Error::Socket("stream ended during handshake".into()))?
            .map_err(|e| Error::Socket(e.to_string()))?;

        let Message::Text(text) = frame else {
            continue;
        };

        match decode_frame(&text)? {
            ServerFrame::AuthRequired => {
                let auth = serde_json::json!({
                    "type": "auth",
                    "access_token": inner.config.access_token.expose_secret(),
                })
                .to_string();
                write
                    .send(Message::Text(auth.into()))
                    .await
                    .map_err(|e| Error::Socket(e.to_string()))?;
            }
            ServerFrame::AuthOk => break,
            ServerFrame::AuthInvalid { message } => {
                return Err(Error::Authentication { message });
            }
            _ => {}
        }
    }

    tracing::info!("command channel authenticated");
    *attempt = 0;

    // ── Pump ─────────────────────────────────────────────────────────
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    inner.set_writer(Some(out_tx));
    inner.emit_status(SessionStatus::Connected);

    let outcome = loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break Ok(()),
            maybe = out_rx.recv() => {
                let Some(msg) = maybe else { break Ok(()) };
                if let Err(e) = write.send(msg).await {
                    break Err(Error::Socket(e.to_string()));
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_text(&text),
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                        tracing::trace!("socket ping");
                    }
                    Some(Ok(Message::Close(close))) => {
                        if let Some(ref cf) = close {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        }
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(Error::Socket(e.to_string())),
                    None => break Ok(()),
                    _ => {
                        // Binary, Pong, raw frames — ignore
                    }
                }
            }
        }
    };

    // This connection is gone: fail in-flight calls and tell consumers,
    // unless we are being torn down on purpose.
    inner.drop_writer();
    inner.fail_pending();
    if !inner.cancel.is_cancelled() {
        inner.emit_status(SessionStatus::Disconnected);
    }

    outcome
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter for socket re-dials.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is ±25%, deterministically seeded from the attempt number, to
/// spread re-dial storms from multiple panels behind one server.
fn redial_backoff(attempt: u32, config: &RedialConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::proto::EventKind;

    fn test_inner() -> Arc<SocketInner> {
        let config = TransportConfig::new(
            "ws://127.0.0.1:8123/api/websocket".parse().unwrap(),
            SecretString::from("token".to_owned()),
        );
        let (event_tx, _) = broadcast::channel(16);
        Arc::new(SocketInner {
            config,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound: std::sync::Mutex::new(None),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = RedialConfig::default();

        let d0 = redial_backoff(0, &config);
        let d1 = redial_backoff(1, &config);
        let d2 = redial_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = RedialConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };

        let d10 = redial_backoff(10, &config);
        // Jitter factor tops out at 1.25, so 12.5s is the ceiling.
        assert!(
            d10 <= Duration::from_secs(13),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn request_frame_injects_id_and_type() {
        let frame = build_request_frame(
            42,
            "battwatch/query_devices",
            json!({ "limit": 50, "sort_key": "priority" }),
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["type"], "battwatch/query_devices");
        assert_eq!(value["limit"], 50);
    }

    #[test]
    fn request_frame_accepts_null_payload() {
        let frame = build_request_frame(1, "battwatch/subscribe", serde_json::Value::Null).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["type"], "battwatch/subscribe");
    }

    #[test]
    fn request_frame_rejects_scalar_payload() {
        assert!(matches!(
            build_request_frame(1, "battwatch/subscribe", json!(5)),
            Err(Error::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn reply_resolves_matching_pending_call() {
        let inner = test_inner();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(9, tx);

        inner.handle_text(
            &json!({ "id": 9, "type": "result", "success": true, "result": { "ok": true } })
                .to_string(),
        );

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome["ok"], true);
        assert!(inner.pending.is_empty());
    }

    #[tokio::test]
    async fn push_frame_reaches_event_subscribers() {
        let inner = test_inner();
        let mut rx = inner.event_tx.subscribe();

        inner.handle_text(
            &json!({
                "type": "battwatch/status",
                "data": { "status": "connected" }
            })
            .to_string(),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::ConnectionStatus);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_panicking() {
        let inner = test_inner();
        let mut rx = inner.event_tx.subscribe();

        inner.handle_text("not json at all");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_pending_resolves_all_calls_with_error() {
        let inner = test_inner();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        inner.pending.insert(1, tx_a);
        inner.pending.insert(2, tx_b);

        inner.fail_pending();

        assert!(matches!(rx_a.await.unwrap(), Err(Error::NotConnected)));
        assert!(matches!(rx_b.await.unwrap(), Err(Error::NotConnected)));
        assert!(inner.pending.is_empty());
    }

    #[tokio::test]
    async fn call_without_connection_fails_fast() {
        let inner = test_inner();
        let err = inner
            .call("battwatch/subscribe", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
