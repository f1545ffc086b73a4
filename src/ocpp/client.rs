//! CSMS Transport Glue (C9): a single WebSocket connection attempt to the
//! CSMS, request/response correlation, and outbound frame writing. Grounded
//! on `examples/original_source/src/charger/ocpp/csms.c` (subprotocol
//! `ocpp1.6`, ping interval, write timeout) and
//! `examples/orange-dot-mapf-het/ek-roj/roj-adapter-ocpp/src/ocpp/client.rs`
//! (WebSocket split + pending-request table shape). Reconnect/backoff is
//! deliberately NOT here — that is the Network Manager's (C10) job; this
//! module surfaces one connection's life cycle and lets the caller retry it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::header, protocol::WebSocketConfig, Message},
};
use tracing::{debug, error, info, warn};

use super::{decode, Action, AdapterError, Call, CallResult, MessageIdGenerator, OcppMessage, OutboundQueue, QueuedCall, DEFAULT_OUTBOUND_QUEUE_CAPACITY};

pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Actions inserted with the "force" flag (spec §4.6 "Back-pressure"):
/// never starved out of the outbound queue by ordinary metering/status traffic.
fn is_force_insert(action: Action) -> bool {
    matches!(action, Action::BootNotification | Action::StartTransaction | Action::StopTransaction)
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub server_url: String,
    pub charge_point_id: String,
    pub ws_ping_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub transaction_message_retry_interval_secs: u64,
    pub transaction_message_attempts: u32,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("request timed out waiting for response")]
    RequestTimeout,
    #[error("csms returned an error: {code} {description}")]
    Remote { code: String, description: String },
    #[error("outbound queue has no space for this call")]
    NoSpace,
}

struct PendingRequest {
    #[allow(dead_code)]
    action: Action,
    response_tx: oneshot::Sender<Result<CallResult, TransportError>>,
}

/// A CSMS-initiated request, forwarded to the charger/connector layer for
/// handling; the response travels back out through `respond`/`respond_error`.
#[derive(Debug)]
pub struct IncomingCall {
    pub message_id: String,
    pub action: Action,
    pub payload: serde_json::Value,
}

/// One connection attempt's live handle. Dropped (or `connect_and_run`
/// returning) tears the socket down; the caller is responsible for
/// reconnecting.
pub struct CsmsTransport {
    config: TransportConfig,
    id_gen: MessageIdGenerator,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    outbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    outbound_queue: Mutex<OutboundQueue>,
}

impl CsmsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            id_gen: MessageIdGenerator::default(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx: Mutex::new(None),
            outbound_queue: Mutex::new(OutboundQueue::new(DEFAULT_OUTBOUND_QUEUE_CAPACITY)),
        }
    }

    /// Sends a `Call` and awaits its `CallResult`/`CallError`, retrying up to
    /// `transaction_message_attempts` times at `transaction_message_retry_interval_secs`
    /// on a dropped connection or a response that never arrives (spec §4.6
    /// "Retry"). Admission into the bounded outbound queue applies the same
    /// force-vs-reject back-pressure as `ocpp_push_request`/
    /// `ocpp_push_request_force` before the first attempt is ever sent
    /// (spec §4.6 "Back-pressure").
    pub async fn request(&self, action: Action, payload: serde_json::Value) -> Result<CallResult, TransportError> {
        let force = is_force_insert(action);
        let message_id = self.id_gen.next();
        let mut pending_call = QueuedCall { message_id: message_id.clone(), action, payload, attempts_made: 0, queued_at: Instant::now() };

        self.outbound_queue
            .lock()
            .await
            .push(pending_call.clone(), force)
            .map_err(|_: AdapterError| TransportError::NoSpace)?;

        let max_attempts = self.config.transaction_message_attempts.max(1);
        let retry_interval = Duration::from_secs(self.config.transaction_message_retry_interval_secs);

        let result = loop {
            match self.send_and_await(&pending_call.message_id, pending_call.action, pending_call.payload.clone()).await {
                Ok(result) => break Ok(result),
                Err(e) => {
                    let mut queue = self.outbound_queue.lock().await;
                    queue.remove(&pending_call.message_id);
                    let should_retry = queue.requeue_for_retry(pending_call.clone(), max_attempts);
                    drop(queue);
                    if !should_retry {
                        break Err(e);
                    }
                    pending_call.attempts_made += 1;
                    warn!(action = pending_call.action.as_str(), attempt = pending_call.attempts_made, error = %e, "csms call failed, retrying");
                    tokio::time::sleep(retry_interval).await;
                }
            }
        };

        self.outbound_queue.lock().await.remove(&pending_call.message_id);
        result
    }

    /// One send-and-wait attempt for `message_id`, bounded by `write_timeout_secs`.
    async fn send_and_await(&self, message_id: &str, action: Action, payload: serde_json::Value) -> Result<CallResult, TransportError> {
        let call = Call { message_id: message_id.to_string(), action, payload };

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id.to_string(), PendingRequest { action, response_tx });

        if let Err(e) = self.send_text(call.to_json_text()).await {
            self.pending.lock().await.remove(message_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_secs(self.config.write_timeout_secs), response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(message_id);
                Err(TransportError::RequestTimeout)
            }
        }
    }

    /// Sends a `CallResult` in response to an `IncomingCall`; not correlated
    /// through the pending table since we initiated nothing.
    pub async fn respond(&self, message_id: String, payload: serde_json::Value) -> Result<(), TransportError> {
        let result = CallResult { message_id, payload };
        self.send_text(result.to_json_text()).await
    }

    pub async fn respond_error(&self, message_id: String, error_code: super::ErrorCode, description: String) -> Result<(), TransportError> {
        let err = super::CallError {
            message_id,
            error_code,
            error_description: description,
            error_details: serde_json::json!({}),
        };
        self.send_text(err.to_json_text()).await
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let guard = self.outbound_tx.lock().await;
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tokio::time::timeout(Duration::from_secs(self.config.write_timeout_secs), tx.send(Message::Text(text.into())))
            .await
            .map_err(|_| TransportError::WriteTimeout(Duration::from_secs(self.config.write_timeout_secs)))?
            .map_err(|_| TransportError::Closed)
    }

    /// Connects once and runs until the socket closes or errors. Returns
    /// `Ok(())` only on a graceful server-initiated close; any other outcome
    /// is `Err`, which the caller (Network Manager) treats as a failed
    /// attempt to back off from.
    pub async fn connect_and_run(&self, incoming_tx: mpsc::Sender<IncomingCall>) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.config.server_url.trim_end_matches('/'), self.config.charge_point_id);
        info!(url = %url, "connecting to CSMS");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL.parse().unwrap());

        let ws_config = WebSocketConfig { max_message_size: Some(64 * 1024), max_frame_size: Some(16 * 1024), ..Default::default() };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let accepted = response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!(accepted = ?accepted, "CSMS did not echo the ocpp1.6 subprotocol");
        }
        info!("CSMS connection established");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(32);
        *self.outbound_tx.lock().await = Some(send_tx);

        let sender_handle = tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                debug!(?msg, "sending ocpp frame");
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let ping_interval = Duration::from_secs(self.config.ws_ping_interval_secs.max(1));
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.tick().await;

        let result = loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_incoming_text(&text, &incoming_tx).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("CSMS closed the connection");
                            break Ok(());
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "websocket error");
                            break Err(TransportError::Closed);
                        }
                        None => break Err(TransportError::Closed),
                    }
                }
                _ = ping_timer.tick() => {
                    if let Some(tx) = self.outbound_tx.lock().await.as_ref() {
                        if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break Err(TransportError::Closed);
                        }
                    }
                }
            }
        };

        *self.outbound_tx.lock().await = None;
        sender_handle.abort();
        self.fail_all_pending().await;
        result
    }

    async fn handle_incoming_text(&self, text: &str, incoming_tx: &mpsc::Sender<IncomingCall>) {
        match decode(text) {
            Ok(OcppMessage::Call(call)) => {
                if let Err(e) = incoming_tx
                    .send(IncomingCall { message_id: call.message_id, action: call.action, payload: call.payload })
                    .await
                {
                    error!(error = %e, "failed to forward incoming CSMS call");
                }
            }
            Ok(OcppMessage::CallResult(result)) => {
                if let Some(pending) = self.pending.lock().await.remove(&result.message_id) {
                    let _ = pending.response_tx.send(Ok(result));
                }
            }
            Ok(OcppMessage::CallError(err)) => {
                if let Some(pending) = self.pending.lock().await.remove(&err.message_id) {
                    let _ = pending.response_tx.send(Err(TransportError::Remote {
                        code: err.error_code.to_string(),
                        description: err.error_description,
                    }));
                }
            }
            Err(e) => warn!(error = %e, "failed to decode incoming ocpp frame"),
        }
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, req) in pending.drain() {
            let _ = req.response_tx.send(Err(TransportError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_server_and_charge_point_id() {
        let config = TransportConfig {
            server_url: "wss://csms.example/ocpp/".into(),
            charge_point_id: "CP001".into(),
            ws_ping_interval_secs: 300,
            write_timeout_secs: 8,
            transaction_message_retry_interval_secs: 60,
            transaction_message_attempts: 3,
        };
        let joined = format!("{}/{}", config.server_url.trim_end_matches('/'), config.charge_point_id);
        assert_eq!(joined, "wss://csms.example/ocpp/CP001");
    }

    #[tokio::test]
    async fn request_without_connection_fails_closed() {
        let transport = CsmsTransport::new(TransportConfig {
            server_url: "ws://localhost:1/ocpp".into(),
            charge_point_id: "CP001".into(),
            ws_ping_interval_secs: 300,
            write_timeout_secs: 1,
            transaction_message_retry_interval_secs: 1,
            transaction_message_attempts: 1,
        });
        let err = transport.request(Action::Heartbeat, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn request_fails_with_no_space_when_queue_is_full_and_non_force() {
        let transport = CsmsTransport::new(TransportConfig {
            server_url: "ws://localhost:1/ocpp".into(),
            charge_point_id: "CP001".into(),
            ws_ping_interval_secs: 300,
            write_timeout_secs: 1,
            transaction_message_retry_interval_secs: 1,
            transaction_message_attempts: 1,
        });

        for _ in 0..super::super::DEFAULT_OUTBOUND_QUEUE_CAPACITY {
            transport
                .outbound_queue
                .lock()
                .await
                .push(
                    QueuedCall { message_id: "x".into(), action: Action::Heartbeat, payload: serde_json::Value::Null, attempts_made: 0, queued_at: Instant::now() },
                    false,
                )
                .unwrap();
        }

        let err = transport.request(Action::Heartbeat, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::NoSpace));
    }
}
