//! OCPP Message Adapter (C8): encodes/decodes the OCPP 1.6-J
//! CALL/CALLRESULT/CALLERROR envelope, correlates our own outbound requests
//! with their responses, and queues outbound traffic with the same
//! force-vs-reject back-pressure distinction as `ocpp_push_request` /
//! `ocpp_push_request_force` in the reference firmware. Grounded on
//! `examples/original_source/src/charger/ocpp/adapter.c` (dispatch table,
//! force/defer semantics) and `src/charger/ocpp/csms.c` (subprotocol, ping
//! interval, write timeout constants already mirrored in `config::OcppConfig`).

pub mod charger;
pub mod checkpoint;
pub mod client;
pub mod connector;
pub mod messages;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// The three OCPP-J message type IDs, per OCPP 1.6 appendix 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTypeId {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u8> for MessageTypeId {
    type Error = AdapterError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Call),
            3 => Ok(Self::CallResult),
            4 => Ok(Self::CallError),
            other => Err(AdapterError::UnknownMessageTypeId(other)),
        }
    }
}

/// Every action this charge point sends or handles, in either direction.
/// A single enum covers both `.req` and `.conf` payloads for an action; the
/// direction is implied by which side of the envelope it appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Authorize,
    BootNotification,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    DataTransfer,
    GetConfiguration,
    Heartbeat,
    MeterValues,
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    StartTransaction,
    StatusNotification,
    StopTransaction,
    UnlockConnector,
    UpdateFirmware,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearCache => "ClearCache",
            Action::DataTransfer => "DataTransfer",
            Action::GetConfiguration => "GetConfiguration",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::Reset => "Reset",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::UnlockConnector => "UnlockConnector",
            Action::UpdateFirmware => "UpdateFirmware",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Authorize" => Action::Authorize,
            "BootNotification" => Action::BootNotification,
            "ChangeAvailability" => Action::ChangeAvailability,
            "ChangeConfiguration" => Action::ChangeConfiguration,
            "ClearCache" => Action::ClearCache,
            "DataTransfer" => Action::DataTransfer,
            "GetConfiguration" => Action::GetConfiguration,
            "Heartbeat" => Action::Heartbeat,
            "MeterValues" => Action::MeterValues,
            "RemoteStartTransaction" => Action::RemoteStartTransaction,
            "RemoteStopTransaction" => Action::RemoteStopTransaction,
            "Reset" => Action::Reset,
            "StartTransaction" => Action::StartTransaction,
            "StatusNotification" => Action::StatusNotification,
            "StopTransaction" => Action::StopTransaction,
            "UnlockConnector" => Action::UnlockConnector,
            "UpdateFirmware" => Action::UpdateFirmware,
            _ => return None,
        })
    }

    /// True for actions whose delivery is retried per `TransactionMessageRetryInterval`
    /// / `TransactionMessageAttempts` rather than dropped on a transport hiccup
    /// (spec §4.6 "Retry policy").
    pub fn is_transaction_related(&self) -> bool {
        matches!(self, Action::StartTransaction | Action::StopTransaction | Action::MeterValues)
    }
}

/// OCPP 1.6 standard error codes (Appendix 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("not a JSON array")]
    NotAnArray,
    #[error("message array too short: {0} elements")]
    TooShort(usize),
    #[error("unknown message type id {0}")]
    UnknownMessageTypeId(u8),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("malformed message id field")]
    MalformedMessageId,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("outbound queue is full")]
    QueueFull,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Call {
    pub fn to_json_text(&self) -> String {
        Value::Array(vec![
            Value::from(MessageTypeId::Call as u8),
            Value::String(self.message_id.clone()),
            Value::String(self.action.as_str().to_string()),
            self.payload.clone(),
        ])
        .to_string()
    }
}

impl CallResult {
    pub fn to_json_text(&self) -> String {
        Value::Array(vec![
            Value::from(MessageTypeId::CallResult as u8),
            Value::String(self.message_id.clone()),
            self.payload.clone(),
        ])
        .to_string()
    }
}

impl CallError {
    pub fn to_json_text(&self) -> String {
        Value::Array(vec![
            Value::from(MessageTypeId::CallError as u8),
            Value::String(self.message_id.clone()),
            Value::String(self.error_code.to_string()),
            Value::String(self.error_description.clone()),
            self.error_details.clone(),
        ])
        .to_string()
    }
}

/// Decodes one OCPP-J text frame into a typed envelope.
pub fn decode(text: &str) -> Result<OcppMessage, AdapterError> {
    let value: Value = serde_json::from_str(text)?;
    let array = value.as_array().ok_or(AdapterError::NotAnArray)?;
    if array.len() < 3 {
        return Err(AdapterError::TooShort(array.len()));
    }

    let type_id = array[0].as_u64().ok_or(AdapterError::MalformedMessageId)? as u8;
    let message_id = array[1].as_str().ok_or(AdapterError::MalformedMessageId)?.to_string();

    match MessageTypeId::try_from(type_id)? {
        MessageTypeId::Call => {
            if array.len() < 4 {
                return Err(AdapterError::TooShort(array.len()));
            }
            let action_str = array[2].as_str().ok_or(AdapterError::MalformedMessageId)?;
            let action = Action::parse(action_str).ok_or_else(|| AdapterError::UnknownAction(action_str.to_string()))?;
            Ok(OcppMessage::Call(Call { message_id, action, payload: array[3].clone() }))
        }
        MessageTypeId::CallResult => Ok(OcppMessage::CallResult(CallResult { message_id, payload: array[2].clone() })),
        MessageTypeId::CallError => {
            if array.len() < 5 {
                return Err(AdapterError::TooShort(array.len()));
            }
            let code_str = array[2].as_str().ok_or(AdapterError::MalformedMessageId)?;
            let error_code: ErrorCode = serde_json::from_value(Value::String(code_str.to_string()))
                .unwrap_or(ErrorCode::GenericError);
            let error_description = array[3].as_str().unwrap_or_default().to_string();
            Ok(OcppMessage::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details: array[4].clone(),
            }))
        }
    }
}

/// `"<unix_seconds>-<nonce>"`; unique per device only, per spec §4.6.
pub struct MessageIdGenerator {
    nonce: AtomicU8,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self { nonce: AtomicU8::new(0) }
    }
}

impl MessageIdGenerator {
    pub fn next(&self) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        format!("{secs}-{nonce}")
    }
}

/// One outbound request waiting in the adapter's bounded queue.
#[derive(Debug, Clone)]
pub struct QueuedCall {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
    pub attempts_made: u32,
    pub queued_at: Instant,
}

/// Bounded outbound queue, `force` push evicts the oldest non-transaction
/// entry instead of rejecting, mirroring `ocpp_push_request_force` (used for
/// e.g. BootNotification, which must never be starved out by metering
/// traffic).
pub struct OutboundQueue {
    capacity: usize,
    items: VecDeque<QueuedCall>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, call: QueuedCall, force: bool) -> Result<(), AdapterError> {
        if self.items.len() >= self.capacity {
            if force {
                let evictable = self.items.iter().position(|c| !c.action.is_transaction_related());
                match evictable {
                    Some(idx) => {
                        let evicted = self.items.remove(idx).expect("index came from this deque");
                        warn!(message_id = %evicted.message_id, action = evicted.action.as_str(), "evicted queued message to make room for forced push");
                    }
                    None => return Err(AdapterError::QueueFull),
                }
            } else {
                return Err(AdapterError::QueueFull);
            }
        }
        self.items.push_back(call);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<QueuedCall> {
        self.items.pop_front()
    }

    /// Removes a queued entry by message id, used once its call resolves
    /// (success or final failure) to release the back-pressure slot it held.
    pub fn remove(&mut self, message_id: &str) -> Option<QueuedCall> {
        let idx = self.items.iter().position(|c| c.message_id == message_id)?;
        self.items.remove(idx)
    }

    pub fn requeue_for_retry(&mut self, mut call: QueuedCall, max_attempts: u32) -> bool {
        call.attempts_made += 1;
        if call.attempts_made >= max_attempts {
            return false;
        }
        self.items.push_back(call);
        true
    }
}

pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trips_through_json_array() {
        let call = Call { message_id: "1-0".into(), action: Action::Heartbeat, payload: serde_json::json!({}) };
        let text = call.to_json_text();
        assert_eq!(text, r#"[2,"1-0","Heartbeat",{}]"#);

        let decoded = decode(&text).unwrap();
        match decoded {
            OcppMessage::Call(c) => {
                assert_eq!(c.message_id, "1-0");
                assert_eq!(c.action, Action::Heartbeat);
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn call_result_round_trips() {
        let result = CallResult { message_id: "42-7".into(), payload: serde_json::json!({"status": "Accepted"}) };
        let decoded = decode(&result.to_json_text()).unwrap();
        match decoded {
            OcppMessage::CallResult(r) => assert_eq!(r.message_id, "42-7"),
            _ => panic!("expected CallResult"),
        }
    }

    #[test]
    fn call_error_round_trips() {
        let err = CallError {
            message_id: "9-1".into(),
            error_code: ErrorCode::NotSupported,
            error_description: "nope".into(),
            error_details: serde_json::json!({}),
        };
        let decoded = decode(&err.to_json_text()).unwrap();
        match decoded {
            OcppMessage::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::NotSupported);
                assert_eq!(e.error_description, "nope");
            }
            _ => panic!("expected CallError"),
        }
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let err = decode(r#"[2,"1-0","NotARealAction",{}]"#).unwrap_err();
        assert!(matches!(err, AdapterError::UnknownAction(_)));
    }

    #[test]
    fn message_id_generator_produces_distinct_ids() {
        let gen = MessageIdGenerator::default();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
    }

    #[test]
    fn queue_rejects_beyond_capacity_without_force() {
        let mut queue = OutboundQueue::new(1);
        queue
            .push(QueuedCall { message_id: "1".into(), action: Action::Heartbeat, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, false)
            .unwrap();
        let err = queue
            .push(QueuedCall { message_id: "2".into(), action: Action::Heartbeat, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, false)
            .unwrap_err();
        assert!(matches!(err, AdapterError::QueueFull));
    }

    #[test]
    fn forced_push_evicts_oldest_non_transaction_message_when_full() {
        let mut queue = OutboundQueue::new(2);
        queue
            .push(QueuedCall { message_id: "1".into(), action: Action::Heartbeat, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, false)
            .unwrap();
        queue
            .push(QueuedCall { message_id: "2".into(), action: Action::StartTransaction, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, true)
            .unwrap();
        queue
            .push(QueuedCall { message_id: "3".into(), action: Action::BootNotification, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, true)
            .unwrap();
        assert_eq!(queue.len(), 2);
        let remaining: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|c| c.message_id).collect();
        assert_eq!(remaining, vec!["2", "3"]);
    }

    #[test]
    fn forced_push_fails_when_only_transaction_messages_can_be_evicted() {
        let mut queue = OutboundQueue::new(1);
        queue
            .push(QueuedCall { message_id: "1".into(), action: Action::StartTransaction, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, false)
            .unwrap();
        let err = queue
            .push(QueuedCall { message_id: "2".into(), action: Action::BootNotification, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, true)
            .unwrap_err();
        assert!(matches!(err, AdapterError::QueueFull));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_drops_entry_matching_message_id() {
        let mut queue = OutboundQueue::new(4);
        queue
            .push(QueuedCall { message_id: "1".into(), action: Action::Heartbeat, payload: Value::Null, attempts_made: 0, queued_at: Instant::now() }, false)
            .unwrap();
        let removed = queue.remove("1");
        assert!(removed.is_some());
        assert!(queue.is_empty());
        assert!(queue.remove("1").is_none());
    }

    #[test]
    fn requeue_for_retry_stops_after_max_attempts() {
        let mut queue = OutboundQueue::new(4);
        let call = QueuedCall { message_id: "1".into(), action: Action::StartTransaction, payload: Value::Null, attempts_made: 2, queued_at: Instant::now() };
        let requeued = queue.requeue_for_retry(call, 3);
        assert!(!requeued);
        assert!(queue.is_empty());
    }

    #[test]
    fn transaction_related_actions_are_flagged() {
        assert!(Action::StartTransaction.is_transaction_related());
        assert!(Action::StopTransaction.is_transaction_related());
        assert!(Action::MeterValues.is_transaction_related());
        assert!(!Action::Heartbeat.is_transaction_related());
    }
}
