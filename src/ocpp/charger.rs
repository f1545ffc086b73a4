//! OCPP Charger FSM (C7): thin coordinator over one or more connector FSMs,
//! owner of the persisted checkpoint. Grounded on
//! `examples/original_source/include/ocpp.h`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::checkpoint::ChargerCheckpoint;
use super::connector::ConnectorFsm;

/// Reboot severity, mirrors `ocpp_charger_reboot_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootRequest {
    None,
    Required,
    RequiredRemotely,
    Forced,
}

/// Replaces the reference firmware's `void *value` tagged union with a
/// proper Rust enum (spec §9 redesign flag).
#[derive(Debug, Clone)]
pub enum ChargerEvent {
    AvailabilityChanged { connector_id: u32 },
    ConfigurationChanged,
    BillingStarted { connector_id: u32, transaction_id: u32 },
    BillingEnded { connector_id: u32, transaction_id: u32 },
    CsmsUp,
    RemoteReset(RebootRequest),
}

const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Minimum bounded message queue capacity per spec §4.5.
pub const MIN_MESSAGE_QUEUE_CAPACITY: usize = 4;

/// Inbound message routed by transaction or message ID; payload decoding
/// happens upstream in the message adapter (C8).
pub struct InboundMessage {
    pub connector_id: Option<u32>,
    pub transaction_id: Option<u32>,
    pub action: String,
    pub payload: serde_json::Value,
}

pub struct OcppCharger {
    connectors: Mutex<Vec<ConnectorFsm>>,
    checkpoint: Mutex<ChargerCheckpoint>,
    reboot: Mutex<RebootRequest>,
    configuration_changed: std::sync::atomic::AtomicBool,
    availability_changed: std::sync::atomic::AtomicBool,
    inbound_queue: Mutex<VecDeque<InboundMessage>>,
    events_tx: broadcast::Sender<ChargerEvent>,
}

impl OcppCharger {
    pub fn new(connectors: Vec<ConnectorFsm>) -> Self {
        let count = connectors.len();
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connectors: Mutex::new(connectors),
            checkpoint: Mutex::new(ChargerCheckpoint::new(count)),
            reboot: Mutex::new(RebootRequest::None),
            configuration_changed: std::sync::atomic::AtomicBool::new(false),
            availability_changed: std::sync::atomic::AtomicBool::new(false),
            inbound_queue: Mutex::new(VecDeque::with_capacity(MIN_MESSAGE_QUEUE_CAPACITY)),
            events_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChargerEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, event: ChargerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub async fn connector_count(&self) -> usize {
        self.connectors.lock().await.len()
    }

    pub fn mark_configuration_changed(&self) {
        self.configuration_changed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.publish(ChargerEvent::ConfigurationChanged);
    }

    pub fn mark_availability_changed(&self, connector_id: u32) {
        self.availability_changed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.publish(ChargerEvent::AvailabilityChanged { connector_id });
    }

    /// `ChangeAvailability.req` (spec §4.6): persists the connector's
    /// Operative/Inoperative intent to the checkpoint so it survives a
    /// reboot, and marks the change for the reboot-quiescence/event path.
    /// Whether the connector FSM honors it immediately or defers until the
    /// connector returns to `Available` is the FSM's own concern (spec §4.4).
    pub async fn set_connector_availability(&self, connector_index: usize, unavailable: bool) {
        let mut cp = self.checkpoint.lock().await;
        if let Some(entry) = cp.connector_mut(connector_index) {
            entry.unavailable = unavailable;
        }
        drop(cp);
        self.mark_availability_changed(connector_index as u32 + 1);
    }

    /// Current persisted availability intent for the connector the runner
    /// feeds into `ConnectorInputs` each step (spec §4.4 "Unavailable").
    pub async fn connector_unavailable(&self, connector_index: usize) -> bool {
        self.checkpoint.lock().await.connector(connector_index).map(|c| c.unavailable).unwrap_or(false)
    }

    pub async fn request_reboot(&self, request: RebootRequest) {
        *self.reboot.lock().await = request;
        if request == RebootRequest::RequiredRemotely || request == RebootRequest::Forced {
            self.publish(ChargerEvent::RemoteReset(request));
        }
    }

    /// Emits `REBOOT_REQUIRED` only once no connector is charging and the
    /// inbound queue is empty, per §4.5 responsibility 2.
    pub async fn poll_reboot_quiescence(&self) -> Option<RebootRequest> {
        let pending = *self.reboot.lock().await;
        if pending == RebootRequest::None {
            return None;
        }
        let any_charging = self
            .connectors
            .lock()
            .await
            .iter()
            .any(|c| matches!(c.status(), super::connector::ConnectorStatus::Charging | super::connector::ConnectorStatus::SuspendedEV));
        let queue_empty = self.inbound_queue.lock().await.is_empty();

        if !any_charging && queue_empty {
            info!(?pending, "reboot quiescence reached");
            Some(pending)
        } else {
            None
        }
    }

    pub async fn enqueue_inbound(&self, message: InboundMessage) -> Result<(), InboundMessage> {
        let mut queue = self.inbound_queue.lock().await;
        if queue.len() >= MIN_MESSAGE_QUEUE_CAPACITY {
            warn!("inbound message queue full, dropping message");
            return Err(message);
        }
        queue.push_back(message);
        Ok(())
    }

    pub async fn dequeue_inbound(&self) -> Option<InboundMessage> {
        self.inbound_queue.lock().await.pop_front()
    }

    /// Dispatches one queued inbound message to the connector it targets,
    /// matching by transaction ID first, falling back to connector ID.
    pub async fn route_inbound(&self, message: &InboundMessage) -> Option<u32> {
        let connectors = self.connectors.lock().await;
        if let Some(tid) = message.transaction_id {
            if let Some(c) = connectors.iter().find(|c| c.session().transaction_id == tid) {
                return Some(c.connector_id());
            }
        }
        message.connector_id
    }

    pub async fn checkpoint_snapshot(&self) -> ChargerCheckpoint {
        self.checkpoint.lock().await.clone()
    }

    pub async fn persist_transaction_start(&self, connector_index: usize, transaction_id: u32) {
        let mut cp = self.checkpoint.lock().await;
        if let Some(entry) = cp.connector_mut(connector_index) {
            entry.transaction_id = transaction_id;
        }
        let tid = transaction_id;
        drop(cp);
        self.publish(ChargerEvent::BillingStarted { connector_id: connector_index as u32, transaction_id: tid });
    }

    pub async fn persist_transaction_stop(&self, connector_index: usize) {
        let mut cp = self.checkpoint.lock().await;
        let tid = cp.connector(connector_index).map(|c| c.transaction_id).unwrap_or(0);
        if let Some(entry) = cp.connector_mut(connector_index) {
            entry.transaction_id = 0;
        }
        drop(cp);
        self.publish(ChargerEvent::BillingEnded { connector_id: connector_index as u32, transaction_id: tid });
    }

    pub fn connectors(&self) -> &Mutex<Vec<ConnectorFsm>> {
        &self.connectors
    }
}

pub type SharedOcppCharger = Arc<OcppCharger>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn charger_with_one_connector() -> OcppCharger {
        OcppCharger::new(vec![ConnectorFsm::new(1, Duration::from_secs(60))])
    }

    #[tokio::test]
    async fn reboot_quiescence_blocked_while_charging_marked_pending() {
        let charger = charger_with_one_connector();
        charger.request_reboot(RebootRequest::RequiredRemotely).await;
        assert_eq!(charger.poll_reboot_quiescence().await, Some(RebootRequest::RequiredRemotely));
    }

    #[tokio::test]
    async fn inbound_queue_rejects_beyond_capacity() {
        let charger = charger_with_one_connector();
        for i in 0..MIN_MESSAGE_QUEUE_CAPACITY {
            let msg = InboundMessage { connector_id: Some(1), transaction_id: None, action: format!("m{i}"), payload: serde_json::Value::Null };
            assert!(charger.enqueue_inbound(msg).await.is_ok());
        }
        let overflow = InboundMessage { connector_id: Some(1), transaction_id: None, action: "overflow".into(), payload: serde_json::Value::Null };
        assert!(charger.enqueue_inbound(overflow).await.is_err());
    }

    #[tokio::test]
    async fn persist_transaction_start_updates_checkpoint_and_emits_event() {
        let charger = charger_with_one_connector();
        let mut rx = charger.subscribe_events();
        charger.persist_transaction_start(0, 7).await;

        let cp = charger.checkpoint_snapshot().await;
        assert_eq!(cp.connector(0).unwrap().transaction_id, 7);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ChargerEvent::BillingStarted { transaction_id: 7, .. }));
    }

    #[tokio::test]
    async fn route_inbound_matches_by_transaction_id() {
        let charger = charger_with_one_connector();
        charger.connectors().lock().await[0].set_transaction_id(99);
        let msg = InboundMessage { connector_id: None, transaction_id: Some(99), action: "StopTransaction".into(), payload: serde_json::Value::Null };
        assert_eq!(charger.route_inbound(&msg).await, Some(1));
    }
}
