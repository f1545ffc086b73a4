//! Task supervisor (spec §5): wires the components built in the other
//! modules into the firmware's four cooperative tasks and owns the single
//! connector's end-to-end wiring between the charge state machine, the
//! connector FSM, and the OCPP message adapter/transport.
//!
//! Grounded on `examples/original_source/src/app.c` (`app_process`'s 50 ms
//! step loop, single-connector construction) and `src/main.c` (the runner
//! watchdog and periodic metric save actor).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::auth_store::{AuthorizationStatus, AuthorizationStore, AuthorizationStoreConfig};
use crate::config::AppConfig;
use crate::hardware::factory::HardwareFactory;
use crate::iec61851::relay::{RelayDriver, RelayParams};
use crate::iec61851::{ChargeAction, ChargeStateMachine};
use crate::metering::{MeteringAccessor, ReadingContext};
use crate::metrics::{self, Counter, MetricFs};
use crate::netmgr::{NetworkManager, NetworkState};
use crate::ocpp::charger::{OcppCharger, RebootRequest};
use crate::ocpp::client::{CsmsTransport, IncomingCall, TransportConfig};
use crate::ocpp::connector::{ConnectorAction, ConnectorFsm, ConnectorInputs, ConnectorStatus, MeteringDue};
use crate::ocpp::messages::*;
use crate::ocpp::{Action, ErrorCode};
use crate::pilot::{PilotParams, PilotProcessor};
use crate::safety::{SafetyMonitor, SafetyVerdict};

const RUNNER_STEP_MS: u64 = 50;
/// Mirrors `app_process`'s `DEFAULT_STEP_INTERVAL_MS`; a step that overruns
/// this by more than 4x is logged as a runner watchdog concern rather than
/// aborting the process, since this runtime has no hardware watchdog to feed.
const RUNNER_OVERRUN_MS: u64 = 200;
const CHARGE_POINT_VENDOR: &str = "Pazzk";
const CHARGE_POINT_MODEL: &str = "EVSE-1P7";
const DISPATCH_QUEUE_CAPACITY: usize = 32;
/// Heartbeat.conf's `currentTime` is only adopted past this drift (spec §4.6).
const SYSTEM_TIME_MAX_DRIFT_SEC: i64 = 5;

/// One `ChangeConfiguration.req`/`GetConfiguration.req` key, mirroring
/// `ocpp_config_entry_t`'s `{key, readonly, needs_reboot}` triple (spec §4.6
/// "typed schema"). `HeartbeatInterval` is the only key this tree can apply
/// without a restart, since `ConnectionTimeOut`/`MeterValueSampleInterval`
/// are baked into the connector FSM at construction.
struct ConfigKeySchema {
    key: &'static str,
    readonly: bool,
    needs_reboot: bool,
}

const CONFIGURATION_SCHEMA: &[ConfigKeySchema] = &[
    ConfigKeySchema { key: "HeartbeatInterval", readonly: false, needs_reboot: false },
    ConfigKeySchema { key: "ConnectionTimeOut", readonly: false, needs_reboot: true },
    ConfigKeySchema { key: "MeterValueSampleInterval", readonly: false, needs_reboot: true },
    ConfigKeySchema { key: "NumberOfConnectors", readonly: true, needs_reboot: false },
    ConfigKeySchema { key: "AuthorizeRemoteTxRequests", readonly: true, needs_reboot: false },
];

/// Everything the main runner and the dispatcher need for the one
/// connector this tree builds (spec §1 scopes multi-connector priority
/// arbitration out; `app_init` itself only ever creates `connector1`).
pub struct Supervisor {
    pilot: Arc<PilotProcessor>,
    relay: Arc<RelayDriver>,
    charge_fsm: Mutex<ChargeStateMachine>,
    safety: Arc<SafetyMonitor>,
    metering: Arc<MeteringAccessor>,
    auth_store: Arc<AuthorizationStore>,
    charger: Arc<OcppCharger>,
    transport: Arc<CsmsTransport>,
    netmgr: Arc<NetworkManager>,
    config: AppConfig,
    dispatch_tx: mpsc::Sender<DispatchJob>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchJob>>>,
    /// Effective `Heartbeat.req` period: seeded from config, overridden by
    /// `BootNotification.conf`'s `interval` field (spec §4.6a) once the CSMS
    /// answers one.
    heartbeat_interval_secs: AtomicU64,
    /// `ChangeConfiguration`/`GetConfiguration`'s backing store, standing in
    /// for the `config.ocpp.config` NVS blob (spec §6 "Persisted device
    /// configuration"); keyed by `ConfigKeySchema::key`.
    configuration: Mutex<HashMap<String, String>>,
}

/// One connector-FSM-triggered OCPP action, handed off from the fast
/// runner loop to the dispatcher task so the runner never blocks on a
/// CSMS round trip (spec §5 "the main runner never blocks").
struct DispatchJob {
    action: ConnectorAction,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Self {
        let hw = HardwareFactory::default();

        let pilot_params = PilotParams {
            scan_interval_ms: config.pilot.scan_interval_ms,
            sample_count: config.pilot.sample_count,
            ..PilotParams::default()
        };
        let pilot = Arc::new(PilotProcessor::new(pilot_params, hw.create_pilot_adc(), hw.create_pwm_channel()));
        let relay = Arc::new(RelayDriver::new(hw.create_relay_coil_pwm(), hw.create_relay_contact(), RelayParams::default()));
        let safety = Arc::new(SafetyMonitor::new(
            hw.create_safety_pulse_source(config.safety.expected_input_frequency_hz),
            config.safety.expected_input_frequency_hz,
        ));
        let metering = Arc::new(MeteringAccessor::new(hw.create_meter()));
        let auth_store = Arc::new(AuthorizationStore::new(AuthorizationStoreConfig {
            allow_offline_tx_for_unknown_id: config.ocpp.allow_offline_tx_for_unknown_id,
            ..AuthorizationStoreConfig::default()
        }));

        let connector = ConnectorFsm::with_metering_intervals(
            1,
            Duration::from_secs(config.connector.connection_timeout_secs),
            Duration::from_secs(config.connector.meter_value_sample_interval_secs),
            config.connector.clock_aligned_data_interval_secs.map(Duration::from_secs),
        );
        let charger = Arc::new(OcppCharger::new(vec![connector]));

        let transport = Arc::new(CsmsTransport::new(TransportConfig {
            server_url: config.ocpp.server_url.clone(),
            charge_point_id: config.ocpp.charge_point_id.clone(),
            ws_ping_interval_secs: config.ocpp.ws_ping_interval_secs,
            write_timeout_secs: config.ocpp.write_timeout_secs,
            transaction_message_retry_interval_secs: config.ocpp.transaction_message_retry_interval_secs,
            transaction_message_attempts: config.ocpp.transaction_message_attempts,
        }));
        let netmgr = Arc::new(NetworkManager::new(config.network.clone(), transport.clone()));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let heartbeat_interval_secs = AtomicU64::new(config.ocpp.heartbeat_interval_secs);

        let mut configuration = HashMap::new();
        configuration.insert("HeartbeatInterval".to_string(), config.ocpp.heartbeat_interval_secs.to_string());
        configuration.insert("ConnectionTimeOut".to_string(), config.connector.connection_timeout_secs.to_string());
        configuration.insert("MeterValueSampleInterval".to_string(), config.connector.meter_value_sample_interval_secs.to_string());
        configuration.insert("NumberOfConnectors".to_string(), "1".to_string());
        configuration.insert("AuthorizeRemoteTxRequests".to_string(), config.ocpp.authorize_remote_tx_requests.to_string());

        Self {
            pilot,
            relay,
            charge_fsm: Mutex::new(ChargeStateMachine::new()),
            safety,
            metering,
            auth_store,
            charger,
            transport,
            netmgr,
            config,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            heartbeat_interval_secs,
            configuration: Mutex::new(configuration),
        }
    }

    /// Spawns the four cooperative tasks of spec §5 and returns immediately;
    /// the caller (`main`) awaits them to keep the process alive.
    pub async fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.pilot.enable().await;
        self.relay.turn_off().await;

        let mut handles = Vec::new();

        let runner = self.clone();
        handles.push(tokio::spawn(async move { runner.run_main_loop().await }));

        let pilot_task = self.clone();
        handles.push(tokio::spawn(async move { pilot_task.run_pilot_task().await }));

        let (incoming_tx, incoming_rx) = mpsc::channel::<IncomingCall>(32);
        let net = self.clone();
        handles.push(tokio::spawn(async move { net.netmgr.run(incoming_tx).await }));

        let inbound = self.clone();
        handles.push(tokio::spawn(async move { inbound.run_inbound_task(incoming_rx).await }));

        let dispatcher = self.clone();
        let dispatch_rx = self.dispatch_rx.lock().await.take().expect("spawn_all called once");
        handles.push(tokio::spawn(async move { dispatcher.run_dispatch_task(dispatch_rx).await }));

        let metric_task = self.clone();
        handles.push(tokio::spawn(async move { metric_task.run_metric_task().await }));

        handles
    }

    /// Main runner (spec §5 task 1, default 50 ms period): advances the
    /// charge state machine off the pilot's published status, drives the
    /// relay/PWM side effects, then advances the connector overlay FSM and
    /// hands any resulting OCPP action to the dispatcher.
    async fn run_main_loop(&self) {
        loop {
            let start = Instant::now();
            self.step().await;
            metrics::increase(Counter::RunnerDispatchCount);

            let elapsed = start.elapsed();
            if elapsed > Duration::from_millis(RUNNER_OVERRUN_MS) {
                metrics::increase(Counter::RunnerOverrunCount);
                warn!(?elapsed, "runner step overran its budget");
            }
            tokio::time::sleep(Duration::from_millis(RUNNER_STEP_MS).saturating_sub(elapsed)).await;
        }
    }

    async fn step(&self) {
        let Some(pilot_status) = self.pilot.status().await else {
            return;
        };
        let safety_verdict = self.safety.check().await;
        let evse_fault = matches!(
            safety_verdict,
            SafetyVerdict::EmergencyStop | SafetyVerdict::AbnormalFrequency | SafetyVerdict::SamplingError
        );
        let pilot_fault_cleared = self.pilot.ok().await;

        let action = {
            let mut fsm = self.charge_fsm.lock().await;
            fsm.advance(pilot_status, evse_fault, pilot_fault_cleared)
        };
        self.apply_charge_action(action).await;

        let physical = self.charge_fsm.lock().await.state();
        let csms_up = self.netmgr.state() == NetworkState::Connected;
        let unavailable_requested = self.charger.connector_unavailable(0).await;

        let connector_action = {
            let mut connectors = self.charger.connectors().lock().await;
            let Some(connector) = connectors.first_mut() else { return };
            connector.advance(&ConnectorInputs {
                physical,
                csms_up,
                unavailable_requested,
                faulted: evse_fault,
                reboot_requested_remote: false,
                missing_transaction_on_checkpoint: None,
                unix_time_secs: Utc::now().timestamp() as u64,
            })
        };

        if connector_action != ConnectorAction::None {
            if let Err(e) = self.dispatch_tx.try_send(DispatchJob { action: connector_action }) {
                warn!(error = %e, "dropped connector action, dispatcher backlogged");
            }
        }

        if let Some(reboot) = self.charger.poll_reboot_quiescence().await {
            metrics::increase(Counter::WdtCount);
            info!(?reboot, "reboot quiescence reached; this process would restart here");
        }
    }

    async fn apply_charge_action(&self, action: ChargeAction) {
        match action {
            ChargeAction::None => {}
            ChargeAction::StartPwm => self.pilot.set_duty(crate::iec61851::current::milliampere_to_duty(self.max_output_current_ma())).await,
            ChargeAction::StopPwm => self.pilot.set_duty(0).await,
            ChargeAction::SupplyPower => self.relay.turn_on().await,
            ChargeAction::StopPower => self.relay.turn_off().await,
            ChargeAction::StopAll => {
                self.relay.turn_off().await;
                self.pilot.set_duty(0).await;
            }
            ChargeAction::Unexpected | ChargeAction::EvseError | ChargeAction::EvError => {
                self.relay.turn_off().await;
            }
        }
    }

    fn max_output_current_ma(&self) -> u32 {
        32_000
    }

    /// Pilot task (spec §5 task 2): ticks the processor on its own
    /// `scan_interval_ms` period with the 500 ms watchdog budget named in
    /// `pilot::PILOT_WATCHDOG_MS`.
    async fn run_pilot_task(&self) {
        let interval = Duration::from_millis(self.config.pilot.scan_interval_ms as u64);
        loop {
            let start = Instant::now();
            if let Err(e) = self.pilot.tick().await {
                warn!(error = %e, "pilot tick reported an error");
            }
            metrics::increase(Counter::PilotTickCount);

            if start.elapsed() > Duration::from_millis(crate::pilot::PILOT_WATCHDOG_MS) {
                metrics::increase(Counter::PilotWatchdogTimeoutCount);
                error!(elapsed = ?start.elapsed(), "pilot task missed its watchdog budget");
            }
            tokio::time::sleep(interval.saturating_sub(start.elapsed())).await;
        }
    }

    /// Drains CSMS-initiated calls surfaced by the transport and responds
    /// to each, mirroring `ocpp_adapter`'s dispatch table (RemoteStart/Stop,
    /// Reset, ChangeAvailability, UnlockConnector, ChangeConfiguration,
    /// GetConfiguration, ClearCache, DataTransfer).
    async fn run_inbound_task(&self, mut incoming_rx: mpsc::Receiver<IncomingCall>) {
        while let Some(call) = incoming_rx.recv().await {
            self.handle_incoming_call(call).await;
        }
    }

    async fn handle_incoming_call(&self, call: IncomingCall) {
        let message_id = call.message_id.clone();
        let result = match call.action {
            Action::RemoteStartTransaction => self.handle_remote_start(call.payload).await,
            Action::RemoteStopTransaction => self.handle_remote_stop(call.payload).await,
            Action::Reset => self.handle_reset(call.payload).await,
            Action::ChangeAvailability => self.handle_change_availability(call.payload).await,
            Action::UnlockConnector => Ok(serde_json::to_value(UnlockConnectorResponse { status: UnlockStatus::NotSupported }).unwrap()),
            Action::ChangeConfiguration => self.handle_change_configuration(call.payload).await,
            Action::GetConfiguration => self.handle_get_configuration(call.payload).await,
            Action::ClearCache => {
                self.auth_store.clear_cache().await;
                Ok(serde_json::to_value(ClearCacheResponse { status: ClearCacheStatus::Accepted }).unwrap())
            }
            Action::DataTransfer => Ok(serde_json::to_value(DataTransferResponse { status: DataTransferStatus::UnknownVendorId, data: None }).unwrap()),
            Action::UpdateFirmware => self.handle_update_firmware(call.payload).await,
            other => {
                warn!(action = ?other, "charge point received an action it does not accept as a CALL");
                Err(ErrorCode::NotImplemented)
            }
        };

        match result {
            Ok(payload) => {
                if let Err(e) = self.transport.respond(message_id, payload).await {
                    warn!(error = %e, "failed to send CALLRESULT");
                }
            }
            Err(code) => {
                if let Err(e) = self.transport.respond_error(message_id, code, "not handled".into()).await {
                    warn!(error = %e, "failed to send CALLERROR");
                }
            }
        }
    }

    /// `RemoteStartTransaction.req` handler (spec §4.4 "Authorization flow",
    /// scenario 4). The CALLRESULT reflects only whether the connector could
    /// accept the attempt (not yet whether authorization succeeds) — a
    /// connector already occupied rejects outright, everything else is
    /// accepted and, when CSMS confirmation is still owed, resolved
    /// asynchronously by a deferred `Authorize.req`.
    async fn handle_remote_start(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: RemoteStartTransactionRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        let csms_up = self.netmgr.state() == NetworkState::Connected;
        let local_status = self.auth_store.authorize(&req.id_tag, csms_up).await;

        let status = {
            let mut connectors = self.charger.connectors().lock().await;
            let Some(connector) = connectors.first_mut() else { return Err(ErrorCode::InternalError) };
            connector.try_occupy(
                &req.id_tag,
                true,
                local_status,
                csms_up,
                self.config.ocpp.authorize_remote_tx_requests,
                self.config.ocpp.local_pre_authorize,
            )
        };

        let rejected = matches!(
            status,
            Some(AuthorizationStatus::ConcurrentTx) | Some(AuthorizationStatus::Invalid) | Some(AuthorizationStatus::Blocked) | Some(AuthorizationStatus::Expired)
        );
        // Authorize.req still owed to the CSMS whenever occupancy didn't
        // bypass authorization entirely — deferred 1 s so this CALLRESULT
        // reaches the CSMS before the Authorize.req does (spec §4.6a
        // "ordering guarantees").
        let needs_authorize = csms_up
            && self.config.ocpp.authorize_remote_tx_requests
            && (status.is_none() || matches!(status, Some(AuthorizationStatus::Accepted)));
        if needs_authorize {
            self.schedule_authorize(req.id_tag.clone(), true);
        }

        Ok(serde_json::to_value(RemoteStartTransactionResponse {
            status: if rejected { RemoteStartStopStatus::Rejected } else { RemoteStartStopStatus::Accepted },
        })
        .unwrap())
    }

    /// Spawns the `Authorize.req`/`conf` round trip outside the inbound
    /// handler so the triggering CALLRESULT is written first; `remote`
    /// selects the 1 s defer named in spec §4.4/§4.6a.
    fn schedule_authorize(&self, id_tag: String, remote: bool) {
        let transport = self.transport.clone();
        let charger = self.charger.clone();
        let auth_store = self.auth_store.clone();
        tokio::spawn(async move {
            if remote {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            send_authorize(&transport, &charger, &auth_store, id_tag).await;
        });
    }

    async fn handle_remote_stop(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: RemoteStopTransactionRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        let mut connectors = self.charger.connectors().lock().await;
        let matched = connectors
            .iter_mut()
            .find(|c| c.session().is_active() && c.session().transaction_id == req.transaction_id as u32);
        let found = matched.is_some();
        if let Some(connector) = matched {
            let id_tag = connector.session().auth_current.id_tag.clone().unwrap_or_default();
            connector.try_release(&id_tag, true);
        }
        Ok(serde_json::to_value(RemoteStopTransactionResponse {
            status: if found { RemoteStartStopStatus::Accepted } else { RemoteStartStopStatus::Rejected },
        })
        .unwrap())
    }

    async fn handle_reset(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: ResetRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        let severity = match req.reset_type {
            ResetType::Hard => RebootRequest::Forced,
            ResetType::Soft => RebootRequest::RequiredRemotely,
        };
        self.charger.request_reboot(severity).await;
        Ok(serde_json::to_value(ResetResponse { status: ResetStatus::Accepted }).unwrap())
    }

    /// `ChangeAvailability.req` (spec §4.6): `connectorId` 0 addresses the
    /// whole charge point, which in this single-connector tree means the
    /// one connector (spec §1 scopes multi-connector arbitration out).
    /// Persists the Operative/Inoperative intent to the checkpoint and feeds
    /// it into the connector FSM's `unavailable_requested` input on the next
    /// `step()`; the FSM itself decides whether that lands immediately
    /// (connector already `Available`) or only once the connector returns
    /// there, which is when `Scheduled` rather than `Accepted` is owed back.
    async fn handle_change_availability(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: ChangeAvailabilityRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        if req.connector_id < 0 || req.connector_id > 1 {
            return Ok(serde_json::to_value(ChangeAvailabilityResponse { status: AvailabilityStatus::Rejected }).unwrap());
        }

        let unavailable = req.availability_type == AvailabilityType::Inoperative;
        let takes_effect_immediately = {
            let connectors = self.charger.connectors().lock().await;
            connectors
                .first()
                .map(|c| matches!(c.status(), ConnectorStatus::Available | ConnectorStatus::Booting))
                .unwrap_or(false)
        };

        self.charger.set_connector_availability(0, unavailable).await;

        let status = if unavailable && !takes_effect_immediately {
            AvailabilityStatus::Scheduled
        } else {
            AvailabilityStatus::Accepted
        };
        Ok(serde_json::to_value(ChangeAvailabilityResponse { status }).unwrap())
    }

    /// `ChangeConfiguration.req` (spec §4.6): validated against
    /// `CONFIGURATION_SCHEMA` before anything is written. `HeartbeatInterval`
    /// takes effect on the next heartbeat tick; the reboot-requiring keys are
    /// only persisted, since this tree's connector FSM reads them at
    /// construction and can't be re-parametrized live.
    async fn handle_change_configuration(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: ChangeConfigurationRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        let Some(schema) = CONFIGURATION_SCHEMA.iter().find(|entry| entry.key == req.key) else {
            return Ok(serde_json::to_value(ChangeConfigurationResponse { status: ConfigurationStatus::NotSupported }).unwrap());
        };

        if schema.readonly {
            return Ok(serde_json::to_value(ChangeConfigurationResponse { status: ConfigurationStatus::Rejected }).unwrap());
        }

        if req.value.parse::<u64>().is_err() {
            return Ok(serde_json::to_value(ChangeConfigurationResponse { status: ConfigurationStatus::Rejected }).unwrap());
        }

        self.configuration.lock().await.insert(schema.key.to_string(), req.value.clone());
        self.charger.mark_configuration_changed();

        if schema.key == "HeartbeatInterval" {
            if let Ok(secs) = req.value.parse::<u64>() {
                self.heartbeat_interval_secs.store(secs.max(1), Ordering::Relaxed);
            }
        }

        let status = if schema.needs_reboot { ConfigurationStatus::RebootRequired } else { ConfigurationStatus::Accepted };
        Ok(serde_json::to_value(ChangeConfigurationResponse { status }).unwrap())
    }

    /// `GetConfiguration.req` (spec §4.6): iterates every known key when none
    /// is requested, otherwise looks each requested key up individually and
    /// reports the rest in `unknownKey`.
    async fn handle_get_configuration(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: GetConfigurationRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        let stored = self.configuration.lock().await;

        let requested: Vec<String> = req.key.unwrap_or_else(|| CONFIGURATION_SCHEMA.iter().map(|e| e.key.to_string()).collect());
        let mut configuration_key = Vec::new();
        let mut unknown_key = Vec::new();

        for key in requested {
            match CONFIGURATION_SCHEMA.iter().find(|entry| entry.key == key) {
                Some(schema) => {
                    configuration_key.push(ConfigurationKeyEntry {
                        key: schema.key.to_string(),
                        readonly: schema.readonly,
                        value: stored.get(schema.key).cloned(),
                    });
                }
                None => unknown_key.push(key),
            }
        }

        Ok(serde_json::to_value(GetConfigurationResponse {
            configuration_key: Some(configuration_key),
            unknown_key: if unknown_key.is_empty() { None } else { Some(unknown_key) },
        })
        .unwrap())
    }

    /// `UpdateFirmware.req` (spec §4.6): real firmware update is out of
    /// scope; the CALLRESULT itself must still be the empty object the CSMS
    /// expects, so this only logs the forwarded location/retrieveDate.
    async fn handle_update_firmware(&self, payload: serde_json::Value) -> Result<serde_json::Value, ErrorCode> {
        let req: UpdateFirmwareRequest = serde_json::from_value(payload).map_err(|_| ErrorCode::FormationViolation)?;
        info!(location = %req.location, retrieve_date = %req.retrieve_date, "UpdateFirmware.req received, forwarding to updater subsystem");
        Ok(serde_json::to_value(UpdateFirmwareResponse {}).unwrap())
    }

    /// Dispatcher task: the only place that issues blocking CSMS requests
    /// triggered by connector FSM transitions, keeping the runner itself
    /// non-blocking per spec §5.
    /// Also owns the `Heartbeat.req` timer (spec §4.6): the dispatcher
    /// already serializes every other outbound CSMS request, so the
    /// heartbeat ticks through the same `select!` rather than adding a
    /// sixth task.
    async fn run_dispatch_task(&self, mut rx: mpsc::Receiver<DispatchJob>) {
        let mut heartbeat_tick = tokio::time::interval(Duration::from_secs(self.heartbeat_interval_secs.load(Ordering::Relaxed).max(1)));
        heartbeat_tick.tick().await;

        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    if let Err(e) = self.dispatch_connector_action(job.action).await {
                        warn!(error = %e, "csms request failed");
                    }
                }
                _ = heartbeat_tick.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "Heartbeat.req failed");
                    }
                    let configured = self.heartbeat_interval_secs.load(Ordering::Relaxed).max(1);
                    if configured != heartbeat_tick.period().as_secs() {
                        heartbeat_tick = tokio::time::interval(Duration::from_secs(configured));
                        heartbeat_tick.tick().await;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<(), crate::ocpp::client::TransportError> {
        let result = self.transport.request(Action::Heartbeat, serde_json::json!({})).await?;
        metrics::increase(Counter::HeartbeatCount);
        if let Ok(resp) = serde_json::from_value::<HeartbeatResponse>(result.payload) {
            self.check_clock_drift(resp.current_time);
        }
        Ok(())
    }

    /// `Heartbeat.conf` drift check (spec §4.6): adopting a CSMS-supplied
    /// wall clock would need a platform-specific syscall this crate does
    /// not assume it can make, so past the threshold this only logs and
    /// counts rather than stepping the process clock.
    fn check_clock_drift(&self, csms_time: DateTime<Utc>) {
        let drift = (Utc::now() - csms_time).num_seconds().abs();
        if drift > SYSTEM_TIME_MAX_DRIFT_SEC {
            warn!(drift_secs = drift, "CSMS clock drift exceeds threshold");
            metrics::increase(Counter::ClockDriftExceededCount);
        }
    }

    async fn dispatch_connector_action(&self, action: ConnectorAction) -> Result<(), crate::ocpp::client::TransportError> {
        match action {
            ConnectorAction::None => Ok(()),
            ConnectorAction::SendBootNotification => self.send_boot_notification().await,
            ConnectorAction::SendStatusNotification(status) => self.send_status_notification(status).await,
            ConnectorAction::SendStartTransaction => self.send_start_transaction().await,
            ConnectorAction::SendStopTransaction(reason) => self.send_stop_transaction(reason).await,
            ConnectorAction::StopMissingTransaction(tid) => self.send_stop_transaction_for(tid, StopReason::PowerLoss).await,
            ConnectorAction::SendMeterValues(due) => self.send_meter_values(due).await,
        }
    }

    /// Periodic metering duties (spec §4.4): samples the meter and reports
    /// it with the `Reading.Context` matching which duty fired, tagging
    /// `transactionId` only while a transaction is actually open.
    async fn send_meter_values(&self, due: MeteringDue) -> Result<(), crate::ocpp::client::TransportError> {
        let context = match due {
            MeteringDue::Periodic => ReadingContext::SamplePeriodic,
            MeteringDue::ClockAligned => ReadingContext::SampleClock,
        };
        let wire_context = match context {
            ReadingContext::SamplePeriodic => ReadingContextWire::SamplePeriodic,
            ReadingContext::SampleClock => ReadingContextWire::SampleClock,
            _ => ReadingContextWire::Other,
        };
        let sample = self.metering.read(context).await;

        let transaction_id = {
            let connectors = self.charger.connectors().lock().await;
            connectors.first().map(|c| c.session().transaction_id).filter(|&tid| tid != 0)
        };

        let mut sampled_value = vec![
            SampledValue {
                value: sample.energy_wh.to_string(),
                context: Some(wire_context),
                measurand: Some(Measurand::EnergyActiveImportRegister),
                unit: Some("Wh".into()),
            },
            SampledValue {
                value: sample.power_w.to_string(),
                context: Some(wire_context),
                measurand: Some(Measurand::PowerActiveImport),
                unit: Some("W".into()),
            },
            SampledValue {
                value: format!("{:.3}", sample.current_ma as f64 / 1000.0),
                context: Some(wire_context),
                measurand: Some(Measurand::CurrentImport),
                unit: Some("A".into()),
            },
            SampledValue {
                value: format!("{:.1}", sample.voltage_mv as f64 / 1000.0),
                context: Some(wire_context),
                measurand: Some(Measurand::Voltage),
                unit: Some("V".into()),
            },
            SampledValue {
                value: format!("{:.2}", sample.power_factor_centi as f64 / 100.0),
                context: Some(wire_context),
                measurand: Some(Measurand::PowerFactor),
                unit: None,
            },
            SampledValue {
                value: format!("{:.2}", sample.frequency_centi_hz as f64 / 100.0),
                context: Some(wire_context),
                measurand: Some(Measurand::Frequency),
                unit: None,
            },
            SampledValue {
                value: format!("{:.1}", sample.temperature_centi_c as f64 / 100.0),
                context: Some(wire_context),
                measurand: Some(Measurand::Temperature),
                unit: Some("Celsius".into()),
            },
        ];
        if let Some(soc) = sample.soc_percent {
            sampled_value.push(SampledValue {
                value: soc.to_string(),
                context: Some(wire_context),
                measurand: Some(Measurand::StateOfCharge),
                unit: Some("Percent".into()),
            });
        }

        let payload = serde_json::to_value(MeterValuesRequest {
            connector_id: 1,
            transaction_id: transaction_id.map(|tid| tid as i32),
            meter_value: vec![MeterValue { timestamp: Utc::now(), sampled_value }],
        })
        .unwrap();
        self.transport.request(Action::MeterValues, payload).await?;
        Ok(())
    }

    async fn send_boot_notification(&self) -> Result<(), crate::ocpp::client::TransportError> {
        let payload = serde_json::to_value(BootNotificationRequest {
            charge_point_vendor: CHARGE_POINT_VENDOR.into(),
            charge_point_model: CHARGE_POINT_MODEL.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").into()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        })
        .unwrap();
        let result = self.transport.request(Action::BootNotification, payload).await?;
        if let Ok(resp) = serde_json::from_value::<BootNotificationResponse>(result.payload) {
            if resp.status != RegistrationStatus::Accepted {
                warn!(status = ?resp.status, "CSMS did not accept boot notification");
            }
            if resp.interval > 0 {
                self.heartbeat_interval_secs.store(resp.interval as u64, Ordering::Relaxed);
            }
            self.check_clock_drift(resp.current_time);
        }
        Ok(())
    }

    async fn send_status_notification(&self, status: ConnectorStatus) -> Result<(), crate::ocpp::client::TransportError> {
        let payload = serde_json::to_value(StatusNotificationRequest {
            connector_id: 1,
            error_code: ChargePointErrorCode::NoError,
            status: wire_status(status),
            info: None,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        })
        .unwrap();
        self.transport.request(Action::StatusNotification, payload).await?;
        Ok(())
    }

    async fn send_start_transaction(&self) -> Result<(), crate::ocpp::client::TransportError> {
        let meter_start = self.metering.energy_wh_total().await as i32;
        let id_tag = {
            let connectors = self.charger.connectors().lock().await;
            connectors.first().and_then(|c| c.session().auth_current.id_tag.clone()).unwrap_or_default()
        };
        let payload = serde_json::to_value(StartTransactionRequest {
            connector_id: 1,
            id_tag,
            meter_start,
            reservation_id: None,
            timestamp: Utc::now(),
        })
        .unwrap();
        let result = self.transport.request(Action::StartTransaction, payload).await?;
        if let Ok(resp) = serde_json::from_value::<StartTransactionResponse>(result.payload) {
            let mut connectors = self.charger.connectors().lock().await;
            if let Some(connector) = connectors.first_mut() {
                connector.set_transaction_id(resp.transaction_id as u32);
            }
            drop(connectors);
            self.charger.persist_transaction_start(0, resp.transaction_id as u32).await;
        }
        Ok(())
    }

    async fn send_stop_transaction(&self, reason: StopReason) -> Result<(), crate::ocpp::client::TransportError> {
        let tid = {
            let connectors = self.charger.connectors().lock().await;
            connectors.first().map(|c| c.session().transaction_id).unwrap_or(0)
        };
        self.send_stop_transaction_for(tid, reason).await
    }

    async fn send_stop_transaction_for(&self, transaction_id: u32, reason: StopReason) -> Result<(), crate::ocpp::client::TransportError> {
        let meter_stop = self.metering.energy_wh_total().await as i32;
        let payload = serde_json::to_value(StopTransactionRequest {
            id_tag: None,
            meter_stop,
            timestamp: Utc::now(),
            transaction_id: transaction_id as i32,
            reason: Some(reason),
            transaction_data: None,
        })
        .unwrap();
        self.transport.request(Action::StopTransaction, payload).await?;

        let mut connectors = self.charger.connectors().lock().await;
        if let Some(connector) = connectors.first_mut() {
            connector.clear_transaction();
        }
        drop(connectors);
        self.charger.persist_transaction_stop(0).await;
        Ok(())
    }

    // Accessors below exist only for the CLI surface (spec §6 "CLI
    // surface"), which is a host-build debugging aid, not one of the four
    // cooperative tasks spec §5 defines.
    pub(crate) fn netmgr(&self) -> &NetworkManager {
        &self.netmgr
    }

    pub(crate) fn charger(&self) -> &OcppCharger {
        &self.charger
    }

    pub(crate) fn auth_store(&self) -> &AuthorizationStore {
        &self.auth_store
    }

    pub(crate) fn pilot(&self) -> &PilotProcessor {
        &self.pilot
    }

    pub(crate) fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) async fn charge_state(&self) -> crate::iec61851::ChargeState {
        self.charge_fsm.lock().await.state()
    }

    /// Metric save task (spec §5 task 4, default 30 min): snapshots the
    /// in-process counters into a CBOR blob via `MetricFs`.
    async fn run_metric_task(&self) {
        let metric_fs = MetricFs::new("data/metrics", 720);
        let mut interval = tokio::time::interval(Duration::from_secs(30 * 60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let snap = metrics::snapshot();
            match metric_fs.write_snapshot(&snap).await {
                Ok(path) => info!(?path, "metrics saved"),
                Err(e) => error!(error = %e, "failed to save metrics"),
            }
            metrics::reset();
        }
    }
}

/// Runs one `Authorize.req`/`conf` round trip and resolves it against the
/// connector and the authorization cache. Free function (rather than a
/// `Supervisor` method) so [`Supervisor::schedule_authorize`] can spawn it
/// holding only the `Arc` fields it needs, not the whole supervisor.
async fn send_authorize(transport: &CsmsTransport, charger: &OcppCharger, auth_store: &AuthorizationStore, id_tag: String) {
    let payload = serde_json::to_value(AuthorizeRequest { id_tag: id_tag.clone() }).unwrap();
    let result = match transport.request(Action::Authorize, payload).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Authorize.req failed");
            return;
        }
    };
    let Ok(resp) = serde_json::from_value::<AuthorizeResponse>(result.payload) else {
        warn!("malformed Authorize.conf payload");
        return;
    };

    let status = local_auth_status(resp.id_tag_info.status);
    auth_store.record_authorize_conf(&id_tag, status).await;

    let mut connectors = charger.connectors().lock().await;
    if let Some(connector) = connectors.first_mut() {
        connector.resolve_authorize_conf(status, resp.id_tag_info.parent_id_tag);
    }
}

fn local_auth_status(wire: AuthorizationStatusWire) -> AuthorizationStatus {
    match wire {
        AuthorizationStatusWire::Accepted => AuthorizationStatus::Accepted,
        AuthorizationStatusWire::Blocked => AuthorizationStatus::Blocked,
        AuthorizationStatusWire::Expired => AuthorizationStatus::Expired,
        AuthorizationStatusWire::Invalid => AuthorizationStatus::Invalid,
        AuthorizationStatusWire::ConcurrentTx => AuthorizationStatus::ConcurrentTx,
    }
}

fn wire_status(status: ConnectorStatus) -> ChargePointStatus {
    match status {
        ConnectorStatus::Booting => ChargePointStatus::Unavailable,
        ConnectorStatus::Available => ChargePointStatus::Available,
        ConnectorStatus::Preparing => ChargePointStatus::Preparing,
        ConnectorStatus::Charging => ChargePointStatus::Charging,
        ConnectorStatus::SuspendedEV => ChargePointStatus::SuspendedEV,
        ConnectorStatus::SuspendedEVSE => ChargePointStatus::SuspendedEVSE,
        ConnectorStatus::Finishing => ChargePointStatus::Finishing,
        ConnectorStatus::Reserved => ChargePointStatus::Reserved,
        ConnectorStatus::Unavailable => ChargePointStatus::Unavailable,
        ConnectorStatus::Faulted => ChargePointStatus::Faulted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_maps_booting_to_unavailable() {
        assert_eq!(wire_status(ConnectorStatus::Booting), ChargePointStatus::Unavailable);
    }

    #[test]
    fn wire_status_maps_charging_directly() {
        assert_eq!(wire_status(ConnectorStatus::Charging), ChargePointStatus::Charging);
    }

    #[test]
    fn local_auth_status_round_trips_wire_variants() {
        assert_eq!(local_auth_status(AuthorizationStatusWire::Accepted), AuthorizationStatus::Accepted);
        assert_eq!(local_auth_status(AuthorizationStatusWire::ConcurrentTx), AuthorizationStatus::ConcurrentTx);
    }
}
