//! OCPP Connector FSM (C6): overlays the 9-state OCPP 1.6 connector status
//! on top of the physical IEC 61851 state, drives authorization and the
//! transaction lifecycle. Grounded on
//! `examples/original_source/include/ocpp_connector.h` and
//! `src/charger/ocpp/ocpp_connector.c` (per spec §9, this is the newer
//! `ocpp_connector_*` lineage — the older `connector_private.c` duplicate is
//! intentionally not carried forward).

use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::messages::StopReason;
use crate::auth_store::AuthorizationStatus;
use crate::iec61851::ChargeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Booting,
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorAction {
    None,
    SendBootNotification,
    SendStatusNotification(ConnectorStatus),
    SendStartTransaction,
    SendStopTransaction(StopReason),
    StopMissingTransaction(u32),
    SendMeterValues(MeteringDue),
}

/// Which periodic metering duty (spec §4.4 "Periodic duties in
/// Charging/SuspendedEV") triggered a `SendMeterValues`, so the caller can
/// pick the matching OCPP `Reading.Context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteringDue {
    Periodic,
    ClockAligned,
}

/// Outcome of a user-initiated release attempt (`try_release`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotMatched,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSlot {
    pub id_tag: Option<String>,
    pub parent_id_tag: Option<String>,
}

/// Per-connector charging session record, per §3 "Charging session".
#[derive(Debug, Clone, Default)]
pub struct ChargingSession {
    pub transaction_id: u32,
    pub reservation_id: Option<i32>,
    pub auth_current: AuthSlot,
    pub auth_trial: AuthSlot,
    pub remote_stop: bool,
    pub expiry: Option<Instant>,
}

impl ChargingSession {
    pub fn is_active(&self) -> bool {
        self.auth_current.id_tag.is_some() && !self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(t) => Instant::now() > t,
            None => false,
        }
    }

    pub fn transaction_started(&self) -> bool {
        self.transaction_id != 0
    }
}

/// Inputs the connector task gathers each step before calling `advance`.
pub struct ConnectorInputs {
    pub physical: ChargeState,
    pub csms_up: bool,
    pub unavailable_requested: bool,
    pub faulted: bool,
    pub reboot_requested_remote: bool,
    pub missing_transaction_on_checkpoint: Option<u32>,
    /// Wall-clock seconds since epoch, used only for clock-aligned metering
    /// sample bucketing (spec §4.4 "`ClockAlignedDataInterval`").
    pub unix_time_secs: u64,
}

pub struct ConnectorFsm {
    connector_id: u32,
    status: ConnectorStatus,
    session: ChargingSession,
    connection_timeout: Duration,
    meter_sample_interval: Duration,
    clock_aligned_interval: Option<Duration>,
    next_periodic_sample_at: Option<Instant>,
    last_clock_aligned_bucket: Option<u64>,
}

impl ConnectorFsm {
    pub fn new(connector_id: u32, connection_timeout: Duration) -> Self {
        Self::with_metering_intervals(connector_id, connection_timeout, Duration::from_secs(60), None)
    }

    pub fn with_metering_intervals(
        connector_id: u32,
        connection_timeout: Duration,
        meter_sample_interval: Duration,
        clock_aligned_interval: Option<Duration>,
    ) -> Self {
        Self {
            connector_id,
            status: ConnectorStatus::Booting,
            session: ChargingSession::default(),
            connection_timeout,
            meter_sample_interval,
            clock_aligned_interval,
            next_periodic_sample_at: None,
            last_clock_aligned_bucket: None,
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        self.status
    }

    pub fn session(&self) -> &ChargingSession {
        &self.session
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    /// Advances the overlay FSM given physical/CSMS inputs. Mirrors
    /// `ocpp_connector_run()`'s per-status switch.
    pub fn advance(&mut self, inputs: &ConnectorInputs) -> ConnectorAction {
        let next_and_action = match self.status {
            ConnectorStatus::Booting => self.advance_booting(inputs),
            ConnectorStatus::Available => self.advance_available(inputs),
            ConnectorStatus::Preparing => self.advance_preparing(inputs),
            ConnectorStatus::Charging => self.advance_charging(inputs),
            ConnectorStatus::SuspendedEV => self.advance_suspended_ev(inputs),
            ConnectorStatus::SuspendedEVSE => self.advance_suspended_evse(inputs),
            ConnectorStatus::Finishing => self.advance_finishing(inputs),
            ConnectorStatus::Unavailable => self.advance_unavailable(inputs),
            ConnectorStatus::Faulted => self.advance_faulted(inputs),
            ConnectorStatus::Reserved => (ConnectorStatus::Reserved, ConnectorAction::None),
        };

        let (next, action) = if inputs.faulted && next_and_action.0 != ConnectorStatus::Faulted {
            (ConnectorStatus::Faulted, ConnectorAction::SendStatusNotification(ConnectorStatus::Faulted))
        } else {
            next_and_action
        };

        if next != self.status {
            info!(connector_id = self.connector_id, from = ?self.status, to = ?next, "connector status transition");
        }
        self.status = next;

        let metering_due = self.poll_periodic_metering(Instant::now(), inputs.unix_time_secs);
        if action == ConnectorAction::None {
            if let Some(due) = metering_due {
                return ConnectorAction::SendMeterValues(due);
            }
        }
        action
    }

    /// Periodic metering duties (spec §4.4 "Periodic duties in
    /// Charging/SuspendedEV"): a plain interval-timer sample plus an
    /// optional wall-clock-aligned sample when `now % interval == 0`.
    /// Resets its timers outside those two statuses so a session that
    /// suspends and resumes doesn't immediately fire a stale-due sample.
    fn poll_periodic_metering(&mut self, now: Instant, unix_time_secs: u64) -> Option<MeteringDue> {
        if !matches!(self.status, ConnectorStatus::Charging | ConnectorStatus::SuspendedEV) {
            self.next_periodic_sample_at = None;
            self.last_clock_aligned_bucket = None;
            return None;
        }

        let due_at = *self.next_periodic_sample_at.get_or_insert(now + self.meter_sample_interval);
        if now >= due_at {
            self.next_periodic_sample_at = Some(now + self.meter_sample_interval);
            return Some(MeteringDue::Periodic);
        }

        if let Some(interval_secs) = self.clock_aligned_interval.map(|d| d.as_secs()).filter(|s| *s > 0) {
            let bucket = unix_time_secs / interval_secs;
            if self.last_clock_aligned_bucket != Some(bucket) {
                self.last_clock_aligned_bucket = Some(bucket);
                return Some(MeteringDue::ClockAligned);
            }
        }
        None
    }

    fn advance_booting(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.unavailable_requested {
            return (ConnectorStatus::Unavailable, ConnectorAction::None);
        }
        if !inputs.csms_up {
            return (ConnectorStatus::Booting, ConnectorAction::SendBootNotification);
        }
        let session_active = self.session.is_active();
        if inputs.physical == ChargeState::A && !session_active {
            if let Some(tid) = inputs.missing_transaction_on_checkpoint {
                warn!(connector_id = self.connector_id, tid, "recovering from missing transaction on checkpoint");
                return (ConnectorStatus::Available, ConnectorAction::StopMissingTransaction(tid));
            }
            return (ConnectorStatus::Available, ConnectorAction::SendStatusNotification(ConnectorStatus::Available));
        }
        if inputs.physical == ChargeState::B || (inputs.physical == ChargeState::A && session_active) {
            return (ConnectorStatus::Preparing, ConnectorAction::None);
        }
        (ConnectorStatus::Booting, ConnectorAction::None)
    }

    fn advance_available(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.unavailable_requested {
            return (ConnectorStatus::Unavailable, ConnectorAction::None);
        }
        if inputs.physical == ChargeState::B || self.session.is_active() {
            self.session.expiry = Some(Instant::now() + self.connection_timeout);
            return (ConnectorStatus::Preparing, ConnectorAction::None);
        }
        (ConnectorStatus::Available, ConnectorAction::None)
    }

    fn advance_preparing(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.physical == ChargeState::A && !self.session.is_active() {
            return (ConnectorStatus::Available, ConnectorAction::None);
        }
        if matches!(inputs.physical, ChargeState::C | ChargeState::D) {
            return (ConnectorStatus::Charging, ConnectorAction::None);
        }
        if inputs.physical == ChargeState::B && self.session.is_active() && !self.session.transaction_started() {
            return (ConnectorStatus::Preparing, ConnectorAction::SendStartTransaction);
        }
        (ConnectorStatus::Preparing, ConnectorAction::None)
    }

    fn finishing_conditions(&self, inputs: &ConnectorInputs) -> Option<StopReason> {
        if inputs.physical == ChargeState::A {
            return Some(StopReason::EVDisconnected);
        }
        if matches!(inputs.physical, ChargeState::E | ChargeState::F) {
            return Some(StopReason::Other);
        }
        if !self.session.is_active() {
            return Some(if self.session.remote_stop { StopReason::Remote } else { StopReason::Local });
        }
        if inputs.reboot_requested_remote {
            return Some(StopReason::Reboot);
        }
        None
    }

    fn advance_charging(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.physical == ChargeState::B {
            return (ConnectorStatus::SuspendedEV, ConnectorAction::None);
        }
        if let Some(reason) = self.finishing_conditions(inputs) {
            return (ConnectorStatus::Finishing, ConnectorAction::SendStopTransaction(reason));
        }
        (ConnectorStatus::Charging, ConnectorAction::None)
    }

    fn advance_suspended_ev(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if matches!(inputs.physical, ChargeState::C | ChargeState::D) {
            return (ConnectorStatus::Charging, ConnectorAction::None);
        }
        if let Some(reason) = self.finishing_conditions(inputs) {
            return (ConnectorStatus::Finishing, ConnectorAction::SendStopTransaction(reason));
        }
        (ConnectorStatus::SuspendedEV, ConnectorAction::None)
    }

    fn advance_suspended_evse(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if let Some(reason) = self.finishing_conditions(inputs) {
            return (ConnectorStatus::Finishing, ConnectorAction::SendStopTransaction(reason));
        }
        (ConnectorStatus::SuspendedEVSE, ConnectorAction::None)
    }

    fn advance_finishing(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        match inputs.physical {
            ChargeState::A => (ConnectorStatus::Available, ConnectorAction::None),
            ChargeState::B => (ConnectorStatus::Preparing, ConnectorAction::None),
            _ => (ConnectorStatus::Finishing, ConnectorAction::None),
        }
    }

    fn advance_unavailable(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.unavailable_requested {
            return (ConnectorStatus::Unavailable, ConnectorAction::None);
        }
        if inputs.physical == ChargeState::B {
            (ConnectorStatus::Preparing, ConnectorAction::None)
        } else {
            (ConnectorStatus::Available, ConnectorAction::None)
        }
    }

    fn advance_faulted(&mut self, inputs: &ConnectorInputs) -> (ConnectorStatus, ConnectorAction) {
        if inputs.faulted {
            return (ConnectorStatus::Faulted, ConnectorAction::None);
        }
        if inputs.physical == ChargeState::B {
            (ConnectorStatus::Preparing, ConnectorAction::None)
        } else {
            (ConnectorStatus::Available, ConnectorAction::None)
        }
    }

    /// `try_occupy` (spec §4.4 "Authorization flow"). Returns the status to
    /// dispatch to the caller immediately when it can be resolved locally;
    /// `None` means an Authorize.req is outstanding and the caller must wait
    /// for `resolve_authorize_conf`.
    pub fn try_occupy(
        &mut self,
        id_tag: &str,
        remote: bool,
        local_status: AuthorizationStatus,
        csms_up: bool,
        allow_remote_tx_requests: bool,
        local_pre_authorize: bool,
    ) -> Option<AuthorizationStatus> {
        if self.session.is_active() {
            return Some(AuthorizationStatus::ConcurrentTx);
        }
        self.session.auth_trial = AuthSlot { id_tag: Some(id_tag.to_string()), parent_id_tag: None };

        if remote && !allow_remote_tx_requests {
            self.promote_trial_to_current();
            return Some(AuthorizationStatus::Accepted);
        }
        if csms_up {
            if local_pre_authorize && local_status == AuthorizationStatus::Accepted {
                self.promote_trial_to_current();
                return Some(AuthorizationStatus::Accepted);
            }
            None
        } else {
            if local_status == AuthorizationStatus::Accepted {
                self.promote_trial_to_current();
                Some(AuthorizationStatus::Accepted)
            } else {
                self.session.auth_trial = AuthSlot::default();
                Some(AuthorizationStatus::Invalid)
            }
        }
    }

    /// CSMS `Authorize.conf` resolution: promotes trial to current on
    /// acceptance, matching by the fact only one trial is outstanding per
    /// connector at a time.
    pub fn resolve_authorize_conf(&mut self, status: AuthorizationStatus, parent_id_tag: Option<String>) {
        if status == AuthorizationStatus::Accepted {
            self.session.auth_trial.parent_id_tag = parent_id_tag;
            self.promote_trial_to_current();
        } else {
            self.session.auth_trial = AuthSlot::default();
        }
    }

    /// `try_release` (spec §4.4 "Authorization flow", release path):
    /// mirrors `ocpp_connector_try_release`'s id/parent-id match, simplified
    /// — the original's fallback of sending a fresh `Authorize.req` for the
    /// *releasing* tag when it doesn't match either id only matters for a
    /// badge nobody has authorized yet trying to end someone else's
    /// session, which this crate's single-reader CLI path does not need to
    /// arbitrate. Clearing `auth_current` here is enough: the next
    /// `advance()` observes `!session.is_active()` and fires
    /// `SendStopTransaction` through the existing `finishing_conditions`
    /// path, so this call itself never returns a `ConnectorAction`.
    /// `remote` records whether the CSMS or a local badge swipe initiated
    /// the release, so `finishing_conditions` can pick `StopReason::Remote`
    /// vs. `StopReason::Local` (spec §4.4 "Stop reason selection").
    pub fn try_release(&mut self, id_tag: &str, remote: bool) -> Option<ReleaseOutcome> {
        if !self.session.is_active() {
            return None;
        }
        let matches_tag =
            self.session.auth_current.id_tag.as_deref() == Some(id_tag) || self.session.auth_current.parent_id_tag.as_deref() == Some(id_tag);
        if !matches_tag {
            return Some(ReleaseOutcome::NotMatched);
        }
        self.session.auth_current = AuthSlot::default();
        self.session.remote_stop = remote;
        Some(ReleaseOutcome::Released)
    }

    fn promote_trial_to_current(&mut self) {
        self.session.auth_current = std::mem::take(&mut self.session.auth_trial);
        self.session.expiry = Some(Instant::now() + self.connection_timeout);
    }

    pub fn set_transaction_id(&mut self, transaction_id: u32) {
        self.session.transaction_id = transaction_id;
    }

    pub fn clear_transaction(&mut self) {
        self.session.transaction_id = 0;
        self.session.auth_current = AuthSlot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(physical: ChargeState, csms_up: bool) -> ConnectorInputs {
        ConnectorInputs {
            physical,
            csms_up,
            unavailable_requested: false,
            faulted: false,
            reboot_requested_remote: false,
            missing_transaction_on_checkpoint: None,
            unix_time_secs: 0,
        }
    }

    #[test]
    fn boots_into_available_once_csms_up_and_no_vehicle() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        let action = fsm.advance(&inputs(ChargeState::A, true));
        assert_eq!(fsm.status(), ConnectorStatus::Available);
        assert_eq!(action, ConnectorAction::SendStatusNotification(ConnectorStatus::Available));
    }

    #[test]
    fn stays_booting_while_csms_down() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        let action = fsm.advance(&inputs(ChargeState::A, false));
        assert_eq!(fsm.status(), ConnectorStatus::Booting);
        assert_eq!(action, ConnectorAction::SendBootNotification);
    }

    #[test]
    fn plug_in_moves_available_to_preparing() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::A, true));
        fsm.advance(&inputs(ChargeState::B, true));
        assert_eq!(fsm.status(), ConnectorStatus::Preparing);
    }

    #[test]
    fn occupy_then_charge_then_unplug_finishes_with_ev_disconnected() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::A, true));
        fsm.advance(&inputs(ChargeState::B, true));

        let status = fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);
        assert_eq!(status, Some(AuthorizationStatus::Accepted));
        assert!(fsm.session().is_active());

        let action = fsm.advance(&inputs(ChargeState::B, true));
        assert_eq!(action, ConnectorAction::SendStartTransaction);
        fsm.set_transaction_id(42);

        fsm.advance(&inputs(ChargeState::C, true));
        assert_eq!(fsm.status(), ConnectorStatus::Charging);

        let stop_action = fsm.advance(&inputs(ChargeState::A, true));
        assert_eq!(fsm.status(), ConnectorStatus::Finishing);
        assert_eq!(stop_action, ConnectorAction::SendStopTransaction(StopReason::EVDisconnected));
    }

    #[test]
    fn concurrent_occupy_rejected_while_session_active() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);

        let second = fsm.try_occupy("tag2", false, AuthorizationStatus::Accepted, false, true, true);
        assert_eq!(second, Some(AuthorizationStatus::ConcurrentTx));
    }

    #[test]
    fn charging_to_suspended_ev_on_pilot_b() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);
        fsm.set_transaction_id(1);
        fsm.advance(&inputs(ChargeState::C, true));
        assert_eq!(fsm.status(), ConnectorStatus::Charging);

        fsm.advance(&inputs(ChargeState::B, true));
        assert_eq!(fsm.status(), ConnectorStatus::SuspendedEV);
    }

    #[test]
    fn periodic_meter_values_fires_while_charging() {
        let mut fsm = ConnectorFsm::with_metering_intervals(1, Duration::from_secs(60), Duration::from_millis(0), None);
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);
        fsm.set_transaction_id(1);

        let action = fsm.advance(&inputs(ChargeState::C, true));
        assert_eq!(fsm.status(), ConnectorStatus::Charging);
        assert_eq!(action, ConnectorAction::SendMeterValues(MeteringDue::Periodic));
    }

    #[test]
    fn periodic_meter_values_resets_once_session_leaves_charging() {
        let mut fsm = ConnectorFsm::with_metering_intervals(1, Duration::from_secs(60), Duration::from_millis(0), None);
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);
        fsm.set_transaction_id(1);
        fsm.advance(&inputs(ChargeState::C, true));
        assert_eq!(fsm.next_periodic_sample_at.is_some(), true);

        fsm.advance(&inputs(ChargeState::A, true));
        assert_eq!(fsm.status(), ConnectorStatus::Finishing);
        assert_eq!(fsm.next_periodic_sample_at, None);
    }

    #[test]
    fn try_release_matching_tag_ends_session_on_next_advance() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);

        let outcome = fsm.try_release("tag1", false);
        assert_eq!(outcome, Some(ReleaseOutcome::Released));
        assert!(!fsm.session().is_active());

        let action = fsm.advance(&inputs(ChargeState::B, true));
        assert_eq!(fsm.status(), ConnectorStatus::Finishing);
        assert_eq!(action, ConnectorAction::SendStopTransaction(StopReason::Local));
    }

    #[test]
    fn try_release_remote_ends_session_with_remote_stop_reason() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);

        let outcome = fsm.try_release("tag1", true);
        assert_eq!(outcome, Some(ReleaseOutcome::Released));

        let action = fsm.advance(&inputs(ChargeState::B, true));
        assert_eq!(fsm.status(), ConnectorStatus::Finishing);
        assert_eq!(action, ConnectorAction::SendStopTransaction(StopReason::Remote));
    }

    #[test]
    fn try_release_mismatched_tag_is_rejected() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::B, true));
        fsm.try_occupy("tag1", false, AuthorizationStatus::Accepted, false, true, true);

        let outcome = fsm.try_release("tag2", false);
        assert_eq!(outcome, Some(ReleaseOutcome::NotMatched));
        assert!(fsm.session().is_active());
    }

    #[test]
    fn try_release_with_no_active_session_is_none() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::A, true));
        assert_eq!(fsm.try_release("tag1", false), None);
    }

    #[test]
    fn faulted_input_forces_faulted_from_any_state() {
        let mut fsm = ConnectorFsm::new(1, Duration::from_secs(60));
        fsm.advance(&inputs(ChargeState::A, true));
        let mut bad = inputs(ChargeState::A, true);
        bad.faulted = true;
        fsm.advance(&bad);
        assert_eq!(fsm.status(), ConnectorStatus::Faulted);
    }
}
