//! IEC 61851-1 charging state machine (C3): states A–F, driven by the
//! classified Control Pilot status from the Pilot Processor (C1).
//!
//! Grounded on `examples/original_source/src/charger/free/fsm.c` and
//! `include/charger.h`; see `SPEC_FULL.md` §4.2.

pub mod current;
pub mod relay;

use std::fmt;
use std::time::Duration;

use tracing::{info, instrument, warn};

pub use crate::pilot::PilotStatus;

/// Time the charger holds in the post-connect settle window before it will
/// honor a transition away from state A. Spec §9 resolves this as an EVSE
/// implementation choice layered on top of IEC 61851-1's unrelated 6 s EV
/// response timeout — not itself a value the standard mandates.
pub const INITIAL_STABILIZATION_SEC: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargeState {
    /// Standby: no vehicle connected.
    A,
    /// Vehicle connected, not ready to charge.
    B,
    /// Vehicle connected and ready, ventilation not required.
    C,
    /// Vehicle connected and ready, ventilation required.
    D,
    /// Vehicle present but pilot fault (diode or level fault).
    E,
    /// EVSE-side fault or unexpected transition; requires explicit recovery.
    F,
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            ChargeState::A => 'A',
            ChargeState::B => 'B',
            ChargeState::C => 'C',
            ChargeState::D => 'D',
            ChargeState::E => 'E',
            ChargeState::F => 'F',
        };
        write!(f, "{c}")
    }
}

/// Side effect the caller must carry out after a transition. The FSM itself
/// never touches PWM or the relay directly — it returns the action and the
/// task driving it (see `SPEC_FULL.md` §5) performs it against the
/// `PilotProcessor` and `RelayDriver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeAction {
    None,
    StopPwm,
    StartPwm,
    SupplyPower,
    StopPower,
    StopAll,
    /// Transition observed was not one any defined edge permits.
    Unexpected,
    /// EVSE hardware raised a fault (safety monitor, pilot `TooLongInterval`,
    /// relay feedback mismatch, etc).
    EvseError,
    /// Vehicle-side pilot fault (diode fault, or CP held at an invalid
    /// level long enough to classify as E from a prior non-E state).
    EvError,
}

fn charge_state_from_pilot(status: PilotStatus) -> ChargeState {
    match status {
        PilotStatus::A => ChargeState::A,
        PilotStatus::B => ChargeState::B,
        PilotStatus::C => ChargeState::C,
        PilotStatus::D => ChargeState::D,
        PilotStatus::E => ChargeState::E,
        PilotStatus::F => ChargeState::F,
    }
}

/// The charging state machine itself. Holds only the current `ChargeState`;
/// all timing/voltage classification lives upstream in the Pilot Processor.
pub struct ChargeStateMachine {
    state: ChargeState,
}

impl Default for ChargeStateMachine {
    /// Boots in `E`, matching the reference firmware's `fsm_init()` — the
    /// pilot line hasn't been sampled yet, so "no vehicle" can't be asserted
    /// until the first tick observes `A` and the initial-settle edge fires.
    fn default() -> Self {
        Self { state: ChargeState::E }
    }
}

impl ChargeStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChargeState {
        self.state
    }

    /// True once the EVSE-side fault that put the machine into F has been
    /// cleared — an explicit `evse_error`-raising condition is no longer
    /// true and the pilot is back reading a valid level.
    fn is_recovered(pilot_fault_cleared: bool, observed: PilotStatus) -> bool {
        pilot_fault_cleared && observed != PilotStatus::F
    }

    /// A transition is an EVSE-side error when the EVSE itself detected a
    /// fault condition (safety monitor trip, relay mismatch, watchdog) — as
    /// opposed to the vehicle presenting an invalid pilot level, which is an
    /// `EvError` instead. `evse_fault` is pushed in by the caller from C2/C9.
    fn is_evse_error(evse_fault: bool) -> bool {
        evse_fault
    }

    /// Advances the FSM given the latest classified pilot status. Returns
    /// the action the caller must perform. Mirrors `fsm_run()`'s per-state
    /// switch in the reference firmware.
    #[instrument(skip(self))]
    pub fn advance(&mut self, observed: PilotStatus, evse_fault: bool, pilot_fault_cleared: bool) -> ChargeAction {
        let observed_state = charge_state_from_pilot(observed);
        let (next, action) = match self.state {
            ChargeState::A => match observed_state {
                ChargeState::A => (ChargeState::A, ChargeAction::None),
                ChargeState::B => (ChargeState::B, ChargeAction::StartPwm),
                ChargeState::C | ChargeState::D | ChargeState::E => (ChargeState::F, ChargeAction::Unexpected),
                ChargeState::F => (ChargeState::F, ChargeAction::EvseError),
            },
            ChargeState::B => match observed_state {
                ChargeState::A => (ChargeState::A, ChargeAction::StopPwm),
                ChargeState::B => (ChargeState::B, ChargeAction::None),
                ChargeState::C => (ChargeState::C, ChargeAction::SupplyPower),
                ChargeState::D => (ChargeState::D, ChargeAction::SupplyPower),
                ChargeState::E => (ChargeState::F, ChargeAction::EvError),
                ChargeState::F => (ChargeState::F, ChargeAction::EvseError),
            },
            ChargeState::C => match observed_state {
                ChargeState::A => (ChargeState::A, ChargeAction::StopAll),
                ChargeState::B => (ChargeState::B, ChargeAction::StopPower),
                ChargeState::C => (ChargeState::C, ChargeAction::None),
                ChargeState::D => (ChargeState::D, ChargeAction::None),
                ChargeState::E => (ChargeState::F, ChargeAction::EvError),
                ChargeState::F => (ChargeState::F, ChargeAction::EvseError),
            },
            ChargeState::D => match observed_state {
                ChargeState::A => (ChargeState::A, ChargeAction::StopAll),
                ChargeState::B => (ChargeState::B, ChargeAction::StopPower),
                ChargeState::C => (ChargeState::C, ChargeAction::None),
                ChargeState::D => (ChargeState::D, ChargeAction::None),
                ChargeState::E => (ChargeState::F, ChargeAction::EvError),
                ChargeState::F => (ChargeState::F, ChargeAction::EvseError),
            },
            ChargeState::E => {
                if observed_state == ChargeState::A {
                    (ChargeState::A, ChargeAction::StopPwm)
                } else {
                    (ChargeState::F, ChargeAction::Unexpected)
                }
            }
            ChargeState::F => {
                if Self::is_recovered(pilot_fault_cleared, observed) {
                    (ChargeState::A, ChargeAction::StopPwm)
                } else {
                    (ChargeState::F, ChargeAction::Unexpected)
                }
            }
        };

        let (next, action) = if Self::is_evse_error(evse_fault) && next != ChargeState::F {
            (ChargeState::F, ChargeAction::EvseError)
        } else {
            (next, action)
        };

        if next != self.state {
            info!(from = %self.state, to = %next, ?action, "charge state transition");
        }
        if action == ChargeAction::Unexpected {
            warn!(state = %self.state, ?observed_state, "unexpected pilot transition forced to F");
        }
        self.state = next;
        action
    }
}

/// Per-connector "still connected" grace window used by the task driving
/// the FSM to debounce a bounce through an intermediate level during plug
/// insertion/removal (spec §4.2 "Edge cases").
pub fn initial_stabilization() -> Duration {
    Duration::from_secs(INITIAL_STABILIZATION_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A freshly-booted machine sits in `E` until the first pilot sample
    /// confirms "no vehicle" (spec §4.2's initial-settle edge); tests that
    /// exercise the A/B/C/D/F edges settle through that edge first.
    fn settled() -> ChargeStateMachine {
        let mut fsm = ChargeStateMachine::new();
        assert_eq!(fsm.state(), ChargeState::E);
        let action = fsm.advance(PilotStatus::A, false, false);
        assert_eq!(fsm.state(), ChargeState::A);
        assert_eq!(action, ChargeAction::StopPwm);
        fsm
    }

    #[test]
    fn boots_in_e_and_settles_to_a() {
        let fsm = settled();
        assert_eq!(fsm.state(), ChargeState::A);
    }

    #[test]
    fn a_to_b_starts_pwm() {
        let mut fsm = settled();
        let action = fsm.advance(PilotStatus::B, false, false);
        assert_eq!(fsm.state(), ChargeState::B);
        assert_eq!(action, ChargeAction::StartPwm);
    }

    #[test]
    fn b_to_c_supplies_power() {
        let mut fsm = settled();
        fsm.advance(PilotStatus::B, false, false);
        let action = fsm.advance(PilotStatus::C, false, false);
        assert_eq!(fsm.state(), ChargeState::C);
        assert_eq!(action, ChargeAction::SupplyPower);
    }

    #[test]
    fn c_back_to_a_stops_all() {
        let mut fsm = settled();
        fsm.advance(PilotStatus::B, false, false);
        fsm.advance(PilotStatus::C, false, false);
        let action = fsm.advance(PilotStatus::A, false, false);
        assert_eq!(fsm.state(), ChargeState::A);
        assert_eq!(action, ChargeAction::StopAll);
    }

    #[test]
    fn unexpected_jump_from_a_to_c_forces_f() {
        let mut fsm = settled();
        let action = fsm.advance(PilotStatus::C, false, false);
        assert_eq!(fsm.state(), ChargeState::F);
        assert_eq!(action, ChargeAction::Unexpected);
    }

    #[test]
    fn charging_to_e_is_ev_error() {
        let mut fsm = settled();
        fsm.advance(PilotStatus::B, false, false);
        fsm.advance(PilotStatus::C, false, false);
        let action = fsm.advance(PilotStatus::E, false, false);
        assert_eq!(fsm.state(), ChargeState::F);
        assert_eq!(action, ChargeAction::EvError);
    }

    #[test]
    fn evse_fault_forces_f_from_any_state() {
        let mut fsm = settled();
        fsm.advance(PilotStatus::B, false, false);
        let action = fsm.advance(PilotStatus::C, true, false);
        assert_eq!(fsm.state(), ChargeState::F);
        assert_eq!(action, ChargeAction::EvseError);
    }

    #[test]
    fn f_recovers_to_a_only_when_cleared_and_not_f() {
        let mut fsm = settled();
        fsm.advance(PilotStatus::C, false, false);
        assert_eq!(fsm.state(), ChargeState::F);

        let stuck = fsm.advance(PilotStatus::A, false, false);
        assert_eq!(fsm.state(), ChargeState::F);
        assert_eq!(stuck, ChargeAction::Unexpected);

        let recovered = fsm.advance(PilotStatus::A, false, true);
        assert_eq!(fsm.state(), ChargeState::A);
        assert_eq!(recovered, ChargeAction::StopPwm);
    }

    #[test]
    fn stabilization_window_matches_constant() {
        assert_eq!(initial_stabilization(), Duration::from_secs(INITIAL_STABILIZATION_SEC));
    }
}
