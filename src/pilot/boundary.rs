//! Pilot classification boundary tables and hysteresis helpers.
//!
//! Default values reproduced from the reference firmware's
//! `pilot_default_params()`, in millivolts after the ADC-to-mv conversion.

use serde::{Deserialize, Serialize};

/// One direction's set of state thresholds, in millivolts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    pub a: u16,
    pub b: u16,
    pub c: u16,
    pub d: u16,
    pub e: u16,
}

/// Rising (`upward`) and falling (`downward`) boundary tables used for
/// hysteresis classification of the CP high excursion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    pub upward: Boundary,
    pub downward: Boundary,
}

impl Default for Boundaries {
    fn default() -> Self {
        Self {
            upward: Boundary {
                a: 3038,
                b: 2718,
                c: 2397,
                d: 2076,
                e: 767,
            },
            downward: Boundary {
                a: 2985,
                b: 2644,
                c: 2344,
                d: 2022,
                e: 767,
            },
        }
    }
}

/// A1–F mapping for a single evaluation (without the diode-fault `E`
/// override, which is applied separately against `lows_min`).
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PilotStatus {
    F = -12,
    E = 0,
    D = 3,
    C = 6,
    B = 9,
    A = 12,
}

impl PilotStatus {
    pub fn stringify(self) -> &'static str {
        match self {
            PilotStatus::A => "A",
            PilotStatus::B => "B",
            PilotStatus::C => "C",
            PilotStatus::D => "D",
            PilotStatus::E => "E",
            PilotStatus::F => "F",
        }
    }
}

impl std::fmt::Display for PilotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stringify())
    }
}

/// Evaluates `highs_max` against one boundary table: A,B,C,D by descending
/// threshold, F if below all of them. The diode-fault `E` override is
/// applied by the caller against `lows_min`, never by this function.
fn evaluate_high(highs_max: u16, table: &Boundary) -> PilotStatus {
    if highs_max > table.a {
        PilotStatus::A
    } else if highs_max > table.b {
        PilotStatus::B
    } else if highs_max > table.c {
        PilotStatus::C
    } else if highs_max > table.d {
        PilotStatus::D
    } else {
        PilotStatus::F
    }
}

/// Classifies a window, applying hysteresis against the previous status and
/// the diode-fault override against `lows_min`.
///
/// On a rising move (new downward-evaluated status > previous), the
/// classification is re-evaluated against `upward` instead, so that a
/// momentary undershoot during a PWM transition does not cause chatter.
pub fn classify(
    highs_max: u16,
    lows_min: u16,
    boundaries: &Boundaries,
    previous: Option<PilotStatus>,
) -> PilotStatus {
    let mut status = evaluate_high(highs_max, &boundaries.downward);

    if let Some(prev) = previous {
        if status > prev {
            status = evaluate_high(highs_max, &boundaries.upward);
        }
    }

    if lows_min > boundaries.upward.e {
        status = PilotStatus::E;
    }

    status
}

/// True if `mv` falls strictly between a table's upward and downward
/// threshold for any of a/b/c/d — a hysteresis dead-band where the signal
/// is ambiguous and should be reported as fluctuating rather than silently
/// rounded to one side.
fn in_any_deadband(mv: u16, boundaries: &Boundaries) -> bool {
    let pairs = [
        (boundaries.upward.a, boundaries.downward.a),
        (boundaries.upward.b, boundaries.downward.b),
        (boundaries.upward.c, boundaries.downward.c),
        (boundaries.upward.d, boundaries.downward.d),
    ];
    pairs.into_iter().any(|(up, down)| {
        let (lo, hi) = if down < up { (down, up) } else { (up, down) };
        mv > lo && mv < hi
    })
}

/// Returns `false` ("fluctuating") when either excursion sits in a
/// hysteresis dead-band; `e` is deliberately excluded per the reference
/// firmware (a diode fault is not a fluctuation, it is classified outright).
pub fn is_within_boundary(highs_max: u16, lows_min: u16, boundaries: &Boundaries) -> bool {
    !in_any_deadband(highs_max, boundaries) && !in_any_deadband(lows_min, boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_state_a_above_threshold() {
        let b = Boundaries::default();
        assert_eq!(classify(3100, 100, &b, None), PilotStatus::A);
    }

    #[test]
    fn classifies_state_f_below_all_thresholds() {
        let b = Boundaries::default();
        assert_eq!(classify(100, 100, &b, None), PilotStatus::F);
    }

    #[test]
    fn diode_fault_overrides_to_e() {
        let b = Boundaries::default();
        assert_eq!(classify(3100, 900, &b, Some(PilotStatus::A)), PilotStatus::E);
    }

    #[test]
    fn hysteresis_prefers_downward_table_when_not_rising() {
        let b = Boundaries::default();
        // Exactly at upward.b: downward-evaluated from B-ish previous stays B
        // (since downward.b < upward.b, a value of upward.b is still > downward.b).
        let highs_max = b.upward.b;
        let status = classify(highs_max, 100, &b, Some(PilotStatus::B));
        assert_eq!(status, PilotStatus::B);
    }

    #[test]
    fn hysteresis_reevaluates_upward_on_rising_move() {
        let b = Boundaries::default();
        // A value between downward.a and upward.a reads as A on the downward
        // table (since downward.a < upward.a means downward is stricter-from-below);
        // check actual boundary relation used here with the real defaults.
        let highs_max = b.downward.a + 1; // just above downward.a
        let below_upward = highs_max <= b.upward.a;
        assert!(below_upward);
        // From a B-ish previous state, downward table already reports A here
        // (since highs_max > downward.a), so no re-evaluation differs yet;
        // the interesting case is when downward reports a *lower* state than
        // upward would for a value between the two thresholds.
        let mid = b.downward.b + 1;
        assert!(mid <= b.upward.b);
        // downward-evaluated status for `mid`, given it's above downward.b.
        let downward_status = evaluate_high(mid, &b.downward);
        let status = classify(mid, 100, &b, Some(PilotStatus::C));
        if downward_status > PilotStatus::C {
            // rising move triggers re-evaluation against upward
            assert_eq!(status, evaluate_high(mid, &b.upward));
        } else {
            assert_eq!(status, downward_status);
        }
    }

    #[test]
    fn within_boundary_true_outside_deadbands() {
        let b = Boundaries::default();
        assert!(is_within_boundary(3100, 100, &b));
    }

    #[test]
    fn within_boundary_false_in_deadband() {
        let b = Boundaries::default();
        let mid = (b.upward.a + b.downward.a) / 2;
        assert!(!is_within_boundary(mid, 100, &b));
    }
}
