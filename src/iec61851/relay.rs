//! Two-phase relay drive: pickup at high duty for a short window, then hold
//! at a lower duty. Grounded on `examples/original_source/src/relay.c`
//! (AZSR250-2AE-12D coil: 9 V pickup / 5 V hold over a 12 V rail).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::hardware::{PwmChannel, RelayContact};

pub const PICKUP_MIN_PCT: u8 = 75;
pub const PICKUP_DEFAULT_PCT: u8 = 85;
pub const PICKUP_MIN_DELAY_MS: u64 = 20;
pub const PICKUP_DEFAULT_DELAY_MS: u64 = 100;
pub const HOLD_MIN_PCT: u8 = 42;
pub const HOLD_DEFAULT_PCT: u8 = 52;

#[derive(Debug, Clone, Copy)]
pub struct RelayParams {
    pub pickup_pct: u8,
    pub pickup_delay_ms: u64,
    pub hold_pct: u8,
}

impl Default for RelayParams {
    fn default() -> Self {
        Self {
            pickup_pct: PICKUP_DEFAULT_PCT,
            pickup_delay_ms: PICKUP_DEFAULT_DELAY_MS,
            hold_pct: HOLD_DEFAULT_PCT,
        }
    }
}

/// Drives a relay coil through a pickup→hold duty sequence using a PWM
/// channel, plus a separate dry contact used only to model whether the
/// relay is physically energized (for invariant-checking in tests).
pub struct RelayDriver {
    coil_pwm: Arc<dyn PwmChannel>,
    contact: Arc<dyn RelayContact>,
    params: RelayParams,
    pickup_timer: Mutex<Option<JoinHandle<()>>>,
}

impl RelayDriver {
    pub fn new(coil_pwm: Arc<dyn PwmChannel>, contact: Arc<dyn RelayContact>, params: RelayParams) -> Self {
        Self {
            coil_pwm,
            contact,
            params,
            pickup_timer: Mutex::new(None),
        }
    }

    /// Starts the pickup phase at `max(pickup_pct, 75)` for
    /// `max(pickup_delay_ms, 20)` ms, then drops to `max(hold_pct, 42)`.
    pub async fn turn_on(self: &Arc<Self>) {
        let pickup_pct = self.params.pickup_pct.max(PICKUP_MIN_PCT);
        let pickup_delay_ms = self.params.pickup_delay_ms.max(PICKUP_MIN_DELAY_MS);
        let hold_pct = self.params.hold_pct.max(HOLD_MIN_PCT);

        self.coil_pwm.set_duty_percent(pickup_pct).await;
        self.coil_pwm.start().await;
        self.contact.energize().await;
        debug!(pickup_pct, pickup_delay_ms, "relay pickup phase started");

        self.cancel_pending_timer().await;

        let coil = self.coil_pwm.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(pickup_delay_ms)).await;
            coil.set_duty_percent(hold_pct).await;
            debug!(hold_pct, "relay hold phase engaged");
        });
        *self.pickup_timer.lock().await = Some(handle);
    }

    /// Immediately kills PWM and the one-shot timer; no transition delay.
    pub async fn turn_off(self: &Arc<Self>) {
        self.cancel_pending_timer().await;
        self.coil_pwm.stop().await;
        self.contact.de_energize().await;
        debug!("relay turned off");
    }

    async fn cancel_pending_timer(&self) {
        if let Some(handle) = self.pickup_timer.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn is_energized(&self) -> bool {
        self.contact.is_energized().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimulatedPwm, SimulatedRelay};

    #[tokio::test]
    async fn turn_on_starts_at_pickup_then_settles_to_hold() {
        let pwm = Arc::new(SimulatedPwm::default());
        let relay = Arc::new(SimulatedRelay::default());
        let driver = Arc::new(RelayDriver::new(
            pwm.clone(),
            relay,
            RelayParams { pickup_pct: 85, pickup_delay_ms: 20, hold_pct: 52 },
        ));

        driver.turn_on().await;
        assert_eq!(pwm.duty_percent().await, 85);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pwm.duty_percent().await, 52);
        assert!(driver.is_energized().await);
    }

    #[tokio::test]
    async fn turn_off_kills_pwm_immediately() {
        let pwm = Arc::new(SimulatedPwm::default());
        let relay = Arc::new(SimulatedRelay::default());
        let driver = Arc::new(RelayDriver::new(pwm.clone(), relay, RelayParams::default()));

        driver.turn_on().await;
        driver.turn_off().await;

        assert_eq!(pwm.duty_percent().await, 0);
        assert!(!driver.is_energized().await);
    }

    #[test]
    fn minimums_are_enforced_on_params_below_floor() {
        assert_eq!(PICKUP_MIN_PCT, 75);
        assert_eq!(HOLD_MIN_PCT, 42);
    }
}
