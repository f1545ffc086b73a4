//! Hardware backend selection, mirroring the teacher's
//! `DeviceFactory`/`HardwareMode` construction pattern.

use std::sync::Arc;

use super::sim::{SimulatedMeter, SimulatedPilotAdc, SimulatedPwm, SimulatedRelay, SimulatedSafetyPulse};
use super::{MeterIc, PilotAdc, PwmChannel, RelayContact, SafetyPulseSource};

/// Selects which hardware backend `HardwareFactory` instantiates. Only
/// `Simulated` is implemented in this tree; a real SPI/I2C/GPIO backend is
/// out of scope (spec §1) but would plug in as another variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvseHardwareMode {
    #[default]
    Simulated,
}

pub struct HardwareFactory {
    mode: EvseHardwareMode,
}

impl HardwareFactory {
    pub fn new(mode: EvseHardwareMode) -> Self {
        Self { mode }
    }

    pub fn create_pilot_adc(&self) -> Arc<dyn PilotAdc> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedPilotAdc::new(200, 200, 0)),
        }
    }

    pub fn create_pwm_channel(&self) -> Arc<dyn PwmChannel> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedPwm::default()),
        }
    }

    pub fn create_relay_coil_pwm(&self) -> Arc<dyn PwmChannel> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedPwm::default()),
        }
    }

    pub fn create_relay_contact(&self) -> Arc<dyn RelayContact> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedRelay::default()),
        }
    }

    pub fn create_meter(&self) -> Arc<dyn MeterIc> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedMeter::default()),
        }
    }

    pub fn create_safety_pulse_source(&self, expected_freq_hz: u16) -> Arc<dyn SafetyPulseSource> {
        match self.mode {
            EvseHardwareMode::Simulated => Arc::new(SimulatedSafetyPulse::new(expected_freq_hz)),
        }
    }
}

impl Default for HardwareFactory {
    fn default() -> Self {
        Self::new(EvseHardwareMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_creates_simulated_pilot_adc() {
        let factory = HardwareFactory::default();
        let adc = factory.create_pilot_adc();
        let samples = adc.sample_window(500).await;
        assert_eq!(samples.len(), 500);
    }

    #[tokio::test]
    async fn factory_creates_simulated_relay_off_by_default() {
        let factory = HardwareFactory::default();
        let relay = factory.create_relay_contact();
        assert!(!relay.is_energized().await);
    }
}
