//! Hardware abstraction traits and their simulated implementations.
//!
//! Real peripheral drivers (SPI/I²C/UART/PWM/GPIO) are out of scope for this
//! crate (spec §1) — only the trait boundary they plug into is defined here,
//! following the teacher's `Battery`/`Inverter`/`EvCharger` trait-plus-
//! simulated-impl shape (`hardware::factory::DeviceFactory`).

pub mod factory;
pub mod sim;

use async_trait::async_trait;

/// Samples the CP line's ADC. Returns raw millivolt readings (already
/// scaled by the driver from the 12-bit code and Vref) for one window.
#[async_trait]
pub trait PilotAdc: Send + Sync {
    async fn sample_window(&self, sample_count: usize) -> Vec<u16>;
}

/// A single PWM output channel, used both for the CP signal and for the
/// two-phase relay coil drive.
#[async_trait]
pub trait PwmChannel: Send + Sync {
    async fn set_duty_percent(&self, pct: u8);
    async fn start(&self);
    async fn stop(&self);
    async fn duty_percent(&self) -> u8;
}

/// Reads instantaneous electrical quantities from the meter IC.
#[async_trait]
pub trait MeterIc: Send + Sync {
    async fn read(&self) -> MeterReading;
    /// Monotonic lifetime energy register, used to derive meterStart/meterStop.
    async fn energy_wh_total(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeterReading {
    pub power_w: i32,
    pub current_ma: i32,
    pub voltage_mv: i32,
    pub power_factor_centi: i16,
    pub frequency_centi_hz: i16,
    pub temperature_centi_c: i16,
    pub soc_percent: Option<u8>,
}

/// A source of AC-derived falling-edge pulses for the safety monitor (C2).
/// `poll_falling_edges` drains timestamps (ms since an arbitrary epoch)
/// recorded since the last call — the simulated equivalent of an ISR
/// writing into a ring buffer.
#[async_trait]
pub trait SafetyPulseSource: Send + Sync {
    async fn poll_falling_edges(&self) -> Vec<u64>;
    async fn is_emergency_stop_asserted(&self) -> bool;
}

/// The two-position power relay contactor.
#[async_trait]
pub trait RelayContact: Send + Sync {
    async fn energize(&self);
    async fn de_energize(&self);
    async fn is_energized(&self) -> bool;
}
