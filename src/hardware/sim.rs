//! Simulated hardware backend — the only backend implemented in this tree
//! (spec §1 treats real peripheral drivers as external collaborators).
//! Grounded on the teacher's `SimulatedBattery`/`SimulatedEvCharger`
//! pattern: plain state behind a lock, mutated by test/harness code and
//! read back through the same trait the real driver would implement.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{MeterIc, MeterReading, PilotAdc, PwmChannel, RelayContact, SafetyPulseSource};

/// A fixed-voltage simulated CP line: every sample in the window reads the
/// same two levels (`high_mv` for the positive half of the duty cycle,
/// `low_mv` for the rest), proportioned by `duty_percent`. Tests mutate
/// `high_mv`/`low_mv` to walk the pilot through A..F.
pub struct SimulatedPilotAdc {
    pub high_mv: AtomicI32,
    pub low_mv: AtomicI32,
    pub duty_percent: AtomicU8,
}

impl SimulatedPilotAdc {
    pub fn new(high_mv: u16, low_mv: u16, duty_percent: u8) -> Self {
        Self {
            high_mv: AtomicI32::new(high_mv as i32),
            low_mv: AtomicI32::new(low_mv as i32),
            duty_percent: AtomicU8::new(duty_percent),
        }
    }

    pub fn set_levels(&self, high_mv: u16, low_mv: u16) {
        self.high_mv.store(high_mv as i32, Ordering::SeqCst);
        self.low_mv.store(low_mv as i32, Ordering::SeqCst);
    }

    pub fn set_duty(&self, duty_percent: u8) {
        self.duty_percent.store(duty_percent, Ordering::SeqCst);
    }
}

#[async_trait]
impl PilotAdc for SimulatedPilotAdc {
    async fn sample_window(&self, sample_count: usize) -> Vec<u16> {
        let high = self.high_mv.load(Ordering::SeqCst) as u16;
        let low = self.low_mv.load(Ordering::SeqCst) as u16;
        let duty = self.duty_percent.load(Ordering::SeqCst) as usize;
        let high_count = sample_count * duty / 100;
        let mut samples = Vec::with_capacity(sample_count);
        samples.extend(std::iter::repeat(high).take(high_count));
        samples.extend(std::iter::repeat(low).take(sample_count - high_count));
        samples
    }
}

#[derive(Default)]
pub struct SimulatedPwm {
    duty: AtomicU8,
    running: AtomicBool,
}

#[async_trait]
impl PwmChannel for SimulatedPwm {
    async fn set_duty_percent(&self, pct: u8) {
        self.duty.store(pct, Ordering::SeqCst);
    }

    async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.duty.store(0, Ordering::SeqCst);
    }

    async fn duty_percent(&self) -> u8 {
        if self.running.load(Ordering::SeqCst) {
            self.duty.load(Ordering::SeqCst)
        } else {
            0
        }
    }
}

pub struct SimulatedMeter {
    pub reading: Mutex<MeterReading>,
    pub energy_wh_total: AtomicU64,
}

impl Default for SimulatedMeter {
    fn default() -> Self {
        Self {
            reading: Mutex::new(MeterReading {
                power_w: 0,
                current_ma: 0,
                voltage_mv: 230_000,
                power_factor_centi: 100,
                frequency_centi_hz: 5000,
                temperature_centi_c: 2500,
                soc_percent: None,
            }),
            energy_wh_total: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl MeterIc for SimulatedMeter {
    async fn read(&self) -> MeterReading {
        *self.reading.lock().unwrap()
    }

    async fn energy_wh_total(&self) -> u64 {
        self.energy_wh_total.load(Ordering::SeqCst)
    }
}

/// Emits falling edges at a configurable frequency when `advance_ms` is
/// called by the test harness (there being no real clock interrupt in
/// simulation). `expected_freq_hz` drives the synthetic period.
pub struct SimulatedSafetyPulse {
    inner: Mutex<SimulatedSafetyPulseState>,
}

struct SimulatedSafetyPulseState {
    freq_hz: u16,
    now_ms: u64,
    next_edge_ms: u64,
    pending: Vec<u64>,
    emergency_stop: bool,
    pulse_enabled: bool,
}

impl SimulatedSafetyPulse {
    pub fn new(freq_hz: u16) -> Self {
        Self {
            inner: Mutex::new(SimulatedSafetyPulseState {
                freq_hz,
                now_ms: 0,
                next_edge_ms: 1000 / freq_hz as u64,
                pending: Vec::new(),
                emergency_stop: false,
                pulse_enabled: true,
            }),
        }
    }

    pub fn set_frequency(&self, freq_hz: u16) {
        self.inner.lock().unwrap().freq_hz = freq_hz;
    }

    pub fn set_pulse_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().pulse_enabled = enabled;
    }

    pub fn set_emergency_stop(&self, asserted: bool) {
        self.inner.lock().unwrap().emergency_stop = asserted;
    }

    /// Advances the simulated clock, generating a falling edge every
    /// `1000/freq_hz` ms while the pulse is enabled.
    pub fn advance_ms(&self, delta_ms: u64) {
        let mut state = self.inner.lock().unwrap();
        if !state.pulse_enabled {
            state.now_ms += delta_ms;
            return;
        }
        let target = state.now_ms + delta_ms;
        let period = (1000 / state.freq_hz as u64).max(1);
        while state.next_edge_ms <= target {
            let t = state.next_edge_ms;
            state.pending.push(t);
            state.next_edge_ms += period;
        }
        state.now_ms = target;
    }
}

#[async_trait]
impl SafetyPulseSource for SimulatedSafetyPulse {
    async fn poll_falling_edges(&self) -> Vec<u64> {
        let mut state = self.inner.lock().unwrap();
        std::mem::take(&mut state.pending)
    }

    async fn is_emergency_stop_asserted(&self) -> bool {
        self.inner.lock().unwrap().emergency_stop
    }
}

#[derive(Default)]
pub struct SimulatedRelay {
    energized: AtomicBool,
}

#[async_trait]
impl RelayContact for SimulatedRelay {
    async fn energize(&self) {
        self.energized.store(true, Ordering::SeqCst);
    }

    async fn de_energize(&self) {
        self.energized.store(false, Ordering::SeqCst);
    }

    async fn is_energized(&self) -> bool {
        self.energized.load(Ordering::SeqCst)
    }
}
