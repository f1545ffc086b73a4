//! Pilot Processor (C1): ADC sampling, waveform reconstruction, A–F
//! classification and anomaly detection for the Control Pilot line.
//!
//! Grounded on `examples/original_source/src/pilot.c` and
//! `include/pilot.h`; see `SPEC_FULL.md` §4.1.

pub mod boundary;
pub mod waveform;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, instrument, warn};

pub use boundary::{Boundaries, PilotStatus};
use boundary::{classify, is_within_boundary};
use waveform::{process_window, Waveform};

use crate::hardware::{PilotAdc, PwmChannel};

/// 1 kHz CP period.
pub const CP_FREQ_HZ: u16 = 1000;
/// Internal waveform history retained for diagnostics/anomaly comparison.
pub const MAX_WAVEFORMS: usize = 3;
/// Pilot task watchdog budget (spec §4.1 "Concurrency").
pub const PILOT_WATCHDOG_MS: u64 = 500;
/// ADC reference voltage used for the 12-bit code → millivolt conversion;
/// the driver performs this conversion, the processor here only consumes
/// already-scaled millivolts (spec §4.1 step 1).
pub const DEFAULT_VREF_MV: u16 = 3300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PilotError {
    #[error("measured duty deviates from commanded duty by more than 1 point")]
    DutyMismatch,
    #[error("pilot excursion sits inside a hysteresis dead-band")]
    Fluctuating,
    #[error("no classified window published within 2x scan interval")]
    TooLongInterval,
    #[error("pilot parameters are invalid")]
    InvalidParams,
    #[error("pilot processor has not been enabled")]
    NotInitialized,
}

#[derive(Debug, Clone, Copy)]
pub struct PilotParams {
    pub scan_interval_ms: u16,
    pub cutoff_voltage_mv: u16,
    pub noise_tolerance_mv: u16,
    pub max_transition_clocks: u16,
    pub sample_count: u16,
    pub boundary: Boundaries,
}

impl Default for PilotParams {
    /// Reproduces `pilot_default_params()` exactly.
    fn default() -> Self {
        Self {
            scan_interval_ms: 10,
            cutoff_voltage_mv: 1996,
            noise_tolerance_mv: 50,
            max_transition_clocks: 15,
            sample_count: 500,
            boundary: Boundaries::default(),
        }
    }
}

/// One fully-published, immutable classified window. Readers always see a
/// complete `PilotWindow`; the processor swaps an `Arc` to publish the next
/// one rather than mutating fields in place (spec §3 "Waveform cache").
#[derive(Debug, Clone)]
pub struct PilotWindow {
    pub waveform: Waveform,
    pub status: PilotStatus,
    pub duty_measured: u8,
    pub published_at: Instant,
    pub anomaly: bool,
}

pub struct PilotProcessor {
    params: PilotParams,
    adc: Arc<dyn PilotAdc>,
    pwm: Arc<dyn PwmChannel>,
    duty_set: AtomicU8,
    latest: RwLock<Option<Arc<PilotWindow>>>,
    history: RwLock<VecDeque<Arc<PilotWindow>>>,
    status_tx: watch::Sender<Option<PilotStatus>>,
    last_publish: RwLock<Instant>,
}

impl PilotProcessor {
    pub fn new(params: PilotParams, adc: Arc<dyn PilotAdc>, pwm: Arc<dyn PwmChannel>) -> Self {
        let (status_tx, _rx) = watch::channel(None);
        Self {
            params,
            adc,
            pwm,
            duty_set: AtomicU8::new(0),
            latest: RwLock::new(None),
            history: RwLock::new(VecDeque::with_capacity(MAX_WAVEFORMS)),
            status_tx,
            last_publish: RwLock::new(Instant::now()),
        }
    }

    /// Subscribes to classification changes; mirrors `pilot_set_status_cb`
    /// as a typed channel rather than an untyped callback (spec §9).
    pub fn subscribe_status(&self) -> watch::Receiver<Option<PilotStatus>> {
        self.status_tx.subscribe()
    }

    pub async fn set_duty(&self, pct: u8) {
        self.duty_set.store(pct, Ordering::SeqCst);
        self.pwm.set_duty_percent(pct).await;
    }

    pub fn duty_set(&self) -> u8 {
        self.duty_set.load(Ordering::SeqCst)
    }

    pub async fn enable(&self) {
        self.pwm.start().await;
    }

    pub async fn disable(&self) {
        self.pwm.stop().await;
    }

    pub async fn latest_window(&self) -> Option<Arc<PilotWindow>> {
        self.latest.read().await.clone()
    }

    pub async fn status(&self) -> Option<PilotStatus> {
        self.latest_window().await.map(|w| w.status)
    }

    pub async fn measured_duty(&self) -> u8 {
        self.latest_window().await.map(|w| w.duty_measured).unwrap_or(0)
    }

    /// Runs one sampling/classification/publication cycle (spec §4.1
    /// "Algorithm per tick").
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), PilotError> {
        let samples = self.adc.sample_window(self.params.sample_count as usize).await;
        let wf = process_window(&samples, self.params.cutoff_voltage_mv, self.params.noise_tolerance_mv);

        let previous_status = self.status().await;
        let status = classify(wf.highs_max, wf.lows_min, &self.params.boundary, previous_status);
        let duty_measured = wf.duty_percent();

        let previous_highs_max = {
            let hist = self.history.read().await;
            hist.back().map(|w| w.waveform.highs_max)
        };
        let anomaly = previous_highs_max
            .map(|prev| {
                (wf.highs_max as i32 - prev as i32).unsigned_abs() as u16
                    > self.params.noise_tolerance_mv
            })
            .unwrap_or(false)
            || (wf.highs_outliers + wf.lows_outliers) >= self.params.max_transition_clocks;

        let window = Arc::new(PilotWindow {
            waveform: wf,
            status,
            duty_measured,
            published_at: Instant::now(),
            anomaly,
        });

        {
            let mut latest = self.latest.write().await;
            *latest = Some(window.clone());
        }
        {
            let mut hist = self.history.write().await;
            if hist.len() == MAX_WAVEFORMS {
                hist.pop_front();
            }
            hist.push_back(window.clone());
        }
        *self.last_publish.write().await = window.published_at;

        if previous_status != Some(status) {
            debug!(?previous_status, ?status, "pilot classification changed");
            let _ = self.status_tx.send(Some(status));
        }

        if anomaly {
            warn!(highs_outliers = window.waveform.highs_outliers, lows_outliers = window.waveform.lows_outliers, "pilot anomaly (metrics only)");
        }

        self.check_error(&window).await
    }

    /// Spec §4.1 "Error detection". Anomaly is metrics-only and never
    /// returned from here, matching the reference firmware's `check_error`.
    async fn check_error(&self, window: &PilotWindow) -> Result<(), PilotError> {
        let elapsed = window.published_at.elapsed();
        if elapsed > Duration::from_millis(2 * self.params.scan_interval_ms as u64) {
            return Err(PilotError::TooLongInterval);
        }
        let duty_set = self.duty_set();
        if (window.duty_measured as i16 - duty_set as i16).unsigned_abs() > 1 {
            return Err(PilotError::DutyMismatch);
        }
        if !is_within_boundary(window.waveform.highs_max, window.waveform.lows_min, &self.params.boundary) {
            return Err(PilotError::Fluctuating);
        }
        Ok(())
    }

    pub async fn ok(&self) -> bool {
        match self.latest_window().await {
            Some(w) => self.check_error(&w).await.is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimulatedPilotAdc, SimulatedPwm};

    fn make(adc: Arc<SimulatedPilotAdc>) -> PilotProcessor {
        PilotProcessor::new(PilotParams::default(), adc, Arc::new(SimulatedPwm::default()))
    }

    #[tokio::test]
    async fn classifies_state_a_when_cp_high_only() {
        let adc = Arc::new(SimulatedPilotAdc::new(3200, 3200, 100));
        let p = make(adc);
        p.tick().await.ok();
        assert_eq!(p.status().await, Some(PilotStatus::A));
    }

    #[tokio::test]
    async fn duty_mismatch_when_commanded_differs() {
        let adc = Arc::new(SimulatedPilotAdc::new(3200, 200, 50));
        let p = make(adc);
        p.set_duty(10).await;
        let err = p.tick().await.unwrap_err();
        assert_eq!(err, PilotError::DutyMismatch);
    }

    #[tokio::test]
    async fn ok_when_duty_matches_and_not_fluctuating() {
        let adc = Arc::new(SimulatedPilotAdc::new(3200, 200, 50));
        let p = make(adc);
        p.set_duty(50).await;
        p.tick().await.unwrap();
        assert!(p.ok().await);
    }

    #[tokio::test]
    async fn status_subscription_observes_change() {
        let adc = Arc::new(SimulatedPilotAdc::new(3200, 3200, 100));
        let p = make(adc.clone());
        let mut rx = p.subscribe_status();
        p.tick().await.ok();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(PilotStatus::A));
    }
}
