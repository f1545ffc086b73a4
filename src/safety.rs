//! Safety Monitor (C2): AC zero-cross frequency measurement and an
//! independent emergency-stop latch. Grounded on
//! `examples/original_source/src/safety/power_safety.c`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::warn;

use crate::hardware::SafetyPulseSource;

pub const DEBOUNCE_DURATION_MS: u64 = 8;
pub const FREQUENCY_TOLERANCE_HZ: u16 = 3;
pub const MAX_SAMPLES: usize = 60;
pub const UPTODATE_DUE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Ok,
    Stale,
    SamplingError,
    AbnormalFrequency,
    EmergencyStop,
}

struct FrequencyStats {
    min_hz: u16,
    max_hz: u16,
    avg_hz: u16,
    sample_count: usize,
    computed_at: Instant,
}

/// One monitored AC-derived pulse line (input power or output power).
pub struct SafetyMonitor {
    source: std::sync::Arc<dyn SafetyPulseSource>,
    expected_freq_hz: u16,
    edges: RwLock<VecDeque<u64>>,
    last_edge_wall: RwLock<Option<Instant>>,
    stats: RwLock<Option<FrequencyStats>>,
    emergency_stop_latched: std::sync::atomic::AtomicBool,
}

impl SafetyMonitor {
    pub fn new(source: std::sync::Arc<dyn SafetyPulseSource>, expected_freq_hz: u16) -> Self {
        Self {
            source,
            expected_freq_hz,
            edges: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            last_edge_wall: RwLock::new(None),
            stats: RwLock::new(None),
            emergency_stop_latched: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Drains newly observed falling edges into the ring buffer, coalescing
    /// edges closer together than `DEBOUNCE_DURATION_MS` as debounce noise.
    pub async fn poll(&self) {
        if self.source.is_emergency_stop_asserted().await {
            self.emergency_stop_latched.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        let new_edges = self.source.poll_falling_edges().await;
        if new_edges.is_empty() {
            return;
        }

        let mut edges = self.edges.write().await;
        for edge_ms in new_edges {
            if let Some(&last) = edges.back() {
                if edge_ms.saturating_sub(last) < DEBOUNCE_DURATION_MS {
                    continue;
                }
            }
            edges.push_back(edge_ms);
            if edges.len() > MAX_SAMPLES {
                edges.pop_front();
            }
        }
        *self.last_edge_wall.write().await = Some(Instant::now());
    }

    /// Recomputes min/avg/max frequency over the ring buffer. Intended to
    /// run on a 1 s period, matching the reference firmware's periodic task.
    pub async fn recompute(&self) {
        let edges = self.edges.read().await;
        if edges.len() < 2 {
            return;
        }

        let mut diffs = Vec::with_capacity(edges.len() - 1);
        for pair in edges.iter().collect::<Vec<_>>().windows(2) {
            let diff = pair[1].saturating_sub(*pair[0]);
            if diff > 0 {
                diffs.push(diff);
            }
        }
        drop(edges);

        if diffs.is_empty() {
            return;
        }

        let freqs: Vec<u16> = diffs.iter().map(|&d| (1000 / d.max(1)) as u16).collect();
        let min_hz = *freqs.iter().min().unwrap();
        let max_hz = *freqs.iter().max().unwrap();
        let sum: u32 = freqs.iter().map(|&f| f as u32).sum();
        let avg_hz = ((sum * 2 + freqs.len() as u32) / (2 * freqs.len() as u32)) as u16;

        *self.stats.write().await = Some(FrequencyStats {
            min_hz,
            max_hz,
            avg_hz,
            sample_count: freqs.len(),
            computed_at: Instant::now(),
        });
    }

    async fn is_pulse_active(&self) -> bool {
        match *self.last_edge_wall.read().await {
            Some(t) => t.elapsed() <= Duration::from_millis(UPTODATE_DUE_MS),
            None => false,
        }
    }

    async fn is_uptodate(&self) -> bool {
        match &*self.stats.read().await {
            Some(s) => s.computed_at.elapsed() <= Duration::from_millis(UPTODATE_DUE_MS * 2),
            None => false,
        }
    }

    /// Priority order per §4.2: emergency stop, then staleness, then
    /// sampling error, then out-of-tolerance frequency, else OK.
    pub async fn check(&self) -> SafetyVerdict {
        if self.emergency_stop_latched.load(std::sync::atomic::Ordering::SeqCst) {
            return SafetyVerdict::EmergencyStop;
        }
        if !self.is_pulse_active().await || !self.is_uptodate().await {
            return SafetyVerdict::Stale;
        }

        let stats = self.stats.read().await;
        let stats = match &*stats {
            Some(s) => s,
            None => return SafetyVerdict::Stale,
        };

        if MAX_SAMPLES.saturating_sub(stats.sample_count) > FREQUENCY_TOLERANCE_HZ as usize {
            return SafetyVerdict::SamplingError;
        }

        let tolerance = FREQUENCY_TOLERANCE_HZ;
        let lo = self.expected_freq_hz.saturating_sub(tolerance);
        let hi = self.expected_freq_hz + tolerance;
        if stats.avg_hz < lo || stats.avg_hz > hi || stats.min_hz < lo || stats.max_hz > hi {
            warn!(avg_hz = stats.avg_hz, min_hz = stats.min_hz, max_hz = stats.max_hz, "frequency out of tolerance");
            return SafetyVerdict::AbnormalFrequency;
        }

        SafetyVerdict::Ok
    }

    pub async fn measured_frequency_hz(&self) -> Option<u16> {
        self.stats.read().await.as_ref().map(|s| s.avg_hz)
    }

    /// Cleared only by an explicit resume, never by `check()` alone.
    pub fn resume(&self) {
        self.emergency_stop_latched.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimulatedSafetyPulse;
    use std::sync::Arc;

    async fn settled_monitor(freq_hz: u16) -> SafetyMonitor {
        let pulse = Arc::new(SimulatedSafetyPulse::new(freq_hz));
        let monitor = SafetyMonitor::new(pulse.clone(), freq_hz);
        pulse.advance_ms(1200);
        monitor.poll().await;
        monitor.recompute().await;
        monitor
    }

    #[tokio::test]
    async fn reports_ok_at_expected_frequency() {
        let monitor = settled_monitor(60).await;
        assert_eq!(monitor.check().await, SafetyVerdict::Ok);
    }

    #[tokio::test]
    async fn reports_abnormal_frequency_outside_tolerance() {
        let pulse = Arc::new(SimulatedSafetyPulse::new(50));
        let monitor = SafetyMonitor::new(pulse.clone(), 60);
        pulse.advance_ms(1200);
        monitor.poll().await;
        monitor.recompute().await;
        assert_eq!(monitor.check().await, SafetyVerdict::AbnormalFrequency);
    }

    #[tokio::test]
    async fn reports_stale_with_no_samples() {
        let pulse = Arc::new(SimulatedSafetyPulse::new(60));
        let monitor = SafetyMonitor::new(pulse, 60);
        assert_eq!(monitor.check().await, SafetyVerdict::Stale);
    }

    #[tokio::test]
    async fn emergency_stop_latches_until_resume() {
        let pulse = Arc::new(SimulatedSafetyPulse::new(60));
        let monitor = SafetyMonitor::new(pulse.clone(), 60);
        pulse.set_emergency_stop(true);
        monitor.poll().await;
        assert_eq!(monitor.check().await, SafetyVerdict::EmergencyStop);

        pulse.set_emergency_stop(false);
        monitor.poll().await;
        assert_eq!(monitor.check().await, SafetyVerdict::EmergencyStop);

        monitor.resume();
        monitor.poll().await;
        assert_ne!(monitor.check().await, SafetyVerdict::EmergencyStop);
    }
}
