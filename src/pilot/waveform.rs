//! Per-window waveform reconstruction: bucketing, outlier removal, duty
//! calculation. Grounded on the reference firmware's `struct waveform` and
//! `remove_outliers`/`get_duty` in `pilot.c`.

/// Post-processed statistics for one classified CP sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Waveform {
    pub highs: u16,
    pub lows: u16,
    pub highs_outliers: u16,
    pub lows_outliers: u16,
    pub highs_max: u16,
    pub lows_min: u16,
}

impl Waveform {
    pub fn total_samples(&self) -> u32 {
        self.highs as u32 + self.lows as u32 + self.highs_outliers as u32 + self.lows_outliers as u32
    }

    /// `duty = round((highs_survivors + transitions/2) / total * 100)`, where
    /// `transitions` apportions half of each side's outliers to the PWM
    /// edge they straddle. Ties round half-up, matching the firmware's
    /// `(x*1000/total + 5) / 10` integer rounding.
    pub fn duty_percent(&self) -> u8 {
        let total = self.total_samples();
        if total == 0 {
            return 0;
        }
        let transitions = self.lows_outliers / 2 + self.highs_outliers / 2;
        let highs_eff = self.highs as u32 + transitions as u32;
        let permille = highs_eff * 1000 / total;
        (((permille + 5) / 10) as u8).min(100)
    }
}

fn mean(samples: &[u32]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    (samples.iter().sum::<u32>()) / samples.len() as u32
}

/// Integer standard deviation via Newton's method, matching the firmware's
/// `sqrt_u32`/`calculate_standard_deviation` (population stdev, truncating).
fn standard_deviation(samples: &[u32], avg: u32) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let variance: u64 = samples
        .iter()
        .map(|&x| {
            let d = x as i64 - avg as i64;
            (d * d) as u64
        })
        .sum::<u64>()
        / samples.len() as u64;
    sqrt_u64(variance)
}

fn sqrt_u64(value: u64) -> u32 {
    if value == 0 {
        return 0;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x as u32
}

/// Removes samples whose deviation from the bucket mean exceeds
/// `max(stdev, noise_tolerance_mv)`, returning the surviving count, the
/// outlier count, and the max (for highs) or min (for lows) of survivors.
fn remove_outliers(samples: &[u32], noise_tolerance_mv: u16, want_max: bool) -> (u16, u16, u16) {
    if samples.is_empty() {
        return (0, 0, 0);
    }
    let avg = mean(samples);
    let stdev = standard_deviation(samples, avg).max(noise_tolerance_mv as u32);

    let mut survivors = 0u16;
    let mut outliers = 0u16;
    let mut extreme: Option<u32> = None;

    for &x in samples {
        let dev = (x as i64 - avg as i64).unsigned_abs() as u32;
        if dev > stdev {
            outliers += 1;
            continue;
        }
        survivors += 1;
        extreme = Some(match extreme {
            None => x,
            Some(e) => {
                if want_max {
                    e.max(x)
                } else {
                    e.min(x)
                }
            }
        });
    }

    (survivors, outliers, extreme.unwrap_or(0) as u16)
}

/// Partitions a raw millivolt sample window into highs/lows by
/// `cutoff_voltage_mv` and reconstructs the classified waveform.
pub fn process_window(samples_mv: &[u16], cutoff_voltage_mv: u16, noise_tolerance_mv: u16) -> Waveform {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    for &mv in samples_mv {
        if mv > cutoff_voltage_mv {
            highs.push(mv as u32);
        } else {
            lows.push(mv as u32);
        }
    }

    let (highs_survivors, highs_outliers, highs_max) =
        remove_outliers(&highs, noise_tolerance_mv, true);
    let (lows_survivors, lows_outliers, lows_min) = remove_outliers(&lows, noise_tolerance_mv, false);

    Waveform {
        highs: highs_survivors,
        lows: lows_survivors,
        highs_outliers,
        lows_outliers,
        highs_max,
        lows_min,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_total_equals_sample_count() {
        let samples: Vec<u16> = (0..500u16)
            .map(|i| if i % 2 == 0 { 3000 } else { 200 })
            .collect();
        let w = process_window(&samples, 1996, 50);
        assert_eq!(w.total_samples(), 500);
    }

    #[test]
    fn duty_is_fifty_percent_for_even_split() {
        let samples: Vec<u16> = (0..500u16)
            .map(|i| if i % 2 == 0 { 3000 } else { 200 })
            .collect();
        let w = process_window(&samples, 1996, 50);
        assert_eq!(w.duty_percent(), 50);
    }

    #[test]
    fn duty_rounds_half_up() {
        // 255 highs / 500 total => 51.0% (not a tie, just checking scale).
        let mut samples = vec![3000u16; 255];
        samples.extend(vec![200u16; 245]);
        let w = process_window(&samples, 1996, 50);
        assert_eq!(w.duty_percent(), 51);
    }

    #[test]
    fn outliers_are_excluded_from_max() {
        let mut samples = vec![3000u16; 480];
        samples.extend(vec![200u16; 10]);
        // Inject spikes far outside the high cluster's stdev.
        samples.extend(vec![4000u16; 10]);
        let w = process_window(&samples, 1996, 50);
        assert!(w.highs_outliers >= 10);
        assert_eq!(w.highs_max, 3000);
    }

    #[test]
    fn sqrt_matches_known_values() {
        assert_eq!(sqrt_u64(0), 0);
        assert_eq!(sqrt_u64(4), 2);
        assert_eq!(sqrt_u64(100), 10);
        assert_eq!(sqrt_u64(99), 9);
    }
}
