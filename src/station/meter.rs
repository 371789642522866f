//! Meter-value synthesis
//!
//! While a connector is charging, its accumulated energy advances by
//! `rate_W · elapsed_s / 3600` between samples; with randomization enabled
//! each sample is perturbed by a relative variance factor.

use rand::Rng;

/// Energy delivered over `elapsed_secs` at `rate_w`, in Wh.
pub fn energy_delta_wh(rate_w: f64, elapsed_secs: f64) -> f64 {
    rate_w * elapsed_secs / 3600.0
}

/// Simulates one connector's meter.
#[derive(Debug, Clone)]
pub struct MeterSimulator {
    pub rate_w: f64,
    pub randomize: bool,
    /// Relative variance per sample (0.05 = ±5%)
    pub variance: f64,
}

impl MeterSimulator {
    pub fn new(rate_w: f64, randomize: bool, variance: f64) -> Self {
        Self {
            rate_w,
            randomize,
            variance,
        }
    }

    /// Wh delivered in one sample window.
    pub fn sample(&self, elapsed_secs: f64, rng: &mut impl Rng) -> f64 {
        let delta = energy_delta_wh(self.rate_w, elapsed_secs);
        if self.randomize && self.variance > 0.0 {
            let factor = 1.0 + rng.gen_range(-self.variance..=self.variance);
            delta * factor
        } else {
            delta
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_matches_rate_times_time() {
        // 7200 W for 10 s → 20 Wh
        assert!((energy_delta_wh(7_200.0, 10.0) - 20.0).abs() < f64::EPSILON);
        // 11 kW for an hour → 11 kWh
        assert!((energy_delta_wh(11_000.0, 3_600.0) - 11_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sixty_second_window_accumulates_within_tolerance() {
        // Scenario: 7200 W, 10 s sample interval, 60 s window → 6 samples,
        // cumulative delta 120 Wh ±10% even with randomization.
        let meter = MeterSimulator::new(7_200.0, true, 0.05);
        let mut rng = rand::thread_rng();
        let total: f64 = (0..6).map(|_| meter.sample(10.0, &mut rng)).sum();
        assert!(total > 108.0 && total < 132.0, "total = {}", total);
    }

    #[test]
    fn deterministic_without_randomization() {
        let meter = MeterSimulator::new(7_200.0, false, 0.5);
        let mut rng = rand::thread_rng();
        assert_eq!(meter.sample(10.0, &mut rng), 20.0);
        assert_eq!(meter.sample(10.0, &mut rng), 20.0);
    }

    #[test]
    fn perturbation_bounded_by_variance() {
        let meter = MeterSimulator::new(1_000.0, true, 0.1);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let sample = meter.sample(3_600.0, &mut rng);
            assert!(sample >= 900.0 - 1e-9 && sample <= 1_100.0 + 1e-9);
        }
    }
}
