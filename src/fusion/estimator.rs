/// GPS-corrected accel integration (first-order complementary filter).
///
/// Accel predicts speed between absolute fixes (responsive); each absolute
/// fix pulls the estimate back toward truth (accurate). Velocity never goes
/// below zero; reverse travel is not modeled.
pub struct SpeedEstimator {
    v_mps: f64,
    last_accel_ns: Option<u64>,

    accel_trust: f64,
    accel_deadband_mps2: f64,
    accel_clamp_mps2: f64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::with_tuning(0.85, 0.08, 6.0)
    }

    /// `accel_trust` weights the integrated path in the blend (0.75-0.9
    /// typical); the deadband suppresses bias-noise creep and the clamp
    /// rejects spikes from bumps and phone handling.
    pub fn with_tuning(accel_trust: f64, accel_deadband_mps2: f64, accel_clamp_mps2: f64) -> Self {
        SpeedEstimator {
            v_mps: 0.0,
            last_accel_ns: None,
            accel_trust,
            accel_deadband_mps2,
            accel_clamp_mps2,
        }
    }

    pub fn reset_to_zero(&mut self) {
        self.v_mps = 0.0;
        self.last_accel_ns = None;
    }

    /// Integrate a forward-acceleration sample. The first call only records
    /// the timestamp baseline. A non-positive or stale delta (`dt > 0.5 s`)
    /// skips the integration but still advances the baseline so the next
    /// delta is measured from now; `dt == 0.5` exactly still integrates.
    pub fn on_accel(&mut self, forward_acc_mps2: f64, timestamp_ns: u64) -> f64 {
        let last = match self.last_accel_ns.replace(timestamp_ns) {
            Some(last) => last,
            None => return self.v_mps,
        };

        let dt = (timestamp_ns as f64 - last as f64) / 1_000_000_000.0;
        if dt <= 0.0 || dt > 0.5 {
            return self.v_mps;
        }

        let mut a = forward_acc_mps2;
        if a.abs() < self.accel_deadband_mps2 {
            a = 0.0;
        }
        a = a.clamp(-self.accel_clamp_mps2, self.accel_clamp_mps2);

        self.v_mps = (self.v_mps + a * dt).max(0.0);
        self.v_mps
    }

    /// Blend in an absolute speed observation. Negative inputs are clamped
    /// to zero before blending.
    pub fn on_absolute(&mut self, speed_mps: f64) -> f64 {
        let abs = speed_mps.max(0.0);
        self.v_mps = self.accel_trust * self.v_mps + (1.0 - self.accel_trust) * abs;
        self.v_mps
    }

    pub fn speed_mps(&self) -> f64 {
        self.v_mps
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const NS: u64 = 1_000_000_000;

    #[test]
    fn test_first_sample_only_sets_baseline() {
        let mut est = SpeedEstimator::new();
        assert_eq!(est.on_accel(3.0, NS), 0.0);
        // Second sample integrates against the recorded baseline
        assert_relative_eq!(est.on_accel(3.0, NS + NS / 10), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_velocity_never_negative() {
        let mut est = SpeedEstimator::new();
        est.on_accel(0.0, NS);
        for i in 1..50 {
            let v = est.on_accel(-5.0, NS + i * NS / 10);
            assert!(v >= 0.0);
        }
        assert_eq!(est.speed_mps(), 0.0);

        est.on_absolute(-10.0);
        assert!(est.speed_mps() >= 0.0);
    }

    #[test]
    fn test_deadband_produces_no_change() {
        let mut est = SpeedEstimator::new();
        est.on_absolute(10.0); // seed a nonzero velocity
        let before = est.speed_mps();

        est.on_accel(0.07, NS);
        est.on_accel(0.07, NS + NS / 10);
        est.on_accel(-0.079, NS + 2 * NS / 10);
        assert_relative_eq!(est.speed_mps(), before);
    }

    #[test]
    fn test_clamp_bounds_spike() {
        let mut est = SpeedEstimator::new();
        est.on_accel(0.0, NS);
        // 100 m/s^2 over 0.1 s changes velocity by at most 6.0 * 0.1
        est.on_accel(100.0, NS + NS / 10);
        assert_relative_eq!(est.speed_mps(), 0.6, epsilon = 1e-9);
    }

    #[test]
    fn test_stale_gap_skips_but_advances_baseline() {
        let mut est = SpeedEstimator::new();
        est.on_accel(2.0, NS);

        // dt = 0.6 s: skipped entirely
        let v = est.on_accel(2.0, NS + 6 * NS / 10);
        assert_eq!(v, 0.0);

        // baseline advanced, so the next 0.1 s delta integrates normally
        let v = est.on_accel(2.0, NS + 7 * NS / 10);
        assert_relative_eq!(v, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_half_second_gap_exactly_integrates() {
        let mut est = SpeedEstimator::new();
        est.on_accel(2.0, NS);
        let v = est.on_accel(2.0, NS + NS / 2);
        assert_relative_eq!(v, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_non_monotonic_timestamp_skipped() {
        let mut est = SpeedEstimator::new();
        est.on_accel(2.0, NS);
        let v = est.on_accel(2.0, NS - NS / 10);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_absolute_blend_weights() {
        let mut est = SpeedEstimator::new();
        est.on_absolute(10.0); // 0.85*0 + 0.15*10
        assert_relative_eq!(est.speed_mps(), 1.5, epsilon = 1e-9);

        est.on_absolute(10.0);
        assert_relative_eq!(est.speed_mps(), 0.85 * 1.5 + 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_reset_to_zero() {
        let mut est = SpeedEstimator::new();
        est.on_absolute(10.0);
        est.on_accel(1.0, NS);
        est.reset_to_zero();
        assert_eq!(est.speed_mps(), 0.0);
        // Baseline cleared: next accel call records instead of integrating
        assert_eq!(est.on_accel(5.0, 2 * NS), 0.0);
    }
}
