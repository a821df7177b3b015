use nalgebra::{Matrix3, Vector2, Vector3};

/// Self-calibrating acceleration front end.
///
/// Stationary periods (stoplights) are the only time true zero-velocity and
/// true bias are both known, so bias learning is gated on the stop detector.
/// Heading is only trustworthy while the device is actually translating, so
/// it is gated on a speed floor distinct from the stop floor.
pub struct AutoCalibration {
    // World-frame accel bias, EMA-updated only while stopped
    bias: Vector3<f64>,

    // Heading unit vector in world frame (x=east, y=north)
    heading: Vector2<f64>,
    have_heading: bool,

    // Stop detector
    stopped_since_ms: Option<u64>,
    stopped: bool,

    // Tuning
    pub stop_speed_mps: f64,
    pub stop_hold_ms: u64,
    pub stop_accel_rms: f64,
    pub bias_learn_alpha: f64,
    pub course_trust_mps: f64,
}

impl AutoCalibration {
    pub fn new() -> Self {
        AutoCalibration {
            bias: Vector3::zeros(),
            heading: Vector2::new(0.0, 1.0),
            have_heading: false,
            stopped_since_ms: None,
            stopped: false,
            stop_speed_mps: 0.25,
            stop_hold_ms: 1200,
            stop_accel_rms: 0.15,
            bias_learn_alpha: 0.02,
            course_trust_mps: 2.0,
        }
    }

    /// Absolute-speed observation with an optional course angle in degrees.
    /// Low-speed course readings are chaos, so the heading is only recomputed
    /// above the trust floor.
    pub fn observe_absolute(&mut self, speed_mps: f64, course_deg: Option<f64>) {
        if let Some(course) = course_deg {
            if speed_mps > self.course_trust_mps {
                let rad = course.to_radians();
                self.heading = Vector2::new(rad.sin(), rad.cos());
                self.have_heading = true;
            }
        }
    }

    /// Debounced stop classification. Stillness must hold continuously for
    /// `stop_hold_ms` before `stopped` flips true; a single noisy sample
    /// clears the timer and the flag.
    pub fn update_stop_state(&mut self, now_ms: u64, speed_mps: f64, world_accel: &Vector3<f64>) {
        let mag = world_accel.norm();
        let stopped_now = speed_mps < self.stop_speed_mps && mag < self.stop_accel_rms;

        if stopped_now {
            if !self.stopped {
                let since = *self.stopped_since_ms.get_or_insert(now_ms);
                if now_ms.saturating_sub(since) >= self.stop_hold_ms {
                    self.stopped = true;
                }
            }
        } else {
            self.stopped_since_ms = None;
            self.stopped = false;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn have_heading(&self) -> bool {
        self.have_heading
    }

    /// Current heading unit vector as (east, north).
    pub fn heading(&self) -> (f64, f64) {
        (self.heading.x, self.heading.y)
    }

    /// EMA bias update; no-op unless currently stopped. Assumes gravity/tilt
    /// have already been removed by the world-frame transform.
    pub fn learn_bias(&mut self, world_accel: &Vector3<f64>) {
        if !self.stopped {
            return;
        }
        let a = self.bias_learn_alpha;
        self.bias = self.bias * (1.0 - a) + world_accel * a;
    }

    /// Bias-corrected acceleration along the direction of travel. Zero until
    /// a heading has ever been established; lateral and vertical components
    /// are discarded.
    pub fn forward_accel(&self, world_accel: &Vector3<f64>) -> f64 {
        if !self.have_heading {
            return 0.0;
        }
        let a = world_accel - self.bias;
        a.x * self.heading.x + a.y * self.heading.y
    }

    /// Transform a device-frame acceleration into the world frame,
    /// world = R * device.
    pub fn device_to_world(rotation: &Matrix3<f64>, accel: &Vector3<f64>) -> Vector3<f64> {
        rotation * accel
    }
}

impl Default for AutoCalibration {
    fn default() -> Self {
        Self::new()
    }
}
