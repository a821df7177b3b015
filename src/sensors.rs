use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::broadcast::Sender;
use tokio::time::{interval, Duration};

/// Absolute speed observation from the location provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsFix {
    pub speed_mps: f64,
    pub course_deg: Option<f64>,
    pub timestamp_ms: u64,
}

impl GpsFix {
    pub fn new(speed_mps: f64, course_deg: Option<f64>, timestamp_ms: u64) -> Self {
        Self {
            speed_mps,
            course_deg,
            timestamp_ms,
        }
    }
}

/// Linear-acceleration sample plus the rotation matrix that maps the device
/// frame into the world frame (row-major, gravity already removed).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MotionSample {
    pub accel: [f64; 3],
    pub rotation: [f64; 9],
    pub timestamp_ns: u64,
}

impl MotionSample {
    pub fn new(accel: [f64; 3], rotation: [f64; 9], timestamp_ns: u64) -> Self {
        Self {
            accel,
            rotation,
            timestamp_ns,
        }
    }

    /// Sample with the identity rotation, for feeds that already report in
    /// the world frame.
    pub fn world_frame(accel: [f64; 3], timestamp_ns: u64) -> Self {
        Self::new(accel, IDENTITY_ROTATION, timestamp_ns)
    }

    pub fn accel_vector(&self) -> Vector3<f64> {
        Vector3::new(self.accel[0], self.accel[1], self.accel[2])
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_row_slice(&self.rotation)
    }
}

pub const IDENTITY_ROTATION: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Mock motion feed at ~50 Hz, standing in for the platform motion API.
/// Emits small world-frame noise with the identity rotation.
pub async fn mock_motion_loop(tx: Sender<MotionSample>) {
    let mut interval = interval(Duration::from_millis(20));
    let start = Instant::now();
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let t = start.elapsed().as_secs_f64();
        let sample = MotionSample::world_frame(
            [0.03 * (t * 1.3).sin(), 0.03 * (t * 0.9).cos(), 0.0],
            start.elapsed().as_nanos() as u64,
        );

        // A real sensor keeps producing whether or not anyone listens
        let _ = tx.send(sample);

        sample_count += 1;
        if sample_count % 500 == 0 {
            log::debug!("[motion] {} samples", sample_count);
        }
    }
}

/// Mock GPS feed at 1 Hz with a gently varying speed and a fixed course.
pub async fn mock_gps_loop(tx: Sender<GpsFix>) {
    let mut interval = interval(Duration::from_secs(1));
    let start = Instant::now();
    let mut fix_count = 0u64;

    loop {
        interval.tick().await;

        let t = start.elapsed().as_secs_f64();
        let speed = (10.0 + 5.0 * (t * 0.05).sin()).max(0.0);
        let course = if speed > 1.0 { Some(45.0) } else { None };
        let fix = GpsFix::new(speed, course, start.elapsed().as_millis() as u64);

        let _ = tx.send(fix);

        fix_count += 1;
        if fix_count % 10 == 0 {
            log::debug!("[gps] {} fixes", fix_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_rotation_is_noop() {
        let sample = MotionSample::world_frame([1.0, 2.0, 3.0], 0);
        let world = sample.rotation_matrix() * sample.accel_vector();
        assert_relative_eq!(world.x, 1.0);
        assert_relative_eq!(world.y, 2.0);
        assert_relative_eq!(world.z, 3.0);
    }

    #[test]
    fn test_rotation_matrix_row_major() {
        // Row-major: second row becomes the world-y weight
        let sample = MotionSample::new(
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            0,
        );
        let world = sample.rotation_matrix() * sample.accel_vector();
        assert_relative_eq!(world.x, 0.0);
        assert_relative_eq!(world.y, 1.0);
    }
}
