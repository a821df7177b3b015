use crate::fusion::{AutoCalibration, SpeedEstimator};
use crate::sensors::{GpsFix, MotionSample};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const MPS_TO_MPH: f64 = 2.23694;

/// Display speeds below this are treated as exactly zero.
pub const DISPLAY_DEADBAND_MPH: f64 = 0.5;

/// Smoothing factor for the GPS observation-rate diagnostic.
const HZ_ALPHA: f64 = 0.2;

/// Immutable speed snapshot. `speed_mph` is the deadbanded display/transmit
/// value, `raw_mph` the undeadbanded source value for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeedSample {
    pub speed_mph: f64,
    pub raw_mph: f64,
    pub source: String,
}

impl SpeedSample {
    pub fn zero(source: &str) -> Self {
        SpeedSample {
            speed_mph: 0.0,
            raw_mph: 0.0,
            source: source.to_string(),
        }
    }

    pub fn from_raw_mph(raw_mph: f64, source: String) -> Self {
        SpeedSample {
            speed_mph: display_mph(raw_mph),
            raw_mph,
            source,
        }
    }
}

pub fn display_mph(raw_mph: f64) -> f64 {
    if raw_mph < DISPLAY_DEADBAND_MPH {
        0.0
    } else {
        raw_mph
    }
}

/// A source of speed snapshots. `start`/`stop` are idempotent; `latest`
/// never blocks and returns a zeroed sample before the first observation.
pub trait SpeedSource: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn latest(&self) -> SpeedSample;
}

/// Calibration engine + estimator behind a single update entry point.
/// Exactly one writer may drive this; the source task owns it.
pub struct FusionCore {
    calibration: AutoCalibration,
    estimator: SpeedEstimator,
    last_abs_mps: f64,
}

impl FusionCore {
    pub fn new() -> Self {
        FusionCore {
            calibration: AutoCalibration::new(),
            estimator: SpeedEstimator::new(),
            last_abs_mps: 0.0,
        }
    }

    pub fn on_gps(&mut self, fix: &GpsFix) -> f64 {
        self.last_abs_mps = fix.speed_mps.max(0.0);
        self.calibration
            .observe_absolute(fix.speed_mps, fix.course_deg);
        self.estimator.on_absolute(fix.speed_mps)
    }

    pub fn on_motion(&mut self, sample: &MotionSample) -> f64 {
        let world =
            AutoCalibration::device_to_world(&sample.rotation_matrix(), &sample.accel_vector());
        let now_ms = sample.timestamp_ns / 1_000_000;

        self.calibration
            .update_stop_state(now_ms, self.last_abs_mps, &world);
        self.calibration.learn_bias(&world);

        let forward = self.calibration.forward_accel(&world);
        self.estimator.on_accel(forward, sample.timestamp_ns)
    }

    pub fn speed_mps(&self) -> f64 {
        self.estimator.speed_mps()
    }

    pub fn is_stopped(&self) -> bool {
        self.calibration.is_stopped()
    }

    pub fn have_heading(&self) -> bool {
        self.calibration.have_heading()
    }

    pub fn reset_to_zero(&mut self) {
        self.estimator.reset_to_zero();
    }
}

impl Default for FusionCore {
    fn default() -> Self {
        Self::new()
    }
}

/// GPS-only source: converts the newest fix to mph and tracks a smoothed
/// observation rate for the provenance tag.
pub struct GpsSpeedSource {
    feed: broadcast::Sender<GpsFix>,
    sample_tx: watch::Sender<SpeedSample>,
    sample_rx: watch::Receiver<SpeedSample>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GpsSpeedSource {
    pub fn new(feed: broadcast::Sender<GpsFix>) -> Self {
        let (sample_tx, sample_rx) = watch::channel(SpeedSample::zero("GPS"));
        GpsSpeedSource {
            feed,
            sample_tx,
            sample_rx,
            task: Mutex::new(None),
        }
    }
}

impl SpeedSource for GpsSpeedSource {
    fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let mut rx = self.feed.subscribe();
        let tx = self.sample_tx.clone();

        *task = Some(tokio::spawn(async move {
            let mut hz_ema = 0.0f64;
            let mut last_fix_ms: Option<u64> = None;

            loop {
                match rx.recv().await {
                    Ok(fix) => {
                        if let Some(last) = last_fix_ms {
                            let dt_ms = fix.timestamp_ms.saturating_sub(last).max(1);
                            let hz = 1000.0 / dt_ms as f64;
                            hz_ema = if hz_ema == 0.0 {
                                hz
                            } else {
                                HZ_ALPHA * hz + (1.0 - HZ_ALPHA) * hz_ema
                            };
                        }
                        last_fix_ms = Some(fix.timestamp_ms);

                        let raw_mph = fix.speed_mps.max(0.0) * MPS_TO_MPH;
                        let source = format!("GPS_HZ:{:.1}", hz_ema);
                        let _ = tx.send(SpeedSample::from_raw_mph(raw_mph, source));
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        debug!("gps speed source started");
    }

    fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
                debug!("gps speed source stopped");
            }
        }
    }

    fn latest(&self) -> SpeedSample {
        self.sample_rx.borrow().clone()
    }
}

/// Fused source: accelerometer integration corrected by GPS, with
/// auto-calibrated bias and heading.
pub struct FusedSpeedSource {
    gps_feed: broadcast::Sender<GpsFix>,
    motion_feed: broadcast::Sender<MotionSample>,
    sample_tx: watch::Sender<SpeedSample>,
    sample_rx: watch::Receiver<SpeedSample>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FusedSpeedSource {
    pub fn new(
        gps_feed: broadcast::Sender<GpsFix>,
        motion_feed: broadcast::Sender<MotionSample>,
    ) -> Self {
        let (sample_tx, sample_rx) = watch::channel(SpeedSample::zero("FUSION"));
        FusedSpeedSource {
            gps_feed,
            motion_feed,
            sample_tx,
            sample_rx,
            task: Mutex::new(None),
        }
    }
}

impl SpeedSource for FusedSpeedSource {
    fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let mut gps_rx = self.gps_feed.subscribe();
        let mut motion_rx = self.motion_feed.subscribe();
        let tx = self.sample_tx.clone();

        *task = Some(tokio::spawn(async move {
            let mut core = FusionCore::new();

            loop {
                tokio::select! {
                    fix = gps_rx.recv() => match fix {
                        Ok(fix) => {
                            core.on_gps(&fix);
                            publish(&tx, &core);
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    sample = motion_rx.recv() => match sample {
                        Ok(sample) => {
                            core.on_motion(&sample);
                            publish(&tx, &core);
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));
        debug!("fused speed source started");

        fn publish(tx: &watch::Sender<SpeedSample>, core: &FusionCore) {
            let raw_mph = core.speed_mps() * MPS_TO_MPH;
            let _ = tx.send(SpeedSample::from_raw_mph(raw_mph, "FUSION".to_string()));
        }
    }

    fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
                debug!("fused speed source stopped");
            }
        }
    }

    fn latest(&self) -> SpeedSample {
        self.sample_rx.borrow().clone()
    }
}

/// Stub variant: always reports a zeroed sample. Used when fusion is not
/// wired to live sensors.
pub struct DisabledSpeedSource;

impl DisabledSpeedSource {
    pub fn new() -> Self {
        DisabledSpeedSource
    }
}

impl Default for DisabledSpeedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedSource for DisabledSpeedSource {
    fn start(&self) {
        debug!("disabled speed source started");
    }

    fn stop(&self) {
        debug!("disabled speed source stopped");
    }

    fn latest(&self) -> SpeedSample {
        SpeedSample::zero("DISABLED")
    }
}
