use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

use approx::assert_relative_eq;
use vss_bridge_rs::error::LinkError;
use vss_bridge_rs::link::{
    Backoff, DeviceIdentity, LinkSession, LinkState, LinkSupervisor, Transport,
};
use vss_bridge_rs::sensors::{GpsFix, MotionSample};
use vss_bridge_rs::speed::{FusedSpeedSource, FusionCore, SpeedSource, MPS_TO_MPH};

const MS_TO_NS: u64 = 1_000_000;

/// Stop at a light, pull away with a GPS course, then accelerate on dead
/// reckoning alone: the canonical bridge scenario.
#[test]
fn scenario_stop_heading_then_dead_reckoning() {
    let mut core = FusionCore::new();

    // 1.3 s stationary: zero accel at 50 Hz, zero-speed fixes every 500 ms
    for t_ms in (0..=1300u64).step_by(20) {
        core.on_motion(&MotionSample::world_frame([0.0, 0.0, 0.0], t_ms * MS_TO_NS));
        if t_ms % 500 == 0 {
            core.on_gps(&GpsFix::new(0.0, None, t_ms));
        }
    }
    assert!(core.is_stopped());
    assert!(!core.have_heading());
    assert_eq!(core.speed_mps(), 0.0);

    // Absolute speed jumps to 10 m/s heading north
    core.on_gps(&GpsFix::new(10.0, Some(0.0), 1310));
    assert!(core.have_heading());
    assert_relative_eq!(core.speed_mps(), 1.5, epsilon = 1e-9);

    // +2 m/s^2 northward for exactly one second, no further fixes
    for t_ms in (1320..=2300u64).step_by(20) {
        core.on_motion(&MotionSample::world_frame([0.0, 2.0, 0.0], t_ms * MS_TO_NS));
    }
    assert_relative_eq!(core.speed_mps(), 3.5, epsilon = 1e-9);
    assert!(!core.is_stopped());
}

enum ConnectOutcome {
    Succeed { fail_after: Option<usize> },
}

struct CaptureTransport {
    script: VecDeque<ConnectOutcome>,
    lines: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicU32>,
}

impl CaptureTransport {
    fn new(script: Vec<ConnectOutcome>) -> Self {
        CaptureTransport {
            script: script.into(),
            lines: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Transport for CaptureTransport {
    type Session = CaptureSession;

    fn connect(&mut self, _target: &DeviceIdentity) -> Result<CaptureSession, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            Some(ConnectOutcome::Succeed { fail_after }) => Ok(CaptureSession {
                lines: Arc::clone(&self.lines),
                fail_after,
                writes: 0,
            }),
            None => Err(LinkError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            ))),
        }
    }
}

struct CaptureSession {
    lines: Arc<Mutex<Vec<String>>>,
    fail_after: Option<usize>,
    writes: usize,
}

impl LinkSession for CaptureSession {
    fn write_line(&mut self, line: &[u8]) -> Result<(), LinkError> {
        if let Some(limit) = self.fail_after {
            if self.writes >= limit {
                return Err(LinkError::Write(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer gone",
                )));
            }
        }
        self.writes += 1;
        self.lines
            .lock()
            .unwrap()
            .push(String::from_utf8(line.to_vec()).unwrap());
        Ok(())
    }
}

#[tokio::test]
async fn fused_source_feeds_wire_lines() {
    let (gps_feed, _g) = broadcast::channel::<GpsFix>(16);
    let (motion_feed, _m) = broadcast::channel::<MotionSample>(512);

    let source = Arc::new(FusedSpeedSource::new(gps_feed.clone(), motion_feed.clone()));
    source.start();

    // Stationary phase
    for t_ms in (0..=1300u64).step_by(20) {
        motion_feed
            .send(MotionSample::world_frame([0.0, 0.0, 0.0], t_ms * MS_TO_NS))
            .unwrap();
        if t_ms % 500 == 0 {
            gps_feed.send(GpsFix::new(0.0, None, t_ms)).unwrap();
        }
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(source.latest().speed_mph, 0.0);

    // Heading acquisition, then dead reckoning
    gps_feed.send(GpsFix::new(10.0, Some(0.0), 1310)).unwrap();
    sleep(Duration::from_millis(50)).await;
    for t_ms in (1320..=2300u64).step_by(20) {
        motion_feed
            .send(MotionSample::world_frame([0.0, 2.0, 0.0], t_ms * MS_TO_NS))
            .unwrap();
    }
    sleep(Duration::from_millis(100)).await;

    let sample = source.latest();
    assert_relative_eq!(sample.raw_mph, 3.5 * MPS_TO_MPH, epsilon = 1e-6);

    // The supervisor picks the sample up within the next transmit tick
    let transport = CaptureTransport::new(vec![ConnectOutcome::Succeed { fail_after: None }]);
    let lines = Arc::clone(&transport.lines);
    let target = DeviceIdentity::new("fake", "esp32-vss");
    let mut supervisor = LinkSupervisor::arm(
        transport,
        target,
        Arc::clone(&source) as Arc<dyn SpeedSource>,
    )
    .unwrap();

    sleep(Duration::from_millis(250)).await;
    supervisor.disarm();
    source.stop();

    let captured = lines.lock().unwrap().clone();
    assert!(!captured.is_empty());
    assert_eq!(captured[0], "SPEED_MPH:7.83\r\n");
    for line in &captured {
        assert!(line.starts_with("SPEED_MPH:") && line.ends_with("\r\n"));
    }
}

#[tokio::test]
async fn write_failure_recovers_and_keeps_streaming() {
    let (gps_feed, _g) = broadcast::channel::<GpsFix>(16);
    let (motion_feed, _m) = broadcast::channel::<MotionSample>(16);

    let source = Arc::new(FusedSpeedSource::new(gps_feed, motion_feed));
    source.start();

    let transport = CaptureTransport::new(vec![
        ConnectOutcome::Succeed {
            fail_after: Some(2),
        },
        ConnectOutcome::Succeed { fail_after: None },
    ]);
    let lines = Arc::clone(&transport.lines);
    let connects = Arc::clone(&transport.connects);

    let target = DeviceIdentity::new("fake", "esp32-vss");
    let mut supervisor = LinkSupervisor::arm_with(
        transport,
        target,
        Arc::clone(&source) as Arc<dyn SpeedSource>,
        Backoff::with(5.0, 1.6, 20.0),
    )
    .unwrap();

    sleep(Duration::from_millis(700)).await;
    assert_eq!(supervisor.state(), LinkState::Streaming);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert!(lines.lock().unwrap().len() > 2);

    supervisor.disarm();
    source.stop();
    assert_eq!(supervisor.state(), LinkState::Idle);
}
