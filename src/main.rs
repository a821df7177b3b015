use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};

use vss_bridge_rs::link::{DeviceIdentity, LinkSupervisor, TcpTransport};
use vss_bridge_rs::sensors::{self, GpsFix, MotionSample};
use vss_bridge_rs::speed::{DisabledSpeedSource, FusedSpeedSource, GpsSpeedSource, SpeedSource};
use vss_bridge_rs::status::{current_timestamp, BridgeStatus};

#[derive(Parser, Debug)]
#[command(name = "vss_bridge")]
#[command(about = "Stream a fused speed signal to an ESP32 VSS peer", long_about = None)]
struct Args {
    /// Target device address (host:port of the serial bridge)
    #[arg(long)]
    device_addr: String,

    /// Human-readable device name
    #[arg(long, default_value = "")]
    device_name: String,

    /// Speed source variant
    #[arg(long, value_enum, default_value_t = SourceKind::Fused)]
    source: SourceKind,

    /// Duration in seconds (0 = run until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Status file path
    #[arg(long, default_value = "vss_status.json")]
    status_path: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SourceKind {
    Gps,
    Fused,
    Disabled,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[{}] VSS Bridge Starting", ts_now());
    println!("  Device: {} ({})", args.device_addr, args.device_name);
    println!("  Source: {:?}", args.source);
    println!("  Duration: {} seconds (0=continuous)", args.duration);

    // Sensor feeds (mock loops stand in for the platform location/motion APIs)
    let (gps_feed, _) = broadcast::channel::<GpsFix>(64);
    let (motion_feed, _) = broadcast::channel::<MotionSample>(256);
    tokio::spawn(sensors::mock_gps_loop(gps_feed.clone()));
    tokio::spawn(sensors::mock_motion_loop(motion_feed.clone()));

    let gps_fixes = Arc::new(AtomicU64::new(0));
    let motion_samples = Arc::new(AtomicU64::new(0));
    spawn_counter(&gps_feed, Arc::clone(&gps_fixes));
    spawn_counter(&motion_feed, Arc::clone(&motion_samples));

    let source: Arc<dyn SpeedSource> = match args.source {
        SourceKind::Gps => Arc::new(GpsSpeedSource::new(gps_feed.clone())),
        SourceKind::Fused => Arc::new(FusedSpeedSource::new(gps_feed.clone(), motion_feed.clone())),
        SourceKind::Disabled => Arc::new(DisabledSpeedSource::new()),
    };
    source.start();

    let target = DeviceIdentity::new(&args.device_addr, &args.device_name);
    let mut supervisor =
        LinkSupervisor::arm(TcpTransport::default(), target.clone(), Arc::clone(&source))?;

    let start = Instant::now();
    let mut status_tick = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                let sample = source.latest();
                let status = BridgeStatus {
                    timestamp: current_timestamp(),
                    link_state: supervisor.state(),
                    device_name: target.display_name().to_string(),
                    speed_mph: sample.speed_mph,
                    raw_mph: sample.raw_mph,
                    source: sample.source,
                    gps_fixes: gps_fixes.load(Ordering::Relaxed),
                    motion_samples: motion_samples.load(Ordering::Relaxed),
                    uptime_seconds: start.elapsed().as_secs(),
                };
                let _ = status.save(&args.status_path);

                if args.duration > 0 && start.elapsed().as_secs() >= args.duration {
                    println!("[{}] Duration reached, stopping...", ts_now());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Ctrl-C, stopping...", ts_now());
                break;
            }
        }
    }

    supervisor.disarm();
    source.stop();

    let sample = source.latest();
    println!("\n=== Final Stats ===");
    println!("Uptime: {} s", start.elapsed().as_secs());
    println!("GPS fixes: {}", gps_fixes.load(Ordering::Relaxed));
    println!("Motion samples: {}", motion_samples.load(Ordering::Relaxed));
    println!("Last speed: {:.2} mph ({})", sample.speed_mph, sample.source);

    Ok(())
}

fn spawn_counter<T: Clone + Send + 'static>(
    feed: &broadcast::Sender<T>,
    counter: Arc<AtomicU64>,
) {
    let mut rx = feed.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    counter.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
