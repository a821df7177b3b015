use crate::error::LinkError;
use crate::speed::SpeedSource;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Fixed transmit cadence, independent of how often the speed source updates.
pub const TX_INTERVAL: Duration = Duration::from_millis(100);

/// Target peer identity, supplied by the pairing collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(address: &str, name: &str) -> Self {
        DeviceIdentity {
            address: address.to_string(),
            name: name.to_string(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }
}

/// Supervisor state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    Connecting,
    Streaming,
}

/// Reconnect delay policy: geometric growth, capped, reset after a
/// successful connect.
#[derive(Clone, Debug)]
pub struct Backoff {
    current_ms: f64,
    floor_ms: f64,
    growth: f64,
    cap_ms: f64,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with(1500.0, 1.6, 15_000.0)
    }

    pub fn with(floor_ms: f64, growth: f64, cap_ms: f64) -> Self {
        Backoff {
            current_ms: floor_ms,
            floor_ms,
            growth,
            cap_ms,
        }
    }

    /// Current delay, growing the interval for the next failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms as u64);
        self.current_ms = (self.current_ms * self.growth).min(self.cap_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.floor_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms as u64
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// One line per transmit tick, two decimal digits, CRLF-terminated.
pub fn wire_line(speed_mph: f64) -> String {
    format!("SPEED_MPH:{:.2}\r\n", speed_mph)
}

/// Opens sessions to the target peer. Connect may block; the supervisor
/// always calls it from its own worker thread.
pub trait Transport: Send + 'static {
    type Session: LinkSession;

    fn connect(&mut self, target: &DeviceIdentity) -> Result<Self::Session, LinkError>;
}

/// A connected, ordered byte-stream channel. Dropping it releases the
/// underlying connection.
pub trait LinkSession: Send {
    fn write_line(&mut self, line: &[u8]) -> Result<(), LinkError>;
}

/// TCP client transport (serial-over-TCP bridge to the peer).
pub struct TcpTransport {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl Transport for TcpTransport {
    type Session = TcpLinkSession;

    fn connect(&mut self, target: &DeviceIdentity) -> Result<TcpLinkSession, LinkError> {
        let addr = target
            .address
            .to_socket_addrs()
            .map_err(LinkError::Connect)?
            .next()
            .ok_or_else(|| {
                LinkError::Connect(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address did not resolve",
                ))
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(LinkError::Connect)?;
        stream.set_nodelay(true).map_err(LinkError::Connect)?;
        stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(LinkError::Connect)?;

        Ok(TcpLinkSession { stream })
    }
}

pub struct TcpLinkSession {
    stream: TcpStream,
}

impl LinkSession for TcpLinkSession {
    fn write_line(&mut self, line: &[u8]) -> Result<(), LinkError> {
        self.stream.write_all(line).map_err(LinkError::Write)?;
        self.stream.flush().map_err(LinkError::Write)
    }
}

/// Keeps an outbound stream to the peer alive: connect, transmit the current
/// speed sample at 10 Hz, back off and reconnect on any failure. All
/// transport errors are transient; only disarm stops the loop for good.
pub struct LinkSupervisor {
    running: Arc<AtomicBool>,
    state_rx: watch::Receiver<LinkState>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LinkSupervisor {
    pub fn arm<T: Transport>(
        transport: T,
        target: DeviceIdentity,
        source: Arc<dyn SpeedSource>,
    ) -> io::Result<Self> {
        Self::arm_with(transport, target, source, Backoff::new())
    }

    pub fn arm_with<T: Transport>(
        transport: T,
        target: DeviceIdentity,
        source: Arc<dyn SpeedSource>,
        backoff: Backoff,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);

        let worker_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("vss-auto-worker".to_string())
            .spawn(move || run_loop(transport, target, source, backoff, worker_running, state_tx))?;

        Ok(LinkSupervisor {
            running,
            state_rx,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for the worker to release any open session.
    pub fn disarm(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkSupervisor {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn run_loop<T: Transport>(
    mut transport: T,
    target: DeviceIdentity,
    source: Arc<dyn SpeedSource>,
    mut backoff: Backoff,
    running: Arc<AtomicBool>,
    state_tx: watch::Sender<LinkState>,
) {
    let name = target.display_name().to_string();

    while running.load(Ordering::SeqCst) {
        let _ = state_tx.send(LinkState::Connecting);
        info!("connecting to {}", name);

        match transport.connect(&target) {
            Ok(mut session) => {
                backoff.reset();
                let _ = state_tx.send(LinkState::Streaming);
                info!("connected to {}", name);

                let failed = stream_loop(&mut session, source.as_ref(), &running);
                drop(session);
                let _ = state_tx.send(LinkState::Idle);

                if !failed {
                    return; // explicit stop
                }
                warn!("stream to {} dropped, reconnecting", name);
            }
            Err(e) => {
                let _ = state_tx.send(LinkState::Idle);
                warn!("connect to {} failed: {}", name, e);
            }
        }

        // Retry with the current backoff interval; a failed write does not
        // reset it, only a successful connect does.
        sleep_while_running(&running, backoff.next_delay());
    }

    let _ = state_tx.send(LinkState::Idle);
}

/// Transmit ticks until the session fails (true) or the supervisor is
/// stopped (false). The failed sample is simply dropped; the next tick
/// sends the then-current speed.
fn stream_loop<S: LinkSession>(
    session: &mut S,
    source: &dyn SpeedSource,
    running: &AtomicBool,
) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }

        let sample = source.latest();
        let line = wire_line(sample.speed_mph);
        if let Err(e) = session.write_line(line.as_bytes()) {
            warn!("{}", e);
            return true;
        }

        thread::sleep(TX_INTERVAL);
    }
}

/// Sleep in short slices so a stop request is honored promptly.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
