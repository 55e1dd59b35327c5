//! Serial/Motion Manager — owns the motion controller's serial handle and
//! offers a safe, ordered API to the rest of the system, transparently
//! reconnecting when the USB-serial adapter drops.
//!
//! Two background Tokio tasks do the work (spec §4.1, §5):
//! - the **request pump**, which owns the write+read-window critical
//!   section for the queued `send_request` pipeline;
//! - the **reconnect watcher**, which retries `connect()` on a fixed
//!   period whenever no handle is live.
//!
//! `send_now` uses a second, independently-locked clone of the port handle
//! (via `serialport`'s `try_clone`), matching spec §5's "distinct critical
//! sections" framing for the immediate-write pipeline — and, as spec §5
//! states, this is a deliberate trade-off: `send_now` can interleave with
//! a queued command's write/read window, so callers needing ordering use
//! `send_request`.
//!
//! Failure containment mirrors the teacher's `uwb_hub.rs`: I/O errors are
//! logged and contained rather than propagated — "never crash — log and
//! continue" — here specialized to clearing the connected state so the
//! reconnect watcher can restore it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scan_protocol::{Axis, ErrorKind, PositionSnapshot};
use serialport::SerialPort;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

use crate::config::Configuration;

type BoxedPort = Box<dyn SerialPort + Send>;

/// How the pump should decide a command's read window is complete.
enum ReadStrategy {
    /// Read until the input goes quiet for `serial_read_window`
    /// (`send_request`'s normal behavior).
    Windowed,
    /// Read until a line containing "ok" (case-insensitive) is seen, or
    /// the deadline expires (`wait_motion_complete`'s M400 barrier).
    UntilOk,
}

struct Command {
    text: String,
    strategy: ReadStrategy,
    deadline: Instant,
    completion: oneshot::Sender<Vec<String>>,
}

/// {connected, last_error}. Owned exclusively by this component;
/// transitions are driven by the pump/reconnect tasks only.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_error: Option<String>,
}

pub struct SerialManager {
    config: Arc<Configuration>,
    pump_port: Arc<AsyncMutex<Option<BoxedPort>>>,
    now_port: Arc<AsyncMutex<Option<BoxedPort>>>,
    connected: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    queue_tx: mpsc::Sender<Command>,
    queue_rx: AsyncMutex<Option<mpsc::Receiver<Command>>>,
    started: AtomicBool,
}

impl SerialManager {
    pub fn new(config: Arc<Configuration>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        Arc::new(Self {
            config,
            pump_port: Arc::new(AsyncMutex::new(None)),
            now_port: Arc::new(AsyncMutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            state_tx,
            state_rx,
            queue_tx,
            queue_rx: AsyncMutex::new(Some(queue_rx)),
            started: AtomicBool::new(false),
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Idempotently launches the request pump and reconnect watcher, and
    /// attempts an initial connection. Safe to call from any thread.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(rx) = self.queue_rx.lock().await.take() else {
            return;
        };

        let pump_self = Arc::clone(self);
        tokio::spawn(async move { pump_self.request_pump(rx).await });

        let watcher_self = Arc::clone(self);
        tokio::spawn(async move { watcher_self.reconnect_watcher().await });

        let _ = self.connect().await;
    }

    /// Open a port chosen by explicit configuration or by matching
    /// description patterns against enumerated devices; wait a post-open
    /// settle interval; flush stale input; publish the handle.
    pub async fn connect(&self) -> bool {
        let path = match self.resolve_port_path() {
            Some(p) => p,
            None => {
                self.set_error("no matching serial adapter found".to_string());
                return false;
            }
        };

        let baud = self.config.serial_baud;
        let timeout = self.config.serial_timeout;
        let open_result = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud).timeout(timeout).open()
        })
        .await;

        let mut port = match open_result {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                self.set_error(format!("open failed: {e}"));
                return false;
            }
            Err(e) => {
                self.set_error(format!("open task panicked: {e}"));
                return false;
            }
        };

        tokio::time::sleep(self.config.serial_response_settle).await;
        if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
            debug!("serial: clear input buffer failed (continuing): {e}");
        }

        let now_port = match port.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!("serial: try_clone failed ({e}); send_now will share the pump lock");
                // Fall back: still usable, just loses independent locking.
                // We reopen a second handle on the same path as a substitute
                // so send_now keeps its own critical section.
                match serialport::new(port.name().unwrap_or_default(), baud)
                    .timeout(timeout)
                    .open()
                {
                    Ok(second) => second,
                    Err(e2) => {
                        warn!("serial: fallback second handle also failed: {e2}");
                        return self.publish_connected(port, None).await;
                    }
                }
            }
        };

        self.publish_connected(port, Some(now_port)).await
    }

    async fn publish_connected(&self, pump: BoxedPort, now: Option<BoxedPort>) -> bool {
        *self.pump_port.lock().await = Some(pump);
        *self.now_port.lock().await = now;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState { connected: true, last_error: None });
        info!("serial: connected");
        true
    }

    fn set_error(&self, message: String) {
        warn!("serial: {message}");
        let _ = self.state_tx.send(ConnectionState { connected: false, last_error: Some(message) });
    }

    /// Release the handle and clear the connected state.
    pub async fn close(&self) {
        *self.pump_port.lock().await = None;
        *self.now_port.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState { connected: false, last_error: None });
    }

    fn resolve_port_path(&self) -> Option<String> {
        if let Some(explicit) = &self.config.serial_port {
            return Some(explicit.clone());
        }
        let ports = serialport::available_ports().ok()?;
        ports.into_iter().find_map(|p| {
            let description = match &p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    info.product.clone().unwrap_or_default()
                }
                _ => String::new(),
            };
            let haystack = format!("{} {}", p.port_name, description).to_uppercase();
            self.config
                .serial_profile
                .description_patterns
                .iter()
                .any(|pat| haystack.contains(&pat.to_uppercase()))
                .then_some(p.port_name)
        })
    }

    /// Enqueues `text` with a completion sink; returns the lines collected
    /// during a bounded read window after write. Fails with `Timeout` if
    /// the sink is not completed in time; fails with `NotConnected` when
    /// no handle is available.
    pub async fn send_request(&self, text: &str, timeout: Duration) -> Result<Vec<String>, ErrorKind> {
        self.enqueue(text, ReadStrategy::Windowed, timeout).await
    }

    /// Clears stale input, issues an M400 barrier, then reads until an
    /// "ok" acknowledgement is seen or `timeout` expires.
    pub async fn wait_motion_complete(&self, timeout: Duration) -> bool {
        self.enqueue("M400", ReadStrategy::UntilOk, timeout).await.is_ok()
    }

    async fn enqueue(
        &self,
        text: &str,
        strategy: ReadStrategy,
        timeout: Duration,
    ) -> Result<Vec<String>, ErrorKind> {
        if !self.is_connected() {
            return Err(ErrorKind::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        let command = Command {
            text: text.to_string(),
            strategy,
            deadline: Instant::now() + timeout,
            completion: tx,
        };
        if self.queue_tx.try_send(command).is_err() {
            return Err(ErrorKind::Timeout);
        }
        match tokio_timeout(timeout, rx).await {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(_)) => Err(ErrorKind::IoError("pump dropped completion sink".into())),
            Err(_) => Err(ErrorKind::Timeout),
        }
    }

    /// Immediate fire-and-forget write with its own mutex.
    pub async fn send_now(&self, text: &str) -> bool {
        let mut guard = self.now_port.lock().await;
        let Some(port) = guard.as_mut() else {
            return false;
        };
        let line = format!("{text}\n");
        if let Err(e) = port.write_all(line.as_bytes()).and_then(|_| port.flush()) {
            warn!("serial: send_now write failed: {e}");
            drop(guard);
            self.close().await;
            return false;
        }
        true
    }

    /// `M114` → raw response lines.
    pub async fn query_position(&self) -> Vec<String> {
        self.send_request("M114", self.config.serial_timeout).await.unwrap_or_default()
    }

    async fn request_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            let lines = self.run_command(&cmd).await;
            let _ = cmd.completion.send(lines);
        }
    }

    async fn run_command(&self, cmd: &Command) -> Vec<String> {
        let mut guard = self.pump_port.lock().await;
        let Some(port) = guard.as_mut() else {
            return Vec::new();
        };

        let line = format!("{}\n", cmd.text);
        if let Err(e) = port.write_all(line.as_bytes()).and_then(|_| port.flush()) {
            warn!("serial: pump write failed: {e}");
            drop(guard);
            self.close().await;
            return Vec::new();
        }

        tokio::time::sleep(self.config.serial_response_settle).await;

        let mut collected = String::new();
        loop {
            let mut buf = [0u8; 256];
            let read_deadline = Instant::now() + self.config.serial_read_window;
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => collected.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("serial: pump read failed: {e}");
                    drop(guard);
                    self.close().await;
                    return Vec::new();
                }
            }

            let lines: Vec<String> =
                collected.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();

            let done = match cmd.strategy {
                ReadStrategy::Windowed => Instant::now() >= read_deadline && !collected.is_empty(),
                ReadStrategy::UntilOk => lines.iter().any(|l| l.eq_ignore_ascii_case("ok")),
            };
            if done || Instant::now() >= cmd.deadline {
                return lines;
            }
        }
    }

    async fn reconnect_watcher(self: Arc<Self>) {
        loop {
            if !self.is_connected() {
                self.connect().await;
            }
            tokio::time::sleep(self.config.serial_reconnect_period).await;
        }
    }
}

/// Tolerant tokenizer accepting both "X:1.23" and "X 1.23" forms,
/// case-insensitive on the axis letter, first match wins.
pub fn parse_axis(axis: Axis, lines: &[String]) -> Option<f64> {
    let letter = axis.letter();
    for line in lines {
        let mut chars = line.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if !c.eq_ignore_ascii_case(&letter) {
                continue;
            }
            let rest = &line[idx + c.len_utf8()..];
            let rest = rest.trim_start_matches(':').trim_start();
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
                .collect();
            if let Ok(value) = token.parse::<f64>() {
                return Some(value);
            }
        }
    }
    None
}

/// Parse a full M114-style response into a `PositionSnapshot`.
pub fn parse_position(lines: &[String]) -> PositionSnapshot {
    PositionSnapshot {
        x: parse_axis(Axis::X, lines),
        y: parse_axis(Axis::Y, lines),
        z: parse_axis(Axis::Z, lines),
        e: parse_axis(Axis::E, lines),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_axis_accepts_colon_form() {
        let lines = vec!["X:12.34 Y:5.00 Z:10.00 E:0.00".to_string()];
        assert_eq!(parse_axis(Axis::X, &lines), Some(12.34));
        assert_eq!(parse_axis(Axis::Z, &lines), Some(10.00));
    }

    #[test]
    fn parse_axis_accepts_space_form() {
        let lines = vec!["X 12.34 Y 5.00".to_string()];
        assert_eq!(parse_axis(Axis::X, &lines), Some(12.34));
        assert_eq!(parse_axis(Axis::Y, &lines), Some(5.00));
    }

    #[test]
    fn parse_axis_handles_negative_values() {
        let lines = vec!["Z:-3.5".to_string()];
        assert_eq!(parse_axis(Axis::Z, &lines), Some(-3.5));
    }

    #[test]
    fn parse_axis_missing_axis_is_none() {
        let lines = vec!["X:1.0 Y:2.0".to_string()];
        assert_eq!(parse_axis(Axis::E, &lines), None);
    }

    #[test]
    fn parse_position_fills_all_available_axes() {
        let lines = vec!["X:1.0 Y:2.0 Z:3.0 E:4.0".to_string()];
        let snap = parse_position(&lines);
        assert_eq!(snap.x, Some(1.0));
        assert_eq!(snap.e, Some(4.0));
    }
}
