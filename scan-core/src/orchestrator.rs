//! Scan Orchestrator (spec §4.4): the only component allowed to drive a
//! full scan sequence end to end — jogging, continuous-move workers,
//! scan-plan management, single/multi sweeps, and graceful shutdown.
//!
//! Manual jogs funnel through a single bounded-queue worker (spec §5):
//! one consumer task drains `jog_tx`, holding the Scanner mode lock only
//! while it executes, and duplicate E-axis ("rotate") commands arriving
//! within `jog_debounce` of each other are collapsed into one motion,
//! every waiting caller getting the same result.
//!
//! Continuous-move workers are plain cooperative loops: a ticking task
//! that calls `ScannerController::delta_move` on a fixed cadence and
//! checks a stop flag between ticks, so it never sleeps while holding the
//! mode lock (spec §9). They are tracked in a registry keyed by
//! `(axis, direction)` (spec §5) — distinct axis/direction pairs run
//! concurrently, and starting a second worker on the same pair is
//! rejected with `AlreadyActive` (spec §4.4, §7).
//!
//! The recorder runs as a separate child process (spec §4.4), spawned via
//! `tokio::process::Command` next to the `scan-core` binary, matching the
//! original design's process-per-sweep isolation: a recorder crash cannot
//! take the control core down with it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scan_protocol::{recorder_env, Axis, ErrorKind, ScanMode, ScanPlan};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::flags::Flags;
use crate::scanner_controller::ScannerController;
use crate::serial_manager::SerialManager;
use crate::ultrasound::UltrasoundSession;

struct ContinuousWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct JogCommand {
    axis: Axis,
    step: f64,
    direction: i8,
    responder: oneshot::Sender<(bool, String)>,
}

pub struct Orchestrator {
    config: Arc<Configuration>,
    serial: Arc<SerialManager>,
    scanner: Arc<ScannerController>,
    ultrasound: Arc<UltrasoundSession>,
    flags: Arc<Flags>,
    continuous: AsyncMutex<HashMap<(Axis, i8), ContinuousWorker>>,
    jog_tx: OnceCell<mpsc::Sender<JogCommand>>,
    children: AsyncMutex<Vec<Child>>,
    shutting_down: AtomicBool,
}

fn sibling_executable(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Clamps and applies a single linear-axis relative jog.
async fn jog_linear(scanner: &ScannerController, max_click_step_mm: f64, axis: Axis, step: f64, direction: i8) -> (bool, String) {
    let bounded = step.min(max_click_step_mm).max(0.0);
    let delta = if direction < 0 { -bounded } else { bounded };
    let ok = scanner.delta_move(axis, delta).await;
    (ok, if ok { "jogged".to_string() } else { "jog command rejected".to_string() })
}

impl Orchestrator {
    pub fn new(
        config: Arc<Configuration>,
        serial: Arc<SerialManager>,
        scanner: Arc<ScannerController>,
        ultrasound: Arc<UltrasoundSession>,
        flags: Arc<Flags>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            serial,
            scanner,
            ultrasound,
            flags,
            continuous: AsyncMutex::new(HashMap::new()),
            jog_tx: OnceCell::new(),
            children: AsyncMutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn check_not_shutting_down(&self) -> Result<(), ErrorKind> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(ErrorKind::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Spawns the single jog worker consuming `jog_tx` (spec §5's "one jog
    /// worker thread consuming a bounded queue"), lazily on first use so
    /// construction stays synchronous and test-friendly. Duplicate E-axis
    /// jogs that arrive within `jog_debounce` of each other are collapsed
    /// into a single motion (spec §4.4), every waiting caller receiving
    /// the same result.
    fn spawn_jog_worker(&self) -> mpsc::Sender<JogCommand> {
        let (tx, mut rx) = mpsc::channel::<JogCommand>(self.config.jog_queue_capacity.max(1));
        let scanner = Arc::clone(&self.scanner);
        let debounce = self.config.jog_debounce;
        let max_click_step_mm = self.config.max_click_step_mm;

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if cmd.axis != Axis::E {
                    let result = jog_linear(&scanner, max_click_step_mm, cmd.axis, cmd.step, cmd.direction).await;
                    let _ = cmd.responder.send(result);
                    continue;
                }

                let mut batch = vec![cmd];
                let deadline = tokio::time::Instant::now() + debounce;
                let mut spillover = None;
                loop {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match tokio::time::timeout(remaining, rx.recv()).await {
                        Ok(Some(next)) if next.axis == Axis::E => batch.push(next),
                        Ok(Some(next)) => {
                            spillover = Some(next);
                            break;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }

                let last = batch.last().expect("batch always has the triggering command");
                let result = scanner.rotate(last.step, last.direction).await;
                for collapsed in batch {
                    let _ = collapsed.responder.send(result.clone());
                }

                if let Some(next) = spillover {
                    let result = jog_linear(&scanner, max_click_step_mm, next.axis, next.step, next.direction).await;
                    let _ = next.responder.send(result);
                }
            }
        });

        tx
    }

    async fn jog_sender(&self) -> mpsc::Sender<JogCommand> {
        self.jog_tx.get_or_init(|| async { self.spawn_jog_worker() }).await.clone()
    }

    /// Enqueues one jog into the bounded worker queue (spec §5, §4.4);
    /// rejects with `QueueFull` under backpressure rather than blocking
    /// the caller.
    pub async fn jog_once(&self, axis: Axis, step: f64, direction: i8) -> Result<(bool, String), ErrorKind> {
        self.check_not_shutting_down()?;
        let tx = self.jog_sender().await;
        let (responder, response) = oneshot::channel();
        tx.try_send(JogCommand { axis, step, direction, responder }).map_err(|_| ErrorKind::QueueFull)?;
        response.await.map_err(|_| ErrorKind::IoError("jog worker dropped the response channel".to_string()))
    }

    /// Starts a ticking worker that repeats a small jog on `axis` until
    /// stopped. Workers are tracked in a registry keyed by
    /// `(axis, direction)` (spec §5) — starting a second worker on the
    /// same axis/direction is rejected with `AlreadyActive` (spec §4.4,
    /// §7); distinct axes/directions run concurrently. E-axis continuous
    /// moves are bounded by `continuous_e_max_duration` even without an
    /// explicit stop (spec §5, §8).
    pub async fn start_continuous(&self, axis: Axis, direction: i8) -> Result<(), ErrorKind> {
        self.check_not_shutting_down()?;

        let key = (axis, direction);
        let mut registry = self.continuous.lock().await;
        if registry.contains_key(&key) {
            return Err(ErrorKind::AlreadyActive);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let scanner = Arc::clone(&self.scanner);
        let tick = self.config.continuous_move_min_tick.max(Duration::from_millis(1));
        let step = self.config.e_axis_default_step.max(0.01).min(self.config.max_click_step_mm);
        let max_duration = self.config.continuous_e_max_duration;

        let handle = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            loop {
                if stop_clone.load(Ordering::SeqCst) {
                    break;
                }
                if axis == Axis::E && started.elapsed() >= max_duration {
                    warn!("orchestrator: continuous E move hit max duration, stopping");
                    break;
                }
                let delta = if direction < 0 { -step } else { step };
                match axis {
                    Axis::E => {
                        scanner.rotate(step, direction).await;
                    }
                    _ => {
                        scanner.delta_move(axis, delta).await;
                    }
                }
                tokio::time::sleep(tick).await;
            }
        });

        registry.insert(key, ContinuousWorker { stop, handle });
        Ok(())
    }

    /// Signals stop to one worker (`Some((axis, direction))`) or all of
    /// them (`None`), per spec §4.4's `stop_continuous(action | all)`.
    pub async fn stop_continuous(&self, target: Option<(Axis, i8)>) {
        let stopped: Vec<ContinuousWorker> = {
            let mut registry = self.continuous.lock().await;
            match target {
                Some(key) => registry.remove(&key).into_iter().collect(),
                None => registry.drain().map(|(_, worker)| worker).collect(),
            }
        };
        for worker in stopped {
            worker.stop.store(true, Ordering::SeqCst);
            let _ = worker.handle.await;
        }
    }

    /// Builds and persists a `ScanPlan`. Pure function of `mode`/`custom`
    /// and current config, so repeated calls with the same inputs produce
    /// the same plan (spec §8 idempotence).
    pub fn plan_scan(&self, mode: ScanMode, custom: Option<(f64, f64)>) -> ScanPlan {
        let x_max = self.config.x_max;
        let plan = match mode {
            ScanMode::Long => ScanPlan::long(x_max),
            ScanMode::Short => ScanPlan::short(x_max),
            ScanMode::Custom => {
                let (x0, x1) = custom.unwrap_or((0.0, x_max));
                ScanPlan::clamped(x0, x1, ScanMode::Custom, x_max)
            }
        };
        self.flags.set_scanplan(&plan);
        plan
    }

    fn recorder_command(&self, plan: &ScanPlan, position_str: &str) -> Command {
        let mut cmd = Command::new(sibling_executable("recorder"));
        cmd.env(recorder_env::SCAN_X0, plan.x0.to_string())
            .env(recorder_env::SCAN_X1, plan.x1.to_string())
            .env(recorder_env::SCAN_START_X, plan.x0.to_string())
            .env(recorder_env::SCAN_END_X, plan.x1.to_string())
            .env(recorder_env::SCAN_MODE, plan.mode.as_str())
            .env(recorder_env::REC_POSITION_STR, position_str)
            .kill_on_drop(true);
        cmd
    }

    /// Runs one X sweep: stage at `x0`, snapshot position for the
    /// recorder's header, spawn the recorder, warm up for
    /// `delay_before_record`, then drive the motion barrier across the
    /// sweep while the recorder watches distance traveled.
    pub async fn run_single_sweep(&self, plan: ScanPlan) -> Result<PathBuf, ErrorKind> {
        self.check_not_shutting_down()?;
        if self.flags.scanning() {
            return Err(ErrorKind::AlreadyActive);
        }

        self.flags.set_scanning(true);
        let result = self.run_single_sweep_inner(plan).await;
        self.flags.set_scanning(false);
        result
    }

    async fn run_single_sweep_inner(&self, plan: ScanPlan) -> Result<PathBuf, ErrorKind> {
        if !self.scanner.go_to_scan_start(plan.x0).await {
            return Err(ErrorKind::IoError("failed to stage at scan start".to_string()));
        }

        let snapshot = self.scanner.get_position_snapshot().await;
        let position_str = format!(
            "X:{:.2} Y:{:.2} Z:{:.2}",
            snapshot.x.unwrap_or(plan.x0),
            snapshot.y.unwrap_or(0.0),
            snapshot.z.unwrap_or(0.0),
        );

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let measurement_dir = self
            .config
            .ensure_measurement_dir(&timestamp)
            .map_err(|e| ErrorKind::IoError(format!("failed to prepare measurement dir: {e}")))?;
        self.flags.set_recdir(&measurement_dir);

        let mut child = self
            .recorder_command(&plan, &position_str)
            .spawn()
            .map_err(|e| ErrorKind::IoError(format!("failed to spawn recorder: {e}")))?;

        tokio::time::sleep(self.config.delay_before_record).await;

        let scan_result = self.scanner.scan_path(plan.x0, plan.x1).await;

        let wait_result = child.wait().await;
        match wait_result {
            Ok(status) if !status.success() => {
                warn!("orchestrator: recorder exited with {status}");
            }
            Err(e) => warn!("orchestrator: failed to wait on recorder: {e}"),
            _ => {}
        }

        scan_result?;
        Ok(measurement_dir)
    }

    /// Two offset sweeps (−Y then +Y) under the multisweep flag, then
    /// spawns the downstream merger tool against both output folders.
    pub async fn run_multi_sweep(&self, plan: ScanPlan) -> Result<(PathBuf, PathBuf), ErrorKind> {
        self.check_not_shutting_down()?;
        if self.flags.scanning() || self.flags.multisweep() {
            return Err(ErrorKind::AlreadyActive);
        }

        self.flags.set_multisweep(true);
        let result = self.run_multi_sweep_inner(plan).await;
        self.flags.set_multisweep(false);
        result
    }

    async fn run_multi_sweep_inner(&self, plan: ScanPlan) -> Result<(PathBuf, PathBuf), ErrorKind> {
        let half_step = self.config.multisweep_y_offset_mm;
        let (cx, cy, _) = self.config.center_xyz();

        self.scanner.move_absolute(Axis::Y, cy - half_step).await;
        let first = self.run_single_sweep(plan).await?;

        self.scanner.move_absolute(Axis::Y, cy + half_step).await;
        let second = self.run_single_sweep(plan).await?;

        self.scanner.move_absolute(Axis::Y, cy).await;
        self.scanner.move_absolute(Axis::X, cx).await;

        match Command::new(sibling_executable("multisweep")).arg(&first).arg(&second).kill_on_drop(true).spawn() {
            Ok(merger) => self.children.lock().await.push(merger),
            Err(e) => warn!("orchestrator: failed to spawn multisweep merger: {e}"),
        }

        Ok((first, second))
    }

    /// Orderly teardown: refuse new operations, stop any continuous
    /// worker, release the probe, kill outstanding children, and release
    /// the serial handle. Never panics — every step is best-effort.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.flags.set_scanning(false);
        self.flags.set_multisweep(false);
        self.stop_continuous(None).await;

        self.ultrasound.freeze().await;
        self.ultrasound.stop().await;
        self.ultrasound.close().await;

        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("orchestrator: child process did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        children.clear();

        self.serial.close().await;
        info!("orchestrator: shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_orchestrator() -> Arc<Orchestrator> {
        let config = Arc::new(Configuration::default());
        let flags = Arc::new(Flags::new(std::env::temp_dir().join(format!(
            "scan-core-orch-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ))));
        let serial = SerialManager::new(Arc::clone(&config));
        let scanner = Arc::new(ScannerController::new(Arc::clone(&serial), Arc::clone(&config), Arc::clone(&flags)));
        let ultrasound = Arc::new(UltrasoundSession::new(Arc::clone(&config)));
        Orchestrator::new(config, serial, scanner, ultrasound, flags)
    }

    #[test]
    fn plan_scan_custom_clamps_to_axis_bounds() {
        let orch = test_orchestrator();
        let x_max = orch.config.x_max;
        let plan = orch.plan_scan(ScanMode::Custom, Some((-50.0, x_max + 50.0)));
        assert!(plan.x0 >= 0.0);
        assert!(plan.x1 <= x_max);
    }

    #[test]
    fn plan_scan_long_and_short_differ() {
        let orch = test_orchestrator();
        let long = orch.plan_scan(ScanMode::Long, None);
        let short = orch.plan_scan(ScanMode::Short, None);
        assert!(long.x1 - long.x0 >= short.x1 - short.x0);
    }

    #[test]
    fn sibling_executable_falls_back_to_bare_name_off_current_exe() {
        let path = sibling_executable("recorder");
        assert!(path.to_string_lossy().ends_with("recorder"));
    }
}
