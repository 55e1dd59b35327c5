//! Scanner Controller — a disciplined layer on the Serial Manager
//! enforcing units, mode, bounds, and high-level sequences (spec §4.2).
//!
//! The "mode lock" guards every code path that enters relative mode
//! (manual jogs, continuous workers) or issues an absolute E move, so
//! G90/G91 can never be concurrently flipped (spec §5). It is a plain
//! `tokio::sync::Mutex<()>` with short critical sections — workers must
//! never sleep while holding it (spec §9).

use std::sync::Arc;
use std::time::{Duration, Instant};

use scan_protocol::{travel_timeout, Axis, ErrorKind, PositionSnapshot};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::Configuration;
use crate::flags::Flags;
use crate::serial_manager::{self, SerialManager};

pub struct ScannerController {
    serial: Arc<SerialManager>,
    config: Arc<Configuration>,
    flags: Arc<Flags>,
    /// Serializes relative-mode sections and absolute-E moves (spec §4.2,
    /// §5, §8 mode-lock contention scenario).
    pub mode_lock: Arc<AsyncMutex<()>>,
}

fn clamp_linear(config: &Configuration, axis: Axis, value: f64) -> f64 {
    match axis {
        Axis::X => value.clamp(0.0, config.x_max),
        Axis::Y => value.clamp(0.0, config.y_max),
        Axis::Z => value.clamp(0.0, config.z_max),
        Axis::E => value,
    }
}

fn ok_in(lines: &[String]) -> bool {
    lines.iter().any(|l| l.eq_ignore_ascii_case("ok"))
}

impl ScannerController {
    pub fn new(serial: Arc<SerialManager>, config: Arc<Configuration>, flags: Arc<Flags>) -> Self {
        Self { serial, config, flags, mode_lock: Arc::new(AsyncMutex::new(())) }
    }

    /// Send mm and absolute-mode commands; idempotent.
    pub async fn ensure_units_and_absolute(&self) -> bool {
        let a = self.serial.send_now("G21").await;
        let b = self.serial.send_now("G90").await;
        a && b
    }

    /// Success iff "ok" is observed.
    pub async fn set_feedrate(&self, feed_mm_per_min: f64) -> bool {
        match self.serial.send_request(&format!("G1 F{feed_mm_per_min}"), self.config.serial_timeout).await {
            Ok(lines) => ok_in(&lines),
            Err(_) => false,
        }
    }

    /// Issues homing for `axis`; returns "ok" status.
    pub async fn home(&self, axis: Axis) -> bool {
        match self
            .serial
            .send_request(&format!("G28 {}", axis.letter()), self.config.init_poll_timeout)
            .await
        {
            Ok(lines) => ok_in(&lines) && self.serial.wait_motion_complete(self.config.init_poll_timeout).await,
            Err(_) => false,
        }
    }

    /// Clamps XYZ to axis limits; issues an absolute move.
    pub async fn move_absolute(&self, axis: Axis, value: f64) -> bool {
        let clamped = clamp_linear(&self.config, axis, value);
        match self
            .serial
            .send_request(&format!("G1 {}{clamped}", axis.letter()), self.config.serial_timeout)
            .await
        {
            Ok(lines) => ok_in(&lines),
            Err(_) => false,
        }
    }

    /// Pure-relative jog: briefly enters relative mode, issues one G1 at
    /// the jog feedrate, restores absolute mode. Must not read position
    /// (no polling contention).
    pub async fn delta_move(&self, axis: Axis, delta: f64) -> bool {
        let _guard = self.mode_lock.lock().await;
        let entered = self.serial.send_now("G91").await;
        let moved = self
            .serial
            .send_now(&format!("G1 {}{delta} F{}", axis.letter(), self.config.jog_feed_mm_per_min))
            .await;
        let restored = self.serial.send_now("G90").await;
        entered && moved && restored
    }

    /// Within the mode lock: optionally enable cold extrusion, compute the
    /// new E = stored ± step, issue an absolute E move, persist E on
    /// success. `rotate(0)` is a no-op that returns ok without touching
    /// the persisted value (spec §8 boundary behavior).
    pub async fn rotate(&self, step: f64, direction: i8) -> (bool, String) {
        if step == 0.0 {
            return (true, "no-op: zero step".to_string());
        }

        let _guard = self.mode_lock.lock().await;
        if self.config.e_axis_allow_cold_extrusion {
            self.serial.send_now("M302 P1").await;
        }

        let signed_step = if direction < 0 { -step } else { step };
        let new_e = self.flags.e_axis_position() + signed_step;

        match self.serial.send_request(&format!("G1 E{new_e}"), self.config.serial_timeout).await {
            Ok(lines) if ok_in(&lines) => {
                self.flags.set_e_axis_position(new_e);
                (true, format!("E now {new_e}"))
            }
            Ok(_) => (false, "rotate: firmware did not acknowledge".to_string()),
            Err(e) => (false, format!("rotate failed: {e}")),
        }
    }

    pub async fn get_position(&self) -> Vec<String> {
        self.serial.query_position().await
    }

    pub async fn get_position_axis(&self, axis: Axis) -> Option<f64> {
        let lines = self.serial.query_position().await;
        serial_manager::parse_axis(axis, &lines)
    }

    pub async fn get_position_snapshot(&self) -> PositionSnapshot {
        let lines = self.serial.query_position().await;
        serial_manager::parse_position(&lines)
    }

    async fn poll_until_within(&self, axis: Axis, target: f64, tolerance: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.get_position_axis(axis).await {
                if (value - target).abs() <= tolerance {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.init_poll_interval).await;
        }
    }

    /// Homing with three fallbacks (all-axes; then XY+Z; then per-axis)
    /// each bounded by a motion barrier; then a fast move to {0,0,10}
    /// verified by polling; then a fast move to the computed center
    /// verified by polling.
    pub async fn go_to_init(&self) -> (bool, String) {
        self.ensure_units_and_absolute().await;

        let homed = if self.home_all().await {
            true
        } else if self.home_xy_then_z().await {
            true
        } else if self.home(Axis::X).await && self.home(Axis::Y).await && self.home(Axis::Z).await {
            true
        } else {
            false
        };
        if !homed {
            return (false, "homing failed on all fallback strategies".to_string());
        }

        if !self.set_feedrate(self.config.fast_feed_mm_per_min).await {
            warn!("scanner: failed to set fast feed before safe-lift move");
        }
        if !self.move_absolute(Axis::X, 0.0).await
            || !self.move_absolute(Axis::Y, 0.0).await
            || !self.move_absolute(Axis::Z, 10.0).await
        {
            return (false, "safe-lift move rejected by firmware".to_string());
        }
        if !self.poll_until_within(Axis::Z, 10.0, self.config.init_position_tolerance_mm, self.config.init_poll_timeout).await {
            return (false, "timeout verifying safe-lift position".to_string());
        }

        let (cx, cy, cz) = self.config.center_xyz();
        if !self.move_absolute(Axis::X, cx).await
            || !self.move_absolute(Axis::Y, cy).await
            || !self.move_absolute(Axis::Z, cz).await
        {
            return (false, "center move rejected by firmware".to_string());
        }
        if !self.poll_until_within(Axis::X, cx, self.config.init_position_tolerance_mm, self.config.init_poll_timeout).await {
            return (false, "timeout/out-of-tolerance verifying center position".to_string());
        }

        (true, "centered".to_string())
    }

    async fn home_all(&self) -> bool {
        match self.serial.send_request("G28", self.config.init_poll_timeout).await {
            Ok(lines) => ok_in(&lines) && self.serial.wait_motion_complete(self.config.init_poll_timeout).await,
            Err(_) => false,
        }
    }

    /// Second homing fallback: X and Y in one command, then Z on its own
    /// (spec §4.2's middle strategy, between all-axes and per-axis).
    async fn home_xy_then_z(&self) -> bool {
        let xy = match self.serial.send_request("G28 X Y", self.config.init_poll_timeout).await {
            Ok(lines) => ok_in(&lines) && self.serial.wait_motion_complete(self.config.init_poll_timeout).await,
            Err(_) => false,
        };
        xy && self.home(Axis::Z).await
    }

    /// Ensure modes, set fast feed, absolute move X=x clamped, wait
    /// barrier.
    pub async fn go_to_scan_start(&self, x: f64) -> bool {
        self.ensure_units_and_absolute().await;
        self.set_feedrate(self.config.fast_feed_mm_per_min).await;
        self.move_absolute(Axis::X, x).await
            && self.serial.wait_motion_complete(self.config.init_poll_timeout).await
    }

    /// Ensure modes; set scan feed (fixed or `60*e_r*fps` in sync mode);
    /// absolute move to x0 then x1; wait barrier with a generous timeout
    /// proportional to distance/feed.
    pub async fn scan_path(&self, x0: f64, x1: f64) -> Result<(), ErrorKind> {
        if x1 < x0 {
            return Err(ErrorKind::InvalidArgument("scan_path: x1 < x0".to_string()));
        }
        if x1 == x0 {
            return Ok(());
        }

        self.ensure_units_and_absolute().await;
        let feed = self.config.scan_feed_mm_per_min();
        self.set_feedrate(feed).await;

        let barrier_timeout = travel_timeout(x1 - x0, feed, self.config.scan_path_timeout_slack);

        if !self.move_absolute(Axis::X, x0).await {
            return Err(ErrorKind::IoError("scan_path: move to x0 rejected".to_string()));
        }
        if !self.serial.wait_motion_complete(barrier_timeout).await {
            return Err(ErrorKind::Timeout);
        }
        if !self.move_absolute(Axis::X, x1).await {
            return Err(ErrorKind::IoError("scan_path: move to x1 rejected".to_string()));
        }
        if !self.serial.wait_motion_complete(barrier_timeout).await {
            return Err(ErrorKind::Timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_linear_bounds_xyz_but_not_e() {
        let config = Configuration::default();
        assert_eq!(clamp_linear(&config, Axis::X, 1000.0), config.x_max);
        assert_eq!(clamp_linear(&config, Axis::X, -10.0), 0.0);
        assert_eq!(clamp_linear(&config, Axis::E, 1000.0), 1000.0);
        assert_eq!(clamp_linear(&config, Axis::E, -1000.0), -1000.0);
    }

    #[test]
    fn ok_in_matches_case_insensitively() {
        assert!(ok_in(&["OK".to_string()]));
        assert!(ok_in(&["ok".to_string()]));
        assert!(!ok_in(&["busy".to_string()]));
    }
}
