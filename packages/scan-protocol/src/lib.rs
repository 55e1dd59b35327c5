//! # scan-protocol
//!
//! Shared types for the benchtop ultrasound scanner control core.
//!
//! These types are used by:
//! - `scan-core`: the long-running control process (serial manager, scanner
//!   controller, ultrasound SDK session, orchestrator, HTTP surface)
//! - `scan-core`'s recorder binary: a short-lived child process spawned per
//!   sweep that reads the same `ScanPlan` and writes the same config-record
//!   key order
//! - `gcode-sim`: a standalone firmware simulator used in development,
//!   which needs the same axis/feed vocabulary to answer plausibly
//!
//! Keeping them in one crate means the recorder's `config.txt` writer and
//! the orchestrator's `ScanPlan` producer can never drift out of sync on
//! field names or key order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error taxonomy ─────────────────────────────────────────────────────────

/// Error taxonomy shared by every subsystem. Operations return
/// `Result<T, ErrorKind>` (or a boolean/`(ok, message)` pair where the
/// original design calls for it) rather than panicking; see DESIGN.md.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("serial handle not connected")]
    NotConnected,
    #[error("serial I/O error: {0}")]
    IoError(String),
    #[error("operation timed out")]
    Timeout,
    #[error("target out of range, clamped")]
    OutOfRange,
    #[error("ultrasound probe unavailable: {0}")]
    ProbeUnavailable(String),
    #[error("ultrasound session not ready")]
    NotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation already active")]
    AlreadyActive,
    #[error("shutting down, operation refused")]
    ShuttingDown,
    #[error("request queue full")]
    QueueFull,
}

// ── Axes ───────────────────────────────────────────────────────────────────

/// A single motion-stage axis. X/Y/Z are bounded linear axes; E is the
/// unbounded rotational nozzle axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Parsed M114-style position report. Each axis is optional because the
/// firmware may omit an axis from its report, or the report may be empty
/// after a timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

impl PositionSnapshot {
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::E => self.e,
        }
    }
}

// ── Scan plan ────────────────────────────────────────────────────────────

/// How a scan range was derived: an explicit preset, or an operator-given
/// custom range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Long,
    Short,
    Custom,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Long => "long",
            ScanMode::Short => "short",
            ScanMode::Custom => "custom",
        }
    }
}

/// {x0, x1, mode}. Clamped to [0, Xmax] with x0 < x1. Persisted as JSON
/// under the state dir (`scanplan.json`) and propagated to the recorder
/// process via environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub x0: f64,
    pub x1: f64,
    pub mode: ScanMode,
}

impl ScanPlan {
    /// Clamp an explicit range to [0, x_max], swapping/inferring nothing —
    /// the caller decides custom vs preset before calling this.
    pub fn clamped(x0: f64, x1: f64, mode: ScanMode, x_max: f64) -> Self {
        let lo = x0.clamp(0.0, x_max);
        let hi = x1.clamp(0.0, x_max);
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        Self { x0: lo, x1: hi, mode }
    }

    /// "long": full axis travel, 0..Xmax.
    pub fn long(x_max: f64) -> Self {
        Self { x0: 0.0, x1: x_max, mode: ScanMode::Long }
    }

    /// "short": a centered 15..min(90, Xmax) default range.
    pub fn short(x_max: f64) -> Self {
        Self { x0: 15.0, x1: x_max.min(90.0), mode: ScanMode::Short }
    }

    pub fn span_mm(&self) -> f64 {
        (self.x1 - self.x0).abs()
    }
}

// ── Measurement directory layout ────────────────────────────────────────

/// Fixed subfolder names under a measurement directory (see spec §6).
pub mod measurement_layout {
    pub const CONFIG_FILE: &str = "config.txt";
    pub const FRAMES_DIR: &str = "frames";
    pub const RAWS_DIR: &str = "raws";
    pub const DICOM_SERIES_DIR: &str = "dicom_series";
}

/// Environment variable names passed to the recorder child process.
pub mod recorder_env {
    pub const SCAN_X0: &str = "SCAN_X0";
    pub const SCAN_X1: &str = "SCAN_X1";
    pub const SCAN_START_X: &str = "SCAN_START_X";
    pub const SCAN_END_X: &str = "SCAN_END_X";
    pub const SCAN_MODE: &str = "SCAN_MODE";
    pub const REC_POSITION_STR: &str = "REC_POSITION_STR";
}

/// Cross-process flag file names (see spec §6). Values are single lines;
/// readers treat parse failures as "not present" rather than erroring.
pub mod flag_files {
    pub const SCANNING: &str = "scanning";
    pub const MULTISWEEP: &str = "multisweep";
    pub const RECDIR: &str = "recdir";
    pub const SCANPLAN: &str = "scanplan.json";
    pub const E_AXIS_POSITION: &str = "e_axis_position.txt";
}

/// The fixed key order the recorder writes to `config.txt`. Cross-checked
/// against `multisweep.py`'s positional reads of the same file (e_r at
/// index 2, Xres/Yres at 12/13, the position line at 9) — this order is
/// load-bearing for the external merger and must never be reordered.
pub const CONFIG_RECORD_KEYS: &[&str] = &[
    "W",
    "H",
    "e_r setpoint",
    "dx",
    "total_samples",
    "frame_rate_aim",
    "delay at SS",
    "scan speed ",
    "ID ",
    "POSTIONS ",
    "COMPUTER ID ",
    "Start Time ",
    "Xres",
    "Yres",
];

/// A recorder-written config record, built in strict key order matching
/// `CONFIG_RECORD_KEYS`. Serialized as `"Key:Value;\n"` lines, never JSON —
/// this is a cross-language, append-only text format downstream tools
/// (imconv, multisweep) already parse positionally.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRecord {
    pub w: u32,
    pub h: u32,
    pub e_r_setpoint: f64,
    pub dx: f64,
    pub total_samples: u64,
    pub frame_rate_aim: f64,
    pub delay_at_ss: f64,
    pub scan_speed: f64,
    pub id: String,
    pub positions: String,
    pub computer_id: String,
    pub start_time: f64,
    pub xres: f64,
    pub yres: f64,
}

impl ConfigRecord {
    /// Render as the fixed `"Key:Value;\n"` lines, in `CONFIG_RECORD_KEYS`
    /// order.
    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        for (key, value) in CONFIG_RECORD_KEYS.iter().zip([
            self.w.to_string(),
            self.h.to_string(),
            self.e_r_setpoint.to_string(),
            self.dx.to_string(),
            self.total_samples.to_string(),
            self.frame_rate_aim.to_string(),
            self.delay_at_ss.to_string(),
            self.scan_speed.to_string(),
            self.id.clone(),
            self.positions.clone(),
            self.computer_id.clone(),
            self.start_time.to_string(),
            self.xres.to_string(),
            self.yres.to_string(),
        ]) {
            out.push_str(&format!("{key}:{value};\n"));
        }
        out
    }
}

// ── Timing helpers shared by serial + recorder ──────────────────────────

/// Convert a feed in mm/min to a `Duration` to travel `distance_mm`, padded
/// by `slack` on top — used to size the motion-barrier timeout for
/// `scan_path`.
pub fn travel_timeout(distance_mm: f64, feed_mm_per_min: f64, slack: Duration) -> Duration {
    if feed_mm_per_min <= 0.0 {
        return slack;
    }
    let minutes = distance_mm.abs() / feed_mm_per_min;
    Duration::from_secs_f64(minutes * 60.0) + slack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_plan_long_spans_full_axis() {
        let plan = ScanPlan::long(118.0);
        assert_eq!(plan.x0, 0.0);
        assert_eq!(plan.x1, 118.0);
        assert_eq!(plan.mode, ScanMode::Long);
    }

    #[test]
    fn scan_plan_short_is_centered_default() {
        let plan = ScanPlan::short(118.0);
        assert_eq!(plan.x0, 15.0);
        assert_eq!(plan.x1, 90.0);
    }

    #[test]
    fn scan_plan_short_clamps_to_axis_max() {
        let plan = ScanPlan::short(60.0);
        assert_eq!(plan.x1, 60.0);
    }

    #[test]
    fn scan_plan_clamped_orders_and_bounds() {
        let plan = ScanPlan::clamped(130.0, -10.0, ScanMode::Custom, 118.0);
        assert_eq!(plan.x0, 0.0);
        assert_eq!(plan.x1, 118.0);
    }

    #[test]
    fn config_record_key_order_is_fixed() {
        let rec = ConfigRecord {
            w: 1024,
            h: 1024,
            e_r_setpoint: 0.06,
            dx: 118.0,
            total_samples: 1967,
            frame_rate_aim: 25.0,
            delay_at_ss: 9.0,
            scan_speed: 90.0,
            id: "20260101_000000".into(),
            positions: "X:0.00 Y:0.00 Z:10.00".into(),
            computer_id: "bench-pc".into(),
            start_time: 1_700_000_000.0,
            xres: 0.05,
            yres: 0.05,
        };
        let lines = rec.to_lines();
        let keys: Vec<&str> = lines.lines().map(|l| l.split(':').next().unwrap()).collect();
        assert_eq!(keys, CONFIG_RECORD_KEYS.to_vec());
    }

    #[test]
    fn travel_timeout_scales_with_distance_and_feed() {
        let t = travel_timeout(118.0, 90.0, Duration::from_secs(30));
        // 118/90 min = 1.3111 min = 78.67s, + 30s slack
        assert!((t.as_secs_f64() - 108.67).abs() < 0.1);
    }
}
