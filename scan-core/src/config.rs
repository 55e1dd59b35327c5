//! Centralized, environment-overridable configuration.
//!
//! Immutable per process: constructed once in the composition root
//! (`main.rs`) and shared behind an `Arc` with every subsystem. Mirrors the
//! teacher's `UwbHubConfig::default()` pattern of reading each field from
//! an environment variable with a typed fallback, generalized from four
//! fields to the full geometry/timing/path surface this core needs.
//!
//! Defaults are taken from the original Python implementation's
//! `app/config.py`, which is the authoritative source for this system's
//! physical constants.

use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

/// Patterns that identify acceptable printer/USB-serial adapters when no
/// explicit `SERIAL_PORT` is configured.
#[derive(Debug, Clone)]
pub struct SerialProfile {
    pub description_patterns: Vec<String>,
}

impl Default for SerialProfile {
    fn default() -> Self {
        Self {
            description_patterns: [
                "USB-SERIAL",
                "CH340",
                "CH341",
                "USB-SERIAL CH340",
                "USB SERIAL",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    // ---------------- Paths ----------------
    pub data_root: PathBuf,
    pub state_dir: PathBuf,
    pub dll_name: String,
    pub dicom_template_name: String,

    // ---------------- Scanner / geometry ----------------
    pub x_max: f64,
    pub y_max: f64,
    pub z_max: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub offset_z: f64,

    // ---------------- Feedrates ----------------
    pub scan_speed_mm_per_min: f64,
    pub fast_feed_mm_per_min: f64,
    pub jog_feed_mm_per_min: f64,
    /// When true, `scan_path` computes feed as `60 * e_r * fps` instead of
    /// using the fixed `scan_speed_mm_per_min`.
    pub sync_feed_to_fps: bool,

    // ---------------- E axis ----------------
    pub e_axis_default_step: f64,
    pub e_axis_allow_cold_extrusion: bool,
    /// Upper bound on how long a continuous E-axis worker may run
    /// unattended even without a stop signal (spec §5, §8 boundary case).
    pub continuous_e_max_duration: Duration,

    // ---------------- Ultrasound / acquisition ----------------
    pub ultra_w: u32,
    pub ultra_h: u32,
    pub target_fps: f64,
    pub elevation_resolution_mm: f64,
    pub dx_mm: f64,
    /// Fallback travel speed (mm/s) used to derive `e_r_effective` when
    /// `elevation_resolution_mm` is not configured positive.
    pub travel_speed_x_mm_per_s: f64,

    // ---------------- Serial / printer ----------------
    pub serial_baud: u32,
    pub serial_timeout: Duration,
    pub serial_profile: SerialProfile,
    pub serial_port: Option<String>,
    pub serial_reconnect_period: Duration,
    pub serial_response_settle: Duration,
    pub serial_read_window: Duration,

    // ---------------- Timing ----------------
    pub delay_before_record: Duration,
    /// INIT homing tolerance (mm) and poll cadence.
    pub init_position_tolerance_mm: f64,
    pub init_poll_interval: Duration,
    pub init_poll_timeout: Duration,
    /// Extra slack folded into `scan_path`'s motion-barrier timeout beyond
    /// the distance/feed estimate.
    pub scan_path_timeout_slack: Duration,

    // ---------------- UI limits ----------------
    pub jog_feed_max_mm_per_min: f64,
    pub jog_queue_capacity: usize,
    pub jog_debounce: Duration,
    /// Server-clamped minimum tick interval for continuous-move workers.
    pub continuous_move_min_tick: Duration,
    pub max_click_step_mm: f64,

    // ---------------- Recorder distance trigger ----------------
    /// Tolerance subtracted from `e_r_effective` when deciding a frame has
    /// been reached (spec §4.4 step 6): 10% of e_r_effective.
    pub recorder_distance_tolerance_fraction: f64,
    pub recorder_poll_interval: Duration,

    // ---------------- Multi-sweep ----------------
    /// ±Y offset (mm) between the two sweeps of a multi-sweep, wide enough
    /// for the downstream merger to stitch a meaningfully wider volume
    /// (spec §4.4, E2E scenario 4) — independent of `elevation_resolution_mm`.
    pub multisweep_y_offset_mm: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        let base_dir: PathBuf = env_str_or("SCAN_BASE_DIR", ".").into();
        let data_root = base_dir.join("static").join("data");
        let state_dir = base_dir.clone();

        Self {
            data_root,
            state_dir,
            dll_name: env_str_or("US_DLL_NAME", "usgfw2wrapper.dll"),
            dicom_template_name: env_str_or("DICOM_TEMPLATE_NAME", "dcmimage.dcm"),

            x_max: env_or("X_MAX", 118.0),
            y_max: env_or("Y_MAX", 118.0),
            z_max: env_or("Z_MAX", 160.0),
            offset_x: env_or("OFFSET_X", -5.5),
            offset_y: env_or("OFFSET_Y", -5.5),
            offset_z: env_or("OFFSET_Z", -70.0),

            scan_speed_mm_per_min: env_or("SCAN_SPEED", 90.0),
            fast_feed_mm_per_min: env_or("FAST_FEED", 1200.0),
            jog_feed_mm_per_min: env_or("JOG_FEED", 2400.0),
            sync_feed_to_fps: env_or("SCAN_SYNC_FEED_TO_FPS", true),

            e_axis_default_step: env_or("E_AXIS_STEP", 0.1),
            e_axis_allow_cold_extrusion: env_str_or("E_AXIS_COLD", "1") == "1",
            continuous_e_max_duration: Duration::from_secs_f64(env_or(
                "E_AXIS_CONTINUOUS_MAX_S",
                8.0,
            )),

            ultra_w: env_or("ULTRASOUND_WIDTH", 1024),
            ultra_h: env_or("ULTRASOUND_HEIGHT", 1024),
            target_fps: env_or("TARGET_FPS", 25.0),
            elevation_resolution_mm: env_or("ELEVATION_RESOLUTION", 0.06),
            dx_mm: env_or("DX_MM", 118.0),
            travel_speed_x_mm_per_s: env_or("TRAVEL_SPEED_X", 5.0),

            serial_baud: env_or("SERIAL_BAUD", 115200),
            serial_timeout: Duration::from_secs_f64(env_or("SERIAL_TIMEOUT", 1.0)),
            serial_profile: SerialProfile::default(),
            serial_port: std::env::var("SERIAL_PORT").ok().filter(|v| !v.is_empty()),
            serial_reconnect_period: Duration::from_secs_f64(env_or(
                "SERIAL_RECONNECT_PERIOD",
                3.0,
            )),
            serial_response_settle: Duration::from_secs_f64(env_or(
                "SERIAL_RESPONSE_SETTLE",
                0.05,
            )),
            serial_read_window: Duration::from_secs_f64(env_or("SERIAL_READ_WINDOW", 0.5)),

            delay_before_record: Duration::from_secs_f64(env_or("DELAY_BEFORE_RECORD", 9.0)),
            init_position_tolerance_mm: env_or("INIT_POSITION_TOLERANCE", 0.5),
            init_poll_interval: Duration::from_millis(env_or("INIT_POLL_INTERVAL_MS", 100)),
            init_poll_timeout: Duration::from_secs_f64(env_or("INIT_POLL_TIMEOUT_S", 30.0)),
            scan_path_timeout_slack: Duration::from_secs_f64(env_or(
                "SCAN_PATH_TIMEOUT_SLACK_S",
                30.0,
            )),

            jog_feed_max_mm_per_min: env_or("JOG_FEED_MAX", 4000.0),
            jog_queue_capacity: env_or("JOG_QUEUE_CAPACITY", 16usize),
            jog_debounce: Duration::from_millis(env_or("JOG_DEBOUNCE_MS", 150)),
            continuous_move_min_tick: Duration::from_millis(env_or(
                "CONTINUOUS_MOVE_MIN_TICK_MS",
                50,
            )),
            max_click_step_mm: env_or("MAX_CLICK_STEP_MM", 10.0),

            recorder_distance_tolerance_fraction: env_or(
                "RECORDER_DISTANCE_TOLERANCE_FRACTION",
                0.10,
            ),
            recorder_poll_interval: Duration::from_millis(env_or(
                "RECORDER_POLL_INTERVAL_MS",
                20,
            )),

            multisweep_y_offset_mm: env_or("MULTISWEEP_Y_OFFSET_MM", 10.0),
        }
    }
}

impl Configuration {
    /// mm/frame required to satisfy `elevation_resolution_mm` given the
    /// configured travel speed, when `elevation_resolution_mm` itself is
    /// not positive (recorder protocol step 3).
    pub fn e_r_effective(&self) -> f64 {
        if self.elevation_resolution_mm > 0.0 {
            self.elevation_resolution_mm
        } else {
            self.travel_speed_x_mm_per_s / self.target_fps.max(1.0)
        }
    }

    /// Scan feed in mm/min for `scan_path`: either the fixed configured
    /// speed, or `60 * e_r * fps` when sync mode is enabled (spec §4.2).
    pub fn scan_feed_mm_per_min(&self) -> f64 {
        if self.sync_feed_to_fps {
            60.0 * self.e_r_effective() * self.target_fps
        } else {
            self.scan_speed_mm_per_min
        }
    }

    pub fn center_xyz(&self) -> (f64, f64, f64) {
        (
            self.offset_x + self.x_max / 2.0,
            self.offset_y + self.y_max / 2.0,
            self.offset_z + self.z_max / 2.0,
        )
    }

    pub fn dll_path(&self) -> PathBuf {
        self.state_dir.join(&self.dll_name)
    }

    /// Timestamped measurement directory under `data_root`, with its
    /// `frames/raws/dicom_series` subfolders created eagerly (mirrors
    /// `Config.ensure_measurement_dir()` in the original implementation).
    pub fn ensure_measurement_dir(&self, timestamp: &str) -> std::io::Result<PathBuf> {
        let dir = self.data_root.join(timestamp);
        std::fs::create_dir_all(dir.join(scan_protocol::measurement_layout::FRAMES_DIR))?;
        std::fs::create_dir_all(dir.join(scan_protocol::measurement_layout::RAWS_DIR))?;
        std::fs::create_dir_all(dir.join(scan_protocol::measurement_layout::DICOM_SERIES_DIR))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_original_constants() {
        let cfg = Configuration::default();
        assert_eq!(cfg.x_max, 118.0);
        assert_eq!(cfg.z_max, 160.0);
        assert_eq!(cfg.offset_z, -70.0);
    }

    #[test]
    fn sync_feed_matches_worked_example() {
        let mut cfg = Configuration::default();
        cfg.elevation_resolution_mm = 0.06;
        cfg.target_fps = 25.0;
        cfg.sync_feed_to_fps = true;
        assert!((cfg.scan_feed_mm_per_min() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn e_r_effective_falls_back_to_travel_speed_over_fps() {
        let mut cfg = Configuration::default();
        cfg.elevation_resolution_mm = 0.0;
        cfg.travel_speed_x_mm_per_s = 5.0;
        cfg.target_fps = 25.0;
        assert!((cfg.e_r_effective() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn center_xyz_uses_offsets_and_half_span() {
        let cfg = Configuration::default();
        let (cx, cy, cz) = cfg.center_xyz();
        assert!((cx - (-5.5 + 59.0)).abs() < 1e-9);
        assert!((cy - (-5.5 + 59.0)).abs() < 1e-9);
        assert!((cz - (-70.0 + 80.0)).abs() < 1e-9);
    }
}
