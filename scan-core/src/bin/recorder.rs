//! Recorder — short-lived child process spawned per sweep (spec §4.4).
//!
//! Runs independently of the control core: it resolves its own scan
//! range, brings up its own ultrasound session, and saves frames as the
//! stage advances. It makes a best-effort attempt to open its own serial
//! connection purely to read `M114` position reports for the
//! distance-trigger; if that fails (for example because the control core
//! already holds the adapter exclusively on this platform) it falls back
//! to a time-based capture cadence at the configured target frame rate,
//! logged as a degraded mode rather than treated as fatal — matching the
//! original implementation's tolerance for missing X feedback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scan_protocol::{measurement_layout, recorder_env, Axis, ConfigRecord, ScanMode, ScanPlan};
use tracing::{info, warn};

use scan_core::config::Configuration;
use scan_core::flags::Flags;
use scan_core::serial_manager::{self, SerialManager};
use scan_core::ultrasound::UltrasoundSession;

fn resolve_plan(flags: &Flags, config: &Configuration) -> ScanPlan {
    let env_pair = std::env::var(recorder_env::SCAN_X0)
        .ok()
        .and_then(|x0| x0.parse::<f64>().ok())
        .zip(std::env::var(recorder_env::SCAN_X1).ok().and_then(|x1| x1.parse::<f64>().ok()));

    if let Some((x0, x1)) = env_pair {
        let mode = match std::env::var(recorder_env::SCAN_MODE).as_deref() {
            Ok("long") => ScanMode::Long,
            Ok("short") => ScanMode::Short,
            _ => ScanMode::Custom,
        };
        return ScanPlan::clamped(x0, x1, mode, config.x_max);
    }

    flags.scanplan().unwrap_or_else(|| ScanPlan::long(config.x_max))
}

fn computer_id() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "bench-pc".to_string())
}

/// Writes a NumPy `.npy` array: magic, version, a header dict giving
/// dtype/order/shape, then the raw bytes — self-describing so
/// `imconv.py`/`multisweep.py` can `np.load` it directly (spec §4.4 step 6).
/// The header is padded with spaces to a 64-byte-aligned total length, per
/// the NumPy format.
fn write_npy_u8(path: &Path, data: &[u8], shape: (u32, u32)) -> std::io::Result<()> {
    let header = format!("{{'descr': '|u1', 'fortran_order': False, 'shape': ({}, {}), }}", shape.0, shape.1);
    const PREFIX_LEN: usize = 10; // b"\x93NUMPY" + major + minor + u16 header length
    let unpadded = PREFIX_LEN + header.len() + 1; // +1 for the trailing newline
    let padded = unpadded.div_ceil(64) * 64;

    let mut header_bytes = header.into_bytes();
    header_bytes.resize(padded - PREFIX_LEN - 1, b' ');
    header_bytes.push(b'\n');

    let mut buf = Vec::with_capacity(padded + data.len());
    buf.extend_from_slice(b"\x93NUMPY");
    buf.push(1); // major version
    buf.push(0); // minor version
    buf.extend_from_slice(&(header_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(data);

    std::fs::write(path, buf)
}

fn save_frame(frames_dir: &Path, raws_dir: &Path, index: u64, rgba: &[u8], w: u32, h: u32) {
    let gray: Vec<u8> = rgba.chunks_exact(4).map(|px| px[0]).collect();

    if let Err(e) = write_npy_u8(&raws_dir.join(format!("{index}.npy")), &gray, (h, w)) {
        warn!("recorder: failed to write raw frame {index}: {e}");
    }

    match image::GrayImage::from_raw(w, h, gray) {
        Some(img) => {
            if let Err(e) = img.save(frames_dir.join(format!("{index:05}.jpg"))) {
                warn!("recorder: failed to encode frame {index}: {e}");
            }
        }
        None => warn!("recorder: frame {index} buffer size mismatch, skipped"),
    }
}

fn sibling_executable(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "recorder=info".into()),
        )
        .init();

    let config = Arc::new(Configuration::default());
    let flags = Arc::new(Flags::new(config.state_dir.clone()));

    let plan = resolve_plan(&flags, &config);
    flags.set_scanning(true);
    info!("recorder: starting sweep x0={} x1={} mode={}", plan.x0, plan.x1, plan.mode.as_str());

    let recdir = flags.recdir().unwrap_or_else(|| config.data_root.clone());
    let frames_dir = recdir.join(measurement_layout::FRAMES_DIR);
    let raws_dir = recdir.join(measurement_layout::RAWS_DIR);
    std::fs::create_dir_all(&frames_dir).ok();
    std::fs::create_dir_all(&raws_dir).ok();

    let e_r = config.e_r_effective();
    let span = plan.span_mm();
    let n_frames = if e_r > 0.0 { (span / e_r).ceil() as u64 } else { 0 };
    let tolerance = e_r * config.recorder_distance_tolerance_fraction;

    let ultrasound = Arc::new(UltrasoundSession::new(Arc::clone(&config)));
    if !ultrasound.ensure_ready().await {
        warn!("recorder: probe not ready at start, will retry lazily during capture");
    }
    let (xres, yres) = ultrasound.get_resolution().await.unwrap_or((0.0, 0.0));

    let config_record = ConfigRecord {
        w: config.ultra_w,
        h: config.ultra_h,
        e_r_setpoint: e_r,
        dx: config.dx_mm,
        total_samples: n_frames,
        frame_rate_aim: config.target_fps,
        delay_at_ss: config.delay_before_record.as_secs_f64(),
        scan_speed: config.scan_feed_mm_per_min(),
        id: chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string(),
        positions: std::env::var(recorder_env::REC_POSITION_STR).unwrap_or_default(),
        computer_id: computer_id(),
        start_time: chrono::Utc::now().timestamp() as f64,
        xres,
        yres,
    };
    if let Err(e) = std::fs::write(recdir.join(measurement_layout::CONFIG_FILE), config_record.to_lines()) {
        warn!("recorder: failed to write config record: {e}");
    }

    let serial = SerialManager::new(Arc::clone(&config));
    serial.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let has_position_feedback = serial.is_connected();
    if !has_position_feedback {
        warn!("recorder: no X position feedback available, falling back to time-based cadence");
    }

    let frame_period = Duration::from_secs_f64(1.0 / config.target_fps.max(1.0));
    let started = Instant::now();
    let mut saved = 0u64;
    let mut next_target = plan.x0 + e_r;

    loop {
        if !flags.scanning() {
            info!("recorder: scanning flag cleared externally, stopping");
            break;
        }
        if n_frames > 0 && saved >= n_frames {
            info!("recorder: reached target sample count, stopping");
            break;
        }

        let current_x = if has_position_feedback {
            serial_manager::parse_axis(Axis::X, &serial.query_position().await)
        } else {
            None
        };

        let should_capture = match current_x {
            Some(x) => x + tolerance >= next_target,
            None if has_position_feedback => false,
            None => started.elapsed() >= frame_period * (saved as u32 + 1),
        };

        if should_capture {
            match ultrasound.grab_frame().await {
                Ok((rgba, w, h)) => save_frame(&frames_dir, &raws_dir, saved, &rgba, w, h),
                Err(e) => {
                    warn!("recorder: frame grab failed ({e}), retrying session");
                    ultrasound.reset().await;
                    ultrasound.ensure_ready().await;
                }
            }
            saved += 1;
            next_target += e_r;
        }

        if let Some(x) = current_x {
            if x >= plan.x1 - tolerance {
                info!("recorder: reached end of travel, stopping");
                break;
            }
        }

        tokio::time::sleep(config.recorder_poll_interval).await;
    }

    flags.set_scanning(false);
    serial.send_now("G90").await;

    ultrasound.freeze().await;
    ultrasound.stop().await;
    ultrasound.close().await;
    serial.close().await;

    let normal_exit = saved > 0;
    if normal_exit {
        match tokio::process::Command::new(sibling_executable("imconv")).arg(&recdir).kill_on_drop(false).spawn() {
            Ok(_) => info!("recorder: spawned downstream conversion for {}", recdir.display()),
            Err(e) => warn!("recorder: failed to spawn downstream conversion: {e}"),
        }
    } else {
        warn!("recorder: no frames captured, skipping downstream conversion");
    }

    info!("recorder: captured {saved} frames of {n_frames} planned");
}
