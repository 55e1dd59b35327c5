//! Continuous MJPEG producer (spec §4.3, §6, §9: "The live preview must
//! never block on a vendor failure ... continue producing frames (a
//! placeholder image) rather than terminating the stream").
//!
//! Mirrors `usg_realtime.py`'s `_capture_loop`: on any grab failure the
//! loop does not propagate the error to its caller, it substitutes a
//! placeholder frame and backs off before retrying, so a disconnected
//! probe degrades the preview instead of killing it. A `broadcast`
//! channel fans the encoded JPEG bytes out to every connected MJPEG
//! client; slow subscribers drop old frames rather than stalling the
//! producer (spec §9's bounded/drop-older-frames guidance).

use std::sync::Arc;
use std::time::Duration;

use image::{codecs::jpeg::JpegEncoder, ColorType, RgbaImage};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::ultrasound::scale_bar::{overlay_scale_bar, DEFAULT_DEPTH_MM};
use crate::ultrasound::session::UltrasoundSession;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const BACKOFF_GROWTH: f64 = 1.6;

/// Fan-out handle: clone to hand a new MJPEG client its own receiver.
#[derive(Clone)]
pub struct FrameBus {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.tx.subscribe()
    }

    fn publish(&self, frame: Vec<u8>) {
        // No receivers is the common case between client connections;
        // a send error there is not a fault.
        let _ = self.tx.send(Arc::new(frame));
    }
}

fn placeholder_jpeg(width: u32, height: u32) -> Vec<u8> {
    let gray = vec![32u8; (width as usize) * (height as usize)];
    let rgba = overlay_scale_bar(&gray, width, height, DEFAULT_DEPTH_MM);
    encode_jpeg(&rgba).unwrap_or_default()
}

fn encode_jpeg(rgba: &RgbaImage) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    match encoder.encode(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8) {
        Ok(()) => Some(buf),
        Err(e) => {
            warn!("mjpeg: jpeg encode failed: {e}");
            None
        }
    }
}

/// Runs forever, pushing encoded JPEG frames onto `bus` at roughly
/// `config.target_fps`. Never returns on a transient vendor error; only
/// exits when the task is cancelled by its owner (orchestrator shutdown).
pub async fn run_producer(session: Arc<UltrasoundSession>, config: Arc<Configuration>, bus: FrameBus) {
    let frame_period = Duration::from_secs_f64(1.0 / config.target_fps.max(1.0));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let tick_start = Instant::now();

        if !session.ensure_ready().await {
            bus.publish(placeholder_jpeg(config.ultra_w, config.ultra_h));
            tokio::time::sleep(backoff).await;
            backoff = Duration::from_secs_f64((backoff.as_secs_f64() * BACKOFF_GROWTH).min(MAX_BACKOFF.as_secs_f64()));
            continue;
        }

        match session.grab_frame().await {
            Ok((rgba_bytes, w, h)) => {
                backoff = INITIAL_BACKOFF;
                let gray: Vec<u8> = rgba_bytes.chunks_exact(4).map(|px| px[0]).collect();
                let depth_mm = session
                    .get_resolution()
                    .await
                    .map(|(_, ry)| ry * h as f64)
                    .filter(|d| *d > 0.0)
                    .unwrap_or(DEFAULT_DEPTH_MM);
                let overlaid = overlay_scale_bar(&gray, w, h, depth_mm);
                match encode_jpeg(&overlaid) {
                    Some(jpeg) => bus.publish(jpeg),
                    None => bus.publish(placeholder_jpeg(w, h)),
                }
            }
            Err(e) => {
                debug!("mjpeg: frame grab failed, resetting session: {e}");
                session.reset().await;
                bus.publish(placeholder_jpeg(config.ultra_w, config.ultra_h));
                tokio::time::sleep(backoff).await;
                backoff = Duration::from_secs_f64((backoff.as_secs_f64() * BACKOFF_GROWTH).min(MAX_BACKOFF.as_secs_f64()));
                continue;
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < frame_period {
            tokio::time::sleep(frame_period - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_jpeg_is_non_empty() {
        let bytes = placeholder_jpeg(32, 32);
        assert!(!bytes.is_empty());
        // JPEG SOI marker.
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn frame_bus_fans_out_to_multiple_subscribers() {
        let bus = FrameBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(vec![1, 2, 3]);
        assert_eq!(*a.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*b.recv().await.unwrap(), vec![1, 2, 3]);
    }
}
