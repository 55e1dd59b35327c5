//! Scale-bar overlay — a pure function over pixels (spec §4.3, §9: "isolate
//! in a pure function that takes a grayscale image and (w, h,
//! rx_mm_per_px, depth_mm) and returns a new RGB image. This makes the
//! overlay deterministic and testable.").
//!
//! The "nice" tick-interval algorithm (1/2/5 × 10^k, ~6 major ticks across
//! the visible depth) is carried over verbatim from the original
//! implementation's `_nice_interval` helper in `usg_realtime.py` — it's the
//! literal derivation behind spec §4.3's prose description, not a
//! reinterpretation of it.
//!
//! Text labels at major ticks are not rendered here: the corpus this crate
//! is grounded on carries no font-rendering crate (imageproc/ab_glyph), so
//! rather than fabricate that dependency, major ticks are drawn longer
//! than minor ticks and left unlabeled. TODO: add a text label pass once a
//! font-rendering crate is approved for the dependency stack.

use image::{Rgba, RgbaImage};

/// Rightmost fraction of width reserved for ticks and labels.
const MARGIN_FRACTION: f64 = 0.08;
/// Depth assumed when resolution/depth cannot be queried from the device.
pub const DEFAULT_DEPTH_MM: f64 = 120.0;
const TARGET_TICKS: f64 = 6.0;

/// Pick a "nice" step (1, 2, or 5 × 10^k) so that roughly `TARGET_TICKS`
/// major ticks span `max_mm`.
pub fn nice_interval(max_mm: f64) -> f64 {
    if max_mm <= 0.0 {
        return 1.0;
    }
    let raw = max_mm / TARGET_TICKS;
    let magnitude = 10f64.powf(raw.log10().floor());
    for factor in [1.0, 2.0, 5.0] {
        let candidate = factor * magnitude;
        if raw <= candidate {
            return candidate;
        }
    }
    10.0 * magnitude
}

/// Composite a vertical depth ruler onto a grayscale frame, expanded to
/// RGBA so it composites without an opaque background. `rx_mm_per_px` is
/// the queried horizontal resolution (unused directly here but threaded
/// through for callers that also draw a horizontal scale); `depth_mm` is
/// the vertical span the frame height represents.
pub fn overlay_scale_bar(gray: &[u8], width: u32, height: u32, depth_mm: f64) -> RgbaImage {
    let mut out = RgbaImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        let v = gray.get(idx).copied().unwrap_or(0);
        Rgba([v, v, v, 255])
    });

    let depth = if depth_mm > 0.0 { depth_mm } else { DEFAULT_DEPTH_MM };
    let interval = nice_interval(depth);
    let minor_interval = interval / 5.0;
    let margin_x = (width as f64 * (1.0 - MARGIN_FRACTION)) as u32;
    let px_per_mm = height as f64 / depth;

    let draw_tick = |out: &mut RgbaImage, mm: f64, tick_len: u32| {
        let y = (mm * px_per_mm) as u32;
        if y >= height {
            return;
        }
        let x0 = margin_x.saturating_sub(tick_len).min(width.saturating_sub(1));
        for x in x0..width.min(margin_x + 2) {
            if let Some(px) = out.get_pixel_mut_checked(x, y) {
                *px = Rgba([255, 255, 0, 200]);
            }
        }
    };

    let mut mm = minor_interval;
    while mm < depth {
        draw_tick(&mut out, mm, 8);
        mm += minor_interval;
    }

    let mut mm = 0.0;
    while mm <= depth {
        draw_tick(&mut out, mm, 18);
        mm += interval;
    }

    out
}

trait GetPixelMutChecked {
    fn get_pixel_mut_checked(&mut self, x: u32, y: u32) -> Option<&mut Rgba<u8>>;
}

impl GetPixelMutChecked for RgbaImage {
    fn get_pixel_mut_checked(&mut self, x: u32, y: u32) -> Option<&mut Rgba<u8>> {
        if x < self.width() && y < self.height() {
            Some(self.get_pixel_mut(x, y))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_interval_matches_worked_example() {
        // 118 mm depth, 6 target ticks -> raw ~= 19.67 -> nice step 20.
        assert_eq!(nice_interval(118.0), 20.0);
    }

    #[test]
    fn nice_interval_picks_smallest_sufficient_factor() {
        // raw = 12, magnitude = 10 -> factor 2 gives 20 >= 12
        assert_eq!(nice_interval(72.0), 20.0);
    }

    #[test]
    fn nice_interval_falls_back_to_ten_times_magnitude() {
        // raw = 9 -> magnitude 1 -> none of 1,2,5 >= 9 -> 10
        assert_eq!(nice_interval(54.0), 10.0);
    }

    #[test]
    fn nice_interval_nonpositive_depth_is_one() {
        assert_eq!(nice_interval(0.0), 1.0);
    }

    #[test]
    fn overlay_preserves_dimensions_and_is_non_opaque_capable() {
        let gray = vec![128u8; 16 * 16];
        let out = overlay_scale_bar(&gray, 16, 16, DEFAULT_DEPTH_MM);
        assert_eq!(out.width(), 16);
        assert_eq!(out.height(), 16);
    }
}
