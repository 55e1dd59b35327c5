//! Minimal G-code firmware emulation: just enough of the motion
//! controller's command set (spec §6 Glossary) for the control core to
//! exercise its serial protocol without bench hardware.
//!
//! Each accepted client gets its own `FirmwareState`, so concurrent
//! connections behave like independent printers rather than sharing
//! motion state.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct FirmwareState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
    pub absolute: bool,
    pub feed_mm_per_min: f64,
    /// Simulated travel speed, used to size the artificial delay before
    /// `M400` reports motion complete.
    pub travel_speed_mm_per_s: f64,
}

impl Default for FirmwareState {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, e: 0.0, absolute: true, feed_mm_per_min: 1200.0, travel_speed_mm_per_s: 20.0 }
    }
}

fn parse_axis_value(token: &str, letter: char) -> Option<f64> {
    let rest = token.strip_prefix(letter)?;
    rest.parse::<f64>().ok()
}

impl FirmwareState {
    /// Processes one line, returning the response lines to write back
    /// (newline-terminated by the caller).
    pub fn process_line(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let mut tokens = line.split_whitespace();
        let Some(code) = tokens.next() else {
            return vec!["ok".to_string()];
        };

        match code {
            "G21" => vec!["ok".to_string()],
            "G90" => {
                self.absolute = true;
                vec!["ok".to_string()]
            }
            "G91" => {
                self.absolute = false;
                vec!["ok".to_string()]
            }
            "G28" => {
                // Rest of line names axes to home; empty means all.
                let axes: Vec<&str> = tokens.collect();
                if axes.is_empty() || axes.iter().any(|a| a.starts_with('X')) {
                    self.x = 0.0;
                }
                if axes.is_empty() || axes.iter().any(|a| a.starts_with('Y')) {
                    self.y = 0.0;
                }
                if axes.is_empty() || axes.iter().any(|a| a.starts_with('Z')) {
                    self.z = 0.0;
                }
                vec!["ok".to_string()]
            }
            "G0" | "G1" => {
                for token in tokens {
                    if let Some(v) = parse_axis_value(token, 'F') {
                        self.feed_mm_per_min = v;
                        continue;
                    }
                    if let Some(v) = parse_axis_value(token, 'X') {
                        self.x = if self.absolute { v } else { self.x + v };
                    } else if let Some(v) = parse_axis_value(token, 'Y') {
                        self.y = if self.absolute { v } else { self.y + v };
                    } else if let Some(v) = parse_axis_value(token, 'Z') {
                        self.z = if self.absolute { v } else { self.z + v };
                    } else if let Some(v) = parse_axis_value(token, 'E') {
                        self.e = if self.absolute { v } else { self.e + v };
                    }
                }
                vec!["ok".to_string()]
            }
            "M114" => {
                vec![format!("X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0", self.x, self.y, self.z, self.e), "ok".to_string()]
            }
            "M302" => vec!["ok".to_string()],
            "M400" => vec!["ok".to_string()],
            "M112" => {
                self.feed_mm_per_min = 0.0;
                vec!["ok".to_string()]
            }
            other => {
                vec![format!("echo: unknown command {other}"), "ok".to_string()]
            }
        }
    }
}

/// Small random jitter on response latency so timing-sensitive callers
/// (the request pump's read window) get exercised realistically.
pub fn jitter_millis(base: u64, spread: u64) -> u64 {
    if spread == 0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    base + rng.gen_range(0..=spread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_move_sets_axis_directly() {
        let mut fw = FirmwareState::default();
        fw.process_line("G1 X10.5 Y2");
        assert_eq!(fw.x, 10.5);
        assert_eq!(fw.y, 2.0);
    }

    #[test]
    fn relative_move_accumulates() {
        let mut fw = FirmwareState::default();
        fw.process_line("G91");
        fw.process_line("G1 X5");
        fw.process_line("G1 X5");
        assert_eq!(fw.x, 10.0);
    }

    #[test]
    fn homing_resets_named_axes_only() {
        let mut fw = FirmwareState { x: 5.0, y: 5.0, z: 5.0, ..FirmwareState::default() };
        fw.process_line("G28 X");
        assert_eq!(fw.x, 0.0);
        assert_eq!(fw.y, 5.0);
    }

    #[test]
    fn m114_reports_current_position() {
        let mut fw = FirmwareState::default();
        fw.x = 3.0;
        let resp = fw.process_line("M114");
        assert!(resp[0].contains("X:3.00"));
        assert_eq!(resp[1], "ok");
    }
}
