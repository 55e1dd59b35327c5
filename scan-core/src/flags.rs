//! Typed interface over the cross-process flag files (spec §6, §9: "wrap
//! them behind a small typed interface ... do not sprinkle file I/O across
//! components"). Readers treat parse failures as "not present" rather than
//! propagating an error — these files are operator-debuggable by design,
//! so a half-written or missing file is an expected transient state, not a
//! bug.
//!
//! The E-axis file is the one flag with a single writer per process (the
//! Scanner Controller) and a monotonically-advancing value, so it gets a
//! best-effort atomic write (write to a temp file, then rename) per spec
//! §5's resource policy; the rest use plain last-writer-wins writes.

use std::path::{Path, PathBuf};

use scan_protocol::{flag_files, ScanPlan};
use tracing::warn;

pub struct Flags {
    dir: PathBuf,
}

impl Flags {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { dir: state_dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_line(path: &Path) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(_) => None,
        }
    }

    fn write_line(path: &Path, value: &str) {
        if let Err(e) = std::fs::write(path, value) {
            warn!("flags: failed to write {}: {e}", path.display());
        }
    }

    fn write_atomic(path: &Path, value: &str) {
        let tmp = path.with_extension("tmp");
        match std::fs::write(&tmp, value).and_then(|_| std::fs::rename(&tmp, path)) {
            Ok(()) => {}
            Err(e) => {
                warn!("flags: atomic write failed for {}: {e}; falling back to direct write", path.display());
                Self::write_line(path, value);
            }
        }
    }

    // ---- scanning ----

    pub fn set_scanning(&self, active: bool) {
        Self::write_line(&self.path(flag_files::SCANNING), if active { "1" } else { "0" });
    }

    pub fn scanning(&self) -> bool {
        Self::read_line(&self.path(flag_files::SCANNING)).as_deref() == Some("1")
    }

    // ---- multisweep ----

    pub fn set_multisweep(&self, active: bool) {
        Self::write_line(&self.path(flag_files::MULTISWEEP), if active { "1" } else { "0" });
    }

    pub fn multisweep(&self) -> bool {
        Self::read_line(&self.path(flag_files::MULTISWEEP)).as_deref() == Some("1")
    }

    // ---- recdir ----

    pub fn set_recdir(&self, path: &Path) {
        Self::write_line(&self.path(flag_files::RECDIR), &path.to_string_lossy());
    }

    pub fn recdir(&self) -> Option<PathBuf> {
        Self::read_line(&self.path(flag_files::RECDIR)).map(PathBuf::from)
    }

    // ---- scanplan ----

    pub fn set_scanplan(&self, plan: &ScanPlan) {
        match serde_json::to_string(plan) {
            Ok(json) => Self::write_line(&self.path(flag_files::SCANPLAN), &json),
            Err(e) => warn!("flags: failed to serialize scan plan: {e}"),
        }
    }

    pub fn scanplan(&self) -> Option<ScanPlan> {
        let text = Self::read_line(&self.path(flag_files::SCANPLAN))?;
        serde_json::from_str(&text).ok()
    }

    // ---- e-axis position ----

    pub fn set_e_axis_position(&self, value: f64) {
        Self::write_atomic(&self.path(flag_files::E_AXIS_POSITION), &value.to_string());
    }

    /// Initialized to 0.0 if missing (spec §3 EAxisPosition lifecycle).
    pub fn e_axis_position(&self) -> f64 {
        Self::read_line(&self.path(flag_files::E_AXIS_POSITION))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_flags() -> (Flags, tempdir_guard::TempDir) {
        let dir = tempdir_guard::TempDir::new();
        (Flags::new(dir.path()), dir)
    }

    #[test]
    fn scanning_defaults_to_false_when_missing() {
        let (flags, _dir) = temp_flags();
        assert!(!flags.scanning());
    }

    #[test]
    fn scanning_round_trips() {
        let (flags, _dir) = temp_flags();
        flags.set_scanning(true);
        assert!(flags.scanning());
        flags.set_scanning(false);
        assert!(!flags.scanning());
    }

    #[test]
    fn e_axis_position_defaults_to_zero() {
        let (flags, _dir) = temp_flags();
        assert_eq!(flags.e_axis_position(), 0.0);
    }

    #[test]
    fn e_axis_position_round_trips_atomically() {
        let (flags, _dir) = temp_flags();
        flags.set_e_axis_position(12.5);
        assert_eq!(flags.e_axis_position(), 12.5);
    }

    #[test]
    fn scanplan_round_trips_as_json() {
        let (flags, _dir) = temp_flags();
        let plan = ScanPlan::long(118.0);
        flags.set_scanplan(&plan);
        assert_eq!(flags.scanplan(), Some(plan));
    }

    #[test]
    fn malformed_scanplan_reads_as_not_present() {
        let (flags, dir) = temp_flags();
        std::fs::write(dir.path().join(flag_files::SCANPLAN), "{ not json").unwrap();
        assert_eq!(flags.scanplan(), None);
    }

    /// Minimal self-contained temp-dir helper so unit tests don't pull in
    /// an extra dev-dependency just for directory cleanup.
    mod tempdir_guard {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut dir = std::env::temp_dir();
                let unique = format!(
                    "scan-core-flags-test-{}-{}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or(0)
                );
                dir.push(unique);
                std::fs::create_dir_all(&dir).expect("create temp test dir");
                Self(dir)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}
