//! Ultrasound SDK Session — single-instance lifecycle over the vendor
//! native library; resilient frame production (spec §4.3).
//!
//! The vendor DLL is loaded with `libloading`, the ecosystem crate for
//! dynamic-library FFI (used for native-plugin loading elsewhere in the
//! retrieval pack). The library handle and session state share one mutex,
//! guarding initialization and teardown the way spec §5 requires ("The SDK
//! session has its own mutex guarding initialization and teardown").
//!
//! Recovery state machine (spec §4.3):
//! `Uninitialized -> AttemptInit -> Initialized | FailedInit`
//! `Initialized -> Streaming -> (StreamError -> Reset -> Uninitialized)`
//!
//! Never panics into the caller: any vendor error collapses the session
//! back to `Uninitialized`, mirroring `usg_realtime.py`'s
//! `_capture_loop`, which wraps every frame grab in try/except and falls
//! back to a placeholder rather than letting a vendor exception escape.

use std::sync::Arc;

use libloading::{Library, Symbol};
use scan_protocol::ErrorKind;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::Configuration;

/// Tolerated `find_connected_probe` success codes. Resolved per
/// DESIGN.md's Open Question note: newer SDK builds return 0 or 1,
/// `record.py`'s original strictness (101-only) is not carried over
/// because the live-preview path must degrade gracefully across builds.
const PROBE_SUCCESS_CODES: [i32; 3] = [0, 1, 101];

/// DLL export names tried in order, mirroring `usg_realtime.py`'s
/// `_resolve_init_function` fallback list — vendor builds export the init
/// entry point under slightly different names.
const INIT_FN_CANDIDATES: &[&str] = &[
    "init_ultrasound_usgfw2",
    "init_ultrasound_usgfw2MATLAB_wrapper",
    "init_ultrasound_wrapper",
    "init_ultrasound_ultrasound_usgfw2",
];

type OnInitFn = unsafe extern "C" fn();
type InitUltrasoundFn = unsafe extern "C" fn() -> i32;
type FindConnectedProbeFn = unsafe extern "C" fn() -> i32;
type DataViewFn = unsafe extern "C" fn() -> i32;
type MixerControlFn = unsafe extern "C" fn(i32, i32, i32, i32, i32, i32, i32) -> i32;
type GetResolutionFn = unsafe extern "C" fn(*mut f32, *mut f32);
type ReturnPixelValuesFn = unsafe extern "C" fn(*mut u32);
type VoidFn = unsafe extern "C" fn();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    FailedInit,
}

struct Loaded {
    library: Library,
    width: u32,
    height: u32,
    resolution: Option<(f64, f64)>,
}

pub struct UltrasoundSession {
    config: Arc<Configuration>,
    inner: AsyncMutex<(SessionState, Option<Loaded>)>,
}

impl UltrasoundSession {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config, inner: AsyncMutex::new((SessionState::Uninitialized, None)) }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.0
    }

    /// Idempotent attempt to initialize: load library, run init sequence,
    /// select probe, configure view, configure the B-mixer with W×H at
    /// origin (0,0), query geometric resolution mm/px.
    pub async fn ensure_ready(&self) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.0 == SessionState::Initialized {
            return true;
        }

        match self.initialize_locked().await {
            Ok(loaded) => {
                guard.0 = SessionState::Initialized;
                guard.1 = Some(loaded);
                info!("ultrasound: session ready");
                true
            }
            Err(e) => {
                warn!("ultrasound: init failed: {e}");
                guard.0 = SessionState::FailedInit;
                guard.1 = None;
                false
            }
        }
    }

    async fn initialize_locked(&self) -> Result<Loaded, ErrorKind> {
        let dll_path = self.config.dll_path();
        let w = self.config.ultra_w;
        let h = self.config.ultra_h;

        // Dynamic-library loading and raw FFI calls are blocking/unsafe;
        // run them on a blocking thread so they never stall the runtime.
        tokio::task::spawn_blocking(move || -> Result<Loaded, ErrorKind> {
            let library = unsafe { Library::new(&dll_path) }
                .map_err(|e| ErrorKind::ProbeUnavailable(format!("load {}: {e}", dll_path.display())))?;

            unsafe {
                let on_init: Symbol<OnInitFn> = library
                    .get(b"on_init")
                    .map_err(|e| ErrorKind::ProbeUnavailable(format!("on_init missing: {e}")))?;
                on_init();

                let init_fn = INIT_FN_CANDIDATES.iter().find_map(|name| {
                    library.get::<InitUltrasoundFn>(name.as_bytes()).ok().map(|sym| (name, sym))
                });
                let (name, init_fn) = init_fn
                    .ok_or_else(|| ErrorKind::ProbeUnavailable("no known init_ultrasound export found".to_string()))?;
                let rc = init_fn();
                if rc == 2 {
                    return Err(ErrorKind::ProbeUnavailable(format!("{name} fatal rc=2")));
                }

                let find_probe: Symbol<FindConnectedProbeFn> = library
                    .get(b"find_connected_probe")
                    .map_err(|e| ErrorKind::ProbeUnavailable(format!("find_connected_probe missing: {e}")))?;
                let rc = find_probe();
                if !PROBE_SUCCESS_CODES.contains(&rc) {
                    return Err(ErrorKind::ProbeUnavailable(format!("probe not detected, rc={rc}")));
                }

                let data_view: Symbol<DataViewFn> = library
                    .get(b"data_view_function")
                    .map_err(|e| ErrorKind::ProbeUnavailable(format!("data_view_function missing: {e}")))?;
                if data_view() < 0 {
                    return Err(ErrorKind::ProbeUnavailable("data_view_function returned error".to_string()));
                }

                let mixer: Symbol<MixerControlFn> = library
                    .get(b"mixer_control_function")
                    .map_err(|e| ErrorKind::ProbeUnavailable(format!("mixer_control_function missing: {e}")))?;
                if mixer(0, 0, w as i32, h as i32, 0, 0, 0) < 0 {
                    return Err(ErrorKind::ProbeUnavailable("mixer_control_function returned error".to_string()));
                }

                let resolution = library.get::<GetResolutionFn>(b"get_resolution").ok().map(|get_res| {
                    let mut rx = 0f32;
                    let mut ry = 0f32;
                    get_res(&mut rx, &mut ry);
                    (rx as f64, ry as f64)
                });

                Ok(Loaded { library, width: w, height: h, resolution })
            }
        })
        .await
        .map_err(|e| ErrorKind::ProbeUnavailable(format!("init task panicked: {e}")))?
    }

    /// Grab a single RGBA H×W×4 uint8 frame. Fails with `NotReady` if the
    /// probe is not initialized.
    pub async fn grab_frame(&self) -> Result<(Vec<u8>, u32, u32), ErrorKind> {
        let guard = self.inner.lock().await;
        let Some(loaded) = guard.1.as_ref() else {
            return Err(ErrorKind::NotReady);
        };
        let (w, h) = (loaded.width, loaded.height);
        let library = &loaded.library;

        let return_pixels: Symbol<ReturnPixelValuesFn> = unsafe {
            library
                .get(b"return_pixel_values")
                .map_err(|e| ErrorKind::ProbeUnavailable(format!("return_pixel_values missing: {e}")))?
        };

        let mut buffer = vec![0u32; (w as usize) * (h as usize) * 4];
        unsafe { return_pixels(buffer.as_mut_ptr()) };

        // First RGBA-like component carries the grayscale sample;
        // replicate across R/G/B with full alpha to make a displayable
        // RGBA frame (mirrors `reshaped[:, :, 0]` in the original).
        let mut rgba = Vec::with_capacity((w as usize) * (h as usize) * 4);
        for px in buffer.chunks_exact(4) {
            let gray = (px[0] & 0xFF) as u8;
            rgba.extend_from_slice(&[gray, gray, gray, 255]);
        }
        Ok((rgba, w, h))
    }

    /// Queried resolution in mm/pixel, if available.
    pub async fn get_resolution(&self) -> Option<(f64, f64)> {
        self.inner.lock().await.1.as_ref().and_then(|l| l.resolution)
    }

    pub async fn freeze(&self) {
        self.call_void("Freeze_ultrasound_scanning").await;
    }

    pub async fn stop(&self) {
        self.call_void("Stop_ultrasound_scanning").await;
    }

    pub async fn close(&self) {
        self.call_void("Close_and_release").await;
        let mut guard = self.inner.lock().await;
        guard.0 = SessionState::Uninitialized;
        guard.1 = None;
    }

    /// Collapse back to `Uninitialized` after a streaming error, ready for
    /// `ensure_ready` to retry.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.0 = SessionState::Uninitialized;
        guard.1 = None;
    }

    async fn call_void(&self, name: &'static str) {
        let guard = self.inner.lock().await;
        if let Some(loaded) = guard.1.as_ref() {
            let result: Result<(), String> = unsafe {
                loaded
                    .library
                    .get::<VoidFn>(name.as_bytes())
                    .map(|f| f())
                    .map_err(|e| e.to_string())
            };
            if let Err(e) = result {
                warn!("ultrasound: {name} unavailable: {e}");
            }
        }
    }
}
