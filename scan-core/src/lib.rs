//! # scan-core
//!
//! Control core for a benchtop 3D ultrasound scanner: a motion stage
//! (X/Y/Z linear axes plus a rotational E axis, driven by G-code over a
//! serial link) sweeps an ultrasound probe over a specimen while a vendor
//! SDK delivers B-mode frames. This crate owns the serial link, the
//! scanner's unit/mode discipline, the ultrasound SDK session, and the
//! top-level scan orchestration; it is exposed to a local UI over a small
//! HTTP surface (see `handlers`).
//!
//! Binary entry points: `main.rs` (the long-running control process) and
//! `bin/recorder.rs` (a short-lived child process spawned per sweep).

pub mod config;
pub mod error;
pub mod flags;
pub mod serial_manager;
pub mod scanner_controller;
pub mod ultrasound;
pub mod orchestrator;
pub mod state;
pub mod handlers;
