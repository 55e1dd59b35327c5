//! Shared-state type aliases threaded through the HTTP surface, mirroring
//! the teacher's `pub type SharedState = Arc<RwLock<RaceState>>;` idiom —
//! each subsystem already manages its own interior mutability, so these
//! aliases are cheap `Arc` handles rather than another layer of locking.

use std::sync::Arc;

use crate::config::Configuration;
use crate::flags::Flags;
use crate::orchestrator::Orchestrator;
use crate::scanner_controller::ScannerController;
use crate::serial_manager::SerialManager;
use crate::ultrasound::mjpeg::FrameBus;
use crate::ultrasound::UltrasoundSession;

pub type SharedConfig = Arc<Configuration>;
pub type SharedSerial = Arc<SerialManager>;
pub type SharedScanner = Arc<ScannerController>;
pub type SharedUltrasound = Arc<UltrasoundSession>;
pub type SharedFlags = Arc<Flags>;
pub type SharedOrchestrator = Arc<Orchestrator>;

/// Axum `State` payload: one `Arc` clone per subsystem, handed to every
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub serial: SharedSerial,
    pub scanner: SharedScanner,
    pub ultrasound: SharedUltrasound,
    pub flags: SharedFlags,
    pub orchestrator: SharedOrchestrator,
    pub frame_bus: FrameBus,
}
