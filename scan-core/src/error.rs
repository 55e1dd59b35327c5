//! Error taxonomy re-exported from `scan-protocol` so every module in this
//! crate returns the same `Result<T, ErrorKind>` shape. Propagation policy
//! (spec §7): operations return explicit success/failure indicators with a
//! short message; exceptions and panics are never used to control flow.

pub use scan_protocol::ErrorKind;

pub type Result<T> = std::result::Result<T, ErrorKind>;
