//! Logging setup shared by the fleetbench binaries.
//!
//! Every crate in the workspace logs through `tracing` with targets of the
//! form `fleet.<crate>.<area>`; this crate installs the global subscriber.
mod logger;
pub use logger::*;
