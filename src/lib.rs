//! Incremental bzip2 mirror builder for game server FastDL content.
//!
//! Each cycle scans the configured server directories, compresses every
//! matching file that has no artifact yet into the destination mirror, and
//! records handled files in a processed list so later cycles skip them.

pub mod mirror;
pub mod utils;

pub use mirror::{
    Backend, BackendKind, BackendReport, Compress, CycleReport, EngineSettings, MirrorEngine, ProcessedSet,
    ProcessedStore, Scheduler, ServerReport,
};
pub use utils::config::{AppConfig, ServerEntry};
