pub mod compression;
pub mod engine;
pub mod liveness;
pub mod scanner;
pub mod scheduler;
pub mod store;

pub use compression::{
    partial_path, Backend, BackendKind, BackendReport, Compress, CompressionError, ARTIFACT_SUFFIX, PARTIAL_SUFFIX,
};
pub use engine::{EngineError, EngineSettings, MirrorEngine};
pub use scanner::{ExtensionSet, FileScanner};
pub use scheduler::{LoopState, Scheduler};
pub use store::{ProcessedSet, ProcessedStore, StoreError};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A source file that still needs a compressed artifact.
#[derive(Debug, Clone)]
pub struct CompressionTask {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub relative_path: String,
    pub processed_key: String,
}

/// Counters for one server's pass through the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerReport {
    pub server: String,
    /// Regular files under the source root, matching or not
    pub scanned: usize,
    pub discovered: usize,
    pub already_processed: usize,
    /// Marked processed because the artifact was already on disk
    pub reconciled: usize,
    pub compressed: usize,
    /// Skipped because another process holds the file or it is still growing
    pub busy: usize,
    pub failed: usize,
    /// Files whose path could not be expressed relative to the source root
    pub unresolved: usize,
    pub elapsed: Duration,
}

impl ServerReport {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            ..Self::default()
        }
    }

    /// Whether the processed set grew during this pass
    pub fn changed(&self) -> bool {
        self.reconciled + self.compressed > 0
    }
}

#[derive(Debug, Clone)]
pub struct ServerFailure {
    pub server: String,
    pub message: String,
}

/// Outcome of one pass over every configured server.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: chrono::DateTime<chrono::Local>,
    pub servers: Vec<ServerReport>,
    pub failures: Vec<ServerFailure>,
}

impl CycleReport {
    pub fn new() -> Self {
        Self {
            started_at: chrono::Local::now(),
            servers: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn total_compressed(&self) -> usize {
        self.servers.iter().map(|s| s.compressed).sum()
    }

    pub fn has_changes(&self) -> bool {
        self.servers.iter().any(ServerReport::changed)
    }
}

impl Default for CycleReport {
    fn default() -> Self {
        Self::new()
    }
}

// Shared between compression workers; every mutation goes through the lock
pub type SharedProcessedSet = Arc<Mutex<ProcessedSet>>;
