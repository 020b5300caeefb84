use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::compression::{Compress, ARTIFACT_SUFFIX};
use super::liveness::{self, Liveness};
use super::scanner::{ExtensionSet, FileScanner};
use super::store::{ProcessedSet, ProcessedStore, StoreError};
use super::{CompressionTask, CycleReport, ServerFailure, ServerReport, SharedProcessedSet};
use crate::utils::config::{AppConfig, ServerEntry};
use crate::utils::paths;

/// Tuning knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub extensions: ExtensionSet,
    pub batch_size: usize,
    /// Save the processed list after this many batches
    pub checkpoint_every: usize,
    pub workers: usize,
    /// Size sampling window for the growing-file check
    pub growth_sample: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            extensions: config.extensions(),
            batch_size: config.batch_size.max(1),
            checkpoint_every: config.checkpoint_every_batches.max(1),
            workers: config.worker_count(),
            growth_sample: Duration::from_millis(config.growth_sample_millis),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create destination directory {path}: {source}")]
    Destination { path: PathBuf, source: io::Error },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Compressed,
    Busy,
    Failed,
}

#[derive(Debug, Default)]
struct BatchMetrics {
    compressed: usize,
    busy: usize,
    failed: usize,
}

impl FromIterator<TaskOutcome> for BatchMetrics {
    fn from_iter<I: IntoIterator<Item = TaskOutcome>>(iter: I) -> Self {
        let mut metrics = Self::default();
        for outcome in iter {
            match outcome {
                TaskOutcome::Compressed => metrics.compressed += 1,
                TaskOutcome::Busy => metrics.busy += 1,
                TaskOutcome::Failed => metrics.failed += 1,
            }
        }
        metrics
    }
}

/// Scan, diff, compress and record, one server at a time.
pub struct MirrorEngine {
    settings: EngineSettings,
    backend: Arc<dyn Compress>,
    store: ProcessedStore,
    processed: SharedProcessedSet,
    pool: rayon::ThreadPool,
    shutdown: Arc<AtomicBool>,
}

impl MirrorEngine {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn Compress>,
        store: ProcessedStore,
        processed: ProcessedSet,
    ) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers.max(1))
            .thread_name(|i| format!("compress-{}", i))
            .build()?;

        Ok(Self {
            settings,
            backend,
            store,
            processed: Arc::new(Mutex::new(processed)),
            pool,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag polled between batches and servers; set it to stop after the
    /// batch in flight.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed.lock().contains(key)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Write the processed set to disk now.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let processed = self.processed.lock();
        self.store.save(&processed)
    }

    fn save_checkpoint(&self) {
        match self.checkpoint() {
            Ok(()) => debug!(
                "Checkpoint: {} entries saved to {}",
                self.processed_count(),
                self.store.path().display()
            ),
            Err(e) => error!(
                "Failed to save processed list: {} (keeping {} entries in memory)",
                e,
                self.processed_count()
            ),
        }
    }

    /// Process every server in configuration order. A failing server is
    /// logged and recorded; the rest still run.
    pub fn run_cycle(&self, servers: &[ServerEntry]) -> CycleReport {
        let mut cycle = CycleReport::new();

        for server in servers {
            if self.shutdown_requested() {
                info!("Shutdown requested, skipping remaining servers");
                break;
            }

            info!("Processing {}...", server.name);
            debug!("Source: {}", server.source.display());
            debug!("Destination: {}", server.destination.display());

            match self.process_server(server) {
                Ok(report) => {
                    if report.compressed > 0 {
                        info!(
                            "Completed {} in {:.1}s - processed {} files",
                            server.name,
                            report.elapsed.as_secs_f64(),
                            report.compressed
                        );
                    } else {
                        info!("No files to process in {}", server.name);
                    }
                    cycle.servers.push(report);
                }
                Err(e) => {
                    error!("Skipping {} this cycle: {}", server.name, e);
                    cycle.failures.push(ServerFailure {
                        server: server.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        cycle
    }

    pub fn process_server(&self, server: &ServerEntry) -> Result<ServerReport, EngineError> {
        let started = Instant::now();
        let mut report = ServerReport::new(&server.name);

        if !server.source.is_dir() {
            error!("Source directory does not exist: {}", server.source.display());
            return Ok(report);
        }

        if !server.destination.is_dir() {
            info!("Creating destination directory: {}", server.destination.display());
            fs::create_dir_all(&server.destination).map_err(|source| EngineError::Destination {
                path: server.destination.clone(),
                source,
            })?;
        }

        let (files, scanned) = FileScanner::new(&self.settings.extensions).scan_with_total(&server.source);
        report.scanned = scanned;
        report.discovered = files.len();
        log_scan_details(server, scanned, &files);
        if files.is_empty() {
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let tasks = self.plan(server, &files, &mut report);
        if !tasks.is_empty() {
            self.compress_all(&tasks, &mut report);
        }

        if report.changed() {
            self.save_checkpoint();
        }

        if report.busy > 0 || report.failed > 0 {
            info!(
                "{}: {} busy and {} failed files will be retried next cycle",
                server.name, report.busy, report.failed
            );
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Filter out processed keys and adopt artifacts that already exist.
    fn plan(&self, server: &ServerEntry, files: &[PathBuf], report: &mut ServerReport) -> Vec<CompressionTask> {
        let mut tasks = Vec::new();
        let mut processed = self.processed.lock();

        for file in files {
            let Some(relative) = paths::relative_of(file, &server.source) else {
                warn!(
                    "Cannot resolve {} relative to {}, skipping",
                    file.display(),
                    server.source.display()
                );
                report.unresolved += 1;
                continue;
            };

            let key = paths::processed_key(&server.name, &relative);
            if processed.contains(&key) {
                report.already_processed += 1;
                continue;
            }

            let destination = paths::artifact_path(&server.destination, &relative, ARTIFACT_SUFFIX);
            if destination.exists() {
                debug!("Compressed file already exists: {}", destination.display());
                processed.insert(key);
                report.reconciled += 1;
                continue;
            }

            tasks.push(CompressionTask {
                source_path: file.clone(),
                destination_path: destination,
                relative_path: relative,
                processed_key: key,
            });
        }

        debug!(
            "{}: {} already processed, {} adopted, {} queued",
            server.name,
            report.already_processed,
            report.reconciled,
            tasks.len()
        );
        tasks
    }

    fn compress_all(&self, tasks: &[CompressionTask], report: &mut ServerReport) {
        let total = tasks.len();
        let batch_size = self.settings.batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);
        let checkpoint_every = self.settings.checkpoint_every.max(1);

        info!(
            "{} files queued for compression in {} batches ({} workers)",
            total,
            batch_count,
            self.pool.current_num_threads()
        );

        let started = Instant::now();
        let mut done = 0usize;

        for (index, batch) in tasks.chunks(batch_size).enumerate() {
            if self.shutdown_requested() {
                warn!("Shutdown requested, deferring {} files to the next run", total - done);
                break;
            }

            let metrics = self.run_batch(batch);
            report.compressed += metrics.compressed;
            report.busy += metrics.busy;
            report.failed += metrics.failed;
            done += batch.len();

            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
            let remaining = total - done;
            let eta = if rate > 0.0 {
                Duration::from_secs((remaining as f64 / rate).round() as u64)
            } else {
                Duration::ZERO
            };

            info!(
                "Batch {}/{}: {} compressed, {} busy, {} failed - {:.1} files/sec, ETA {}",
                index + 1,
                batch_count,
                metrics.compressed,
                metrics.busy,
                metrics.failed,
                rate,
                humantime::format_duration(eta)
            );

            let more_to_come = index + 1 < batch_count;
            if more_to_come && (index + 1) % checkpoint_every == 0 {
                self.save_checkpoint();
            }
        }
    }

    /// Compress one batch on the worker pool; returns once every task in it
    /// has finished.
    fn run_batch(&self, batch: &[CompressionTask]) -> BatchMetrics {
        let outcomes: Vec<TaskOutcome> = self
            .pool
            .install(|| batch.par_iter().map(|task| self.compress_task(task)).collect());
        outcomes.into_iter().collect()
    }

    fn compress_task(&self, task: &CompressionTask) -> TaskOutcome {
        match liveness::check(&task.source_path, self.settings.growth_sample) {
            Liveness::Ready => {}
            state => {
                debug!("Skipping {} ({:?}), retry next cycle", task.relative_path, state);
                return TaskOutcome::Busy;
            }
        }

        debug!(
            "Compressing: {} -> {}",
            task.source_path.display(),
            task.destination_path.display()
        );

        match self.backend.compress(&task.source_path, &task.destination_path) {
            Ok(()) => {
                set_world_permissions(&task.destination_path);
                self.processed.lock().insert(task.processed_key.clone());
                TaskOutcome::Compressed
            }
            Err(e) => {
                warn!("Compression failed for {}: {}", task.source_path.display(), e);
                TaskOutcome::Failed
            }
        }
    }
}

const SAMPLE_FILES_SHOWN: usize = 10;

fn log_scan_details(server: &ServerEntry, scanned: usize, files: &[PathBuf]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    debug!("=== {} ===", server.name);
    debug!("Total files found: {}", scanned);
    debug!("Matching files: {}", files.len());
    for file in files.iter().take(SAMPLE_FILES_SHOWN) {
        match paths::relative_of(file, &server.source) {
            Some(relative) => debug!("  {}", relative),
            None => debug!("  {}", file.display()),
        }
    }
    if files.len() > SAMPLE_FILES_SHOWN {
        debug!("  ... and {} more", files.len() - SAMPLE_FILES_SHOWN);
    }
}

/// The mirror is served by a web server running as another user.
#[cfg(unix)]
fn set_world_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        warn!("Error setting permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_world_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::compression::{BackendKind, CompressionError};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Copies the source verbatim and counts invocations.
    #[derive(Default)]
    struct CopyBackend {
        calls: AtomicUsize,
    }

    impl Compress for CopyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Builtin
        }

        fn compress(&self, source: &Path, destination: &Path) -> Result<(), CompressionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::copy(source, destination).map_err(|source| CompressionError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
            Ok(())
        }
    }

    struct RejectBackend;

    impl Compress for RejectBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Builtin
        }

        fn compress(&self, _source: &Path, _destination: &Path) -> Result<(), CompressionError> {
            Err(CompressionError::NoBackend)
        }
    }

    struct Fixture {
        _temp: TempDir,
        server: ServerEntry,
        state: PathBuf,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("srv").join("cstrike");
        for file in files {
            let path = source.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("content of {}", file)).unwrap();
        }
        let server = ServerEntry {
            name: "cstrike".to_string(),
            source,
            destination: temp.path().join("fastdl").join("cstrike"),
        };
        let state = temp.path().join("processed.txt");
        Fixture {
            _temp: temp,
            server,
            state,
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            extensions: ExtensionSet::parse("bsp,mdl,nav"),
            batch_size: 4,
            checkpoint_every: 1,
            workers: 4,
            growth_sample: Duration::ZERO,
        }
    }

    fn engine(fixture: &Fixture, backend: Arc<dyn Compress>) -> MirrorEngine {
        let store = ProcessedStore::new(&fixture.state);
        let processed = store.load().unwrap();
        MirrorEngine::new(settings(), backend, store, processed).unwrap()
    }

    #[test]
    fn test_second_run_processes_nothing() {
        let fixture = fixture(&["maps/de_dust2.bsp", "maps/de_dust2.nav", "models/crate.mdl", "readme.txt"]);
        let backend = Arc::new(CopyBackend::default());
        let engine = engine(&fixture, backend.clone());

        let first = engine.process_server(&fixture.server).unwrap();
        assert_eq!(first.scanned, 4);
        assert_eq!(first.discovered, 3);
        assert_eq!(first.compressed, 3);
        assert!(fixture.server.destination.join("maps").join("de_dust2.bsp.bz2").is_file());

        let second = engine.process_server(&fixture.server).unwrap();
        assert_eq!(second.compressed, 0);
        assert_eq!(second.already_processed, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_existing_artifact_is_adopted_without_compressing() {
        let fixture = fixture(&["maps/de_dust2.bsp"]);
        let artifact = fixture.server.destination.join("maps").join("de_dust2.bsp.bz2");
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"already there").unwrap();

        let backend = Arc::new(CopyBackend::default());
        let engine = engine(&fixture, backend.clone());
        let report = engine.process_server(&fixture.server).unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.compressed, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.processed_count(), 1);
    }

    #[test]
    fn test_failed_compression_is_not_recorded() {
        let fixture = fixture(&["maps/a.bsp", "maps/b.bsp"]);
        let engine = engine(&fixture, Arc::new(RejectBackend));

        let report = engine.process_server(&fixture.server).unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.compressed, 0);
        assert_eq!(engine.processed_count(), 0);
        assert!(!report.changed());
    }

    #[test]
    fn test_missing_source_is_empty_report() {
        let fixture = fixture(&[]);
        let engine = engine(&fixture, Arc::new(CopyBackend::default()));
        let mut server = fixture.server.clone();
        server.source = server.source.join("does-not-exist");

        let report = engine.process_server(&server).unwrap();
        assert_eq!(report, ServerReport { elapsed: report.elapsed, ..ServerReport::new("cstrike") });
    }

    #[test]
    fn test_progress_is_checkpointed_to_disk() {
        let fixture = fixture(&["maps/a.bsp", "maps/b.bsp", "maps/c.bsp", "maps/d.bsp", "maps/e.bsp"]);
        let engine = engine(&fixture, Arc::new(CopyBackend::default()));
        engine.process_server(&fixture.server).unwrap();

        let on_disk = ProcessedStore::new(&fixture.state).load().unwrap();
        assert_eq!(on_disk.len(), 5);
        let expected = paths::processed_key("cstrike", &paths::normalize(Path::new("maps/c.bsp")).to_string_lossy());
        assert!(on_disk.contains(&expected));
    }

    #[test]
    fn test_failing_server_does_not_stop_the_cycle() {
        let fixture = fixture(&["maps/a.bsp"]);
        let engine = engine(&fixture, Arc::new(CopyBackend::default()));

        // Destination below a regular file cannot be created
        let blocker = fixture.state.with_file_name("blocker");
        fs::write(&blocker, b"").unwrap();
        let broken = ServerEntry {
            name: "broken".to_string(),
            source: fixture.server.source.clone(),
            destination: blocker.join("fastdl"),
        };

        let cycle = engine.run_cycle(&[broken, fixture.server.clone()]);
        assert_eq!(cycle.failures.len(), 1);
        assert_eq!(cycle.failures[0].server, "broken");
        assert_eq!(cycle.servers.len(), 1);
        assert_eq!(cycle.total_compressed(), 1);
    }

    #[test]
    fn test_concurrent_marking_loses_nothing() {
        let names: Vec<String> = (0..64).map(|i| format!("maps/map_{:02}.bsp", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let fixture = fixture(&refs);
        let backend = Arc::new(CopyBackend::default());
        let engine = engine(&fixture, backend.clone());

        let report = engine.process_server(&fixture.server).unwrap();
        assert_eq!(report.compressed, 64);
        assert_eq!(engine.processed_count(), 64);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_shutdown_stops_before_next_batch() {
        let fixture = fixture(&["maps/a.bsp", "maps/b.bsp"]);
        let engine = engine(&fixture, Arc::new(CopyBackend::default()));
        engine.shutdown_flag().store(true, Ordering::SeqCst);

        let report = engine.process_server(&fixture.server).unwrap();
        assert_eq!(report.discovered, 2);
        assert_eq!(report.compressed, 0);

        let cycle = engine.run_cycle(&[fixture.server.clone()]);
        assert!(cycle.servers.is_empty());
    }

    /// Records how many keys are on disk each time a file starts compressing.
    struct DiskObserver {
        state: PathBuf,
        seen_on_disk: Mutex<Vec<usize>>,
    }

    impl Compress for DiskObserver {
        fn kind(&self) -> BackendKind {
            BackendKind::Builtin
        }

        fn compress(&self, source: &Path, destination: &Path) -> Result<(), CompressionError> {
            let lines = fs::read_to_string(&self.state).unwrap().lines().count();
            self.seen_on_disk.lock().push(lines);
            fs::create_dir_all(destination.parent().unwrap()).unwrap();
            fs::copy(source, destination).unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_checkpoint_lands_between_batches() {
        let fixture = fixture(&["maps/a.bsp", "maps/b.bsp", "maps/c.bsp", "maps/d.bsp", "maps/e.bsp"]);
        let backend = Arc::new(DiskObserver {
            state: fixture.state.clone(),
            seen_on_disk: Mutex::new(Vec::new()),
        });
        let settings = EngineSettings {
            batch_size: 1,
            checkpoint_every: 2,
            workers: 1,
            ..settings()
        };
        let store = ProcessedStore::new(&fixture.state);
        let processed = store.load().unwrap();
        let engine = MirrorEngine::new(settings, backend.clone(), store, processed).unwrap();

        engine.process_server(&fixture.server).unwrap();

        // Saved after batches 2 and 4, before the next batch starts
        assert_eq!(*backend.seen_on_disk.lock(), vec![0, 0, 2, 2, 4]);
        assert_eq!(ProcessedStore::new(&fixture.state).load().unwrap().len(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_artifacts_are_world_accessible() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = fixture(&["maps/a.bsp"]);
        let engine = engine(&fixture, Arc::new(CopyBackend::default()));
        engine.process_server(&fixture.server).unwrap();

        let artifact = fixture.server.destination.join("maps").join("a.bsp.bz2");
        let mode = fs::metadata(artifact).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }
}
