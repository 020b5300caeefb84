use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::MirrorEngine;
use super::CycleReport;
use crate::utils::config::ServerEntry;

/// Pause after a cycle blew up before trying again
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(30);

/// Log the idle notice on the 1st, 6th, 11th... empty cycle
const IDLE_NOTICE_EVERY: u64 = 5;

const SLEEP_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    RunningCycle,
    Sleeping,
    ShuttingDown,
}

/// Drives the engine once or forever on an interval.
pub struct Scheduler {
    engine: Arc<MirrorEngine>,
    servers: Arc<Vec<ServerEntry>>,
    interval: Duration,
    cooldown: Duration,
    shutdown: Arc<AtomicBool>,
    state: LoopState,
}

impl Scheduler {
    pub fn new(engine: Arc<MirrorEngine>, servers: Vec<ServerEntry>, interval: Duration) -> Self {
        let shutdown = engine.shutdown_flag();
        Self {
            engine,
            servers: Arc::new(servers),
            interval,
            cooldown: FAILURE_COOLDOWN,
            shutdown,
            state: LoopState::Idle,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Shared with the engine; setting it stops the loop after the batch
    /// in flight.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!("Scheduler state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// One pass over all servers on a blocking thread. A panic inside the
    /// engine comes back as an error.
    async fn run_cycle(&self) -> Result<CycleReport> {
        let engine = self.engine.clone();
        let servers = self.servers.clone();

        tokio::task::spawn_blocking(move || engine.run_cycle(&servers))
            .await
            .context("Processing cycle aborted")
    }

    /// Best-effort save of the processed set.
    async fn persist(&self) {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.checkpoint()).await {
            Ok(Ok(())) => debug!("Processed list saved"),
            Ok(Err(e)) => error!("Failed to save processed list: {}", e),
            Err(e) => error!("Save task failed: {}", e),
        }
    }

    /// Sleep in one-second steps so a shutdown request is noticed quickly.
    async fn sleep_interruptible(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.shutdown_requested() {
                return;
            }
            let step = remaining.min(SLEEP_STEP);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
    }

    /// Run exactly one cycle, save, and stop.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        info!("Starting one-time processing...");
        self.transition(LoopState::RunningCycle);
        let result = self.run_cycle().await;

        self.transition(LoopState::ShuttingDown);
        self.persist().await;

        let report = result?;
        if report.has_changes() {
            info!(
                "Processed {} files across {} servers",
                report.total_compressed(),
                report.servers.len()
            );
        } else {
            info!("No new files found in any server.");
        }
        Ok(report)
    }

    /// Cycle, save, sleep, repeat until the shutdown flag is set.
    pub async fn run_continuous(&mut self) -> Result<()> {
        let mut empty_cycles = 0u64;

        while !self.shutdown_requested() {
            self.transition(LoopState::RunningCycle);

            match self.run_cycle().await {
                Ok(report) => {
                    self.persist().await;

                    if report.has_changes() {
                        empty_cycles = 0;
                        info!(
                            "Cycle started {} finished: {} files compressed",
                            report.started_at.format("%H:%M:%S"),
                            report.total_compressed()
                        );
                    } else {
                        empty_cycles += 1;
                        if empty_cycles % IDLE_NOTICE_EVERY == 1 {
                            info!(
                                "No new files found. Sleeping for {} (cycle {})",
                                humantime::format_duration(self.interval),
                                empty_cycles
                            );
                        }
                    }

                    if !report.failures.is_empty() {
                        warn!("{} servers failed this cycle", report.failures.len());
                    }

                    self.transition(LoopState::Sleeping);
                    debug!(
                        "Waiting {} before next check...",
                        humantime::format_duration(self.interval)
                    );
                    self.sleep_interruptible(self.interval).await;
                }
                Err(e) => {
                    error!("Error in processing loop: {:#}", e);
                    self.persist().await;
                    warn!(
                        "Restarting loop in {}",
                        humantime::format_duration(self.cooldown)
                    );
                    self.transition(LoopState::Sleeping);
                    self.sleep_interruptible(self.cooldown).await;
                }
            }
        }

        self.transition(LoopState::ShuttingDown);
        info!("Shutting down, saving processed list");
        self.persist().await;
        Ok(())
    }
}
