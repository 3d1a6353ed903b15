//! The per-process controller.
//!
//! One `Warden` owns the configuration and every sub-component instance;
//! callers pass it around explicitly. Bootstrap acquires the on-disk
//! instance lock, merges both snapshots, and starts the background tasks
//! (cache sweep, snapshot persistence); shutdown persists and stops them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::{self, PatternFilter, ResultCache, SnapshotFilter};
use crate::config::{WardenConfig, WardenPaths};
use crate::error::Result;
use crate::exec::{
    CommandOutcome, ExecOptions, PassthroughSandbox, Sandbox, SecureExecutor,
};
use crate::lock::{InstanceLock, ProcessLockManager};
use crate::recovery::ErrorRecoveryManager;
use crate::sched::{
    DependencyAnalysis, ExecutionHistory, TestSchedulingGraph, load_perf_snapshot,
    save_perf_snapshot,
};
use crate::telemetry::{AuditSink, Monitor, NoopAudit, NoopMonitor};

/// Optional collaborators, chosen once at bootstrap. Everything defaults to
/// a no-op implementation.
pub struct Capabilities {
    pub sandbox: Arc<dyn Sandbox>,
    pub monitor: Arc<dyn Monitor>,
    pub audit: Arc<dyn AuditSink>,
    /// Overrides the config-derived plausibility filter for snapshot loads.
    pub snapshot_filter: Option<Arc<dyn SnapshotFilter>>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sandbox: Arc::new(PassthroughSandbox),
            monitor: Arc::new(NoopMonitor),
            audit: Arc::new(NoopAudit),
            snapshot_filter: None,
        }
    }
}

/// Result of one batch run, in execution order.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub order: Vec<String>,
    pub passed: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub file: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub struct Warden {
    paths: WardenPaths,
    config: WardenConfig,
    executor: SecureExecutor,
    cache: Arc<ResultCache>,
    history: Arc<ExecutionHistory>,
    graph: Mutex<TestSchedulingGraph>,
    filter: Arc<dyn SnapshotFilter>,
    sandbox: Arc<dyn Sandbox>,
    _instance: InstanceLock,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Warden {
    pub async fn bootstrap(
        paths: WardenPaths,
        config: WardenConfig,
        caps: Capabilities,
    ) -> Result<Self> {
        config.validate()?;

        let instance = InstanceLock::acquire(
            paths.instance_lock(),
            Duration::from_millis(config.locks.stale_instance_threshold_ms),
        )
        .await?;

        let filter: Arc<dyn SnapshotFilter> = caps
            .snapshot_filter
            .unwrap_or_else(|| Arc::new(PatternFilter::from_config(&config.snapshots)));

        let cache = Arc::new(ResultCache::new(&config.cache));
        cache::load_snapshot(&paths.cache_snapshot(), &cache, &filter).await?;

        let history = Arc::new(ExecutionHistory::new(config.scheduling.history_window));
        load_perf_snapshot(&paths.perf_snapshot(), &history, &filter).await?;

        let locks = ProcessLockManager::new(
            Duration::from_millis(config.locks.process_lock_timeout_ms),
            Duration::from_millis(config.locks.reaper_interval_ms),
        );
        let recovery = ErrorRecoveryManager::new(&config.recovery, Some(paths.temp_dir()));

        let executor = SecureExecutor::new(
            config.executor.clone(),
            config.validation.clone(),
            &config.rate_limit,
            locks,
            recovery,
            Arc::clone(&cache),
            Arc::clone(&caps.sandbox),
            Arc::clone(&caps.monitor),
            Arc::clone(&caps.audit),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut background = Vec::new();
        background.push(Self::spawn_sweeper(
            Arc::clone(&cache),
            Duration::from_millis(config.cache.sweep_interval_ms),
            shutdown_rx.clone(),
        ));
        background.push(Self::spawn_persister(
            paths.clone(),
            Arc::clone(&cache),
            Arc::clone(&history),
            Duration::from_millis(config.snapshots.persist_interval_ms),
            shutdown_rx,
        ));

        info!(root = %paths.root.display(), "Warden started");
        Ok(Self {
            paths,
            graph: Mutex::new(TestSchedulingGraph::new(Arc::clone(&history))),
            config,
            executor,
            cache,
            history,
            filter,
            sandbox: caps.sandbox,
            _instance: instance,
            shutdown_tx,
            background,
        })
    }

    fn spawn_sweeper(
        cache: Arc<ResultCache>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_persister(
        paths: WardenPaths,
        cache: Arc<ResultCache>,
        history: Arc<ExecutionHistory>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache::save_snapshot(&paths.cache_snapshot(), &cache).await {
                            warn!(error = %e, "Periodic cache snapshot failed");
                        }
                        let stats = cache.stats();
                        if let Err(e) =
                            save_perf_snapshot(&paths.perf_snapshot(), &history, &stats).await
                        {
                            warn!(error = %e, "Periodic performance snapshot failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.history
    }

    pub fn snapshot_filter(&self) -> &Arc<dyn SnapshotFilter> {
        &self.filter
    }

    pub async fn run_command(
        &self,
        command: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<CommandOutcome> {
        self.executor.execute(command, args, opts).await
    }

    pub fn add_dependency(
        &self,
        file: impl Into<String>,
        depends_on: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.graph.lock().add_dependency(file, depends_on);
    }

    /// The order a batch would run in, without running it.
    pub fn planned_order(&self, files: &[String]) -> Vec<String> {
        let mut graph = self.graph.lock();
        if self.config.scheduling.infer_dependencies {
            graph.infer_dependencies(files);
        }
        graph.optimal_order(files)
    }

    pub fn analyze_dependencies(&self, files: &[String]) -> DependencyAnalysis {
        let mut graph = self.graph.lock();
        if self.config.scheduling.infer_dependencies {
            graph.infer_dependencies(files);
        }
        graph.analyze(files)
    }

    /// Run `runner <file>` for every file, in dependency-respecting order.
    /// Failures are reported per file, not propagated, so one broken test
    /// file does not hide the rest of the batch.
    pub async fn run_batch(
        &self,
        runner: &str,
        files: &[String],
        opts: &ExecOptions,
    ) -> BatchReport {
        let order = self.planned_order(files);
        let mut items = Vec::with_capacity(order.len());
        let mut passed = 0;
        let mut failed = 0;

        for file in &order {
            let args = vec![file.clone()];
            match self.executor.execute(runner, &args, opts).await {
                Ok(outcome) => {
                    self.history.record(file, outcome.duration_ms);
                    passed += 1;
                    items.push(BatchItem {
                        file: file.clone(),
                        success: true,
                        duration_ms: outcome.duration_ms,
                        error: None,
                    });
                }
                Err(e) => {
                    failed += 1;
                    items.push(BatchItem {
                        file: file.clone(),
                        success: false,
                        duration_ms: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(total = order.len(), passed, failed, "Batch complete");
        BatchReport {
            order,
            passed,
            failed,
            items,
        }
    }

    /// Persist both snapshots now.
    pub async fn persist(&self) -> Result<()> {
        cache::save_snapshot(&self.paths.cache_snapshot(), &self.cache).await?;
        let stats = self.cache.stats();
        save_perf_snapshot(&self.paths.perf_snapshot(), &self.history, &stats).await?;
        Ok(())
    }

    /// Persist, stop background tasks, and release the instance lock.
    pub async fn shutdown(mut self) -> Result<()> {
        let persisted = self.persist().await;
        let _ = self.shutdown_tx.send(true);
        for handle in self.background.drain(..) {
            handle.abort();
        }
        self.sandbox.cleanup().await;
        info!("Warden stopped");
        persisted
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.paths.root
    }
}
