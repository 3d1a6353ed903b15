//! Rolling execution history and the persisted performance snapshot.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::cache::{CacheStats, SnapshotFilter};
use crate::error::Result;

/// Aggregate counters carried alongside the per-file durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateCounters {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_requests: u64,
    pub peak_memory_bytes: u64,
}

#[derive(Default)]
struct HistoryInner {
    durations: HashMap<String, VecDeque<u64>>,
    counters: AggregateCounters,
}

pub struct ExecutionHistory {
    window: usize,
    inner: Mutex<HistoryInner>,
}

impl ExecutionHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    pub fn record(&self, file: &str, duration_ms: u64) {
        let mut inner = self.inner.lock();
        let window = inner
            .durations
            .entry(file.to_string())
            .or_default();
        window.push_back(duration_ms);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    pub fn avg_duration_ms(&self, file: &str) -> Option<f64> {
        let inner = self.inner.lock();
        let window = inner.durations.get(file)?;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<u64>() as f64 / window.len() as f64)
    }

    /// Scheduling weight: `1 / ln(avg + 1)`, so historically fast files sort
    /// first. Files with no history get 1.0, placing them ahead of anything
    /// measured.
    pub fn weight(&self, file: &str) -> f64 {
        match self.avg_duration_ms(file) {
            Some(avg) if avg > 0.0 => 1.0 / (avg + 1.0).ln(),
            _ => 1.0,
        }
    }

    pub fn observe_peak_memory(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.counters.peak_memory_bytes = inner.counters.peak_memory_bytes.max(bytes);
    }

    pub fn counters(&self) -> AggregateCounters {
        self.inner.lock().counters
    }

    pub fn tracked_files(&self) -> usize {
        self.inner.lock().durations.len()
    }
}

/// On-disk performance snapshot. Unknown fields are ignored on load so the
/// format can grow.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PerfSnapshot {
    durations: HashMap<String, Vec<u64>>,
    counters: AggregateCounters,
}

/// Persist `history`, folding the cache's live counters into the snapshot.
pub async fn save_perf_snapshot(
    path: &Path,
    history: &ExecutionHistory,
    cache_stats: &CacheStats,
) -> Result<()> {
    let snapshot = {
        let inner = history.inner.lock();
        PerfSnapshot {
            durations: inner
                .durations
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            counters: AggregateCounters {
                cache_hits: cache_stats.hits.max(inner.counters.cache_hits),
                cache_misses: cache_stats.misses.max(inner.counters.cache_misses),
                total_requests: cache_stats.total_requests.max(inner.counters.total_requests),
                peak_memory_bytes: inner.counters.peak_memory_bytes,
            },
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&temp_path, serde_json::to_vec_pretty(&snapshot)?).await?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => {
            debug!(path = %path.display(), files = snapshot.durations.len(), "Performance snapshot written");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(e.into())
        }
    }
}

/// Merge a persisted snapshot. Files already tracked keep their live data;
/// incoming files must pass the plausibility filter. Returns how many files
/// were admitted.
pub async fn load_perf_snapshot(
    path: &Path,
    history: &ExecutionHistory,
    filter: &std::sync::Arc<dyn SnapshotFilter>,
) -> Result<usize> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let snapshot: PerfSnapshot = serde_json::from_slice(&content)?;

    let mut inner = history.inner.lock();
    let mut admitted = 0;
    for (file, durations) in snapshot.durations {
        if !filter.retain(&file) || inner.durations.contains_key(&file) {
            continue;
        }
        let mut window: VecDeque<u64> = durations.into_iter().collect();
        while window.len() > history.window {
            window.pop_front();
        }
        if window.is_empty() {
            continue;
        }
        inner.durations.insert(file, window);
        admitted += 1;
    }

    let c = &mut inner.counters;
    c.cache_hits = c.cache_hits.max(snapshot.counters.cache_hits);
    c.cache_misses = c.cache_misses.max(snapshot.counters.cache_misses);
    c.total_requests = c.total_requests.max(snapshot.counters.total_requests);
    c.peak_memory_bytes = c.peak_memory_bytes.max(snapshot.counters.peak_memory_bytes);

    info!(path = %path.display(), admitted, "Performance snapshot loaded");
    Ok(admitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RetainAll;
    use std::sync::Arc;

    fn retain_all() -> Arc<dyn SnapshotFilter> {
        Arc::new(RetainAll)
    }

    #[test]
    fn rolling_window_drops_old_samples() {
        let history = ExecutionHistory::new(3);
        for ms in [10, 20, 30, 40] {
            history.record("a.rs", ms);
        }
        assert_eq!(history.avg_duration_ms("a.rs"), Some(30.0));
    }

    #[test]
    fn weight_prefers_fast_files() {
        let history = ExecutionHistory::new(10);
        history.record("fast.rs", 10);
        history.record("slow.rs", 10_000);
        assert!(history.weight("fast.rs") > history.weight("slow.rs"));
        // Unseen files sort ahead of measured ones.
        assert!(history.weight("new.rs") > history.weight("fast.rs"));
    }

    #[test]
    fn peak_memory_is_monotonic() {
        let history = ExecutionHistory::new(10);
        history.observe_peak_memory(100);
        history.observe_peak_memory(50);
        assert_eq!(history.counters().peak_memory_bytes, 100);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-snapshot.json");

        let source = ExecutionHistory::new(10);
        source.record("suite/a.rs", 120);
        source.record("suite/a.rs", 140);
        source.observe_peak_memory(4096);
        save_perf_snapshot(&path, &source, &CacheStats::default())
            .await
            .unwrap();

        let target = ExecutionHistory::new(10);
        assert_eq!(
            load_perf_snapshot(&path, &target, &retain_all()).await.unwrap(),
            1
        );
        assert_eq!(target.avg_duration_ms("suite/a.rs"), Some(130.0));
        assert_eq!(target.counters().peak_memory_bytes, 4096);
    }

    #[tokio::test]
    async fn load_respects_filter_and_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-snapshot.json");

        let source = ExecutionHistory::new(10);
        source.record("real.rs", 100);
        source.record("fixture_gen.rs", 5);
        save_perf_snapshot(&path, &source, &CacheStats::default())
            .await
            .unwrap();

        let target = ExecutionHistory::new(10);
        target.record("real.rs", 900);

        let filter: Arc<dyn SnapshotFilter> = Arc::new(crate::cache::PatternFilter::from_config(
            &crate::config::SnapshotConfig::default(),
        ));
        assert_eq!(load_perf_snapshot(&path, &target, &filter).await.unwrap(), 0);
        // Live window wins; fixture file was filtered out.
        assert_eq!(target.avg_duration_ms("real.rs"), Some(900.0));
        assert_eq!(target.avg_duration_ms("fixture_gen.rs"), None);
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let history = ExecutionHistory::new(10);
        let admitted = load_perf_snapshot(
            Path::new("/nonexistent/perf.json"),
            &history,
            &retain_all(),
        )
        .await;
        assert_eq!(admitted.unwrap(), 0);
    }
}
