//! Atomic snapshot persistence with a pluggable plausibility filter.
//!
//! Snapshots are written to a temporary path and renamed into place, so a
//! crash mid-write never corrupts the previous snapshot. On load, entries
//! must be inside their TTL and pass the filter before being merged.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::{CacheEntry, ResultCache};
use crate::config::SnapshotConfig;
use crate::error::Result;

/// Decides which persisted entries are plausible enough to merge. Installed
/// at bootstrap; the default is substring allow/deny lists from config.
pub trait SnapshotFilter: Send + Sync {
    fn retain(&self, key: &str) -> bool;
}

pub struct PatternFilter {
    deny_substrings: Vec<String>,
    allow_substrings: Vec<String>,
}

impl PatternFilter {
    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self {
            deny_substrings: config.deny_substrings.clone(),
            allow_substrings: config.allow_substrings.clone(),
        }
    }
}

impl SnapshotFilter for PatternFilter {
    fn retain(&self, key: &str) -> bool {
        if self.allow_substrings.iter().any(|p| key.contains(p)) {
            return true;
        }
        !self.deny_substrings.iter().any(|p| key.contains(p))
    }
}

/// Admits everything; useful for callers that trust their snapshots.
pub struct RetainAll;

impl SnapshotFilter for RetainAll {
    fn retain(&self, _key: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheSnapshot {
    #[serde(default)]
    entries: HashMap<String, PersistedEntry>,
}

/// On-disk entry shape. Unknown fields are ignored on load; missing fields
/// default so older snapshots stay loadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedEntry {
    value: serde_json::Value,
    created_at_ms: i64,
    last_access_ms: i64,
    ttl_ms: u64,
}

impl From<CacheEntry> for PersistedEntry {
    fn from(e: CacheEntry) -> Self {
        Self {
            value: e.value,
            created_at_ms: e.created_at_ms,
            last_access_ms: e.last_access_ms,
            ttl_ms: e.ttl_ms,
        }
    }
}

impl From<PersistedEntry> for CacheEntry {
    fn from(e: PersistedEntry) -> Self {
        Self {
            value: e.value,
            created_at_ms: e.created_at_ms,
            last_access_ms: e.last_access_ms,
            ttl_ms: e.ttl_ms,
        }
    }
}

pub async fn save_snapshot(path: &Path, cache: &ResultCache) -> Result<()> {
    let snapshot = CacheSnapshot {
        entries: cache
            .export_entries()
            .into_iter()
            .map(|(k, e)| (k, e.into()))
            .collect(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let content = serde_json::to_vec_pretty(&snapshot)?;
    fs::write(&temp_path, &content).await?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => {
            debug!(path = %path.display(), entries = snapshot.entries.len(), "Cache snapshot written");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(e.into())
        }
    }
}

/// Load a snapshot and merge it into `cache`. Missing file is not an error.
/// Returns the number of entries admitted; loading twice with no writes in
/// between admits nothing new the second time.
pub async fn load_snapshot(
    path: &Path,
    cache: &ResultCache,
    filter: &Arc<dyn SnapshotFilter>,
) -> Result<usize> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let snapshot: CacheSnapshot = serde_json::from_slice(&content)?;
    let total = snapshot.entries.len();
    let plausible: HashMap<String, CacheEntry> = snapshot
        .entries
        .into_iter()
        .filter(|(key, _)| filter.retain(key))
        .map(|(k, e)| (k, e.into()))
        .collect();
    let filtered = total - plausible.len();

    let admitted = cache.import_entries(plausible);
    info!(
        path = %path.display(),
        admitted,
        filtered,
        "Cache snapshot loaded"
    );
    Ok(admitted)
}
