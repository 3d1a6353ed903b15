//! Advisory single-instance lock file.
//!
//! The file holds one millisecond epoch timestamp. A second controller
//! refuses to start while the file is younger than the staleness threshold;
//! an older file is treated as abandoned and replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};

pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the instance lock at `path`, replacing a stale one.
    pub async fn acquire(path: impl Into<PathBuf>, stale_threshold: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Some(written_ms) = Self::read_timestamp(&path).await? {
            let age_ms = (Utc::now().timestamp_millis() - written_ms).max(0) as u64;
            let threshold_ms = stale_threshold.as_millis() as u64;
            if age_ms < threshold_ms {
                return Err(WardenError::InstanceAlreadyRunning {
                    age_ms,
                    threshold_ms,
                });
            }
            info!(path = %path.display(), age_ms, "Removing stale instance lock");
        }

        let temp_path = path.with_extension(format!("lock.{}.tmp", std::process::id()));
        let content = Utc::now().timestamp_millis().to_string();
        fs::write(&temp_path, &content).await?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Instance lock acquired");
                Ok(Self { path })
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e.into())
            }
        }
    }

    async fn read_timestamp(path: &Path) -> Result<Option<i64>> {
        match fs::read_to_string(path).await {
            Ok(content) => match content.trim().parse::<i64>() {
                Ok(ms) => Ok(Some(ms)),
                // Unreadable content counts as abandoned, not fatal.
                Err(_) => {
                    warn!(path = %path.display(), "Instance lock holds non-numeric content");
                    Ok(Some(0))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh the timestamp so long-running instances stay non-stale.
    pub async fn touch(&self) -> Result<()> {
        let temp_path = self
            .path
            .with_extension(format!("lock.{}.tmp", std::process::id()));
        fs::write(&temp_path, Utc::now().timestamp_millis().to_string()).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove instance lock");
        }
    }
}
