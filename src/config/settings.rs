use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, WardenError};

/// Well-known paths under the state directory.
#[derive(Debug, Clone)]
pub struct WardenPaths {
    pub root: PathBuf,
}

impl WardenPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn cache_snapshot(&self) -> PathBuf {
        self.root.join("cache-snapshot.json")
    }

    pub fn perf_snapshot(&self) -> PathBuf {
        self.root.join("perf-snapshot.json")
    }

    pub fn instance_lock(&self) -> PathBuf {
        self.root.join("warden.lock")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub executor: ExecutorConfig,
    pub validation: ValidationConfig,
    pub rate_limit: RateLimitConfig,
    pub locks: LockConfig,
    pub cache: CacheConfig,
    pub recovery: RecoveryConfig,
    pub scheduling: SchedulingConfig,
    pub snapshots: SnapshotConfig,
}

impl WardenConfig {
    pub async fn load(paths: &WardenPaths) -> Result<Self> {
        let config_path = paths.config_file();
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, paths: &WardenPaths) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(&paths.root).await?;
        let content =
            toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))?;
        fs::write(paths.config_file(), content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.executor.command_timeout_ms == 0 {
            errors.push("executor.command_timeout_ms must be greater than 0");
        }
        if self.executor.idle_timeout_ms == 0 {
            errors.push("executor.idle_timeout_ms must be greater than 0");
        }
        if self.executor.idle_timeout_ms > self.executor.command_timeout_ms {
            errors.push("executor.idle_timeout_ms must not exceed command_timeout_ms");
        }

        if self.validation.max_args == 0 {
            errors.push("validation.max_args must be greater than 0");
        }
        if self.validation.max_arg_len == 0 {
            errors.push("validation.max_arg_len must be greater than 0");
        }
        if self.validation.min_timeout_secs > self.validation.max_timeout_secs {
            errors.push("validation.min_timeout_secs must not exceed max_timeout_secs");
        }
        if self.validation.max_workers == 0 {
            errors.push("validation.max_workers must be greater than 0");
        }

        if self.rate_limit.max_executions == 0 {
            errors.push("rate_limit.max_executions must be greater than 0");
        }
        if self.rate_limit.time_window_ms == 0 {
            errors.push("rate_limit.time_window_ms must be greater than 0");
        }

        if self.locks.max_readers == 0 {
            errors.push("locks.max_readers must be greater than 0");
        }
        if self.locks.process_lock_timeout_ms == 0 {
            errors.push("locks.process_lock_timeout_ms must be greater than 0");
        }
        if self.locks.reaper_interval_ms == 0 {
            errors.push("locks.reaper_interval_ms must be greater than 0");
        }
        if self.locks.stale_instance_threshold_ms == 0 {
            errors.push("locks.stale_instance_threshold_ms must be greater than 0");
        }

        if self.cache.max_size == 0 {
            errors.push("cache.max_size must be greater than 0");
        }
        if self.cache.default_ttl_ms == 0 {
            errors.push("cache.default_ttl_ms must be greater than 0");
        }
        if self.cache.sweep_interval_ms == 0 {
            errors.push("cache.sweep_interval_ms must be greater than 0");
        }

        if self.recovery.default_max_retries == 0 {
            errors.push("recovery.default_max_retries must be greater than 0");
        }
        if self.recovery.default_backoff_multiplier < 1.0 {
            errors.push("recovery.default_backoff_multiplier must be >= 1.0");
        }

        if self.scheduling.history_window == 0 {
            errors.push("scheduling.history_window must be greater than 0");
        }

        if self.snapshots.persist_interval_ms == 0 {
            errors.push("snapshots.persist_interval_ms must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WardenError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Absolute deadline for a command, in milliseconds.
    pub command_timeout_ms: u64,
    /// Kill the child when no output is observed for this long.
    pub idle_timeout_ms: u64,
    /// Commands that always bypass the sandbox capability.
    pub system_commands: Vec<String>,
    /// Run non-system commands through the sandbox capability.
    pub use_sandbox: bool,
    /// Permit direct execution when the sandbox fails.
    pub allow_direct_fallback: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 120_000,
            idle_timeout_ms: 30_000,
            system_commands: vec!["git".to_string(), "sh".to_string(), "env".to_string()],
            use_sandbox: false,
            allow_direct_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_args: usize,
    pub max_arg_len: usize,
    /// Substrings rejected anywhere in an argument.
    pub denied_keywords: Vec<String>,
    /// Flag pairs that must not appear together.
    pub conflicting_flags: Vec<(String, String)>,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_workers: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_args: 64,
            max_arg_len: 4096,
            denied_keywords: vec![
                "rm -rf".to_string(),
                "sudo".to_string(),
                "mkfifo".to_string(),
                "eval".to_string(),
                "exec ".to_string(),
            ],
            conflicting_flags: vec![
                ("--silent".to_string(), "--verbose".to_string()),
                ("--quiet".to_string(), "--debug".to_string()),
            ],
            min_timeout_secs: 1,
            max_timeout_secs: 86_400,
            max_workers: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_executions: usize,
    pub time_window_ms: u64,
    /// How long a check may wait on the per-key gate before giving up.
    pub gate_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_executions: 10,
            time_window_ms: 60_000,
            gate_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_readers: usize,
    /// Fair mode: direct read acquisitions queue behind waiting writers.
    pub fair: bool,
    pub default_acquire_timeout_ms: u64,
    /// Auto-expiry deadline for process locks.
    pub process_lock_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    /// Age beyond which the on-disk instance lock is presumed abandoned.
    pub stale_instance_threshold_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_readers: 32,
            fair: true,
            default_acquire_timeout_ms: 10_000,
            process_lock_timeout_ms: 300_000,
            reaper_interval_ms: 1_000,
            stale_instance_threshold_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl_ms: 3_600_000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_backoff_multiplier: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_retry_delay_ms: 1_000,
            default_backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Rolling window of historical durations kept per test file.
    pub history_window: usize,
    /// Derive heuristic dependency edges before ordering a batch.
    pub infer_dependencies: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            infer_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub persist_interval_ms: u64,
    /// Keys/files containing any of these substrings are dropped on load.
    pub deny_substrings: Vec<String>,
    /// Overrides the deny list: matching entries are always kept.
    pub allow_substrings: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            persist_interval_ms: 30_000,
            deny_substrings: vec![
                "fixture".to_string(),
                "__mock".to_string(),
                ".tmp".to_string(),
            ],
            allow_substrings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WardenConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_window() {
        let mut config = WardenConfig::default();
        config.rate_limit.time_window_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("time_window_ms"));
    }

    #[test]
    fn rejects_idle_exceeding_command_timeout() {
        let mut config = WardenConfig::default();
        config.executor.idle_timeout_ms = config.executor.command_timeout_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn collects_multiple_violations() {
        let mut config = WardenConfig::default();
        config.cache.max_size = 0;
        config.locks.max_readers = 0;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("cache.max_size"));
        assert!(message.contains("locks.max_readers"));
    }

    #[tokio::test]
    async fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WardenPaths::new(dir.path().join(".runwarden"));
        let config = WardenConfig::load(&paths).await.unwrap();
        assert_eq!(config.cache.max_size, 1_000);
    }

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WardenPaths::new(dir.path().join(".runwarden"));
        let mut config = WardenConfig::default();
        config.rate_limit.max_executions = 3;
        config.save(&paths).await.unwrap();

        let loaded = WardenConfig::load(&paths).await.unwrap();
        assert_eq!(loaded.rate_limit.max_executions, 3);
    }
}
