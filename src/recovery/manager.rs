//! Classified error recovery with bounded retry budgets.
//!
//! Each error kind owns a strategy: how many attempts, the delay curve, and
//! whether cleanup must run before the next attempt. Concurrency conflicts
//! retry more often with jitter to desynchronize contenders; resource
//! exhaustion retries fewer times with mandatory cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{ErrorKind, ExecError, Result, WardenError};

#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub cleanup_required: bool,
}

impl RetryStrategy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.retry_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let jittered = if self.jitter {
            // Up to +50% so contenders spread out.
            base * (1.0 + rand::rng().random_range(0.0..0.5))
        } else {
            base
        };
        Duration::from_secs_f64(jittered)
    }
}

/// One tracked failing operation.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub operation: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDirective {
    pub attempt: u32,
    pub delay: Duration,
}

pub struct ErrorRecoveryManager {
    strategies: HashMap<ErrorKind, RetryStrategy>,
    records: Mutex<HashMap<String, ErrorRecord>>,
    /// Purged when a strategy demands cleanup before the next attempt.
    temp_dir: Option<PathBuf>,
}

impl ErrorRecoveryManager {
    pub fn new(config: &RecoveryConfig, temp_dir: Option<PathBuf>) -> Self {
        let default = RetryStrategy {
            max_retries: config.default_max_retries,
            retry_delay: Duration::from_millis(config.default_retry_delay_ms),
            backoff_multiplier: config.default_backoff_multiplier,
            jitter: false,
            cleanup_required: false,
        };

        let mut strategies = HashMap::new();
        strategies.insert(ErrorKind::CommandFailed, default.clone());
        strategies.insert(ErrorKind::TimeoutKilled, default.clone());
        strategies.insert(
            ErrorKind::ConcurrencyConflict,
            RetryStrategy {
                max_retries: config.default_max_retries + 2,
                retry_delay: Duration::from_millis(config.default_retry_delay_ms / 5).max(Duration::from_millis(50)),
                backoff_multiplier: 1.5,
                jitter: true,
                cleanup_required: false,
            },
        );
        strategies.insert(
            ErrorKind::ResourceExhausted,
            RetryStrategy {
                max_retries: (config.default_max_retries / 2).max(1),
                retry_delay: Duration::from_millis(config.default_retry_delay_ms * 2),
                backoff_multiplier: config.default_backoff_multiplier,
                jitter: false,
                cleanup_required: true,
            },
        );
        strategies.insert(
            ErrorKind::RateLimited,
            RetryStrategy {
                max_retries: 1,
                retry_delay: Duration::from_millis(config.default_retry_delay_ms),
                backoff_multiplier: 1.0,
                jitter: true,
                cleanup_required: false,
            },
        );
        // Surfaced, never retried: the queue entry was already cleaned up.
        strategies.insert(
            ErrorKind::LockTimeout,
            RetryStrategy {
                max_retries: 0,
                retry_delay: Duration::ZERO,
                backoff_multiplier: 1.0,
                jitter: false,
                cleanup_required: false,
            },
        );

        Self {
            strategies,
            records: Mutex::new(HashMap::new()),
            temp_dir,
        }
    }

    pub fn with_strategy(mut self, kind: ErrorKind, strategy: RetryStrategy) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    pub fn strategy(&self, kind: ErrorKind) -> Option<&RetryStrategy> {
        self.strategies.get(&kind)
    }

    /// Decide whether `operation` may retry after `error`. Returns the
    /// directive after sleeping out the computed delay, or a terminal
    /// `RecoveryExhausted` once the kind's budget is spent.
    pub async fn handle_error(
        &self,
        operation: &str,
        error: &ExecError,
    ) -> Result<RetryDirective> {
        let kind = error.kind();
        if kind == ErrorKind::Validation {
            // Malformed input is terminal by definition.
            return Err(WardenError::Exec(error.clone()));
        }

        let strategy = self.strategies.get(&kind).cloned().unwrap_or(RetryStrategy {
            max_retries: 0,
            retry_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
            cleanup_required: false,
        });

        let (attempt, exhausted) = {
            let mut records = self.records.lock();
            let record = records
                .entry(operation.to_string())
                .or_insert_with(|| ErrorRecord {
                    operation: operation.to_string(),
                    kind,
                    attempts: 0,
                    first_seen: Utc::now(),
                });
            if record.attempts >= strategy.max_retries {
                let attempts = record.attempts;
                records.remove(operation);
                (attempts, true)
            } else {
                record.attempts += 1;
                (record.attempts, false)
            }
        };

        if exhausted {
            warn!(operation, kind = %kind, attempts = attempt, "Recovery exhausted");
            return Err(WardenError::RecoveryExhausted {
                kind,
                attempts: attempt,
                last_error: error.to_string(),
            });
        }

        if strategy.cleanup_required {
            self.run_cleanup().await;
        }

        let delay = strategy.delay_for_attempt(attempt);
        info!(
            operation,
            kind = %kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        tokio::time::sleep(delay).await;
        Ok(RetryDirective { attempt, delay })
    }

    /// Forget the record for `operation` once it succeeds.
    pub fn resolve(&self, operation: &str) {
        if self.records.lock().remove(operation).is_some() {
            debug!(operation, "Recovery record cleared after success");
        }
    }

    pub fn record(&self, operation: &str) -> Option<ErrorRecord> {
        self.records.lock().get(operation).cloned()
    }

    pub fn tracked_operations(&self) -> usize {
        self.records.lock().len()
    }

    /// Best-effort temp purge. There is no collector to force in Rust, so
    /// cleanup is limited to reclaiming scratch space.
    async fn run_cleanup(&self) {
        let Some(dir) = &self.temp_dir else {
            return;
        };
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                let _ = tokio::fs::create_dir_all(dir).await;
                info!(dir = %dir.display(), "Purged temp directory before retry");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Temp cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ErrorRecoveryManager {
        ErrorRecoveryManager::new(
            &RecoveryConfig {
                default_max_retries: 3,
                default_retry_delay_ms: 10,
                default_backoff_multiplier: 2.0,
            },
            None,
        )
    }

    fn command_failed() -> ExecError {
        ExecError::CommandFailed {
            message: "exit 1".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_up_to_budget_then_exhausts() {
        let manager = manager();
        let error = command_failed();

        for attempt in 1..=3 {
            let directive = manager.handle_error("op", &error).await.unwrap();
            assert_eq!(directive.attempt, attempt);
        }

        let err = manager.handle_error("op", &error).await.unwrap_err();
        match err {
            WardenError::RecoveryExhausted { attempts, kind, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(kind, ErrorKind::CommandFailed);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Exhaustion discards the record; a later failure starts fresh.
        assert_eq!(manager.tracked_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially() {
        let manager = manager();
        let error = command_failed();

        let d1 = manager.handle_error("op", &error).await.unwrap().delay;
        let d2 = manager.handle_error("op", &error).await.unwrap().delay;
        let d3 = manager.handle_error("op", &error).await.unwrap().delay;
        assert_eq!(d1, Duration::from_millis(10));
        assert_eq!(d2, Duration::from_millis(20));
        assert_eq!(d3, Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_delays_carry_jitter() {
        let manager = manager();
        let error = ExecError::ConcurrencyConflict {
            message: "contended".into(),
        };
        let strategy = manager.strategy(ErrorKind::ConcurrencyConflict).unwrap();
        let base = strategy.retry_delay;

        let directive = manager.handle_error("op", &error).await.unwrap();
        assert!(directive.delay >= base);
        assert!(directive.delay <= base.mul_f64(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_budget() {
        let manager = manager();
        let error = command_failed();

        for _ in 0..3 {
            manager.handle_error("op", &error).await.unwrap();
        }
        manager.resolve("op");

        let directive = manager.handle_error("op", &error).await.unwrap();
        assert_eq!(directive.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_timeouts_are_surfaced_not_retried() {
        let manager = manager();
        let error = ExecError::LockTimeout {
            resource: "rw".into(),
            waited: Duration::from_millis(10),
        };
        let err = manager.handle_error("op", &error).await.unwrap_err();
        assert!(matches!(err, WardenError::RecoveryExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn validation_never_enters_recovery() {
        let manager = manager();
        let error = ExecError::Validation {
            message: "bad".into(),
        };
        let err = manager.handle_error("op", &error).await.unwrap_err();
        assert!(matches!(err, WardenError::Exec(ExecError::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_are_tracked_independently() {
        let manager = manager();
        let error = command_failed();

        manager.handle_error("a", &error).await.unwrap();
        manager.handle_error("a", &error).await.unwrap();
        let directive = manager.handle_error("b", &error).await.unwrap();
        assert_eq!(directive.attempt, 1);
        assert_eq!(manager.tracked_operations(), 2);
    }

    #[tokio::test]
    async fn cleanup_purges_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();
        std::fs::write(temp.join("scratch.bin"), b"junk").unwrap();

        let manager = ErrorRecoveryManager::new(
            &RecoveryConfig {
                default_max_retries: 2,
                default_retry_delay_ms: 1,
                default_backoff_multiplier: 1.0,
            },
            Some(temp.clone()),
        );
        let error = ExecError::ResourceExhausted {
            message: "oom".into(),
        };
        manager.handle_error("op", &error).await.unwrap();
        assert!(temp.exists());
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
    }
}
