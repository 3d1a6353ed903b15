//! Guarded command execution.
//!
//! The pipeline for every command: argument validation, rate admission,
//! a short-lived dispatch lock, then sandboxed or direct execution under
//! both watchdogs. Failures are classified and retried under the recovery
//! manager's per-kind budget in a single bounded loop.

mod sandbox;
mod watchdog;

pub use sandbox::{AllowlistSandbox, PassthroughSandbox, Sandbox};
pub use watchdog::{CommandOutcome, WatchdogLimits};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::config::{ExecutorConfig, RateLimitConfig, ValidationConfig};
use crate::error::{ExecError, Result, WardenError};
use crate::lock::ProcessLockManager;
use crate::ratelimit::CommandRateLimiter;
use crate::recovery::ErrorRecoveryManager;
use crate::telemetry::{AuditEvent, AuditLevel, AuditSink, Monitor};
use crate::validate;

/// Per-call knobs; anything unset falls back to the executor's config.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub command_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Await the rate-limit cooldown and retry the check once.
    pub wait_on_rate_limit: bool,
    /// Overrides the configured sandbox-failure fallback.
    pub allow_direct_fallback: Option<bool>,
    pub recovery: bool,
    /// Consult and populate the result cache under this key.
    pub cache_key: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            command_timeout: None,
            idle_timeout: None,
            wait_on_rate_limit: true,
            allow_direct_fallback: None,
            recovery: true,
            cache_key: None,
        }
    }
}

pub struct SecureExecutor {
    config: ExecutorConfig,
    validation: ValidationConfig,
    rate_limiter: CommandRateLimiter,
    locks: ProcessLockManager,
    recovery: ErrorRecoveryManager,
    cache: Arc<ResultCache>,
    sandbox: Arc<dyn Sandbox>,
    monitor: Arc<dyn Monitor>,
    audit: Arc<dyn AuditSink>,
}

/// Releases the dispatch lock on every exit path.
struct DispatchLock<'a> {
    locks: &'a ProcessLockManager,
    id: String,
}

impl Drop for DispatchLock<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.id);
    }
}

impl SecureExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        validation: ValidationConfig,
        rate_limit: &RateLimitConfig,
        locks: ProcessLockManager,
        recovery: ErrorRecoveryManager,
        cache: Arc<ResultCache>,
        sandbox: Arc<dyn Sandbox>,
        monitor: Arc<dyn Monitor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            validation,
            rate_limiter: CommandRateLimiter::new(rate_limit),
            locks,
            recovery,
            cache,
            sandbox,
            monitor,
            audit,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &CommandRateLimiter {
        &self.rate_limiter
    }

    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<CommandOutcome> {
        validate::validate(args, &self.validation).map_err(WardenError::Exec)?;

        if let Some(key) = &opts.cache_key
            && let Some(cached) = self.lookup_cached(key)
        {
            return Ok(cached);
        }

        self.admit(command, opts).await?;

        let span = self.monitor.start_trace("execute_command", None);
        self.monitor
            .counter("command.start", 1, &[("command", command)]);

        let op_id = format!("{}@{}", command, Utc::now().timestamp_millis());
        let result = self.run_with_recovery(command, args, opts, &op_id).await;
        self.monitor.finish_trace(&span);

        match result {
            Ok(outcome) => {
                self.recovery.resolve(&op_id);
                self.monitor
                    .counter("command.success", 1, &[("command", command)]);
                self.monitor.metric(
                    "command.duration_ms",
                    outcome.duration_ms as f64,
                    &[("command", command)],
                );
                if let Some(key) = &opts.cache_key
                    && let Ok(value) = serde_json::to_value(&outcome)
                {
                    self.cache.set(key, value, None);
                }
                info!(command, duration_ms = outcome.duration_ms, "Command complete");
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    fn lookup_cached(&self, key: &str) -> Option<CommandOutcome> {
        match self.cache.get(key) {
            Some(value) => {
                self.monitor.counter("cache.hit", 1, &[("key", key)]);
                match serde_json::from_value(value) {
                    Ok(outcome) => {
                        debug!(key, "Serving command result from cache");
                        Some(outcome)
                    }
                    Err(e) => {
                        warn!(key, error = %e, "Dropping undecodable cache entry");
                        self.cache.invalidate(key);
                        None
                    }
                }
            }
            None => {
                self.monitor.counter("cache.miss", 1, &[("key", key)]);
                None
            }
        }
    }

    /// Rate admission: one cooldown wait is allowed, then the check repeats
    /// with waiting disabled.
    async fn admit(&self, command: &str, opts: &ExecOptions) -> Result<()> {
        let decision = self
            .rate_limiter
            .check(command)
            .await
            .map_err(WardenError::Exec)?;
        if decision.allowed {
            return Ok(());
        }

        self.audit
            .record(AuditEvent::new(
                "rate_limit",
                "denied",
                AuditLevel::Warning,
                json!({ "command": command, "wait_ms": decision.wait.map(|w| w.as_millis() as u64) }),
            ))
            .await;

        let Some(wait) = decision.wait.filter(|_| opts.wait_on_rate_limit) else {
            return Err(WardenError::Exec(ExecError::RateLimited {
                wait: decision.wait,
            }));
        };

        info!(command, wait_ms = wait.as_millis() as u64, "Awaiting rate-limit cooldown");
        tokio::time::sleep(wait).await;

        let retry = self
            .rate_limiter
            .check(command)
            .await
            .map_err(WardenError::Exec)?;
        if retry.allowed {
            Ok(())
        } else {
            Err(WardenError::Exec(ExecError::RateLimited { wait: retry.wait }))
        }
    }

    /// Bounded retry loop; the recovery manager's per-kind counter is the
    /// only bound.
    async fn run_with_recovery(
        &self,
        command: &str,
        args: &[String],
        opts: &ExecOptions,
        op_id: &str,
    ) -> Result<CommandOutcome> {
        loop {
            match self.dispatch(command, args, opts, op_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let err = err.classify_output();
                    self.audit
                        .record(AuditEvent::new(
                            "command",
                            "failed",
                            AuditLevel::Warning,
                            json!({
                                "command": command,
                                "kind": err.kind().as_str(),
                                "timeout": err.timeout_kind().map(|k| k.as_str()),
                            }),
                        ))
                        .await;

                    if !opts.recovery {
                        return Err(WardenError::Exec(err));
                    }
                    let directive = self.recovery.handle_error(op_id, &err).await?;
                    self.monitor.counter(
                        "command.retry",
                        1,
                        &[("command", command), ("kind", err.kind().as_str())],
                    );
                    debug!(
                        command,
                        attempt = directive.attempt,
                        "Retrying after classified failure"
                    );
                }
            }
        }
    }

    /// One dispatch attempt under the short-lived process lock.
    async fn dispatch(
        &self,
        command: &str,
        args: &[String],
        opts: &ExecOptions,
        op_id: &str,
    ) -> std::result::Result<CommandOutcome, ExecError> {
        let dispatch_id = format!("dispatch:{}", op_id);
        if !self.locks.acquire(&dispatch_id, "executor") {
            self.audit
                .record(AuditEvent::new(
                    "lock",
                    "denied",
                    AuditLevel::Warning,
                    json!({ "lock": dispatch_id }),
                ))
                .await;
            return Err(ExecError::ConcurrencyConflict {
                message: format!("duplicate concurrent dispatch of {}", command),
            });
        }
        self.monitor
            .counter("lock.acquired", 1, &[("command", command)]);
        let _lock = DispatchLock {
            locks: &self.locks,
            id: dispatch_id,
        };

        let limits = WatchdogLimits::new(
            opts.command_timeout
                .unwrap_or(Duration::from_millis(self.config.command_timeout_ms)),
            opts.idle_timeout
                .unwrap_or(Duration::from_millis(self.config.idle_timeout_ms)),
        );

        let is_system = self.config.system_commands.iter().any(|c| c == command);
        if !self.config.use_sandbox || is_system {
            return watchdog::run(command, args, opts.cwd.as_deref(), &limits).await;
        }

        self.sandbox.validate_command(command, args)?;
        match self
            .sandbox
            .execute(command, args, opts.cwd.as_deref(), &limits)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(sandbox_err) => {
                let fallback = opts
                    .allow_direct_fallback
                    .unwrap_or(self.config.allow_direct_fallback);
                if !fallback {
                    return Err(sandbox_err);
                }
                warn!(command, error = %sandbox_err, "Sandbox failed, falling back to direct execution");
                watchdog::run(command, args, opts.cwd.as_deref(), &limits).await
            }
        }
    }
}
