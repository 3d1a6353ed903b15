//! Sandbox capability.
//!
//! Selected explicitly at construction time; when nothing is configured the
//! executor runs children directly. The core implements no isolation of its
//! own — a real sandbox plugs in through this trait.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::watchdog::{self, CommandOutcome, WatchdogLimits};
use crate::error::ExecError;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Reject a command before any execution attempt.
    fn validate_command(&self, command: &str, args: &[String]) -> Result<(), ExecError>;

    async fn execute(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        limits: &WatchdogLimits,
    ) -> Result<CommandOutcome, ExecError>;

    /// Release sandbox resources at shutdown.
    async fn cleanup(&self) {}
}

/// Accepts everything and runs children directly; the no-op default.
pub struct PassthroughSandbox;

#[async_trait]
impl Sandbox for PassthroughSandbox {
    fn validate_command(&self, _command: &str, _args: &[String]) -> Result<(), ExecError> {
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        limits: &WatchdogLimits,
    ) -> Result<CommandOutcome, ExecError> {
        watchdog::run(command, args, cwd, limits).await
    }
}

/// Restricts execution to an explicit command allowlist. Still runs the
/// child directly once admitted; path/resource confinement belongs to an
/// external sandbox implementation.
pub struct AllowlistSandbox {
    allowed: Vec<String>,
}

impl AllowlistSandbox {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Sandbox for AllowlistSandbox {
    fn validate_command(&self, command: &str, _args: &[String]) -> Result<(), ExecError> {
        if self.allowed.iter().any(|c| c == command) {
            Ok(())
        } else {
            Err(ExecError::Validation {
                message: format!("command {:?} is not in the sandbox allowlist", command),
            })
        }
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        limits: &WatchdogLimits,
    ) -> Result<CommandOutcome, ExecError> {
        self.validate_command(command, args)?;
        debug!(command, "Sandbox admitting command");
        watchdog::run(command, args, cwd, limits).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_validates_commands() {
        let sandbox = AllowlistSandbox::new(["cargo", "npm"]);
        assert!(sandbox.validate_command("cargo", &[]).is_ok());
        assert!(sandbox.validate_command("bash", &[]).is_err());
    }

    #[test]
    fn passthrough_accepts_everything() {
        assert!(PassthroughSandbox.validate_command("anything", &[]).is_ok());
    }
}
