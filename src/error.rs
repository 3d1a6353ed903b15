use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which watchdog fired for a killed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    Command,
    Idle,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "CMD_TIMEOUT",
            Self::Idle => "IDLE_TIMEOUT",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy-table key for recovery. Derived from `ExecError`, never
/// constructed from free text outside `ExecError::classify_output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    LockTimeout,
    ConcurrencyConflict,
    ResourceExhausted,
    CommandFailed,
    TimeoutKilled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::LockTimeout => "lock_timeout",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::ResourceExhausted => "resource_exhausted",
            Self::CommandFailed => "command_failed",
            Self::TimeoutKilled => "timeout_killed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-level failure carrying enough context that callers can report
/// without re-deriving state from the child process.
#[derive(Debug, Clone)]
pub enum ExecError {
    Validation {
        message: String,
    },
    RateLimited {
        wait: Option<Duration>,
    },
    LockTimeout {
        resource: String,
        waited: Duration,
    },
    ConcurrencyConflict {
        message: String,
    },
    ResourceExhausted {
        message: String,
    },
    CommandFailed {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        duration: Duration,
    },
    TimeoutKilled {
        kind: TimeoutKind,
        stdout: String,
        stderr: String,
        duration: Duration,
    },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::TimeoutKilled { .. } => ErrorKind::TimeoutKilled,
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    /// Refine a non-zero-exit failure using the child's output. Memory
    /// pressure and lock contention get their own kinds so the recovery
    /// table can treat them differently; everything else (including
    /// rate-limit-looking output) stays `CommandFailed`.
    pub fn classify_output(self) -> Self {
        let Self::CommandFailed {
            message,
            exit_code,
            stdout,
            stderr,
            duration,
        } = self
        else {
            return self;
        };

        let haystack = format!("{}\n{}", stderr, stdout).to_lowercase();

        const MEMORY_MARKERS: &[&str] = &[
            "out of memory",
            "cannot allocate",
            "enomem",
            "oom-kill",
            "heap limit",
        ];
        if MEMORY_MARKERS.iter().any(|p| haystack.contains(p)) {
            return Self::ResourceExhausted {
                message: format!("{} (memory pressure in output)", message),
            };
        }

        const CONTENTION_MARKERS: &[&str] = &[
            "resource busy",
            "lock held",
            "could not acquire lock",
            "database is locked",
            "already locked",
        ];
        if CONTENTION_MARKERS.iter().any(|p| haystack.contains(p)) {
            return Self::ConcurrencyConflict {
                message: format!("{} (contention in output)", message),
            };
        }

        Self::CommandFailed {
            message,
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }

    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stdout, .. } | Self::TimeoutKilled { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } | Self::TimeoutKilled { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::CommandFailed { duration, .. } | Self::TimeoutKilled { duration, .. } => {
                Some(*duration)
            }
            _ => None,
        }
    }

    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Self::TimeoutKilled { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { message } => write!(f, "Invalid arguments: {}", message),
            Self::RateLimited { wait } => match wait {
                Some(d) => write!(f, "Rate limited, retry in {}ms", d.as_millis()),
                None => write!(f, "Rate limited"),
            },
            Self::LockTimeout { resource, waited } => {
                write!(
                    f,
                    "Lock timeout on {} after {}ms",
                    resource,
                    waited.as_millis()
                )
            }
            Self::ConcurrencyConflict { message } => {
                write!(f, "Concurrency conflict: {}", message)
            }
            Self::ResourceExhausted { message } => {
                write!(f, "Resource exhausted: {}", message)
            }
            Self::CommandFailed {
                message, exit_code, ..
            } => match exit_code {
                Some(code) => write!(f, "Command failed (exit {}): {}", code, message),
                None => write!(f, "Command failed: {}", message),
            },
            Self::TimeoutKilled { kind, duration, .. } => {
                write!(f, "Killed by {} after {}ms", kind, duration.as_millis())
            }
        }
    }
}

impl std::error::Error for ExecError {}

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Exec(#[from] ExecError),

    #[error("Recovery exhausted for {kind} after {attempts} attempts: {last_error}")]
    RecoveryExhausted {
        kind: ErrorKind,
        attempts: u32,
        last_error: String,
    },

    #[error("Another instance is running (lock file age {age_ms}ms, threshold {threshold_ms}ms)")]
    InstanceAlreadyRunning { age_ms: u64, threshold_ms: u64 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    /// The exec-level error kind, when this wraps one.
    pub fn exec_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Exec(e) => Some(e.kind()),
            Self::RecoveryExhausted { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_output_detects_memory_pressure() {
        let err = ExecError::CommandFailed {
            message: "exit 1".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "fatal: Cannot allocate memory".into(),
            duration: Duration::from_millis(10),
        };
        assert_eq!(err.classify_output().kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn classify_output_detects_contention() {
        let err = ExecError::CommandFailed {
            message: "exit 1".into(),
            exit_code: Some(1),
            stdout: "Error: database is locked".into(),
            stderr: String::new(),
            duration: Duration::from_millis(10),
        };
        assert_eq!(err.classify_output().kind(), ErrorKind::ConcurrencyConflict);
    }

    #[test]
    fn classify_output_defaults_to_command_failed() {
        let err = ExecError::CommandFailed {
            message: "exit 2".into(),
            exit_code: Some(2),
            stdout: "429 Too Many Requests".into(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
        };
        // Rate-limit-looking output is still a command failure; only the
        // limiter itself produces RateLimited.
        assert_eq!(err.classify_output().kind(), ErrorKind::CommandFailed);
    }

    #[test]
    fn validation_is_terminal() {
        let err = ExecError::Validation {
            message: "bad".into(),
        };
        assert!(!err.is_transient());
        assert!(
            ExecError::ConcurrencyConflict {
                message: "x".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn timeout_kind_tags() {
        assert_eq!(TimeoutKind::Command.as_str(), "CMD_TIMEOUT");
        assert_eq!(TimeoutKind::Idle.as_str(), "IDLE_TIMEOUT");
    }
}
