pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod lock;
pub mod orchestrator;
pub mod ratelimit;
pub mod recovery;
pub mod sched;
pub mod telemetry;
pub mod validate;

pub use cache::{PatternFilter, ResultCache, SnapshotFilter};
pub use config::{WardenConfig, WardenPaths};
pub use error::{ErrorKind, ExecError, Result, TimeoutKind, WardenError};
pub use exec::{CommandOutcome, ExecOptions, SecureExecutor};
pub use lock::{InstanceLock, ProcessLockManager, SharedRwLock};
pub use orchestrator::{BatchReport, Capabilities, Warden};
pub use ratelimit::CommandRateLimiter;
pub use recovery::ErrorRecoveryManager;
pub use sched::{ExecutionHistory, TestSchedulingGraph};
