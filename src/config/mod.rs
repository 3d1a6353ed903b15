mod settings;

pub use settings::{
    CacheConfig, ExecutorConfig, LockConfig, RateLimitConfig, RecoveryConfig, SchedulingConfig,
    SnapshotConfig, ValidationConfig, WardenConfig, WardenPaths,
};
