mod lockfile;
mod process;
mod rwlock;

pub use lockfile::InstanceLock;
pub use process::ProcessLockManager;
pub use rwlock::{ReadGuard, RwLockStats, SharedRwLock, WriteGuard};
