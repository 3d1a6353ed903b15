mod manager;

pub use manager::{ErrorRecoveryManager, ErrorRecord, RetryDirective, RetryStrategy};
