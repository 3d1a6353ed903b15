//! Sliding-window admission control per command key.
//!
//! The check-and-record sequence for one key runs under that key's write
//! lock, so concurrent checks for the same key serialize while unrelated
//! keys proceed independently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::ExecError;
use crate::lock::SharedRwLock;

/// Outcome of a rate check. `wait` is how long until the oldest timestamp
/// leaves the window, present only on denial.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub wait: Option<Duration>,
}

struct KeyState {
    gate: SharedRwLock,
    window: Arc<Mutex<VecDeque<Instant>>>,
}

pub struct CommandRateLimiter {
    max_executions: usize,
    time_window: Duration,
    gate_timeout: Duration,
    keys: Mutex<HashMap<String, Arc<KeyState>>>,
}

impl CommandRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_executions: config.max_executions,
            time_window: Duration::from_millis(config.time_window_ms),
            gate_timeout: Duration::from_millis(config.gate_timeout_ms),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key_state(&self, key: &str) -> Arc<KeyState> {
        let mut keys = self.keys.lock();
        Arc::clone(keys.entry(key.to_string()).or_insert_with(|| {
            Arc::new(KeyState {
                gate: SharedRwLock::new(format!("rate:{}", key), 1, true),
                window: Arc::new(Mutex::new(VecDeque::new())),
            })
        }))
    }

    /// Check whether `key` may execute now, recording the execution when
    /// allowed.
    pub async fn check(&self, key: &str) -> Result<RateDecision, ExecError> {
        let state = self.key_state(key);
        let _gate = state.gate.write(self.gate_timeout).await?;

        let now = Instant::now();
        let mut window = state.window.lock();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.time_window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_executions
            && let Some(oldest) = window.front().copied()
        {
            let wait = self.time_window.saturating_sub(now.duration_since(oldest));
            debug!(key, in_window = window.len(), wait_ms = wait.as_millis() as u64, "Rate limited");
            return Ok(RateDecision {
                allowed: false,
                wait: Some(wait),
            });
        }

        window.push_back(now);
        Ok(RateDecision {
            allowed: true,
            wait: None,
        })
    }

    /// Number of executions currently inside the window for `key`.
    pub fn in_window(&self, key: &str) -> usize {
        let keys = self.keys.lock();
        let Some(state) = keys.get(key) else {
            return 0;
        };
        let now = Instant::now();
        state
            .window
            .lock()
            .iter()
            .filter(|t| now.duration_since(**t) < self.time_window)
            .count()
    }

    /// Drop windows with no live timestamps so long-running controllers do
    /// not accumulate one entry per historical command name.
    pub fn prune(&self) {
        let now = Instant::now();
        let time_window = self.time_window;
        self.keys.lock().retain(|_, state| {
            state
                .window
                .lock()
                .iter()
                .any(|t| now.duration_since(*t) < time_window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_executions: usize, window_ms: u64) -> CommandRateLimiter {
        CommandRateLimiter::new(&RateLimitConfig {
            max_executions,
            time_window_ms: window_ms,
            gate_timeout_ms: 1_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_call_inside_window_is_denied_with_wait() {
        let limiter = limiter(3, 1_000);

        for _ in 0..3 {
            assert!(limiter.check("cargo test").await.unwrap().allowed);
        }

        let decision = limiter.check("cargo test").await.unwrap();
        assert!(!decision.allowed);
        let wait = decision.wait.unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapse_readmits_the_key() {
        let limiter = limiter(3, 1_000);
        for _ in 0..3 {
            assert!(limiter.check("k").await.unwrap().allowed);
        }
        assert!(!limiter.check("k").await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert!(limiter.check("k").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_limited_independently() {
        let limiter = limiter(1, 1_000);
        assert!(limiter.check("a").await.unwrap().allowed);
        assert!(limiter.check("b").await.unwrap().allowed);
        assert!(!limiter.check("a").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_check_does_not_record() {
        let limiter = limiter(2, 1_000);
        assert!(limiter.check("k").await.unwrap().allowed);
        assert!(limiter.check("k").await.unwrap().allowed);
        for _ in 0..5 {
            assert!(!limiter.check("k").await.unwrap().allowed);
        }
        assert_eq!(limiter.in_window("k"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_dead_windows() {
        let limiter = limiter(3, 100);
        limiter.check("gone").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        limiter.prune();
        assert_eq!(limiter.in_window("gone"), 0);
        assert!(limiter.keys.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_checks_for_one_key_serialize() {
        let limiter = Arc::new(limiter(10, 60_000));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(
                async move { limiter.check("shared").await.unwrap() },
            ));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(limiter.in_window("shared"), 10);
    }
}
