use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_MAX_COMMANDS: usize = 15;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error(
    "Rate limit exceeded: {limit} commands per {window_seconds}s; retry in {retry_after_seconds}s"
)]
pub struct RateLimitError {
    pub limit: usize,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
}

/// Sliding-window rate limiter keyed by session id.
///
/// Constructed once at startup and shared by reference; the window map is
/// behind a mutex so overlapping calls from any mix of sessions are safe.
/// Dry-run validations never reach `admit`, so they do not consume budget.
pub struct RateLimiter {
    max_commands: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_commands: usize, window: Duration) -> Self {
        Self {
            max_commands,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one call for `session`, or reject with a retry-after estimate
    /// derived from the oldest timestamp still inside the window.
    pub fn admit(&self, session: &str) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps = windows.entry(session.to_string()).or_default();

        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_commands {
            let oldest = timestamps.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(RateLimitError {
                limit: self.max_commands,
                window_seconds: self.window.as_secs(),
                retry_after_seconds: retry_after.as_secs().max(1),
            });
        }

        timestamps.push_back(now);
        Ok(())
    }

    /// Admitted calls currently inside the window for `session`.
    pub fn in_window(&self, session: &str) -> usize {
        let now = Instant::now();
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .get(session)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn max_commands(&self) -> usize {
        self.max_commands
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMANDS, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_admits_under_cap() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.admit("session-a").is_ok());
        }
        assert_eq!(limiter.in_window("session-a"), 3);
    }

    #[test]
    fn test_rejects_at_cap_with_retry_hint() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.admit("session-a").unwrap();
        limiter.admit("session-a").unwrap();

        let err = limiter.admit("session-a").unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(err.window_seconds, 60);
        assert!(err.retry_after_seconds >= 1 && err.retry_after_seconds <= 60);
    }

    #[test]
    fn test_rejection_does_not_consume_budget() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.admit("session-a").unwrap();
        assert!(limiter.admit("session-a").is_err());
        assert_eq!(limiter.in_window("session-a"), 1);
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        limiter.admit("session-a").unwrap();
        assert!(limiter.admit("session-a").is_err());

        thread::sleep(Duration::from_millis(150));
        assert!(limiter.admit("session-a").is_ok());
    }

    #[test]
    fn test_sessions_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.admit("session-a").unwrap();
        assert!(limiter.admit("session-a").is_err());
        assert!(limiter.admit("session-b").is_ok());
    }

    #[test]
    fn test_concurrent_admissions_respect_cap() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                let mut admitted = 0;
                for _ in 0..5 {
                    if limiter.admit("shared").is_ok() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_defaults() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.max_commands(), DEFAULT_MAX_COMMANDS);
        assert_eq!(limiter.window(), DEFAULT_WINDOW);
    }
}
