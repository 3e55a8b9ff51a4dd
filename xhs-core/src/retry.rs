use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::browser::{BrowserError, ErrorClass};

/// Bounded retry for transient faults.
///
/// Access faults (login wall, risk restriction) and session faults are never
/// retried: repeating them only deepens the restriction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, schedule: Vec<Duration>, jitter_ms: u64) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::from_secs(2)]
        } else {
            schedule
        };
        Self {
            max_attempts: max_attempts.max(1),
            schedule,
            jitter_ms,
        }
    }

    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self::new(max_attempts, vec![delay], 0)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before the next attempt after `attempts` failed ones, or `None` to give up.
    pub fn next_delay(&self, attempts: usize, error: &BrowserError) -> Option<Duration> {
        if error.class() != ErrorClass::Transient || attempts >= self.max_attempts {
            return None;
        }
        let base = self
            .schedule
            .get(attempts.saturating_sub(1))
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default();
        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };
        Some(base + jitter)
    }

    /// Logs and sleeps when another attempt is allowed.
    pub async fn backoff(&self, attempts: usize, error: &BrowserError, operation: &str) -> bool {
        match self.next_delay(attempts, error) {
            Some(delay) => {
                warn!(
                    operation,
                    attempt = attempts,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                true
            }
            None => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let policy = RetryPolicy::default();
        let err = BrowserError::Timeout("search response".into());
        assert_eq!(policy.next_delay(1, &err), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(2, &err), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3, &err), None);
    }

    #[test]
    fn access_and_session_faults_are_not_retried() {
        let policy = RetryPolicy::default();
        let login = BrowserError::LoginRequired("wall".into());
        let risk = BrowserError::RiskRestricted {
            code: "300013".into(),
            message: "访问频次异常".into(),
        };
        assert_eq!(policy.next_delay(1, &login), None);
        assert_eq!(policy.next_delay(1, &risk), None);
        assert_eq!(policy.next_delay(1, &BrowserError::SessionClosed), None);
    }

    #[test]
    fn schedule_extends_with_last_entry() {
        let policy = RetryPolicy::new(
            5,
            vec![Duration::from_millis(100), Duration::from_millis(400)],
            0,
        );
        let err = BrowserError::Network("dropped".into());
        assert_eq!(policy.next_delay(1, &err), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(4, &err), Some(Duration::from_millis(400)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_reports_whether_to_continue() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(2));
        let err = BrowserError::Malformed("bad".into());
        assert!(policy.backoff(1, &err, "search").await);
        assert!(!policy.backoff(2, &err, "search").await);
    }
}
