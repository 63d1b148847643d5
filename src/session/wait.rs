//! Bounded polling.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// How often to check and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between checks (default: 1s)
    pub interval: Duration,
    /// Total budget, measured from the first check (default: 10s)
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Result of [`poll_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            PollOutcome::Ready { attempts } | PollOutcome::TimedOut { attempts } => attempts,
        }
    }
}

/// Run `check` every `config.interval` until it returns `true` or
/// `config.timeout` has elapsed.
///
/// The check always runs at least once. A check still running at the
/// deadline is cancelled.
pub async fn poll_until<F, Fut>(config: PollConfig, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, check()).await {
            Ok(true) => return PollOutcome::Ready { attempts },
            Ok(false) => {}
            Err(_) => return PollOutcome::TimedOut { attempts },
        }

        let next = Instant::now() + config.interval;
        if next >= deadline {
            tokio::time::sleep_until(deadline).await;
            return PollOutcome::TimedOut { attempts };
        }
        tokio::time::sleep_until(next).await;
    }
}
