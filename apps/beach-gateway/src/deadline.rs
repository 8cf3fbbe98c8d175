use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_ACTION_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed time budget measured on the tokio clock.
///
/// Besides elapsed/remaining arithmetic it carries an independent periodic
/// trigger (`is_action_due`) used for progress logging while polling, which
/// is unrelated to retry timing.
#[derive(Debug, Clone)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
    action_interval: Duration,
    last_action: Instant,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            budget,
            action_interval: DEFAULT_ACTION_INTERVAL,
            last_action: start,
        }
    }

    pub fn with_action_interval(mut self, interval: Duration) -> Self {
        self.set_action_interval(interval);
        self
    }

    pub fn set_action_interval(&mut self, interval: Duration) {
        self.action_interval = interval;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Never negative; zero once the budget is spent.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// True at most once per action interval. Firing resets the interval.
    pub fn is_action_due(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_action) >= self.action_interval {
            self.last_action = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_clamps_at_zero() {
        let deadline = Deadline::new(Duration::from_secs(3));
        assert_eq!(deadline.remaining(), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(deadline.elapsed(), Duration::from_secs(1));
        assert_eq!(deadline.remaining(), Duration::from_secs(2));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn action_due_fires_once_per_interval() {
        let mut deadline =
            Deadline::new(Duration::from_secs(60)).with_action_interval(Duration::from_secs(5));
        assert!(!deadline.is_action_due());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(deadline.is_action_due());
        assert!(!deadline.is_action_due());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!deadline.is_action_due());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(deadline.is_action_due());
    }

    #[tokio::test(start_paused = true)]
    async fn action_interval_is_independent_of_expiry() {
        let mut deadline =
            Deadline::new(Duration::from_secs(1)).with_action_interval(Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(deadline.is_expired());
        assert!(deadline.is_action_due());
    }
}
