//! Workflow run records and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{ExecutionId, RuleId, RunId};
use stockflow_events::TriggerEvent;

/// Workflow run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by an executor until the lease expires
    Running { lease_expires_at: DateTime<Utc> },
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Out of attempts or permanently failed
    DeadLettered { error: String, attempts: u32 },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::DeadLettered { .. } | RunStatus::Cancelled
        )
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, RunStatus::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running { .. } => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed { .. } => "failed",
            RunStatus::DeadLettered { .. } => "dead_lettered",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so retries of many runs do not line up.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One attempt of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A durable execution of one rule for one trigger event.
///
/// `execution_id` is fixed at creation and shared by every attempt, so
/// idempotency keys derived from it are stable across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub execution_id: ExecutionId,
    pub rule_id: RuleId,
    pub event: TriggerEvent,
    pub status: RunStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<RunAttemptRecord>,
}

impl WorkflowRun {
    pub fn new(rule_id: RuleId, event: TriggerEvent) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            execution_id: ExecutionId::new(),
            rule_id,
            event,
            status: RunStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| now >= at)
    }

    /// Waiting and due, or running under a lease that has run out.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match &self.status {
            RunStatus::Pending | RunStatus::Failed { .. } => self.is_ready(now),
            RunStatus::Running { lease_expires_at } => *lease_expires_at <= now,
            _ => false,
        }
    }

    pub fn mark_running(&mut self, lease: Duration) {
        let now = Utc::now();
        self.status = RunStatus::Running {
            lease_expires_at: now + chrono::Duration::from_std(lease).unwrap_or_default(),
        };
        self.attempt += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = RunStatus::Completed;
        self.updated_at = now;
        self.record_attempt(started_at, now, None);
    }

    /// Schedule a retry with backoff, or dead-letter once attempts run out.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = RunStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = RunStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Dead-letter without spending the remaining attempts.
    pub fn mark_permanently_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(error.clone()));
        self.status = RunStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(RunAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// What the run handler reports back to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    /// Retried under the run's policy
    Failure(String),
    /// Dead-lettered immediately
    Permanent(String),
    RetryAfter(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub run: WorkflowRun,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(run: WorkflowRun, reason: String) -> Self {
        Self {
            run,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use stockflow_core::{EntityId, UserId};

    fn run() -> WorkflowRun {
        WorkflowRun::new(
            RuleId::new(),
            TriggerEvent::created("sales_orders", EntityId::new(), Map::new(), UserId::new()),
        )
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn failures_retry_until_attempts_run_out() {
        let mut run = run().with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10)));

        run.mark_running(Duration::from_secs(30));
        run.mark_failed("db down".into(), Utc::now());
        assert!(run.status.is_retriable());
        assert!(run.scheduled_at.is_some());

        run.mark_running(Duration::from_secs(30));
        run.mark_failed("db down".into(), Utc::now());
        assert_eq!(
            run.status,
            RunStatus::DeadLettered {
                error: "db down".into(),
                attempts: 2
            }
        );
        assert_eq!(run.history.len(), 2);
        assert!(run.history.iter().all(|a| !a.success));
    }

    #[test]
    fn permanent_failure_skips_remaining_attempts() {
        let mut run = run();
        run.mark_running(Duration::from_secs(30));
        run.mark_permanently_failed("bad config".into(), Utc::now());
        assert!(matches!(run.status, RunStatus::DeadLettered { attempts: 1, .. }));
    }

    #[test]
    fn expired_lease_is_claimable_again() {
        let mut run = run();
        let now = Utc::now();
        assert!(run.is_claimable(now));

        run.mark_running(Duration::from_secs(30));
        assert!(!run.is_claimable(Utc::now()));
        assert!(run.is_claimable(Utc::now() + chrono::Duration::seconds(31)));

        run.mark_completed(now);
        assert!(!run.is_claimable(Utc::now() + chrono::Duration::days(1)));
    }
}
