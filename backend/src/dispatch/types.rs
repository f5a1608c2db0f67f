use platforms::Platform;

use crate::jobs::results::{PlatformOutcome, PlatformResults};

/// Result of handling one configured platform for one job.
#[derive(Clone, Debug, PartialEq)]
pub struct PlatformAttempt {
    pub platform: Platform,
    pub outcome: PlatformOutcome,
    pub event_id: Option<String>,
    /// Platform's own retryability verdict for a failure; `None` when it gave none.
    pub retryable: Option<bool>,
    /// False for skips and for short-circuited prior sends.
    pub network_call: bool,
}

impl PlatformAttempt {
    pub fn already_sent(platform: Platform) -> Self {
        Self {
            platform,
            outcome: PlatformOutcome::Sent,
            event_id: None,
            retryable: None,
            network_call: false,
        }
    }

    pub fn skipped(platform: Platform, reason: String) -> Self {
        Self {
            platform,
            outcome: PlatformOutcome::skipped(reason),
            event_id: None,
            retryable: None,
            network_call: false,
        }
    }
}

/// Aggregate of every configured platform for one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchOutcome {
    pub attempts: Vec<PlatformAttempt>,
}

impl DispatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn any_sent(&self) -> bool {
        self.attempts.iter().any(|a| a.outcome.is_sent())
    }

    pub fn any_failed(&self) -> bool {
        self.attempts.iter().any(|a| a.outcome.is_failed())
    }

    /// True only when there was at least one platform and every one was skipped.
    pub fn all_skipped(&self) -> bool {
        !self.attempts.is_empty() && self.attempts.iter().all(|a| a.outcome.is_skipped())
    }

    /// True when every failure was explicitly reported as non-retryable.
    pub fn all_failures_permanent(&self) -> bool {
        let mut failures = self.attempts.iter().filter(|a| a.outcome.is_failed()).peekable();
        failures.peek().is_some() && failures.all(|a| a.retryable == Some(false))
    }

    pub fn results(&self) -> PlatformResults {
        let mut out = PlatformResults::new();
        for a in &self.attempts {
            out.record(a.platform, a.outcome.clone());
        }
        out
    }
}
