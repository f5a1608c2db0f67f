//! Next-status decision for a processed job.
//!
//! Pure: takes the job as claimed plus what happened during this pass and
//! returns the row mutation and whether the billing slot must be given back.
//! The orchestrator performs both side effects.

use std::str::FromStr;

use tracing::debug;

use crate::collaborators::billing::BillingReservation;
use crate::dispatch::types::DispatchOutcome;
use crate::jobs::model::{ConversionJob, JobStatus, JobUpdate};
use crate::jobs::payload::{ConsentEvidence, TrustMetadata};
use crate::jobs::results::{PlatformResults, truncate_reason};
use crate::scheduler::backoff::RetryBackoff;

const ERROR_MESSAGE_MAX: usize = 500;

/// How platform failures flagged as non-retryable are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Every failure is retried until `max_attempts`, whatever the platform said.
    #[default]
    RetryAll,
    /// If every failed platform reported a permanent error, stop retrying now.
    FailFastPermanent,
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry_all" => Ok(RetryPolicy::RetryAll),
            "fail_fast_permanent" => Ok(RetryPolicy::FailFastPermanent),
            other => Err(format!("unknown retry policy: {other}")),
        }
    }
}

/// What to persist and which side effect to run.
#[derive(Clone, Debug, PartialEq)]
pub struct Finalized {
    pub update: JobUpdate,
    pub release_billing: bool,
}

impl Finalized {
    pub fn with_evidence(
        mut self,
        trust_metadata: TrustMetadata,
        consent_evidence: ConsentEvidence,
    ) -> Self {
        self.update.trust_metadata = Some(trust_metadata);
        self.update.consent_evidence = Some(consent_evidence);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobFinalizer {
    backoff: RetryBackoff,
    policy: RetryPolicy,
}

impl JobFinalizer {
    pub fn new(backoff: RetryBackoff, policy: RetryPolicy) -> Self {
        Self { backoff, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn retry_delay_ms(&self, attempt: u32) -> u64 {
        self.backoff.delay_ms(attempt)
    }

    /// No deliverable pixel config: nothing to do, billing never consulted.
    pub fn no_platforms(&self, job: &ConversionJob, now_ms: u64) -> Finalized {
        let attempts = next_attempts(job);
        Finalized {
            update: base_update(job, JobStatus::Completed, attempts, now_ms),
            release_billing: false,
        }
    }

    /// The quota service itself failed; treated as transient.
    pub fn billing_error(&self, job: &ConversionJob, error: &str, now_ms: u64) -> Finalized {
        self.retry_or_dead_letter(job, format!("billing check failed: {error}"), now_ms)
    }

    /// The shop is out of quota for this period. Terminal.
    pub fn limit_exceeded(
        &self,
        job: &ConversionJob,
        reservation: &BillingReservation,
        now_ms: u64,
    ) -> Finalized {
        let attempts = next_attempts(job);
        let mut update = base_update(job, JobStatus::LimitExceeded, attempts, now_ms);
        update.error_message = Some(format!(
            "billing limit exceeded: {}/{}",
            reservation.current, reservation.limit
        ));
        Finalized {
            update,
            release_billing: false,
        }
    }

    /// Unexpected failure while processing this job (including a panic).
    ///
    /// Exhausted jobs go to `dead_letter` so nothing stays `failed` forever
    /// without being claimable.
    pub fn job_error(&self, job: &ConversionJob, error: &str, now_ms: u64) -> Finalized {
        self.retry_or_dead_letter(job, format!("processing error: {error}"), now_ms)
    }

    /// Decision after a dispatch pass, given the billing reservation that allowed it.
    pub fn after_dispatch(
        &self,
        job: &ConversionJob,
        reservation: &BillingReservation,
        outcome: &DispatchOutcome,
        now_ms: u64,
    ) -> Finalized {
        let attempts = next_attempts(job);
        let exhausted = attempts >= job.max_attempts;
        let release = !reservation.already_counted;

        let mut results = job.platform_results.clone();
        results.merge(&outcome.results());

        let any_sent = outcome.any_sent();
        let any_failed = outcome.any_failed();

        let (status, error, release_billing) = if outcome.is_empty() {
            (JobStatus::Completed, None, false)
        } else if outcome.all_skipped() {
            (JobStatus::Completed, None, release)
        } else if any_sent && !any_failed {
            (JobStatus::Completed, None, false)
        } else if self.policy == RetryPolicy::FailFastPermanent
            && outcome.all_failures_permanent()
        {
            debug!(job_id = %job.id, "all failures permanent; not retrying");
            if any_sent {
                (
                    JobStatus::Completed,
                    Some(format!("permanent failure on: {}", unsent(&results))),
                    false,
                )
            } else {
                (
                    JobStatus::DeadLetter,
                    Some(format!("permanent failure on all platforms: {}", unsent(&results))),
                    release,
                )
            }
        } else if any_sent {
            if exhausted {
                (
                    JobStatus::Completed,
                    Some(format!(
                        "max attempts reached; not delivered to: {}",
                        unsent(&results)
                    )),
                    false,
                )
            } else {
                (
                    JobStatus::Failed,
                    Some(format!("delivery failed on: {}", unsent(&results))),
                    false,
                )
            }
        } else if exhausted {
            (
                JobStatus::DeadLetter,
                Some(format!(
                    "delivery failed on all platforms after {attempts} attempts: {}",
                    unsent(&results)
                )),
                release,
            )
        } else {
            (
                JobStatus::Failed,
                Some(format!("delivery failed on all platforms: {}", unsent(&results))),
                release,
            )
        };

        let mut update = base_update(job, status, attempts, now_ms);
        update.platform_results = results;
        update.error_message = error.map(|e| truncate_reason(&e, ERROR_MESSAGE_MAX));
        if status == JobStatus::Failed {
            update.next_retry_at_ms = Some(now_ms.saturating_add(self.backoff.delay_ms(attempts)));
        }

        Finalized {
            update,
            release_billing,
        }
    }

    fn retry_or_dead_letter(&self, job: &ConversionJob, error: String, now_ms: u64) -> Finalized {
        let attempts = next_attempts(job);
        let status = if attempts >= job.max_attempts {
            JobStatus::DeadLetter
        } else {
            JobStatus::Failed
        };

        let mut update = base_update(job, status, attempts, now_ms);
        update.error_message = Some(truncate_reason(&error, ERROR_MESSAGE_MAX));
        if status == JobStatus::Failed {
            update.next_retry_at_ms = Some(now_ms.saturating_add(self.backoff.delay_ms(attempts)));
        }

        Finalized {
            update,
            release_billing: false,
        }
    }
}

fn next_attempts(job: &ConversionJob) -> u32 {
    job.attempts.saturating_add(1)
}

fn base_update(job: &ConversionJob, status: JobStatus, attempts: u32, now_ms: u64) -> JobUpdate {
    JobUpdate {
        job_id: job.id.clone(),
        status,
        attempts,
        next_retry_at_ms: None,
        last_attempt_at_ms: now_ms,
        processed_at_ms: now_ms,
        completed_at_ms: (status == JobStatus::Completed).then_some(now_ms),
        platform_results: job.platform_results.clone(),
        error_message: None,
        trust_metadata: job.trust_metadata.clone(),
        consent_evidence: job.consent_evidence.clone(),
    }
}

fn unsent(results: &PlatformResults) -> String {
    results.failed_platforms().join(", ")
}
