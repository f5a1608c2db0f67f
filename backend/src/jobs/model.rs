use std::fmt;
use std::str::FromStr;

use platforms::{LineItem, Platform};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::trust::ConsentStrategy;
use crate::error::PipelineError;
use crate::jobs::payload::{CapiInput, ConsentEvidence, TrustMetadata};
use crate::jobs::results::{PlatformOutcome, PlatformResults};

/// Lifecycle of a conversion job.
///
/// ```text
/// queued -> processing -> {completed, failed, dead_letter, limit_exceeded}
/// failed -> processing (re-claim once due)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLetter,
    LimitExceeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::LimitExceeded => "limit_exceeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLetter | JobStatus::LimitExceeded
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Failed, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Processing, LimitExceeded)
        )
    }

    pub fn transition(self, next: JobStatus) -> Result<JobStatus, PipelineError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            "limit_exceeded" => Ok(JobStatus::LimitExceeded),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One purchase event awaiting server-side delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionJob {
    pub id: String,
    pub shop_id: String,
    pub order_id: String,
    pub order_number: Option<String>,

    pub order_value: f64,
    pub currency: String,
    pub capi_input: CapiInput,

    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at_ms: Option<u64>,
    pub last_attempt_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub processed_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,

    pub platform_results: PlatformResults,
    pub error_message: Option<String>,
    pub trust_metadata: Option<TrustMetadata>,
    pub consent_evidence: Option<ConsentEvidence>,
}

impl ConversionJob {
    pub fn checkout_token(&self) -> Option<&str> {
        self.capi_input.checkout_token.as_deref()
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.capi_input.line_items
    }
}

/// Shop fields the pipeline needs for billing and consent.
#[derive(Clone, Debug, PartialEq)]
pub struct Shop {
    pub id: String,
    pub shop_domain: String,
    pub plan: String,
    pub consent_strategy: ConsentStrategy,
}

/// Client-side options stored alongside a pixel config.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelClientConfig {
    #[serde(default)]
    pub treat_as_marketing: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PixelConfig {
    pub id: String,
    pub shop_id: String,
    pub platform: Platform,
    pub is_active: bool,
    pub server_side_enabled: bool,
    /// Opaque ciphertext; only the credential decryptor reads it.
    pub credentials_encrypted: String,
    pub client_config: PixelClientConfig,
}

impl PixelConfig {
    pub fn is_deliverable(&self) -> bool {
        self.is_active && self.server_side_enabled
    }
}

/// A claimed job with the relations the pipeline needs.
///
/// `pixel_configs` only ever contains deliverable configs.
#[derive(Clone, Debug)]
pub struct LoadedJob {
    pub job: ConversionJob,
    pub shop: Shop,
    pub pixel_configs: Vec<PixelConfig>,
}

/// The full row mutation computed for one processed job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub next_retry_at_ms: Option<u64>,
    pub last_attempt_at_ms: u64,
    pub processed_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub platform_results: PlatformResults,
    pub error_message: Option<String>,
    pub trust_metadata: Option<TrustMetadata>,
    pub consent_evidence: Option<ConsentEvidence>,
}

/// Reporting status of a `conversion_logs` row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStatus {
    Pending,
    Sent,
    Skipped,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Sent => "sent",
            LogStatus::Skipped => "skipped",
            LogStatus::Failed => "failed",
        }
    }
}

impl From<&PlatformOutcome> for LogStatus {
    fn from(o: &PlatformOutcome) -> Self {
        match o {
            PlatformOutcome::Sent => LogStatus::Sent,
            PlatformOutcome::Skipped(_) => LogStatus::Skipped,
            PlatformOutcome::Failed(_) => LogStatus::Failed,
            PlatformOutcome::Unknown(_) => LogStatus::Pending,
        }
    }
}

/// Latest attempt outcome for one (shop, order, platform, event type).
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionLogEntry {
    pub shop_id: String,
    pub order_id: String,
    pub order_number: Option<String>,
    pub order_value: f64,
    pub currency: String,
    pub platform: Platform,
    pub event_type: String,
    pub event_id: Option<String>,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub attempted_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::DeadLetter,
            JobStatus::LimitExceeded,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>(), Ok(s));
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_documented_edges_are_allowed() {
        use JobStatus::*;

        assert!(Queued.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));
        assert!(Processing.can_transition_to(LimitExceeded));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!DeadLetter.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));

        assert!(Completed.transition(Failed).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::LimitExceeded.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn log_status_follows_outcome() {
        assert_eq!(LogStatus::from(&PlatformOutcome::Sent), LogStatus::Sent);
        assert_eq!(
            LogStatus::from(&PlatformOutcome::skipped("x")),
            LogStatus::Skipped
        );
        assert_eq!(
            LogStatus::from(&PlatformOutcome::Unknown("queued".into())),
            LogStatus::Pending
        );
    }
}
