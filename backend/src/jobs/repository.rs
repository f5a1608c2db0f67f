use anyhow::Result;
use async_trait::async_trait;

use crate::jobs::model::{ConversionLogEntry, JobUpdate, LoadedJob};

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Atomically flips up to `batch_size` due jobs to `processing` under
    /// `claim_token` and returns their ids oldest first. Never waits on rows
    /// another claimer holds.
    async fn claim_jobs(&self, batch_size: usize, now_ms: u64, claim_token: &str)
    -> Result<Vec<String>>;

    /// Loads jobs with their shop and deliverable pixel configs.
    ///
    /// Ids whose rows cannot be read are absent from the result.
    async fn fetch_jobs(&self, job_ids: &[String]) -> Result<Vec<LoadedJob>>;

    /// Applies every update in one transaction; all or nothing.
    ///
    /// Only rows still `processing` under `claim_token` are written. Returns
    /// the ids whose claim was lost and were left untouched.
    async fn apply_updates(&self, claim_token: &str, updates: &[JobUpdate]) -> Result<Vec<String>>;

    /// Single-row form of [`apply_updates`](Self::apply_updates); `false`
    /// when the claim was lost.
    async fn apply_update(&self, claim_token: &str, update: &JobUpdate) -> Result<bool>;

    /// Error path for a claimed job that could not be loaded: counts the
    /// attempt and moves it to `failed`, or `dead_letter` once exhausted.
    /// `false` when the claim was lost.
    async fn fail_unloadable(
        &self,
        job_id: &str,
        claim_token: &str,
        error: &str,
        retry_at_ms: u64,
        now_ms: u64,
    ) -> Result<bool>;

    /// Insert-or-update keyed on (shop, order, platform, event type).
    async fn upsert_conversion_log(&self, entry: &ConversionLogEntry) -> Result<()>;

    /// Releases `processing` claims taken before `claimed_before_ms`. The
    /// orphaned run counts as an attempt: the job goes to `failed`, due
    /// immediately, or to `dead_letter` once attempts are exhausted.
    async fn recover_stale_claims(&self, claimed_before_ms: u64, now_ms: u64) -> Result<u64>;
}
