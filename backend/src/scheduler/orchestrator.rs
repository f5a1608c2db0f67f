//! One batch of conversion job processing.
//!
//! Responsibilities:
//! - Recover orphaned claims, honour the adaptive delay, claim due jobs.
//! - Resolve receipts for the whole batch in one lookup.
//! - Process jobs in a fixed concurrency window; a failing or panicking job
//!   becomes a retryable update and never affects its siblings.
//! - Persist every computed update, in one transaction when possible and row
//!   by row otherwise.
//!
//! Non-responsibilities:
//! - Platform payloads and HTTP (platform services).
//! - Consent policy internals (trust evaluator).
//! - Choosing the next status (finalizer).
//!
//! Correctness across replicas rests on the claim: a job id is handed to
//! exactly one orchestrator per claim, and every write is fenced on the
//! batch's claim token so a recovered claim can no longer be written.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt, stream};
use tracing::{Instrument, debug, error, field, info, warn};
use uuid::Uuid;

use crate::audit::{ConversionLogWriter, log_entries};
use crate::collaborators::billing::BillingGate;
use crate::collaborators::trust::{Receipt, ReceiptKey, ReceiptMap, ShopContext};
use crate::dispatch::Dispatcher;
use crate::dispatch::dispatcher::panic_message;
use crate::jobs::finalizer::{Finalized, JobFinalizer};
use crate::jobs::model::{JobStatus, JobUpdate, LoadedJob};
use crate::jobs::repository::JobRepository;
use crate::logger::{TraceId, annotate_job_span, child_span, root_span, warn_if_slow};
use crate::metrics::counters::{Counters, add, bump};
use crate::scheduler::backoff::AdaptiveBatchBackoff;
use crate::time::now_ms;

const SLOW_QUERY: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Jobs processed at once within a batch.
    pub concurrency: usize,
    /// A `processing` claim older than this is treated as orphaned.
    pub stale_processing_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            stale_processing_ms: 15 * 60 * 1_000,
        }
    }
}

/// Tally of one `process_conversion_jobs` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub recovered: u64,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub limit_exceeded: usize,
    /// Jobs whose processing panicked; their update is also tallied by status.
    pub errored: usize,
    /// Claimed jobs that could not be loaded and were failed in place.
    pub unloadable: usize,
    /// Updates dropped because the claim was recovered by another worker.
    pub claims_lost: usize,
}

impl BatchReport {
    fn tally(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::DeadLetter => self.dead_lettered += 1,
            JobStatus::LimitExceeded => self.limit_exceeded += 1,
            JobStatus::Queued | JobStatus::Processing => {}
        }
    }

    fn unhealthy(&self) -> usize {
        self.failed + self.dead_lettered + self.unloadable
    }
}

struct JobResult {
    /// Status the job had when loaded.
    from: JobStatus,
    finalized: Finalized,
    errored: bool,
}

pub struct BatchOrchestrator {
    repo: Arc<dyn JobRepository>,
    dispatcher: Arc<Dispatcher>,
    billing: Arc<dyn BillingGate>,
    audit: ConversionLogWriter,
    finalizer: JobFinalizer,
    batch_backoff: Arc<AdaptiveBatchBackoff>,
    settings: OrchestratorSettings,
    counters: Counters,
}

impl BatchOrchestrator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        dispatcher: Arc<Dispatcher>,
        billing: Arc<dyn BillingGate>,
        audit: ConversionLogWriter,
        counters: Counters,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            billing,
            audit,
            finalizer: JobFinalizer::default(),
            batch_backoff: Arc::new(AdaptiveBatchBackoff::default()),
            settings: OrchestratorSettings::default(),
            counters,
        }
    }

    pub fn with_finalizer(mut self, finalizer: JobFinalizer) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub fn with_batch_backoff(mut self, backoff: Arc<AdaptiveBatchBackoff>) -> Self {
        self.batch_backoff = backoff;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = OrchestratorSettings {
            concurrency: settings.concurrency.max(1),
            ..settings
        };
        self
    }

    pub fn audit(&self) -> &ConversionLogWriter {
        &self.audit
    }

    pub fn batch_backoff(&self) -> &Arc<AdaptiveBatchBackoff> {
        &self.batch_backoff
    }

    /// Moves orphaned `processing` claims back to `failed`, due now.
    pub async fn recover_stale_claims(&self) -> anyhow::Result<u64> {
        let now = now_ms();
        let cutoff = now.saturating_sub(self.settings.stale_processing_ms);
        let recovered = warn_if_slow(
            "recover_stale_claims",
            SLOW_QUERY,
            self.repo.recover_stale_claims(cutoff, now),
        )
        .await?;

        if recovered > 0 {
            add(&self.counters.stale_recovered, recovered);
            warn!(recovered, "recovered stale processing claims");
        }
        Ok(recovered)
    }

    /// Claims and fully processes up to `batch_size` due jobs.
    pub async fn process_conversion_jobs(&self, batch_size: usize) -> anyhow::Result<BatchReport> {
        let trace_id = TraceId::default();
        let span = root_span("process_conversion_jobs", &trace_id);
        self.run_batch(batch_size).instrument(span).await
    }

    async fn run_batch(&self, batch_size: usize) -> anyhow::Result<BatchReport> {
        let mut report = BatchReport::default();

        match self.recover_stale_claims().await {
            Ok(n) => report.recovered = n,
            Err(e) => warn!(error = %e, "stale claim recovery failed; continuing"),
        }

        let delay = self.batch_backoff.current_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "applying adaptive batch delay");
            tokio::time::sleep(delay).await;
        }

        let claim_token = Uuid::new_v4().to_string();
        let ids = warn_if_slow(
            "claim_jobs",
            SLOW_QUERY,
            self.repo.claim_jobs(batch_size, now_ms(), &claim_token),
        )
        .await?;

        bump(&self.counters.batches);
        if ids.is_empty() {
            bump(&self.counters.batches_empty);
            debug!("no due conversion jobs");
            return Ok(report);
        }

        report.claimed = ids.len();
        add(&self.counters.jobs_claimed, ids.len() as u64);
        tracing::Span::current().record("job_count", field::display(ids.len()));

        let loaded = match warn_if_slow("fetch_jobs", SLOW_QUERY, self.repo.fetch_jobs(&ids)).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "loading claimed jobs failed");
                for id in &ids {
                    self.fail_unloadable(id, &claim_token, &format!("load failed: {e}"), &mut report)
                        .await;
                }
                self.batch_backoff.record_batch(0, ids.len());
                return Err(e);
            }
        };

        let loaded_ids: HashSet<&str> = loaded.iter().map(|l| l.job.id.as_str()).collect();
        for id in ids.iter().filter(|id| !loaded_ids.contains(id.as_str())) {
            self.fail_unloadable(id, &claim_token, "job row could not be loaded", &mut report)
                .await;
        }

        let receipts = self.fetch_receipts(&loaded).await;

        let receipts = &receipts;
        let results: Vec<JobResult> = stream::iter(loaded.iter())
            .map(move |lj| {
                let receipt = receipts.get(&(lj.job.shop_id.clone(), lj.job.order_id.clone()));
                self.process_guarded(lj, receipt)
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        let mut updates = Vec::with_capacity(results.len());
        for r in results {
            if r.errored {
                report.errored += 1;
                bump(&self.counters.jobs_errored);
            }
            if let Err(e) = r.from.transition(r.finalized.update.status) {
                error!(job_id = %r.finalized.update.job_id, error = %e, "dropping update");
                continue;
            }
            updates.push(r.finalized.update);
        }

        let lost = self.persist(&claim_token, &updates).await;
        report.claims_lost += lost.len();
        for u in updates.iter().filter(|u| !lost.contains(&u.job_id)) {
            report.tally(u.status);
        }
        self.count(&report);

        let unhealthy = report.unhealthy();
        self.batch_backoff
            .record_batch(report.claimed.saturating_sub(unhealthy), unhealthy);

        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            limit_exceeded = report.limit_exceeded,
            errored = report.errored,
            unloadable = report.unloadable,
            claims_lost = report.claims_lost,
            "conversion batch processed"
        );

        Ok(report)
    }

    async fn fetch_receipts(&self, loaded: &[LoadedJob]) -> ReceiptMap {
        let keys: Vec<ReceiptKey> = loaded
            .iter()
            .map(|l| ReceiptKey {
                shop_id: l.job.shop_id.clone(),
                order_id: l.job.order_id.clone(),
                checkout_token: l.job.checkout_token().map(str::to_string),
                created_at_ms: l.job.created_at_ms,
            })
            .collect();

        match self.dispatcher.trust().batch_fetch_receipts(&keys).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "receipt lookup failed; evaluating without receipts");
                ReceiptMap::new()
            }
        }
    }

    async fn process_guarded(&self, loaded: &LoadedJob, receipt: Option<&Receipt>) -> JobResult {
        let span = child_span("process_job");
        annotate_job_span(&span, &loaded.job);

        let fut = AssertUnwindSafe(self.process_job(loaded, receipt)).catch_unwind();
        match fut.instrument(span.clone()).await {
            Ok(finalized) => JobResult {
                from: loaded.job.status,
                finalized,
                errored: false,
            },
            Err(panic) => {
                let msg = panic_message(&*panic);
                span.in_scope(|| error!(error = %msg, "job processing panicked"));
                JobResult {
                    from: loaded.job.status,
                    finalized: self.finalizer.job_error(&loaded.job, &msg, now_ms()),
                    errored: true,
                }
            }
        }
    }

    async fn process_job(&self, loaded: &LoadedJob, receipt: Option<&Receipt>) -> Finalized {
        let job = &loaded.job;
        let shop = &loaded.shop;
        let trust = self.dispatcher.trust();
        let now = now_ms();

        let evaluation = trust.evaluate_trust(
            receipt,
            job.checkout_token(),
            &ShopContext {
                shop_id: shop.id.clone(),
                shop_domain: shop.shop_domain.clone(),
                consent_strategy: shop.consent_strategy,
            },
        );
        let evidence = trust.build_consent_evidence(receipt, &evaluation, shop.consent_strategy, now);
        let metadata = evaluation.trust_metadata.clone();

        if loaded.pixel_configs.is_empty() {
            debug!("no deliverable pixel configs");
            return self.finalizer.no_platforms(job, now).with_evidence(metadata, evidence);
        }

        let reservation = match self
            .billing
            .check_and_reserve_billing_slot(&shop.id, &shop.plan, &job.order_id)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "billing reservation failed");
                return self
                    .finalizer
                    .billing_error(job, &e.to_string(), now)
                    .with_evidence(metadata, evidence);
            }
        };

        if !reservation.success {
            info!(
                current = reservation.current,
                limit = reservation.limit,
                "billing limit exceeded"
            );
            return self
                .finalizer
                .limit_exceeded(job, &reservation, now)
                .with_evidence(metadata, evidence);
        }

        let outcome = self.dispatcher.dispatch(loaded, &evaluation, receipt).await;
        let finalized = self
            .finalizer
            .after_dispatch(job, &reservation, &outcome, now_ms())
            .with_evidence(metadata, evidence);

        if finalized.release_billing {
            match self.billing.release_billing_slot(&shop.id).await {
                Ok(()) => bump(&self.counters.billing_releases),
                Err(e) => {
                    bump(&self.counters.billing_release_errors);
                    warn!(error = %e, "billing slot release failed; quota may overcount this period");
                }
            }
        }

        self.audit.record_all(log_entries(loaded, &outcome, now_ms()));

        debug!(status = %finalized.update.status, "job finalized");
        finalized
    }

    async fn fail_unloadable(
        &self,
        job_id: &str,
        claim_token: &str,
        error: &str,
        report: &mut BatchReport,
    ) {
        let now = now_ms();
        let retry_at = now.saturating_add(self.finalizer.retry_delay_ms(1));
        report.unloadable += 1;
        bump(&self.counters.jobs_errored);

        match self
            .repo
            .fail_unloadable(job_id, claim_token, error, retry_at, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                report.claims_lost += 1;
                warn!(job_id, "claim lost before the failure could be recorded");
            }
            Err(e) => error!(job_id, error = %e, "could not record failure for unloadable job"),
        }
    }

    /// Bulk write with per-row fallback. Every failure is logged; none is fatal.
    /// Returns the ids whose update was dropped because their claim was lost.
    async fn persist(&self, claim_token: &str, updates: &[JobUpdate]) -> HashSet<String> {
        if updates.is_empty() {
            return HashSet::new();
        }

        let bulk = warn_if_slow(
            "apply_updates",
            SLOW_QUERY,
            self.repo.apply_updates(claim_token, updates),
        )
        .await;
        let e = match bulk {
            Ok(lost) => {
                for job_id in &lost {
                    warn!(job_id = %job_id, "claim lost; update not written");
                }
                return lost.into_iter().collect();
            }
            Err(e) => e,
        };

        bump(&self.counters.bulk_write_fallbacks);
        warn!(error = %e, count = updates.len(), "bulk job update failed; falling back to per-row writes");

        let mut lost = HashSet::new();
        for u in updates {
            match self.repo.apply_update(claim_token, u).await {
                Ok(true) => {}
                Ok(false) => {
                    lost.insert(u.job_id.clone());
                    warn!(job_id = %u.job_id, "claim lost; update not written");
                }
                Err(e) => error!(
                    job_id = %u.job_id,
                    status = %u.status,
                    error = %e,
                    "job update lost"
                ),
            }
        }
        lost
    }

    fn count(&self, report: &BatchReport) {
        add(&self.counters.claims_lost, report.claims_lost as u64);
        add(&self.counters.jobs_completed, report.completed as u64);
        add(&self.counters.jobs_failed, report.failed as u64);
        add(&self.counters.jobs_dead_lettered, report.dead_lettered as u64);
        add(&self.counters.jobs_limit_exceeded, report.limit_exceeded as u64);
    }
}
