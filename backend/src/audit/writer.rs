//! Detached, best-effort writer for `conversion_logs`.
//!
//! Callers hand entries over without awaiting the database. A single worker
//! task drains the queue in order; its failures are logged and counted and
//! never reach the job that produced the entry. Dropped entries are not
//! retried: the upsert is keyed, and a late retry could overwrite a newer
//! attempt's row.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, warn};

use crate::dispatch::types::DispatchOutcome;
use crate::jobs::model::{ConversionLogEntry, LoadedJob, LogStatus};
use crate::jobs::repository::JobRepository;
use crate::metrics::counters::{Counters, bump};

enum AuditCommand {
    Upsert(Box<ConversionLogEntry>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ConversionLogWriter {
    tx: mpsc::Sender<AuditCommand>,
    counters: Counters,
}

impl ConversionLogWriter {
    /// Starts the worker task on the current runtime, inside the caller's span.
    pub fn spawn(repo: Arc<dyn JobRepository>, capacity: usize, counters: Counters) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(repo, rx, counters.clone()).in_current_span());
        Self { tx, counters }
    }

    /// Queues one upsert. Never blocks; a full or closed queue drops the entry.
    pub fn record(&self, entry: ConversionLogEntry) {
        if let Err(e) = self.tx.try_send(AuditCommand::Upsert(Box::new(entry))) {
            bump(&self.counters.audit_dropped);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(reason, "conversion log entry dropped");
        }
    }

    pub fn record_all(&self, entries: impl IntoIterator<Item = ConversionLogEntry>) {
        for entry in entries {
            self.record(entry);
        }
    }

    /// Resolves once every entry queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run(
    repo: Arc<dyn JobRepository>,
    mut rx: mpsc::Receiver<AuditCommand>,
    counters: Counters,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            AuditCommand::Upsert(entry) => {
                if let Err(e) = repo.upsert_conversion_log(&entry).await {
                    bump(&counters.audit_write_errors);
                    warn!(
                        error = %e,
                        shop_id = %entry.shop_id,
                        order_id = %entry.order_id,
                        platform = %entry.platform,
                        "conversion log write failed"
                    );
                }
            }
            AuditCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("conversion log writer stopped");
}

/// One entry per platform handled in this pass.
///
/// Short-circuited prior sends made no call and are not logged again.
pub fn log_entries(
    loaded: &LoadedJob,
    outcome: &DispatchOutcome,
    now_ms: u64,
) -> Vec<ConversionLogEntry> {
    let job = &loaded.job;
    outcome
        .attempts
        .iter()
        .filter(|a| a.network_call || !a.outcome.is_sent())
        .map(|a| {
            let status = LogStatus::from(&a.outcome);
            let error_message = a
                .outcome
                .reason()
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            ConversionLogEntry {
                shop_id: job.shop_id.clone(),
                order_id: job.order_id.clone(),
                order_number: job.order_number.clone(),
                order_value: job.order_value,
                currency: job.currency.clone(),
                platform: a.platform,
                event_type: job.capi_input.event_type().to_string(),
                event_id: a.event_id.clone(),
                status,
                error_message,
                attempted_at_ms: now_ms,
            }
        })
        .collect()
}
