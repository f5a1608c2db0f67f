use std::time::Duration;

use tracing::{Span, field};

pub use common::logger::{TraceId, child_span, init_logger, root_span};

use crate::jobs::model::ConversionJob;

/// Fills the per-job fields of a span created by [`child_span`].
pub fn annotate_job_span(span: &Span, job: &ConversionJob) {
    span.record("job_id", field::display(&job.id));
    span.record("shop_id", field::display(&job.shop_id));
    span.record("order_id", field::display(&job.order_id));
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
