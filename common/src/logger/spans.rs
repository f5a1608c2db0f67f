use tracing::{Span, field};

use super::TraceId;

/// Create a root span for a batch run.
///
/// `job_count` is recorded once the claim has happened.
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id.as_str(),
        job_count = field::Empty
    )
}

/// Create a child span (inherits trace_id from the current root).
pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!(
        "child",
        name = %name,
        job_id = field::Empty,
        shop_id = field::Empty,
        order_id = field::Empty
    )
}
