pub mod backoff;
pub mod orchestrator;

pub use backoff::{AdaptiveBatchBackoff, BatchBackoffConfig, RetryBackoff};
pub use orchestrator::{BatchOrchestrator, BatchReport, OrchestratorSettings};
