pub mod finalizer;
pub mod model;
pub mod payload;
pub mod repository;
pub mod repository_sqlx;
pub mod results;

pub use finalizer::{Finalized, JobFinalizer, RetryPolicy};
pub use model::{ConversionJob, ConversionLogEntry, JobStatus, JobUpdate, LoadedJob};
pub use repository::JobRepository;
pub use repository_sqlx::SqlxJobRepository;
