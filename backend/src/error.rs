use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("claim transaction exceeded {0} ms")]
    ClaimTimeout(u64),

    #[error("repository failure: {0}")]
    Repository(#[from] sqlx::Error),

    #[error("malformed row {id}: {reason}")]
    MalformedRow { id: String, reason: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),
}
