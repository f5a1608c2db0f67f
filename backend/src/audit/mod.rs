pub mod writer;

pub use writer::{ConversionLogWriter, log_entries};
