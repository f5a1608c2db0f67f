pub mod dispatcher;
pub mod eligibility;
pub mod types;

pub use dispatcher::Dispatcher;
pub use types::{DispatchOutcome, PlatformAttempt};
