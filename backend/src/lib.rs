pub mod audit;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod jobs;
pub mod metrics;
pub mod scheduler;

pub mod error;
pub mod logger;
pub mod time;
