use std::str::FromStr;
use std::time::Duration;

use crate::error::PipelineError;
use crate::jobs::finalizer::{JobFinalizer, RetryPolicy};
use crate::scheduler::backoff::{BatchBackoffConfig, RetryBackoff};
use crate::scheduler::orchestrator::OrchestratorSettings;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// sqlx Any URL; `postgres://` in production, `sqlite://` locally.
    pub database_url: String,

    /// `APP_ENV=production` switches logs to JSON.
    pub production: bool,

    // =========================
    // Batch configuration
    // =========================
    /// Jobs claimed per batch.
    pub batch_size: usize,

    /// Jobs processed concurrently within one batch.
    pub job_concurrency: usize,

    /// Pause between scheduled batches.
    pub poll_interval: Duration,

    /// Upper bound on the claim transaction. Guards against lock starvation.
    pub claim_timeout: Duration,

    /// A `processing` claim older than this is assumed orphaned by a crash.
    pub stale_processing_ms: u64,

    // =========================
    // Retry configuration
    // =========================
    pub retry: RetryBackoff,
    pub retry_policy: RetryPolicy,

    /// Process-local delay applied before claims while batches keep failing.
    pub batch_backoff: BatchBackoffConfig,

    // =========================
    // Audit configuration
    // =========================
    /// Capacity of the conversion log queue. A full queue drops entries.
    pub audit_queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let retry_defaults = RetryBackoff::default();
        let batch_defaults = BatchBackoffConfig::default();

        let cfg = Self {
            database_url: env
                .raw("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://capi_dev.db?mode=rwc".to_string()),
            production: env.raw("APP_ENV").as_deref() == Some("production"),

            batch_size: env.parse("BATCH_SIZE", 50)?,
            job_concurrency: env.parse("JOB_CONCURRENCY", 10)?,
            poll_interval: Duration::from_millis(env.parse("POLL_INTERVAL_MS", 5_000)?),
            claim_timeout: Duration::from_millis(env.parse("CLAIM_TIMEOUT_MS", 10_000)?),
            stale_processing_ms: env.parse("STALE_PROCESSING_MS", 15 * 60 * 1_000)?,

            retry: RetryBackoff {
                base_ms: env.parse("RETRY_BASE_MS", retry_defaults.base_ms)?,
                multiplier: env.parse("RETRY_MULTIPLIER", retry_defaults.multiplier)?,
                max_ms: env.parse("RETRY_MAX_MS", retry_defaults.max_ms)?,
                jitter_factor: env.parse("RETRY_JITTER", retry_defaults.jitter_factor)?,
            },
            retry_policy: env.parse("RETRY_POLICY", RetryPolicy::RetryAll)?,
            batch_backoff: BatchBackoffConfig {
                base_ms: env.parse("BATCH_BACKOFF_BASE_MS", batch_defaults.base_ms)?,
                max_ms: env.parse("BATCH_BACKOFF_MAX_MS", batch_defaults.max_ms)?,
                failure_threshold: env
                    .parse("BATCH_FAILURE_THRESHOLD", batch_defaults.failure_threshold)?,
            },

            audit_queue_capacity: env.parse("AUDIT_QUEUE_CAPACITY", 1_024)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("BATCH_SIZE must be positive".into()));
        }
        if self.job_concurrency == 0 {
            return Err(PipelineError::Config("JOB_CONCURRENCY must be positive".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(PipelineError::Config("RETRY_MULTIPLIER must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(PipelineError::Config("RETRY_JITTER must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.batch_backoff.failure_threshold) {
            return Err(PipelineError::Config(
                "BATCH_FAILURE_THRESHOLD must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn finalizer(&self) -> JobFinalizer {
        JobFinalizer::new(self.retry.clone(), self.retry_policy)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            concurrency: self.job_concurrency,
            stale_processing_ms: self.stale_processing_ms,
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, PipelineError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| PipelineError::Config(format!("{key}={v}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<AppConfig, PipelineError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = from(&[]).unwrap();

        assert_eq!(cfg.database_url, "sqlite://capi_dev.db?mode=rwc");
        assert!(!cfg.production);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.job_concurrency, 10);
        assert_eq!(cfg.claim_timeout, Duration::from_secs(10));
        assert_eq!(cfg.retry, RetryBackoff::default());
        assert_eq!(cfg.retry_policy, RetryPolicy::RetryAll);
        assert_eq!(cfg.batch_backoff, BatchBackoffConfig::default());
        assert_eq!(cfg.audit_queue_capacity, 1_024);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from(&[
            ("DATABASE_URL", "postgres://localhost/capi"),
            ("APP_ENV", "production"),
            ("BATCH_SIZE", "25"),
            ("RETRY_MULTIPLIER", "3"),
            ("RETRY_POLICY", "fail_fast_permanent"),
            ("BATCH_FAILURE_THRESHOLD", "0.75"),
        ])
        .unwrap();

        assert!(cfg.production);
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.retry.multiplier, 3.0);
        assert_eq!(cfg.retry_policy, RetryPolicy::FailFastPermanent);
        assert_eq!(cfg.batch_backoff.failure_threshold, 0.75);
        assert_eq!(cfg.orchestrator_settings().concurrency, 10);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = from(&[("BATCH_SIZE", "many")]).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("BATCH_SIZE")));

        assert!(matches!(
            from(&[("JOB_CONCURRENCY", "0")]),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            from(&[("RETRY_JITTER", "1.5")]),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            from(&[("RETRY_POLICY", "never")]),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = from(&[("BATCH_SIZE", "  ")]).unwrap();
        assert_eq!(cfg.batch_size, 50);
    }
}
