use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use platforms::Platform;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::trust::ConsentStrategy;
use crate::db::{Db, Dialect, placeholders};
use crate::error::PipelineError;
use crate::jobs::model::{
    ConversionJob, ConversionLogEntry, JobStatus, JobUpdate, LoadedJob, PixelClientConfig,
    PixelConfig, Shop,
};
use crate::jobs::payload::decode_column;
use crate::jobs::repository::JobRepository;

/// SQLx-backed implementation of JobRepository.
/// Responsible only for persistence and row mapping.
pub struct SqlxJobRepository {
    pool: AnyPool,
    dialect: Dialect,
    claim_timeout: Duration,
}

impl SqlxJobRepository {
    pub fn new(db: &Db, claim_timeout: Duration) -> Self {
        Self {
            pool: db.pool.clone(),
            dialect: db.dialect,
            claim_timeout,
        }
    }

    fn update_query<'q>(
        &self,
        sql: &'q str,
        claim_token: &str,
        u: &JobUpdate,
    ) -> anyhow::Result<Query<'q, Any, AnyArguments<'q>>> {
        Ok(sqlx::query(sql)
            .bind(u.status.as_str().to_string())
            .bind(i64::from(u.attempts))
            .bind(u.next_retry_at_ms.map(u64_to_i64).transpose()?)
            .bind(u64_to_i64(u.last_attempt_at_ms)?)
            .bind(u64_to_i64(u.processed_at_ms)?)
            .bind(u.completed_at_ms.map(u64_to_i64).transpose()?)
            .bind(serde_json::to_string(&u.platform_results)?)
            .bind(u.error_message.clone())
            .bind(encode_optional(u.trust_metadata.as_ref())?)
            .bind(encode_optional(u.consent_evidence.as_ref())?)
            .bind(u.job_id.clone())
            .bind(claim_token.to_string()))
    }

    async fn fetch_shops(&self, shop_ids: &[String]) -> anyhow::Result<HashMap<String, Shop>> {
        let sql = format!(
            "SELECT id, shop_domain, plan, consent_strategy FROM shops WHERE id IN ({})",
            placeholders(shop_ids.len())
        );
        let sql = self.dialect.sql(&sql);
        let mut q = sqlx::query(&sql);
        for id in shop_ids {
            q = q.bind(id.clone());
        }

        let mut out = HashMap::new();
        for r in q.fetch_all(&self.pool).await? {
            match row_to_shop(&r) {
                Ok(s) => {
                    out.insert(s.id.clone(), s);
                }
                Err(e) => warn!(error = %e, "skipping malformed shop row"),
            }
        }
        Ok(out)
    }

    async fn fetch_configs(
        &self,
        shop_ids: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<PixelConfig>>> {
        let sql = format!(
            r#"
SELECT id, shop_id, platform, credentials_encrypted, client_config
FROM pixel_configs
WHERE shop_id IN ({})
  AND is_active = TRUE
  AND server_side_enabled = TRUE
ORDER BY shop_id, platform, id
"#,
            placeholders(shop_ids.len())
        );
        let sql = self.dialect.sql(&sql);
        let mut q = sqlx::query(&sql);
        for id in shop_ids {
            q = q.bind(id.clone());
        }

        let mut out: HashMap<String, Vec<PixelConfig>> = HashMap::new();
        for r in q.fetch_all(&self.pool).await? {
            let config = match row_to_config(&r) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "skipping malformed pixel config row");
                    continue;
                }
            };

            let configs = out.entry(config.shop_id.clone()).or_default();
            if configs.iter().any(|c| c.platform == config.platform) {
                warn!(
                    shop_id = %config.shop_id,
                    platform = %config.platform,
                    config_id = %config.id,
                    "duplicate pixel config for platform; keeping the first"
                );
                continue;
            }
            configs.push(config);
        }
        Ok(out)
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn claim_jobs(
        &self,
        batch_size: usize,
        now_ms: u64,
        claim_token: &str,
    ) -> anyhow::Result<Vec<String>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(batch_size).context("batch size out of range")?;
        let now = u64_to_i64(now_ms)?;
        let sql = format!(
            r#"
UPDATE conversion_jobs
SET status = 'processing', last_attempt_at = ?, claim_token = ?
WHERE id IN (
  SELECT id FROM conversion_jobs
  WHERE status = 'queued'
     OR (status = 'failed' AND next_retry_at <= ? AND attempts < max_attempts)
  ORDER BY created_at ASC
  LIMIT ?
  {lock}
)
RETURNING id, created_at
"#,
            lock = self.dialect.lock_clause()
        );
        let sql = self.dialect.sql(&sql);

        let claim = async {
            let mut tx = self.pool.begin().await?;
            if let Some(stmt) = self.dialect.statement_timeout(self.claim_timeout) {
                sqlx::query(&stmt).execute(&mut *tx).await?;
            }
            let rows = sqlx::query(&sql)
                .bind(now)
                .bind(claim_token.to_string())
                .bind(now)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        };

        let rows = match tokio::time::timeout(self.claim_timeout, claim).await {
            Ok(res) => res.map_err(PipelineError::from)?,
            Err(_) => {
                return Err(PipelineError::ClaimTimeout(self.claim_timeout.as_millis() as u64).into());
            }
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: String = r.try_get("id")?;
            let created_at: i64 = r.try_get("created_at")?;
            claimed.push((created_at, id));
        }
        // RETURNING order is unspecified
        claimed.sort();

        debug!(claimed = claimed.len(), "claimed conversion jobs");
        Ok(claimed.into_iter().map(|(_, id)| id).collect())
    }

    async fn fetch_jobs(&self, job_ids: &[String]) -> anyhow::Result<Vec<LoadedJob>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
SELECT
  id, shop_id, order_id, order_number, order_value, currency, capi_input,
  status, attempts, max_attempts,
  next_retry_at, last_attempt_at, created_at, processed_at, completed_at,
  platform_results, error_message, trust_metadata, consent_evidence
FROM conversion_jobs
WHERE id IN ({})
ORDER BY created_at ASC
"#,
            placeholders(job_ids.len())
        );
        let sql = self.dialect.sql(&sql);
        let mut q = sqlx::query(&sql);
        for id in job_ids {
            q = q.bind(id.clone());
        }

        let mut jobs = Vec::new();
        for r in q.fetch_all(&self.pool).await? {
            match row_to_job(&r) {
                Ok(j) => jobs.push(j),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the batch
                    warn!(error = %e, "skipping malformed conversion job row");
                }
            }
        }
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let shop_ids: Vec<String> = jobs
            .iter()
            .map(|j| j.shop_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let shops = self.fetch_shops(&shop_ids).await?;
        let configs = self.fetch_configs(&shop_ids).await?;

        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Some(shop) = shops.get(&job.shop_id).cloned() else {
                warn!(job_id = %job.id, shop_id = %job.shop_id, "job references unknown shop");
                continue;
            };
            let pixel_configs = configs.get(&job.shop_id).cloned().unwrap_or_default();
            out.push(LoadedJob {
                job,
                shop,
                pixel_configs,
            });
        }

        Ok(out)
    }

    async fn apply_updates(
        &self,
        claim_token: &str,
        updates: &[JobUpdate],
    ) -> anyhow::Result<Vec<String>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let sql = self.dialect.sql(UPDATE_JOB_SQL);
        let mut lost = Vec::new();
        let mut tx = self.pool.begin().await?;
        for u in updates {
            let res = self.update_query(&sql, claim_token, u)?.execute(&mut *tx).await?;
            if res.rows_affected() == 0 {
                lost.push(u.job_id.clone());
            }
        }
        tx.commit().await?;

        Ok(lost)
    }

    async fn apply_update(&self, claim_token: &str, update: &JobUpdate) -> anyhow::Result<bool> {
        let sql = self.dialect.sql(UPDATE_JOB_SQL);
        let res = self
            .update_query(&sql, claim_token, update)?
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn fail_unloadable(
        &self,
        job_id: &str,
        claim_token: &str,
        error: &str,
        retry_at_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        let sql = self.dialect.sql(
            r#"
UPDATE conversion_jobs
SET
  status = CASE WHEN attempts + 1 >= max_attempts THEN 'dead_letter' ELSE 'failed' END,
  next_retry_at = CASE WHEN attempts + 1 >= max_attempts THEN NULL ELSE ? END,
  attempts = attempts + 1,
  error_message = ?,
  last_attempt_at = ?,
  processed_at = ?,
  claim_token = NULL
WHERE id = ? AND status = 'processing' AND claim_token = ?
"#,
        );
        let now = u64_to_i64(now_ms)?;
        let res = sqlx::query(&sql)
            .bind(u64_to_i64(retry_at_ms)?)
            .bind(error.to_string())
            .bind(now)
            .bind(now)
            .bind(job_id.to_string())
            .bind(claim_token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn upsert_conversion_log(&self, entry: &ConversionLogEntry) -> anyhow::Result<()> {
        let sql = self.dialect.sql(
            r#"
INSERT INTO conversion_logs (
  id, shop_id, order_id, order_number, order_value, currency,
  platform, event_type, event_id, status, attempts, error_message,
  last_attempt_at, created_at
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
ON CONFLICT (shop_id, order_id, platform, event_type) DO UPDATE SET
  status = excluded.status,
  attempts = conversion_logs.attempts + 1,
  event_id = COALESCE(excluded.event_id, conversion_logs.event_id),
  error_message = excluded.error_message,
  last_attempt_at = excluded.last_attempt_at
"#,
        );
        let at = u64_to_i64(entry.attempted_at_ms)?;
        sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(entry.shop_id.clone())
            .bind(entry.order_id.clone())
            .bind(entry.order_number.clone())
            .bind(entry.order_value)
            .bind(entry.currency.clone())
            .bind(entry.platform.as_str().to_string())
            .bind(entry.event_type.clone())
            .bind(entry.event_id.clone())
            .bind(entry.status.as_str().to_string())
            .bind(entry.error_message.clone())
            .bind(at)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recover_stale_claims(&self, claimed_before_ms: u64, now_ms: u64) -> anyhow::Result<u64> {
        let sql = self.dialect.sql(
            r#"
UPDATE conversion_jobs
SET
  status = CASE WHEN attempts + 1 >= max_attempts THEN 'dead_letter' ELSE 'failed' END,
  next_retry_at = CASE WHEN attempts + 1 >= max_attempts THEN NULL ELSE ? END,
  attempts = attempts + 1,
  error_message = ?,
  claim_token = NULL
WHERE status = 'processing' AND last_attempt_at < ?
"#,
        );
        let res = sqlx::query(&sql)
            .bind(u64_to_i64(now_ms)?)
            .bind("recovered stale processing claim".to_string())
            .bind(u64_to_i64(claimed_before_ms)?)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

const UPDATE_JOB_SQL: &str = r#"
UPDATE conversion_jobs
SET
  status = ?,
  attempts = ?,
  next_retry_at = ?,
  last_attempt_at = ?,
  processed_at = ?,
  completed_at = ?,
  platform_results = ?,
  error_message = ?,
  trust_metadata = ?,
  consent_evidence = ?,
  claim_token = NULL
WHERE id = ? AND status = 'processing' AND claim_token = ?
"#;

/* =========================
Row mapping + conversions
========================= */

fn row_to_job(r: &AnyRow) -> anyhow::Result<ConversionJob> {
    let id: String = r.try_get("id")?;
    let malformed = |reason: String| PipelineError::MalformedRow {
        id: id.clone(),
        reason,
    };

    let status: String = r.try_get("status")?;
    let status: JobStatus = status.parse().map_err(malformed)?;

    let capi_input: Option<String> = r.try_get("capi_input")?;
    let platform_results: Option<String> = r.try_get("platform_results")?;
    let trust_metadata: Option<String> = r.try_get("trust_metadata")?;
    let consent_evidence: Option<String> = r.try_get("consent_evidence")?;

    Ok(ConversionJob {
        shop_id: r.try_get("shop_id")?,
        order_id: r.try_get("order_id")?,
        order_number: r.try_get("order_number")?,
        order_value: r.try_get("order_value")?,
        currency: r.try_get("currency")?,
        capi_input: decode_column(capi_input.as_deref())
            .map_err(|e| malformed(format!("capi_input: {e}")))?,
        status,
        attempts: i64_to_u32(r.try_get("attempts")?)?,
        max_attempts: i64_to_u32(r.try_get("max_attempts")?)?,
        next_retry_at_ms: opt_i64_to_u64(r.try_get("next_retry_at")?)?,
        last_attempt_at_ms: opt_i64_to_u64(r.try_get("last_attempt_at")?)?,
        created_at_ms: i64_to_u64(r.try_get("created_at")?)?,
        processed_at_ms: opt_i64_to_u64(r.try_get("processed_at")?)?,
        completed_at_ms: opt_i64_to_u64(r.try_get("completed_at")?)?,
        platform_results: decode_column(platform_results.as_deref())
            .map_err(|e| malformed(format!("platform_results: {e}")))?,
        error_message: r.try_get("error_message")?,
        trust_metadata: decode_optional(trust_metadata.as_deref())
            .map_err(|e| malformed(format!("trust_metadata: {e}")))?,
        consent_evidence: decode_optional(consent_evidence.as_deref())
            .map_err(|e| malformed(format!("consent_evidence: {e}")))?,
        id,
    })
}

fn row_to_shop(r: &AnyRow) -> anyhow::Result<Shop> {
    let id: String = r.try_get("id")?;
    let raw_strategy: String = r.try_get("consent_strategy")?;
    let consent_strategy = raw_strategy.parse().unwrap_or_else(|e: String| {
        warn!(shop_id = %id, error = %e, "unreadable consent strategy; using strict");
        ConsentStrategy::Strict
    });

    Ok(Shop {
        shop_domain: r.try_get("shop_domain")?,
        plan: r.try_get("plan")?,
        consent_strategy,
        id,
    })
}

fn row_to_config(r: &AnyRow) -> anyhow::Result<PixelConfig> {
    let id: String = r.try_get("id")?;
    let platform: String = r.try_get("platform")?;
    let platform: Platform = platform.parse().map_err(|e: platforms::RegistryError| {
        PipelineError::MalformedRow {
            id: id.clone(),
            reason: e.to_string(),
        }
    })?;
    let client_config: Option<String> = r.try_get("client_config")?;
    let client_config: PixelClientConfig = decode_column(client_config.as_deref())
        .with_context(|| format!("pixel config {id}: client_config"))?;

    Ok(PixelConfig {
        shop_id: r.try_get("shop_id")?,
        platform,
        is_active: true,
        server_side_enabled: true,
        credentials_encrypted: r.try_get("credentials_encrypted")?,
        client_config,
        id,
    })
}

fn decode_optional<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> serde_json::Result<Option<T>> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(None),
        Some(s) => serde_json::from_str(s).map(Some),
    }
}

fn encode_optional<T: serde::Serialize>(value: Option<&T>) -> serde_json::Result<Option<String>> {
    value.map(serde_json::to_string).transpose()
}

/* =========================
Numeric safety helpers
========================= */

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    u32::try_from(v).map_err(|_| anyhow!("out of range for u32: {v}"))
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    u64::try_from(v).map_err(|_| anyhow!("negative i64 where u64 expected: {v}"))
}

fn opt_i64_to_u64(v: Option<i64>) -> anyhow::Result<Option<u64>> {
    v.map(i64_to_u64).transpose()
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    i64::try_from(v).map_err(|_| anyhow!("u64 too large for i64: {v}"))
}
