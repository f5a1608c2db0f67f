use sqlx::AnyPool;

/// One statement per entry; PostgreSQL rejects multi-statement prepared queries.
const STATEMENTS: &[&str] = &[
    // Shops (owned by ingestion; read here)
    r#"
CREATE TABLE IF NOT EXISTS shops (
  id TEXT PRIMARY KEY,
  shop_domain TEXT NOT NULL,
  plan TEXT NOT NULL DEFAULT 'free',
  consent_strategy TEXT NOT NULL DEFAULT 'balanced'
)
"#,
    // Pixel configs (read-only here)
    r#"
CREATE TABLE IF NOT EXISTS pixel_configs (
  id TEXT PRIMARY KEY,
  shop_id TEXT NOT NULL,
  platform TEXT NOT NULL,
  is_active BOOLEAN NOT NULL DEFAULT TRUE,
  server_side_enabled BOOLEAN NOT NULL DEFAULT FALSE,
  credentials_encrypted TEXT NOT NULL DEFAULT '',
  client_config TEXT
)
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_pixel_configs_shop ON pixel_configs(shop_id)"#,
    // Conversion jobs
    r#"
CREATE TABLE IF NOT EXISTS conversion_jobs (
  id TEXT PRIMARY KEY,
  shop_id TEXT NOT NULL,
  order_id TEXT NOT NULL,
  order_number TEXT,
  order_value DOUBLE PRECISION NOT NULL,
  currency TEXT NOT NULL,
  capi_input TEXT,
  status TEXT NOT NULL DEFAULT 'queued',
  attempts BIGINT NOT NULL DEFAULT 0,
  max_attempts BIGINT NOT NULL DEFAULT 5,
  next_retry_at BIGINT,
  last_attempt_at BIGINT,
  claim_token TEXT,
  created_at BIGINT NOT NULL,
  processed_at BIGINT,
  completed_at BIGINT,
  platform_results TEXT,
  error_message TEXT,
  trust_metadata TEXT,
  consent_evidence TEXT
)
"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_conversion_jobs_shop_order ON conversion_jobs(shop_id, order_id)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_conversion_jobs_claim ON conversion_jobs(status, next_retry_at, created_at)"#,
    // Conversion logs
    r#"
CREATE TABLE IF NOT EXISTS conversion_logs (
  id TEXT PRIMARY KEY,
  shop_id TEXT NOT NULL,
  order_id TEXT NOT NULL,
  order_number TEXT,
  order_value DOUBLE PRECISION NOT NULL,
  currency TEXT NOT NULL,
  platform TEXT NOT NULL,
  event_type TEXT NOT NULL,
  event_id TEXT,
  status TEXT NOT NULL,
  attempts BIGINT NOT NULL DEFAULT 1,
  error_message TEXT,
  last_attempt_at BIGINT NOT NULL,
  created_at BIGINT NOT NULL
)
"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_conversion_logs_event ON conversion_logs(shop_id, order_id, platform, event_type)"#,
];

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
