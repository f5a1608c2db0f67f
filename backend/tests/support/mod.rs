#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use platforms::{
    ConversionData, CredentialValidation, Credentials, Platform, PlatformError, PlatformErrorKind,
    PlatformRegistry, PlatformService, SendResult,
};
use serde_json::{Value, json};
use sqlx::Row;
use uuid::Uuid;

use capi_backend::audit::ConversionLogWriter;
use capi_backend::collaborators::billing::{BillingGate, BillingReservation};
use capi_backend::collaborators::dry_run::PlaintextCredentials;
use capi_backend::collaborators::event_id::Sha256EventIdGenerator;
use capi_backend::collaborators::trust::{
    ConsentState, Receipt, ReceiptKey, ReceiptMap, ShopContext, TrustEvaluation, TrustEvaluator,
    TrustLevel,
};
use capi_backend::db::Db;
use capi_backend::dispatch::Dispatcher;
use capi_backend::jobs::payload::TrustMetadata;
use capi_backend::jobs::{JobFinalizer, JobRepository, LoadedJob, RetryPolicy, SqlxJobRepository};
use capi_backend::metrics::counters::Counters;
use capi_backend::scheduler::{
    AdaptiveBatchBackoff, BatchBackoffConfig, BatchOrchestrator, OrchestratorSettings,
    RetryBackoff,
};

/* =========================
Database
========================= */

/// Isolated, uniquely named in-memory SQLite database with the schema applied.
///
/// One connection keeps the shared-cache database alive and serialises writers.
pub async fn setup_db() -> Db {
    let url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
    let db = Db::connect(&url, 1).await.unwrap();
    db.migrate().await.unwrap();
    db
}

/// File-backed SQLite database in `dir`, migrated and in WAL mode so that
/// separate pools opened on the returned URL really contend for rows.
pub async fn setup_file_db(dir: &tempfile::TempDir) -> String {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
    let db = Db::connect(&url, 1).await.unwrap();
    db.migrate().await.unwrap();
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&db.pool)
        .await
        .unwrap();
    db.pool.close().await;
    url
}

pub async fn insert_shop(db: &Db, id: &str, consent_strategy: &str) {
    sqlx::query("INSERT INTO shops (id, shop_domain, plan, consent_strategy) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(format!("{id}.example.com"))
        .bind("pro".to_string())
        .bind(consent_strategy.to_string())
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn insert_config(db: &Db, shop_id: &str, platform: &str, active: bool, server_side: bool) {
    let sql = format!(
        "INSERT INTO pixel_configs (id, shop_id, platform, is_active, server_side_enabled, credentials_encrypted, client_config) \
         VALUES (?, ?, ?, {}, {}, ?, NULL)",
        if active { "TRUE" } else { "FALSE" },
        if server_side { "TRUE" } else { "FALSE" },
    );
    sqlx::query(&sql)
        .bind(format!("px-{shop_id}-{platform}"))
        .bind(shop_id.to_string())
        .bind(platform.to_string())
        .bind(json!({ "accessToken": "secret" }).to_string())
        .execute(&db.pool)
        .await
        .unwrap();
}

/// Seed row for `conversion_jobs`.
#[derive(Clone, Debug)]
pub struct JobSeed {
    pub id: String,
    pub shop_id: String,
    pub order_id: String,
    pub order_value: f64,
    pub currency: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_retry_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub claim_token: Option<String>,
    pub created_at: i64,
    pub platform_results: Option<Value>,
    pub capi_input: Option<Value>,
}

impl JobSeed {
    pub fn queued(id: &str, shop_id: &str, created_at: i64) -> Self {
        Self {
            id: id.to_string(),
            shop_id: shop_id.to_string(),
            order_id: format!("order-{id}"),
            order_value: 49.99,
            currency: "USD".to_string(),
            status: "queued".to_string(),
            attempts: 0,
            max_attempts: 5,
            next_retry_at: None,
            last_attempt_at: None,
            claim_token: None,
            created_at,
            platform_results: None,
            capi_input: Some(json!({
                "lineItems": [{ "productId": "p1", "variantId": "v1", "quantity": 1, "price": 49.99 }],
                "checkoutToken": format!("ck-{id}")
            })),
        }
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn attempts(mut self, attempts: i64, max_attempts: i64) -> Self {
        self.attempts = attempts;
        self.max_attempts = max_attempts;
        self
    }

    pub fn next_retry_at(mut self, at: i64) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn last_attempt_at(mut self, at: i64) -> Self {
        self.last_attempt_at = Some(at);
        self
    }

    /// Marks the row `processing` under `token`.
    pub fn claimed(mut self, token: &str, at: i64) -> Self {
        self.status = "processing".to_string();
        self.claim_token = Some(token.to_string());
        self.last_attempt_at = Some(at);
        self
    }

    pub fn platform_results(mut self, v: Value) -> Self {
        self.platform_results = Some(v);
        self
    }

    pub async fn insert(self, db: &Db) {
        sqlx::query(
            r#"
INSERT INTO conversion_jobs (
  id, shop_id, order_id, order_number, order_value, currency, capi_input,
  status, attempts, max_attempts, next_retry_at, last_attempt_at, claim_token,
  created_at, platform_results
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
        )
        .bind(self.id.clone())
        .bind(self.shop_id)
        .bind(self.order_id)
        .bind(format!("#{}", self.id))
        .bind(self.order_value)
        .bind(self.currency)
        .bind(self.capi_input.map(|v| v.to_string()))
        .bind(self.status)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.next_retry_at)
        .bind(self.last_attempt_at)
        .bind(self.claim_token)
        .bind(self.created_at)
        .bind(self.platform_results.map(|v| v.to_string()))
        .execute(&db.pool)
        .await
        .unwrap();
    }
}

pub async fn job_status(db: &Db, id: &str) -> String {
    sqlx::query("SELECT status FROM conversion_jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get::<String, _>("status")
}

pub async fn set_consent_strategy(db: &Db, shop_id: &str, strategy: &str) {
    sqlx::query("UPDATE shops SET consent_strategy = ? WHERE id = ?")
        .bind(strategy.to_string())
        .bind(shop_id.to_string())
        .execute(&db.pool)
        .await
        .unwrap();
}

/// Overwrites a job's payload with text that is not JSON.
pub async fn corrupt_capi_input(db: &Db, id: &str) {
    sqlx::query("UPDATE conversion_jobs SET capi_input = '{broken' WHERE id = ?")
        .bind(id.to_string())
        .execute(&db.pool)
        .await
        .unwrap();
}

/// Makes a `failed` job due right now.
pub async fn make_due(db: &Db, id: &str) {
    sqlx::query("UPDATE conversion_jobs SET next_retry_at = 0 WHERE id = ?")
        .bind(id.to_string())
        .execute(&db.pool)
        .await
        .unwrap();
}

/// (platform, status, attempts) rows of `conversion_logs`, ordered by platform.
pub async fn log_rows(db: &Db, order_id: &str) -> Vec<(String, String, i64)> {
    sqlx::query(
        "SELECT platform, status, attempts FROM conversion_logs WHERE order_id = ? ORDER BY platform",
    )
    .bind(order_id.to_string())
    .fetch_all(&db.pool)
    .await
    .unwrap()
    .iter()
    .map(|r| (r.get("platform"), r.get("status"), r.get("attempts")))
    .collect()
}

/* =========================
Fake platform
========================= */

#[derive(Clone, Debug)]
pub enum Behavior {
    Succeed,
    Reject { retryable: bool },
    Error(String),
    Panic,
}

pub struct FakePlatform {
    platform: Platform,
    calls: AtomicUsize,
    event_ids: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Mutex<Behavior>,
}

impl FakePlatform {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            calls: AtomicUsize::new(0),
            event_ids: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Behavior::Succeed),
        })
    }

    /// Behaviour for the next call only.
    pub fn next(&self, b: Behavior) {
        self.script.lock().push_back(b);
    }

    /// Behaviour for every call once the script is empty.
    pub fn always(&self, b: Behavior) {
        *self.fallback.lock() = b;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.event_ids.lock().clone()
    }
}

#[async_trait]
impl PlatformService for FakePlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn send_conversion(
        &self,
        _credentials: &Credentials,
        _data: &ConversionData,
        event_id: &str,
    ) -> anyhow::Result<SendResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.event_ids.lock().push(event_id.to_string());

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());

        match behavior {
            Behavior::Succeed => Ok(SendResult::sent(Some(json!({ "events_received": 1 })))),
            Behavior::Reject { retryable } => Ok(SendResult::failed(PlatformError::new(
                if retryable {
                    PlatformErrorKind::Server
                } else {
                    PlatformErrorKind::InvalidCredentials
                },
                "rejected by platform",
                retryable,
            ))),
            Behavior::Error(msg) => Err(anyhow::anyhow!(msg)),
            Behavior::Panic => panic!("platform client bug"),
        }
    }

    fn validate_credentials(&self, _raw: &Value) -> CredentialValidation {
        CredentialValidation::ok()
    }
}

/* =========================
Fake billing
========================= */

#[derive(Clone, Debug)]
pub enum BillingMode {
    Allow { already_counted: bool },
    Limit { current: u64, limit: u64 },
    Error,
}

pub struct FakeBilling {
    mode: Mutex<BillingMode>,
    reserves: AtomicUsize,
    releases: Mutex<Vec<String>>,
    fail_release: Mutex<bool>,
    panic_on_order: Mutex<Option<String>>,
}

impl FakeBilling {
    pub fn new(mode: BillingMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            reserves: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
            fail_release: Mutex::new(false),
            panic_on_order: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: BillingMode) {
        *self.mode.lock() = mode;
    }

    pub fn fail_releases(&self) {
        *self.fail_release.lock() = true;
    }

    /// Reservation for `order_id` panics, simulating a bug outside platform code.
    pub fn panic_on(&self, order_id: &str) {
        *self.panic_on_order.lock() = Some(order_id.to_string());
    }

    pub fn reserves(&self) -> usize {
        self.reserves.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().clone()
    }
}

#[async_trait]
impl BillingGate for FakeBilling {
    async fn check_and_reserve_billing_slot(
        &self,
        _shop_id: &str,
        _plan: &str,
        order_id: &str,
    ) -> anyhow::Result<BillingReservation> {
        self.reserves.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_order.lock().as_deref() == Some(order_id) {
            panic!("quota bookkeeping bug");
        }
        let mode = self.mode.lock().clone();
        match mode {
            BillingMode::Allow { already_counted } => Ok(BillingReservation {
                success: true,
                current: 1,
                limit: 100,
                already_counted,
            }),
            BillingMode::Limit { current, limit } => Ok(BillingReservation {
                success: false,
                current,
                limit,
                already_counted: false,
            }),
            BillingMode::Error => Err(anyhow::anyhow!("billing store unreachable")),
        }
    }

    async fn release_billing_slot(&self, shop_id: &str) -> anyhow::Result<()> {
        self.releases.lock().push(shop_id.to_string());
        if *self.fail_release.lock() {
            anyhow::bail!("release failed");
        }
        Ok(())
    }
}

/* =========================
Fake trust evaluator
========================= */

pub struct FakeTrust {
    pub level: TrustLevel,
    pub consent: ConsentState,
    pub receipts: ReceiptMap,
    pub fail_lookup: bool,
    pub lookups: AtomicUsize,
}

impl FakeTrust {
    pub fn consenting() -> Self {
        Self::with_consent(ConsentState {
            marketing: Some(true),
            analytics: Some(true),
            sale_of_data: None,
        })
    }

    pub fn with_consent(consent: ConsentState) -> Self {
        Self {
            level: TrustLevel::Trusted,
            consent,
            receipts: ReceiptMap::new(),
            fail_lookup: false,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_receipt(mut self, shop_id: &str, order_id: &str, event_id: &str) -> Self {
        self.receipts.insert(
            (shop_id.to_string(), order_id.to_string()),
            Receipt {
                shop_id: shop_id.to_string(),
                order_id: order_id.to_string(),
                checkout_token: None,
                event_id: Some(event_id.to_string()),
                consent: None,
                received_at_ms: 1,
            },
        );
        self
    }
}

#[async_trait]
impl TrustEvaluator for FakeTrust {
    async fn batch_fetch_receipts(&self, _keys: &[ReceiptKey]) -> anyhow::Result<ReceiptMap> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            anyhow::bail!("receipt store down");
        }
        Ok(self.receipts.clone())
    }

    fn evaluate_trust(
        &self,
        receipt: Option<&Receipt>,
        _checkout_token: Option<&str>,
        _shop: &ShopContext,
    ) -> TrustEvaluation {
        TrustEvaluation {
            trust_level: self.level,
            trust_metadata: TrustMetadata {
                trust_level: self.level,
                reason: Some("test".into()),
                receipt_matched: receipt.is_some(),
                receipt_event_id: receipt.and_then(|r| r.event_id.clone()),
                ..Default::default()
            },
            consent_state: self.consent,
        }
    }
}

/* =========================
Harness
========================= */

pub const SHOP: &str = "shop-1";

pub struct Harness {
    pub db: Db,
    pub repo: Arc<SqlxJobRepository>,
    pub platforms: HashMap<Platform, Arc<FakePlatform>>,
    pub billing: Arc<FakeBilling>,
    pub trust: Arc<FakeTrust>,
    pub counters: Counters,
    pub orchestrator: BatchOrchestrator,
}

pub struct HarnessOptions {
    pub trust: FakeTrust,
    pub billing: BillingMode,
    pub retry: RetryBackoff,
    pub policy: RetryPolicy,
    pub concurrency: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            trust: FakeTrust::consenting(),
            billing: BillingMode::Allow {
                already_counted: false,
            },
            retry: RetryBackoff {
                base_ms: 60_000,
                multiplier: 2.0,
                max_ms: 7_200_000,
                jitter_factor: 0.2,
            },
            policy: RetryPolicy::RetryAll,
            concurrency: 4,
        }
    }
}

impl Harness {
    pub async fn new(opts: HarnessOptions) -> Self {
        let db = setup_db().await;
        let repo = Arc::new(SqlxJobRepository::new(&db, std::time::Duration::from_secs(5)));
        let counters = Counters::default();

        let mut registry = PlatformRegistry::new();
        let mut platforms = HashMap::new();
        for p in Platform::ALL {
            let fake = FakePlatform::new(p);
            registry.register(fake.clone());
            platforms.insert(p, fake);
        }

        let trust = Arc::new(opts.trust);
        let billing = FakeBilling::new(opts.billing);

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            trust.clone(),
            Arc::new(PlaintextCredentials),
            Arc::new(Sha256EventIdGenerator),
            counters.clone(),
        ));
        let repo_dyn: Arc<dyn JobRepository> = repo.clone();
        let audit = ConversionLogWriter::spawn(repo_dyn.clone(), 64, counters.clone());

        let orchestrator = BatchOrchestrator::new(
            repo_dyn,
            dispatcher,
            billing.clone(),
            audit,
            counters.clone(),
        )
        .with_finalizer(JobFinalizer::new(opts.retry, opts.policy))
        .with_batch_backoff(Arc::new(AdaptiveBatchBackoff::new(BatchBackoffConfig {
            base_ms: 0,
            max_ms: 0,
            failure_threshold: 0.5,
        })))
        .with_settings(OrchestratorSettings {
            concurrency: opts.concurrency,
            stale_processing_ms: 15 * 60 * 1_000,
        });

        insert_shop(&db, SHOP, "balanced").await;

        Self {
            db,
            repo,
            platforms,
            billing,
            trust,
            counters,
            orchestrator,
        }
    }

    pub fn platform(&self, p: Platform) -> &Arc<FakePlatform> {
        &self.platforms[&p]
    }

    /// Runs one batch and waits for its audit writes.
    pub async fn run(&self, batch_size: usize) -> capi_backend::scheduler::BatchReport {
        let report = self
            .orchestrator
            .process_conversion_jobs(batch_size)
            .await
            .unwrap();
        self.orchestrator.audit().flush().await;
        report
    }

    pub async fn load(&self, id: &str) -> LoadedJob {
        self.repo
            .fetch_jobs(&[id.to_string()])
            .await
            .unwrap()
            .pop()
            .unwrap()
    }
}
