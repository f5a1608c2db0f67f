use std::sync::Arc;

use capi_backend::{
    audit::ConversionLogWriter,
    collaborators::dry_run::{DryRunPlatform, NoReceiptTrust, PlaintextCredentials, UnmeteredBilling},
    collaborators::event_id::Sha256EventIdGenerator,
    config::AppConfig,
    db::Db,
    dispatch::Dispatcher,
    jobs::{JobRepository, SqlxJobRepository},
    logger::init_logger,
    metrics::counters::{Counters, read},
    scheduler::{AdaptiveBatchBackoff, BatchOrchestrator},
};
use platforms::{Platform, PlatformRegistry};

/// Connects, migrates and builds the repository.
async fn init_repository(cfg: &AppConfig) -> anyhow::Result<Arc<dyn JobRepository>> {
    let max_connections = u32::try_from(cfg.job_concurrency + 4).unwrap_or(u32::MAX);
    let db = Db::connect(&cfg.database_url, max_connections).await?;
    db.migrate().await?;

    tracing::info!(dialect = ?db.dialect, "database ready");
    Ok(Arc::new(SqlxJobRepository::new(&db, cfg.claim_timeout)))
}

/// Dry-run services for every platform until real clients are registered.
fn build_registry() -> PlatformRegistry {
    Platform::ALL
        .iter()
        .fold(PlatformRegistry::new(), |reg, p| reg.with(Arc::new(DryRunPlatform(*p))))
}

fn build_orchestrator(
    cfg: &AppConfig,
    repo: Arc<dyn JobRepository>,
    counters: Counters,
) -> BatchOrchestrator {
    let dispatcher = Arc::new(Dispatcher::new(
        build_registry(),
        Arc::new(NoReceiptTrust),
        Arc::new(PlaintextCredentials),
        Arc::new(Sha256EventIdGenerator),
        counters.clone(),
    ));
    let audit = ConversionLogWriter::spawn(repo.clone(), cfg.audit_queue_capacity, counters.clone());

    BatchOrchestrator::new(repo, dispatcher, Arc::new(UnmeteredBilling), audit, counters)
        .with_finalizer(cfg.finalizer())
        .with_batch_backoff(Arc::new(AdaptiveBatchBackoff::new(cfg.batch_backoff.clone())))
        .with_settings(cfg.orchestrator_settings())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;
    init_logger("capi-worker", cfg.production);

    tracing::info!(
        batch_size = cfg.batch_size,
        concurrency = cfg.job_concurrency,
        retry_policy = ?cfg.retry_policy,
        "Starting conversion worker..."
    );

    let counters = Counters::default();
    let repo = init_repository(&cfg).await?;
    let orchestrator = build_orchestrator(&cfg, repo, counters.clone());

    // Unwind claims orphaned by a previous crash before taking new work.
    orchestrator.recover_stale_claims().await?;

    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.process_conversion_jobs(cfg.batch_size).await {
                    tracing::error!(error = ?e, "conversion batch failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    orchestrator.audit().flush().await;
    tracing::info!(
        claimed = read(&counters.jobs_claimed),
        completed = read(&counters.jobs_completed),
        failed = read(&counters.jobs_failed),
        dead_lettered = read(&counters.jobs_dead_lettered),
        audit_dropped = read(&counters.audit_dropped),
        claims_lost = read(&counters.claims_lost),
        "worker stopped"
    );

    Ok(())
}
