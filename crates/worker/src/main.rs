use std::sync::Arc;

use meterline_billing::BillingService;
use meterline_worker::{jobs, webhook_processor, WorkerConfig, WorkerResult};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env()?;

    let migration_pool = meterline_shared::create_migration_pool(&config.database_url).await?;
    meterline_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = meterline_shared::create_pool(&config.database_url, config.database_max_connections).await?;
    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let mut scheduler = schedule(&config, pool, billing).await?;
    scheduler.start().await?;
    tracing::info!(
        billing_cycle = %config.billing_cycle_cron,
        notification_queue = %config.notification_queue_cron,
        "Worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,meterline_worker=debug,meterline_billing=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn schedule(config: &WorkerConfig, pool: PgPool, billing: Arc<BillingService>) -> WorkerResult<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let cycle_billing = billing.clone();
    let batch_size = config.billing_batch_size;
    let max_retries = config.billing_max_retries;
    scheduler
        .add(Job::new_async(config.billing_cycle_cron.as_str(), move |_id, _scheduler| {
            let billing = cycle_billing.clone();
            Box::pin(async move {
                jobs::run_billing_cycle(&billing, batch_size, max_retries).await;
            })
        })?)
        .await?;

    let queue_pool = pool.clone();
    let notification_batch = config.notification_batch_size;
    scheduler
        .add(Job::new_async(config.notification_queue_cron.as_str(), move |_id, _scheduler| {
            let pool = queue_pool.clone();
            let billing = billing.clone();
            Box::pin(async move {
                let report = webhook_processor::process_notification_queue(&pool, &billing, notification_batch).await;
                if report != webhook_processor::DrainReport::default() {
                    tracing::info!(
                        completed = report.completed,
                        retrying = report.retrying,
                        failed = report.failed,
                        "Notification queue drained"
                    );
                }
            })
        })?)
        .await?;

    let retention_days = config.queue_retention_days;
    scheduler
        .add(Job::new_async(config.queue_cleanup_cron.as_str(), move |_id, _scheduler| {
            let pool = pool.clone();
            Box::pin(async move {
                webhook_processor::cleanup_old_notifications(&pool, retention_days).await;
            })
        })?)
        .await?;

    Ok(scheduler)
}
