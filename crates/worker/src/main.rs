//! Sightline worker: scheduled usage reporting.
//!
//! Runs the usage reporter on a cron schedule (`USAGE_REPORT_CRON`, default
//! 02:00 UTC daily). `--once` runs a single report and exits, which is what
//! the deploy pipeline uses for backfills; `USAGE_REPORT_DRY_RUN=true`
//! computes reports without transmitting them.

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sightline_billing::{BillingApiClient, UsageReporter};

const DEFAULT_USAGE_REPORT_CRON: &str = "0 0 2 * * *";

fn dry_run_from_env() -> bool {
    std::env::var("USAGE_REPORT_DRY_RUN")
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = sightline_shared::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;

    let client = BillingApiClient::from_env().context("Failed to build billing client")?;
    let reporter = UsageReporter::new(pool, client);
    let dry_run = dry_run_from_env();

    if std::env::args().any(|arg| arg == "--once") {
        let outcome = reporter.run(dry_run).await.context("Usage report failed")?;
        tracing::info!(?outcome, "One-shot usage report finished");
        return Ok(());
    }

    let cron =
        std::env::var("USAGE_REPORT_CRON").unwrap_or_else(|_| DEFAULT_USAGE_REPORT_CRON.into());

    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;

    let job_reporter = reporter.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let reporter = job_reporter.clone();
        Box::pin(async move {
            match reporter.run(dry_run).await {
                Ok(outcome) => tracing::info!(?outcome, "Scheduled usage report finished"),
                Err(e) => tracing::error!(error = %e, "Scheduled usage report failed"),
            }
        })
    })
    .context("Invalid USAGE_REPORT_CRON expression")?;

    scheduler.add(job).await.context("Failed to add job")?;
    scheduler.start().await.context("Failed to start scheduler")?;

    tracing::info!(cron = %cron, dry_run, "Sightline worker running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    Ok(())
}
