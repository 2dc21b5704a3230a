use std::sync::Arc;

use anyhow::{bail, Context, Result};
use billing_engine::billing::{
    run_billing_automation_tick, spawn_billing_scheduler, start_reconciliation_worker, ReconciliationJob,
    RenewalEngine,
};
use billing_engine::charges::ChargeService;
use billing_engine::processor::LocalProcessor;
use billing_engine::signals::TracingSignalSink;
use billing_engine::{config, organizations, BillingConfig};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let billing_config = BillingConfig::from_env();
    let db_url = config::DATABASE_URL
        .clone()
        .context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    {
        let mut conn = pool.acquire().await?;
        organizations::ensure(&mut conn, &billing_config.broker_slug, "Broker").await?;
        organizations::ensure(&mut conn, &billing_config.processor_slug, "Payment processor").await?;
    }

    let processor = Arc::new(LocalProcessor::from_config(&billing_config));
    let charges = Arc::new(ChargeService::new(
        pool.clone(),
        processor,
        Arc::new(TracingSignalSink),
        billing_config.clone(),
    ));
    let engine = Arc::new(RenewalEngine::new(charges.clone()));

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        // One sweep, then exit.
        Some("renewals") => {
            let dry_run = billing_config.dry_run || args.any(|arg| arg == "--dry-run");
            let report = run_billing_automation_tick(&engine, Utc::now(), dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None | Some("serve") => {
            let reconciliation = start_reconciliation_worker(charges);
            spawn_billing_scheduler(engine);
            reconciliation
                .dispatch(ReconciliationJob::CompleteCharges { at_time: Utc::now() })
                .await?;
            tracing::info!(
                interval_secs = billing_config.renewal_scan_interval_secs,
                dry_run = billing_config.dry_run,
                "billing engine running"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
        }
        Some(other) => bail!("unknown command `{other}` (expected `serve` or `renewals [--dry-run]`)"),
    }
    Ok(())
}
