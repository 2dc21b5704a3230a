use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use super::renewals::{RenewalEngine, RenewalReport};

/// key: billing-renewal-scheduler -> run the renewal sweep on an interval
pub fn spawn(engine: Arc<RenewalEngine>) {
    let config = engine.charges().config().clone();
    let interval = TokioDuration::from_secs(config.renewal_scan_interval_secs.max(1));
    let dry_run = config.dry_run;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&engine, Utc::now(), dry_run).await {
                warn!(?err, "billing renewal tick failed");
            }
        }
    });
}

/// key: billing-renewal-scheduler -> tick handler
pub async fn process_tick(engine: &RenewalEngine, now: DateTime<Utc>, dry_run: bool) -> Result<RenewalReport> {
    let report = engine.run_renewals(now, dry_run).await;
    info!(
        at_time = %now,
        dry_run,
        nb_phases = report.phases.len(),
        nb_errors = report.errors.len(),
        "billing renewal tick"
    );
    if report.phases.is_empty() && !report.errors.is_empty() {
        bail!("every renewal phase failed: {:?}", report.errors);
    }
    Ok(report)
}
