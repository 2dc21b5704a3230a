use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info, warn};

use crate::charges::ChargeService;
use crate::processor::ChargeEvent;

/// key: billing-reconciliation -> background worker for processor callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationJob {
    /// A processor notification about one charge.
    ChargeEvent {
        processor_key: String,
        event: ChargeEvent,
        at_time: DateTime<Utc>,
    },
    /// Poll the processor for every charge still waiting on it.
    CompleteCharges { at_time: DateTime<Utc> },
}

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(charges: Arc<ChargeService>) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::ChargeEvent {
                    processor_key,
                    event,
                    at_time,
                } => match charges.apply_event(&processor_key, event, at_time).await {
                    Ok(Some(charge)) => info!(
                        charge = %processor_key,
                        event = event.as_str(),
                        state = charge.state.as_str(),
                        "charge reconciled from processor event"
                    ),
                    Ok(None) => {}
                    // A conflicting update is picked up again by the next sweep.
                    Err(err) if err.is_retryable() => warn!(
                        ?err,
                        charge = %processor_key,
                        event = event.as_str(),
                        "charge busy, leaving event to the next sweep"
                    ),
                    Err(err) => error!(
                        ?err,
                        charge = %processor_key,
                        event = event.as_str(),
                        "failed to apply processor event"
                    ),
                },
                ReconciliationJob::CompleteCharges { at_time } => {
                    match charges.complete_charges(at_time, false).await {
                        Ok(report) => info!(
                            settled = report.settled,
                            failed = report.failed,
                            pending = report.pending,
                            errors = report.errors,
                            "charge completion sweep finished"
                        ),
                        Err(err) => error!(?err, "charge completion sweep failed"),
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
