pub mod reconciliation;
pub mod renewals;
pub mod scheduler;

pub use reconciliation::{start_reconciliation_worker, ReconciliationHandle, ReconciliationJob};
pub use renewals::{
    classify_notice, recognizable_amount, ExpirationNotice, OrderSpan, PhaseReport, RenewalEngine,
    RenewalReport,
};
pub use scheduler::{process_tick as run_billing_automation_tick, spawn as spawn_billing_scheduler};
