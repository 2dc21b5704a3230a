use thiserror::Error;

use crate::processor::ProcessorError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("insufficient funds on {organization}: requested {requested} {unit}, available {available} {unit}")]
    InsufficientFunds {
        organization: String,
        requested: i64,
        available: i64,
        unit: String,
    },
    #[error("balance spans more than one unit: {units:?}")]
    MixedUnits { units: Vec<String> },
    #[error("ledger integrity violation: {0}")]
    Integrity(String),
    #[error("charge {charge_id} is no longer in state {expected}")]
    ChargeConflict { charge_id: i64, expected: String },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid event id `{0}`")]
    InvalidEventId(String),
    #[error("invalid refund: {0}")]
    InvalidRefund(String),
}

impl BillingError {
    /// Failures that the next batch run is expected to resolve on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::ChargeConflict { .. } => true,
            BillingError::Processor(err) => err.is_retryable(),
            BillingError::Db(sqlx::Error::Database(db_err)) => {
                // lock_not_available, serialization_failure
                matches!(db_err.code().as_deref(), Some("55P03") | Some("40001"))
            }
            _ => false,
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "ledger integrity violation");
        BillingError::Integrity(message)
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
