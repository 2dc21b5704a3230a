//! Contract with the payment processor, the billing engine's only outbound
//! dependency.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::charges::Charge;
use crate::money::Price;
use crate::organizations::Organization;

pub use local::LocalProcessor;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessorError {
    /// Customer-facing decline.
    #[error("card declined: {code}")]
    Card {
        code: String,
        charge_processor_key: Option<String>,
    },
    /// Provider or broker has no usable processor account.
    #[error("processor account not set up for {provider}")]
    Setup { provider: String },
    #[error("processor error: {0}")]
    Backend(String),
}

impl ProcessorError {
    /// Only generic backend faults are expected to clear on the next run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Backend(_))
    }
}

/// key: processor-charge-event -> webhook taxonomy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChargeEvent {
    Succeeded,
    Failed,
    Refunded,
    Captured,
    DisputeCreated,
    DisputeUpdated,
    DisputeWon,
    DisputeLost,
}

impl ChargeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeEvent::Succeeded => "charge.succeeded",
            ChargeEvent::Failed => "charge.failed",
            ChargeEvent::Refunded => "charge.refunded",
            ChargeEvent::Captured => "charge.captured",
            ChargeEvent::DisputeCreated => "charge.dispute.created",
            ChargeEvent::DisputeUpdated => "charge.dispute.updated",
            ChargeEvent::DisputeWon => "charge.dispute.closed.won",
            ChargeEvent::DisputeLost => "charge.dispute.closed.lost",
        }
    }

    pub fn from_event_type(value: &str) -> Option<Self> {
        match value {
            "charge.succeeded" => Some(ChargeEvent::Succeeded),
            "charge.failed" => Some(ChargeEvent::Failed),
            "charge.refunded" => Some(ChargeEvent::Refunded),
            "charge.captured" => Some(ChargeEvent::Captured),
            "charge.dispute.created" => Some(ChargeEvent::DisputeCreated),
            "charge.dispute.updated" => Some(ChargeEvent::DisputeUpdated),
            "charge.dispute.closed.won" => Some(ChargeEvent::DisputeWon),
            "charge.dispute.closed.lost" => Some(ChargeEvent::DisputeLost),
            _ => None,
        }
    }
}

/// Card metadata echoed on receipts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReceiptInfo {
    pub last4: Option<i32>,
    pub exp_date: Option<NaiveDate>,
    pub card_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PaymentRequest<'a> {
    pub price: Price,
    pub token: &'a str,
    pub customer: &'a Organization,
    pub provider: &'a Organization,
    pub broker_fee_amount: i64,
    pub descr: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PaymentReceipt {
    pub processor_key: String,
    pub created_at: DateTime<Utc>,
    pub receipt: ReceiptInfo,
    /// Funds were captured synchronously; otherwise a later event settles
    /// the charge.
    pub settled: bool,
}

/// Processor's breakdown of a charge after `refunded` minor units were
/// given back.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChargeDistribution {
    pub distribute: Price,
    pub processor_fee: Price,
    pub broker_fee: Price,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transfer {
    pub transfer_id: String,
    pub created_at: DateTime<Utc>,
}

/// key: processor-backend -> payments, distribution, refunds, transfers
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    async fn create_payment(&self, request: &PaymentRequest<'_>) -> Result<PaymentReceipt, ProcessorError>;

    async fn charge_distribution(
        &self,
        charge: &Charge,
        refunded: i64,
    ) -> Result<ChargeDistribution, ProcessorError>;

    async fn refund_charge(
        &self,
        charge: &Charge,
        amount: i64,
        broker_amount: i64,
    ) -> Result<(), ProcessorError>;

    /// Total the processor has given back on `charge`, whoever issued it.
    async fn refunded_amount(&self, charge: &Charge) -> Result<i64, ProcessorError>;

    async fn create_transfer(
        &self,
        provider: &Organization,
        price: &Price,
        descr: &str,
    ) -> Result<Transfer, ProcessorError>;

    /// Latest state of `charge` on the processor side.
    async fn retrieve_charge(&self, charge: &Charge) -> Result<ChargeEvent, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_round_trip() {
        for event in [
            ChargeEvent::Succeeded,
            ChargeEvent::Failed,
            ChargeEvent::Refunded,
            ChargeEvent::Captured,
            ChargeEvent::DisputeCreated,
            ChargeEvent::DisputeUpdated,
            ChargeEvent::DisputeWon,
            ChargeEvent::DisputeLost,
        ] {
            assert_eq!(ChargeEvent::from_event_type(event.as_str()), Some(event));
        }
        assert_eq!(ChargeEvent::from_event_type("invoice.paid"), None);
    }

    #[test]
    fn only_backend_errors_retry() {
        assert!(ProcessorError::Backend("timeout".into()).is_retryable());
        assert!(!ProcessorError::Setup {
            provider: "cowork".into()
        }
        .is_retryable());
        assert!(!ProcessorError::Card {
            code: "card_declined".into(),
            charge_processor_key: None
        }
        .is_retryable());
    }
}
