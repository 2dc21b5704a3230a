use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// key: billing-signals -> notifications raised by the billing engine
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingSignal {
    ExpiresSoon {
        organization_id: i64,
        subscription_ids: Vec<i64>,
        nb_days: i64,
    },
    UpgradeSoon {
        organization_id: i64,
        subscription_ids: Vec<i64>,
        nb_days: i64,
    },
    CardExpiresSoon {
        organization_id: i64,
        nb_days: i64,
    },
    RenewalChargeFailed {
        organization_id: i64,
        nb_attempts: i32,
        final_notice: bool,
        code: String,
    },
    ManualReview {
        organization_id: i64,
        amount: i64,
        unit: String,
    },
    ProcessorSetupError {
        provider: String,
    },
    ChargeUpdated {
        charge_id: i64,
        processor_key: String,
        state: String,
        at_time: DateTime<Utc>,
    },
}

impl BillingSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingSignal::ExpiresSoon { .. } => "expires_soon",
            BillingSignal::UpgradeSoon { .. } => "upgrade_soon",
            BillingSignal::CardExpiresSoon { .. } => "card_expires_soon",
            BillingSignal::RenewalChargeFailed { .. } => "renewal_charge_failed",
            BillingSignal::ManualReview { .. } => "manual_review",
            BillingSignal::ProcessorSetupError { .. } => "processor_setup_error",
            BillingSignal::ChargeUpdated { .. } => "charge_updated",
        }
    }
}

/// Destination for billing signals (mailer, queue, audit log).
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn emit(&self, signal: BillingSignal);
}

/// Default sink: one structured log line per signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSignalSink;

#[async_trait]
impl SignalSink for TracingSignalSink {
    async fn emit(&self, signal: BillingSignal) {
        let payload = serde_json::to_value(&signal).unwrap_or_default();
        match signal {
            BillingSignal::ProcessorSetupError { .. } | BillingSignal::RenewalChargeFailed { .. } => {
                warn!(signal = signal.kind(), %payload, "billing signal")
            }
            _ => info!(signal = signal.kind(), %payload, "billing signal"),
        }
    }
}

/// Sink that keeps every signal in memory.
#[derive(Default)]
pub struct RecordingSignalSink {
    signals: tokio::sync::Mutex<Vec<BillingSignal>>,
}

impl RecordingSignalSink {
    pub async fn take(&self) -> Vec<BillingSignal> {
        std::mem::take(&mut *self.signals.lock().await)
    }
}

#[async_trait]
impl SignalSink for RecordingSignalSink {
    async fn emit(&self, signal: BillingSignal) {
        self.signals.lock().await.push(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_keeps_signals_in_order() {
        let sink = RecordingSignalSink::default();
        sink.emit(BillingSignal::ProcessorSetupError {
            provider: "cowork".into(),
        })
        .await;
        sink.emit(BillingSignal::CardExpiresSoon {
            organization_id: 1,
            nb_days: 7,
        })
        .await;
        let signals = sink.take().await;
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].kind(), "processor_setup_error");
        assert!(sink.take().await.is_empty());
    }

    #[test]
    fn signals_serialize_with_kind_tag() {
        let value = serde_json::to_value(BillingSignal::ManualReview {
            organization_id: 3,
            amount: 4000,
            unit: "usd".into(),
        })
        .unwrap();
        assert_eq!(value["kind"], "manual_review");
        assert_eq!(value["amount"], 4000);
    }
}
