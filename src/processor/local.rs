use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ChargeDistribution, ChargeEvent, PaymentReceipt, PaymentRequest, Processor, ProcessorError,
    ReceiptInfo, Transfer,
};
use crate::charges::Charge;
use crate::config::BillingConfig;
use crate::money::Price;
use crate::organizations::Organization;

#[derive(Clone, Debug)]
struct LocalCharge {
    amount: i64,
    refunded: i64,
    broker_fee_amount: i64,
    state: ChargeEvent,
}

/// key: processor-local -> in-process sandbox
///
/// Fees follow a basis-point model (`round(net * bps / 10000) + fixed`).
/// Tokens starting with `tok_decline`, `tok_setup` or `tok_error` fail with
/// the matching [`ProcessorError`].
#[derive(Debug)]
pub struct LocalProcessor {
    fee_bps: i64,
    fee_fixed: i64,
    charges: DashMap<String, LocalCharge>,
    transfers: DashMap<String, Price>,
}

impl LocalProcessor {
    pub fn new(fee_bps: i64, fee_fixed: i64) -> Self {
        Self {
            fee_bps,
            fee_fixed,
            charges: DashMap::new(),
            transfers: DashMap::new(),
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(config.processor_fee_bps, config.processor_fee_fixed)
    }

    /// Moves a sandbox charge to `state`, as the processor would before
    /// sending the matching webhook.
    pub fn set_state(&self, processor_key: &str, state: ChargeEvent) -> Result<(), ProcessorError> {
        let mut charge = self
            .charges
            .get_mut(processor_key)
            .ok_or_else(|| ProcessorError::Backend(format!("no such charge {processor_key}")))?;
        charge.state = state;
        Ok(())
    }

    pub fn refunded(&self, processor_key: &str) -> Option<i64> {
        self.charges.get(processor_key).map(|charge| charge.refunded)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    fn processor_fee(&self, net: i64) -> i64 {
        if net <= 0 {
            return 0;
        }
        (net * self.fee_bps + 5_000) / 10_000 + self.fee_fixed
    }

    /// Breakdown of `amount - refunded` with the broker fee scaled down in
    /// proportion to what was refunded.
    pub fn distribution_for(
        &self,
        amount: i64,
        broker_fee_amount: i64,
        refunded: i64,
        unit: &str,
    ) -> ChargeDistribution {
        let net = (amount - refunded).max(0);
        let broker_fee = if amount > 0 {
            broker_fee_amount * net / amount
        } else {
            0
        };
        let processor_fee = self.processor_fee(net).min(net - broker_fee);
        ChargeDistribution {
            distribute: Price::new(net - processor_fee - broker_fee, unit),
            processor_fee: Price::new(processor_fee, unit),
            broker_fee: Price::new(broker_fee, unit),
        }
    }
}

impl Default for LocalProcessor {
    fn default() -> Self {
        Self::from_config(&BillingConfig::default())
    }
}

#[async_trait]
impl Processor for LocalProcessor {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_payment(&self, request: &PaymentRequest<'_>) -> Result<PaymentReceipt, ProcessorError> {
        let processor_key = format!("ch_{}", Uuid::new_v4().simple());
        if request.token.starts_with("tok_decline") {
            warn!(customer = %request.customer.slug, "sandbox card declined");
            return Err(ProcessorError::Card {
                code: "card_declined".to_string(),
                charge_processor_key: Some(processor_key),
            });
        }
        if request.token.starts_with("tok_setup") {
            return Err(ProcessorError::Setup {
                provider: request.provider.slug.clone(),
            });
        }
        if request.token.starts_with("tok_error") {
            return Err(ProcessorError::Backend("sandbox backend unavailable".to_string()));
        }
        if request.price.amount <= 0 {
            return Err(ProcessorError::Backend(format!(
                "cannot charge {}",
                request.price
            )));
        }

        self.charges.insert(
            processor_key.clone(),
            LocalCharge {
                amount: request.price.amount,
                refunded: 0,
                broker_fee_amount: request.broker_fee_amount,
                state: ChargeEvent::Succeeded,
            },
        );
        let created_at = Utc::now();
        info!(
            charge = %processor_key,
            customer = %request.customer.slug,
            amount = request.price.amount,
            unit = %request.price.unit,
            "sandbox payment captured"
        );
        Ok(PaymentReceipt {
            processor_key,
            created_at,
            receipt: ReceiptInfo {
                last4: Some(4242),
                exp_date: Some((created_at + Duration::days(730)).date_naive()),
                card_name: Some(request.customer.full_name.clone()),
            },
            settled: true,
        })
    }

    async fn charge_distribution(
        &self,
        charge: &Charge,
        refunded: i64,
    ) -> Result<ChargeDistribution, ProcessorError> {
        let broker_fee_amount = self
            .charges
            .get(&charge.processor_key)
            .map(|local| local.broker_fee_amount)
            .unwrap_or(charge.broker_fee_amount);
        Ok(self.distribution_for(charge.amount, broker_fee_amount, refunded, &charge.unit))
    }

    async fn refund_charge(
        &self,
        charge: &Charge,
        amount: i64,
        broker_amount: i64,
    ) -> Result<(), ProcessorError> {
        let mut local = self
            .charges
            .get_mut(&charge.processor_key)
            .ok_or_else(|| ProcessorError::Backend(format!("no such charge {}", charge.processor_key)))?;
        if amount <= 0 || local.refunded + amount > local.amount {
            return Err(ProcessorError::Backend(format!(
                "cannot refund {amount} on {} ({} already refunded)",
                charge.processor_key, local.refunded
            )));
        }
        local.refunded += amount;
        local.state = ChargeEvent::Refunded;
        debug!(charge = %charge.processor_key, amount, broker_amount, "sandbox refund");
        Ok(())
    }

    async fn refunded_amount(&self, charge: &Charge) -> Result<i64, ProcessorError> {
        self.refunded(&charge.processor_key)
            .ok_or_else(|| ProcessorError::Backend(format!("no such charge {}", charge.processor_key)))
    }

    async fn create_transfer(
        &self,
        provider: &Organization,
        price: &Price,
        descr: &str,
    ) -> Result<Transfer, ProcessorError> {
        if price.amount <= 0 {
            return Err(ProcessorError::Backend(format!("cannot transfer {price}")));
        }
        let transfer_id = format!("tr_{}", Uuid::new_v4().simple());
        self.transfers.insert(transfer_id.clone(), price.clone());
        info!(provider = %provider.slug, transfer = %transfer_id, amount = price.amount, descr, "sandbox transfer");
        Ok(Transfer {
            transfer_id,
            created_at: Utc::now(),
        })
    }

    async fn retrieve_charge(&self, charge: &Charge) -> Result<ChargeEvent, ProcessorError> {
        self.charges
            .get(&charge.processor_key)
            .map(|local| local.state)
            .ok_or_else(|| ProcessorError::Backend(format!("no such charge {}", charge.processor_key)))
    }
}
