use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

use super::distribution::{convert, refund_delta, split_distribution, split_proportionally, Shares};
use super::models::{Charge, ChargeItem, ChargeState};
use super::store::{self, NewCharge};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, Account, BalanceQuery, NewTransaction, Transaction};
use crate::money::{as_money, Price};
use crate::organizations::{self, BillingParties, Organization};
use crate::processor::{ChargeDistribution, ChargeEvent, PaymentRequest, Processor, ProcessorError, ReceiptInfo};
use crate::signals::{BillingSignal, SignalSink};
use crate::{plans, subscriptions};

const CHARGEBACK_DESCR: &str = "Chargeback";
const CHARGEBACK_REVERSAL_DESCR: &str = "Reversal of chargeback";
const DISPUTE_FEE_DESCR: &str = "Dispute fee";

/// Outcome of one `complete_charges` sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub settled: usize,
    pub failed: usize,
    pub pending: usize,
    pub errors: usize,
}

/// Conversion between the unit the processor settles in and the charge unit.
#[derive(Clone, Debug)]
struct UnitBridge {
    unit: String,
    charge_unit: String,
    from_total: i64,
    to_total: i64,
}

impl UnitBridge {
    fn new(charge: &Charge, distribution: &ChargeDistribution, charge_net: i64) -> Self {
        Self {
            unit: distribution.distribute.unit.clone(),
            charge_unit: charge.unit.clone(),
            from_total: Shares::from_distribution(distribution).total(),
            to_total: charge_net,
        }
    }

    fn settled(&self, amount: i64) -> Price {
        Price::new(amount, self.unit.clone())
    }

    fn in_charge_unit(&self, amount: i64) -> Price {
        if self.unit == self.charge_unit {
            Price::new(amount, self.charge_unit.clone())
        } else {
            Price::new(convert(amount, self.from_total, self.to_total), self.charge_unit.clone())
        }
    }
}

/// key: charge-state-machine -> distribution, refunds, disputes
pub struct ChargeService {
    pool: PgPool,
    processor: Arc<dyn Processor>,
    signals: Arc<dyn SignalSink>,
    config: BillingConfig,
}

impl ChargeService {
    pub fn new(
        pool: PgPool,
        processor: Arc<dyn Processor>,
        signals: Arc<dyn SignalSink>,
        config: BillingConfig,
    ) -> Self {
        Self {
            pool,
            processor,
            signals,
            config,
        }
    }

    pub fn processor(&self) -> &Arc<dyn Processor> {
        &self.processor
    }

    pub fn signals(&self) -> &Arc<dyn SignalSink> {
        &self.signals
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Charges `customer` for `invoiceables` and, when the processor
    /// captures synchronously, distributes the funds right away.
    ///
    /// A declined card is recorded as a failed charge before the error is
    /// returned, so callers must commit even on `ProcessorError::Card`.
    pub async fn charge_card(
        &self,
        conn: &mut PgConnection,
        customer: &Organization,
        invoiceables: &[Transaction],
        token: Option<&str>,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        let first = invoiceables
            .first()
            .ok_or_else(|| BillingError::integrity(format!("nothing to charge for {}", customer.slug)))?;
        let mut price = Price::zero(first.dest_unit.clone());
        for invoiced in invoiceables {
            price = price.checked_add(&invoiced.dest_price())?;
        }
        let broker_fee_amount = self.broker_fee_for(conn, invoiceables).await?;
        let provider_id = provider_for(conn, first).await?;
        let provider = organizations::get(conn, provider_id).await?;
        let parties = BillingParties::resolve(conn, &self.config).await?;
        let descr = charge_descr(invoiceables);

        let Some(token) = token.or(customer.processor_card_key.as_deref()) else {
            return Err(ProcessorError::Card {
                code: "missing_card".to_string(),
                charge_processor_key: None,
            }
            .into());
        };

        let request = PaymentRequest {
            price: price.clone(),
            token,
            customer,
            provider: &provider,
            broker_fee_amount,
            descr: descr.clone(),
        };
        let receipt = match self.processor.create_payment(&request).await {
            Ok(receipt) => receipt,
            Err(ProcessorError::Card {
                code,
                charge_processor_key,
            }) => {
                if let Some(processor_key) = charge_processor_key.as_deref() {
                    store::insert(
                        conn,
                        &NewCharge {
                            created_at: at_time,
                            price: &price,
                            broker_fee_amount,
                            customer_id: customer.id,
                            processor_id: parties.processor.id,
                            processor_key,
                            descr: &descr,
                            state: ChargeState::Failed,
                            receipt: &ReceiptInfo::default(),
                        },
                    )
                    .await?;
                }
                warn!(customer = %customer.slug, code = %code, amount = price.amount, "card declined");
                return Err(ProcessorError::Card {
                    code,
                    charge_processor_key,
                }
                .into());
            }
            Err(ProcessorError::Setup { provider }) => {
                self.signals
                    .emit(BillingSignal::ProcessorSetupError {
                        provider: provider.clone(),
                    })
                    .await;
                return Err(ProcessorError::Setup { provider }.into());
            }
            Err(err) => return Err(err.into()),
        };

        let charge = store::insert(
            conn,
            &NewCharge {
                created_at: at_time,
                price: &price,
                broker_fee_amount,
                customer_id: customer.id,
                processor_id: parties.processor.id,
                processor_key: &receipt.processor_key,
                descr: &descr,
                state: ChargeState::Created,
                receipt: &receipt.receipt,
            },
        )
        .await?;
        for invoiced in invoiceables {
            store::insert_item(conn, charge.id, invoiced.id).await?;
        }
        info!(
            charge = %charge.processor_key,
            customer = %customer.slug,
            amount = charge.amount,
            unit = %charge.unit,
            nb_items = invoiceables.len(),
            "charge created"
        );

        if receipt.settled {
            self.payment_successful(conn, charge.id, Some(&receipt.receipt), at_time)
                .await
        } else {
            Ok(charge)
        }
    }

    async fn broker_fee_for(&self, conn: &mut PgConnection, invoiceables: &[Transaction]) -> BillingResult<i64> {
        let mut fee_by_plan: HashMap<i64, plans::Plan> = HashMap::new();
        let mut total = 0;
        for invoiced in invoiceables {
            let Some(subscription_id) = invoiced.event().and_then(|event| event.subscription_id()) else {
                continue;
            };
            let subscription = subscriptions::get(conn, subscription_id).await?;
            if !fee_by_plan.contains_key(&subscription.plan_id) {
                let plan = plans::get(conn, subscription.plan_id).await?;
                fee_by_plan.insert(subscription.plan_id, plan);
            }
            if let Some(plan) = fee_by_plan.get(&subscription.plan_id) {
                total += plan.broker_fee(invoiced.dest_amount);
            }
        }
        Ok(total)
    }

    /// Settles a captured charge: flips it to `Done`, then posts the
    /// customer payment and the per-item fee and distribution legs.
    pub async fn payment_successful(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        receipt: Option<&ReceiptInfo>,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Created).await?;
        let charge = store::transition(conn, charge_id, ChargeState::Created, ChargeState::Done, receipt).await?;

        let distribution = self.processor.charge_distribution(&charge, 0).await?;
        let parties = BillingParties::resolve(conn, &self.config).await?;
        let processor_id = parties.processor.id;
        let broker_id = parties.broker.id;
        let (items, invoiced) = load_items(conn, &charge).await?;

        let mut invoiced_total = Price::zero(charge.unit.clone());
        for line in &invoiced {
            invoiced_total = invoiced_total.checked_add(&line.dest_price())?;
        }
        if !invoiced_total.is_zero() && invoiced_total.unit != charge.unit {
            return Err(BillingError::MixedUnits {
                units: vec![invoiced_total.unit, charge.unit.clone()],
            });
        }
        if invoiced_total.amount > charge.amount {
            return Err(BillingError::integrity(format!(
                "charge {} invoices {} but only collected {}",
                charge.processor_key,
                invoiced_total,
                charge.price()
            )));
        }

        self.post(
            conn,
            NewTransaction::transfer(
                at_time,
                (processor_id, Account::Funds),
                (charge.customer_id, Account::Liability),
                &charge.price(),
                format!("Charge {} for {}", charge.processor_key, charge.descr),
            )
            .with_event(&charge.event()),
        )
        .await?;

        let bridge = UnitBridge::new(&charge, &distribution, charge.amount);
        let amounts = invoiced.iter().map(|line| line.dest_amount).collect::<Vec<_>>();
        let shares = split_distribution(Shares::from_distribution(&distribution), &amounts, charge.amount);

        for ((item, line), share) in items.iter().zip(&invoiced).zip(shares) {
            if line.dest_account == Account::Payable {
                if let Some(event) = line.event() {
                    let payable = ledger::get_balance(
                        conn,
                        &BalanceQuery::account(line.dest_organization_id, Account::Payable)
                            .for_event(&event)
                            .through(at_time),
                    )
                    .await?;
                    let moved = payable.amount.min(line.dest_amount);
                    if moved > 0 {
                        self.post(
                            conn,
                            NewTransaction::transfer(
                                at_time,
                                (charge.customer_id, Account::Liability),
                                (line.dest_organization_id, Account::Payable),
                                &Price::new(moved, line.dest_unit.clone()),
                                line.descr.clone(),
                            )
                            .with_event_id(line.event_id.clone()),
                        )
                        .await?;
                    }
                }
            }

            let provider_id = provider_for(conn, line).await?;
            let mut processor_fee_id = None;
            let mut broker_fee_id = None;

            if share.processor_fee > 0 {
                let leg = self
                    .post(
                        conn,
                        NewTransaction::transfer(
                            at_time,
                            (provider_id, Account::Expenses),
                            (processor_id, Account::Backlog),
                            &bridge.settled(share.processor_fee),
                            format!("Processor fee for {}", line.descr),
                        )
                        .with_event_id(line.event_id.clone()),
                    )
                    .await?;
                processor_fee_id = Some(leg.id);
            }

            if share.broker_fee > 0 {
                self.post(
                    conn,
                    NewTransaction::transfer(
                        at_time,
                        (provider_id, Account::Expenses),
                        (broker_id, Account::Backlog),
                        &bridge.settled(share.broker_fee),
                        format!("Broker fee for {}", line.descr),
                    )
                    .with_event_id(line.event_id.clone()),
                )
                .await?;
                let leg = self
                    .post(
                        conn,
                        NewTransaction::transfer(
                            at_time,
                            (broker_id, Account::Funds),
                            (processor_id, Account::Funds),
                            &bridge.settled(share.broker_fee),
                            format!("Broker fee for {}", line.descr),
                        )
                        .with_orig(&bridge.in_charge_unit(share.broker_fee))
                        .with_event_id(line.event_id.clone()),
                    )
                    .await?;
                broker_fee_id = Some(leg.id);
            }

            self.post(
                conn,
                NewTransaction::transfer(
                    at_time,
                    (provider_id, Account::Receivable),
                    (provider_id, Account::Backlog),
                    &line.dest_price(),
                    format!("Paid {}", line.descr),
                )
                .with_event_id(line.event_id.clone()),
            )
            .await?;
            let distribute = self
                .post(
                    conn,
                    NewTransaction::transfer(
                        at_time,
                        (provider_id, Account::Funds),
                        (processor_id, Account::Funds),
                        &bridge.settled(share.distribute),
                        format!("Funds from {} for {}", charge.processor_key, line.descr),
                    )
                    .with_orig(&bridge.in_charge_unit(share.distribute))
                    .with_event_id(line.event_id.clone()),
                )
                .await?;

            store::link_item_legs(conn, item.id, processor_fee_id, broker_fee_id, Some(distribute.id)).await?;
        }

        organizations::reset_renewal_attempts(conn, charge.customer_id).await?;
        info!(
            charge = %charge.processor_key,
            distribute = distribution.distribute.amount,
            processor_fee = distribution.processor_fee.amount,
            broker_fee = distribution.broker_fee.amount,
            "charge distributed"
        );
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    pub async fn payment_failed(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        receipt: Option<&ReceiptInfo>,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Created).await?;
        let charge = store::transition(conn, charge_id, ChargeState::Created, ChargeState::Failed, receipt).await?;
        info!(charge = %charge.processor_key, "charge failed");
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    /// Refunds `refunded_amount` (the whole unrefunded line by default) of
    /// the charge item `line`.
    pub async fn refund(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        line: i64,
        refunded_amount: Option<i64>,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Vec<Transaction>> {
        let charge = store::lock(conn, charge_id, ChargeState::Done).await?;
        if charge.state != ChargeState::Done {
            return Err(BillingError::InvalidRefund(format!(
                "charge {} is {}",
                charge.processor_key,
                charge.state.as_str()
            )));
        }
        let (items, invoiced) = load_items(conn, &charge).await?;
        let mut charge_refunded = 0;
        let mut target = None;
        for (item, invoiced) in items.iter().zip(&invoiced) {
            let refunded = refunded_for_item(conn, &charge, item).await?;
            charge_refunded += refunded;
            if item.id == line {
                target = Some((item, invoiced, refunded));
            }
        }
        let (item, invoiced, item_refunded) = target.ok_or(BillingError::NotFound("charge item"))?;

        let available = invoiced.dest_amount - item_refunded;
        let amount = refunded_amount.unwrap_or(available);
        if amount <= 0 || amount > available {
            return Err(BillingError::InvalidRefund(format!(
                "cannot refund {} on line {line} of {} ({} available)",
                as_money(amount, &charge.unit),
                charge.processor_key,
                as_money(available, &charge.unit)
            )));
        }

        let before = self.processor.charge_distribution(&charge, charge_refunded).await?;
        let after = self
            .processor
            .charge_distribution(&charge, charge_refunded + amount)
            .await?;
        let delta = refund_delta(&before, &after)?;
        let bridge = UnitBridge::new(&charge, &before, charge.amount - charge_refunded);

        let provider_id = provider_for(conn, invoiced).await?;
        ensure_funds(conn, provider_id, &bridge.settled(delta.distribute)).await?;
        self.processor.refund_charge(&charge, amount, delta.broker_fee).await?;

        let postings = self
            .create_refund_transactions(
                conn,
                &charge,
                item,
                invoiced,
                amount,
                delta,
                &bridge,
                Account::Refund,
                at_time,
            )
            .await?;
        info!(
            charge = %charge.processor_key,
            line,
            amount,
            distribute = delta.distribute,
            "charge item refunded"
        );
        self.signal_update(&charge, at_time).await;
        Ok(postings)
    }

    /// Mirror-image postings of a refund or chargeback on one charge item.
    /// `account` is `Refund` or `Chargeback`.
    #[allow(clippy::too_many_arguments)]
    async fn create_refund_transactions(
        &self,
        conn: &mut PgConnection,
        charge: &Charge,
        item: &ChargeItem,
        invoiced: &Transaction,
        refunded_amount: i64,
        delta: Shares,
        bridge: &UnitBridge,
        account: Account,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Vec<Transaction>> {
        let parties = BillingParties::resolve(conn, &self.config).await?;
        let processor_id = parties.processor.id;
        let broker_id = parties.broker.id;
        let provider_id = provider_for(conn, invoiced).await?;
        let event = charge.line_event(item.id);
        let label = if account == Account::Chargeback {
            CHARGEBACK_DESCR
        } else {
            "Refund"
        };
        let descr = format!("{label} of {} for {}", charge.processor_key, invoiced.descr);
        let refunded = Price::new(refunded_amount, charge.unit.clone());

        let mut legs = vec![NewTransaction::transfer(
            at_time,
            (provider_id, account),
            (charge.customer_id, Account::Refunded),
            &refunded,
            descr.clone(),
        )];
        if delta.distribute > 0 {
            legs.push(
                NewTransaction::transfer(
                    at_time,
                    (processor_id, Account::Funds),
                    (provider_id, Account::Funds),
                    &bridge.in_charge_unit(delta.distribute),
                    descr.clone(),
                )
                .with_orig(&bridge.settled(delta.distribute)),
            );
        }
        if delta.broker_fee > 0 {
            legs.push(
                NewTransaction::transfer(
                    at_time,
                    (processor_id, Account::Funds),
                    (broker_id, Account::Funds),
                    &bridge.in_charge_unit(delta.broker_fee),
                    descr.clone(),
                )
                .with_orig(&bridge.settled(delta.broker_fee)),
            );
        }
        if delta.processor_fee > 0 {
            legs.push(NewTransaction::transfer(
                at_time,
                (processor_id, Account::Backlog),
                (provider_id, Account::Expenses),
                &bridge.settled(delta.processor_fee),
                descr.clone(),
            ));
        }
        if delta.broker_fee > 0 {
            legs.push(NewTransaction::transfer(
                at_time,
                (broker_id, Account::Backlog),
                (provider_id, Account::Expenses),
                &bridge.settled(delta.broker_fee),
                descr.clone(),
            ));
        }
        legs.push(NewTransaction::transfer(
            at_time,
            (provider_id, Account::Backlog),
            (provider_id, account),
            &refunded,
            descr,
        ));

        let mut posted = Vec::with_capacity(legs.len());
        for leg in legs {
            posted.push(self.post(conn, leg.with_event(&event)).await?);
        }
        Ok(posted)
    }

    /// Takes back everything not yet refunded on the charge and bills the
    /// dispute fee. The provider's funds balance may go negative here; the
    /// chargeback is posted whatever the provider holds.
    pub async fn dispute_created(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Done).await?;
        let charge = store::transition(conn, charge_id, ChargeState::Done, ChargeState::Disputed, None).await?;

        let (items, invoiced) = load_items(conn, &charge).await?;
        let mut remaining = Vec::with_capacity(items.len());
        let mut charge_refunded = 0;
        for (item, line) in items.iter().zip(&invoiced) {
            let refunded = refunded_for_item(conn, &charge, item).await?;
            charge_refunded += refunded;
            remaining.push((line.dest_amount - refunded).max(0));
        }
        let disputed: i64 = remaining.iter().sum();

        if disputed > 0 {
            let before = self.processor.charge_distribution(&charge, charge_refunded).await?;
            let after = self.processor.charge_distribution(&charge, charge.amount).await?;
            let delta = refund_delta(&before, &after)?;
            let bridge = UnitBridge::new(&charge, &before, charge.amount - charge_refunded);
            let processor_fees = split_proportionally(delta.processor_fee, &remaining, disputed);
            let broker_fees = split_proportionally(delta.broker_fee, &remaining, disputed);
            let distributes = split_proportionally(delta.distribute, &remaining, disputed);

            for (idx, (item, line)) in items.iter().zip(&invoiced).enumerate() {
                if remaining[idx] == 0 {
                    continue;
                }
                let share = Shares {
                    processor_fee: processor_fees[idx],
                    broker_fee: broker_fees[idx],
                    distribute: distributes[idx],
                };
                self.create_refund_transactions(
                    conn,
                    &charge,
                    item,
                    line,
                    remaining[idx],
                    share,
                    &bridge,
                    Account::Chargeback,
                    at_time,
                )
                .await?;
            }
        }

        if let Some(line) = invoiced.first() {
            self.charge_dispute_fee(conn, &charge, line, at_time).await?;
        }
        warn!(charge = %charge.processor_key, disputed, "charge disputed");
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    /// Posts refunds issued on the processor side that the ledger does not
    /// know about yet. The missing amount is taken from the charge items in
    /// order, each up to what is left on it. Returns `None` when the ledger
    /// already agrees with the processor.
    pub async fn sync_refunds(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Option<Charge>> {
        let charge = store::lock(conn, charge_id, ChargeState::Done).await?;
        if charge.state != ChargeState::Done {
            return Ok(None);
        }
        let processor_refunded = self.processor.refunded_amount(&charge).await?;
        let (items, invoiced) = load_items(conn, &charge).await?;
        let mut available = Vec::with_capacity(items.len());
        let mut charge_refunded = 0;
        for (item, line) in items.iter().zip(&invoiced) {
            let refunded = refunded_for_item(conn, &charge, item).await?;
            charge_refunded += refunded;
            available.push((line.dest_amount - refunded).max(0));
        }
        let mut missing = processor_refunded - charge_refunded;
        if missing <= 0 {
            debug!(
                charge = %charge.processor_key,
                processor_refunded,
                ledger_refunded = charge_refunded,
                "refunds already recorded"
            );
            return Ok(None);
        }

        for (idx, (item, line)) in items.iter().zip(&invoiced).enumerate() {
            let amount = missing.min(available[idx]);
            if amount <= 0 {
                continue;
            }
            let before = self.processor.charge_distribution(&charge, charge_refunded).await?;
            let after = self
                .processor
                .charge_distribution(&charge, charge_refunded + amount)
                .await?;
            let delta = refund_delta(&before, &after)?;
            let bridge = UnitBridge::new(&charge, &before, charge.amount - charge_refunded);
            self.create_refund_transactions(
                conn,
                &charge,
                item,
                line,
                amount,
                delta,
                &bridge,
                Account::Refund,
                at_time,
            )
            .await?;
            charge_refunded += amount;
            missing -= amount;
            if missing == 0 {
                break;
            }
        }
        if missing > 0 {
            warn!(
                charge = %charge.processor_key,
                missing,
                "processor refunded more than the charge items hold"
            );
        }
        info!(
            charge = %charge.processor_key,
            processor_refunded,
            ledger_refunded = charge_refunded,
            "processor refunds recorded"
        );
        self.signal_update(&charge, at_time).await;
        Ok(Some(charge))
    }

    async fn charge_dispute_fee(
        &self,
        conn: &mut PgConnection,
        charge: &Charge,
        line: &Transaction,
        at_time: DateTime<Utc>,
    ) -> BillingResult<()> {
        let fee = self.config.dispute_fee_amount;
        if fee <= 0 {
            return Ok(());
        }
        let already_charged = ledger::store::by_event(conn, &charge.event())
            .await?
            .iter()
            .any(|txn| txn.descr.starts_with(DISPUTE_FEE_DESCR) && txn.dest_account == Account::Expenses);
        if already_charged {
            debug!(charge = %charge.processor_key, "dispute fee already charged");
            return Ok(());
        }

        let parties = BillingParties::resolve(conn, &self.config).await?;
        let provider_id = provider_for(conn, line).await?;
        let price = Price::new(fee, charge.unit.clone());
        let descr = format!("{DISPUTE_FEE_DESCR} for {}", charge.processor_key);
        self.post(
            conn,
            NewTransaction::transfer(
                at_time,
                (provider_id, Account::Expenses),
                (parties.processor.id, Account::Backlog),
                &price,
                descr.clone(),
            )
            .with_event(&charge.event()),
        )
        .await?;
        self.post(
            conn,
            NewTransaction::transfer(
                at_time,
                (parties.processor.id, Account::Funds),
                (provider_id, Account::Funds),
                &price,
                descr,
            )
            .with_event(&charge.event()),
        )
        .await?;
        Ok(())
    }

    pub async fn dispute_updated(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Disputed).await?;
        let charge =
            store::transition(conn, charge_id, ChargeState::Disputed, ChargeState::Disputed, None).await?;
        info!(charge = %charge.processor_key, "dispute updated");
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    /// Dispute closed in the provider's favor: the chargeback legs that are
    /// still outstanding are reversed.
    pub async fn dispute_won(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Disputed).await?;
        let charge = store::transition(conn, charge_id, ChargeState::Disputed, ChargeState::Done, None).await?;

        let rows = ledger::store::by_event(conn, &charge.event()).await?;
        let mut reversed: HashMap<LegKey, usize> = HashMap::new();
        for row in rows.iter().filter(|row| row.descr.starts_with(CHARGEBACK_REVERSAL_DESCR)) {
            *reversed.entry(LegKey::swapped(row)).or_default() += 1;
        }
        let mut nb_reversed = 0;
        for row in rows.iter().filter(|row| row.descr.starts_with(CHARGEBACK_DESCR)) {
            if let Some(count) = reversed.get_mut(&LegKey::of(row)) {
                if *count > 0 {
                    *count -= 1;
                    continue;
                }
            }
            let reversal = NewTransaction {
                created_at: at_time,
                descr: format!("{CHARGEBACK_REVERSAL_DESCR}: {}", row.descr),
                event_id: row.event_id.clone(),
                orig_organization_id: row.dest_organization_id,
                orig_account: row.dest_account,
                orig_amount: row.dest_amount,
                orig_unit: row.dest_unit.clone(),
                dest_organization_id: row.orig_organization_id,
                dest_account: row.orig_account,
                dest_amount: row.orig_amount,
                dest_unit: row.orig_unit.clone(),
                nb_periods: None,
                period_type: None,
            };
            self.post(conn, reversal).await?;
            nb_reversed += 1;
        }
        info!(charge = %charge.processor_key, nb_reversed, "dispute won");
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    pub async fn dispute_lost(
        &self,
        conn: &mut PgConnection,
        charge_id: i64,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Charge> {
        store::lock(conn, charge_id, ChargeState::Disputed).await?;
        let charge = store::transition(conn, charge_id, ChargeState::Disputed, ChargeState::Failed, None).await?;
        warn!(charge = %charge.processor_key, "dispute lost");
        self.signal_update(&charge, at_time).await;
        Ok(charge)
    }

    /// Applies a processor event to `charge`. Events that do not apply to
    /// the current state are ignored so redelivered webhooks are harmless.
    pub async fn update_charge_state(
        &self,
        conn: &mut PgConnection,
        charge: &Charge,
        event: ChargeEvent,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Option<Charge>> {
        let updated = match (charge.state, event) {
            (ChargeState::Created, ChargeEvent::Succeeded | ChargeEvent::Captured) => {
                self.payment_successful(conn, charge.id, None, at_time).await?
            }
            (ChargeState::Created, ChargeEvent::Failed) => {
                self.payment_failed(conn, charge.id, None, at_time).await?
            }
            (ChargeState::Done, ChargeEvent::DisputeCreated) => {
                self.dispute_created(conn, charge.id, at_time).await?
            }
            (ChargeState::Done, ChargeEvent::Refunded) => {
                return self.sync_refunds(conn, charge.id, at_time).await;
            }
            (ChargeState::Disputed, ChargeEvent::DisputeUpdated) => {
                self.dispute_updated(conn, charge.id, at_time).await?
            }
            (ChargeState::Disputed, ChargeEvent::DisputeWon) => {
                self.dispute_won(conn, charge.id, at_time).await?
            }
            (ChargeState::Disputed, ChargeEvent::DisputeLost) => {
                self.dispute_lost(conn, charge.id, at_time).await?
            }
            (state, event) => {
                debug!(
                    charge = %charge.processor_key,
                    state = state.as_str(),
                    event = event.as_str(),
                    "event does not change charge state"
                );
                return Ok(None);
            }
        };
        Ok(Some(updated))
    }

    /// Applies `event` to the charge known as `processor_key` in its own
    /// database transaction.
    pub async fn apply_event(
        &self,
        processor_key: &str,
        event: ChargeEvent,
        at_time: DateTime<Utc>,
    ) -> BillingResult<Option<Charge>> {
        let mut tx = self.pool.begin().await?;
        let charge = store::by_processor_key(&mut tx, processor_key).await?;
        let updated = self.update_charge_state(&mut tx, &charge, event, at_time).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Polls the processor for every charge still in `Created` and applies
    /// what it reports. Each charge settles in its own transaction.
    pub async fn complete_charges(&self, at_time: DateTime<Utc>, dry_run: bool) -> BillingResult<CompletionReport> {
        let pending = {
            let mut conn = self.pool.acquire().await?;
            store::in_state(&mut conn, ChargeState::Created).await?
        };
        let mut report = CompletionReport::default();
        for charge in pending {
            let event = match self.processor.retrieve_charge(&charge).await {
                Ok(event) => event,
                Err(err) => {
                    warn!(?err, charge = %charge.processor_key, "failed to retrieve charge");
                    report.errors += 1;
                    continue;
                }
            };
            let outcome = async {
                let mut tx = self.pool.begin().await?;
                let updated = self.update_charge_state(&mut tx, &charge, event, at_time).await?;
                if dry_run {
                    tx.rollback().await?;
                } else {
                    tx.commit().await?;
                }
                Ok::<_, BillingError>(updated)
            }
            .await;
            match outcome {
                Ok(Some(updated)) if updated.state == ChargeState::Done => report.settled += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.pending += 1,
                Err(err) => {
                    warn!(?err, charge = %charge.processor_key, retryable = err.is_retryable(), "failed to complete charge");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Inserts `posting` and mirrors any Funds leg into the cached balances.
    async fn post(&self, conn: &mut PgConnection, posting: NewTransaction) -> BillingResult<Transaction> {
        let transaction = ledger::store::insert(conn, &posting).await?;
        apply_funds(conn, &transaction).await?;
        Ok(transaction)
    }

    async fn signal_update(&self, charge: &Charge, at_time: DateTime<Utc>) {
        self.signals
            .emit(BillingSignal::ChargeUpdated {
                charge_id: charge.id,
                processor_key: charge.processor_key.clone(),
                state: charge.state.as_str().to_string(),
                at_time,
            })
            .await;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LegKey {
    dest: (i64, Account, i64, String),
    orig: (i64, Account, i64, String),
    event_id: Option<String>,
}

impl LegKey {
    fn of(row: &Transaction) -> Self {
        Self {
            dest: (row.dest_organization_id, row.dest_account, row.dest_amount, row.dest_unit.clone()),
            orig: (row.orig_organization_id, row.orig_account, row.orig_amount, row.orig_unit.clone()),
            event_id: row.event_id.clone(),
        }
    }

    fn swapped(row: &Transaction) -> Self {
        let key = Self::of(row);
        Self {
            dest: key.orig,
            orig: key.dest,
            event_id: key.event_id,
        }
    }
}

/// Keeps the cached `funds_balance` in step with a posting's Funds legs.
pub async fn apply_funds(conn: &mut PgConnection, transaction: &Transaction) -> BillingResult<()> {
    if transaction.dest_account == Account::Funds && transaction.dest_amount != 0 {
        organizations::adjust_funds_balance(
            conn,
            transaction.dest_organization_id,
            transaction.dest_amount,
            &transaction.dest_unit,
        )
        .await?;
    }
    if transaction.orig_account == Account::Funds && transaction.orig_amount != 0 {
        organizations::adjust_funds_balance(
            conn,
            transaction.orig_organization_id,
            -transaction.orig_amount,
            &transaction.orig_unit,
        )
        .await?;
    }
    Ok(())
}

async fn ensure_funds(conn: &mut PgConnection, provider_id: i64, needed: &Price) -> BillingResult<()> {
    let provider = organizations::get(conn, provider_id).await?;
    if needed.amount > 0 && provider.funds_balance < needed.amount {
        warn!(
            organization = %provider.slug,
            requested = needed.amount,
            available = provider.funds_balance,
            "insufficient funds for refund"
        );
        return Err(BillingError::InsufficientFunds {
            organization: provider.slug,
            requested: needed.amount,
            available: provider.funds_balance,
            unit: needed.unit.clone(),
        });
    }
    Ok(())
}

async fn load_items(
    conn: &mut PgConnection,
    charge: &Charge,
) -> BillingResult<(Vec<ChargeItem>, Vec<Transaction>)> {
    let items = store::items(conn, charge.id).await?;
    let mut invoiced = Vec::with_capacity(items.len());
    for item in &items {
        invoiced.push(ledger::store::get(conn, item.invoiced_id).await?);
    }
    Ok((items, invoiced))
}

/// Amount already given back on `item`, refunds and chargebacks alike.
async fn refunded_for_item(conn: &mut PgConnection, charge: &Charge, item: &ChargeItem) -> BillingResult<i64> {
    let refunded: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(orig_amount), 0)::BIGINT FROM transactions
        WHERE orig_account = $1
          AND event_id = $2
        "#,
    )
    .bind(Account::Refunded.as_str())
    .bind(charge.line_event(item.id).to_string())
    .fetch_one(&mut *conn)
    .await?;
    let reversed: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(dest_amount), 0)::BIGINT FROM transactions
        WHERE dest_account = $1
          AND event_id = $2
        "#,
    )
    .bind(Account::Refunded.as_str())
    .bind(charge.line_event(item.id).to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(refunded - reversed)
}

/// Organization that receives the revenue for an invoiced line.
pub(crate) async fn provider_for(conn: &mut PgConnection, invoiced: &Transaction) -> BillingResult<i64> {
    if invoiced.orig_account == Account::Receivable {
        return Ok(invoiced.orig_organization_id);
    }
    let event = invoiced
        .event()
        .ok_or_else(|| BillingError::integrity(format!("line {} has no event to find its provider", invoiced.id)))?;
    ledger::store::by_event(conn, &event)
        .await?
        .into_iter()
        .find(|txn| {
            txn.event_id == invoiced.event_id
                && txn.dest_account == Account::Payable
                && txn.orig_account == Account::Receivable
        })
        .map(|order| order.orig_organization_id)
        .ok_or_else(|| BillingError::integrity(format!("no order behind line {}", invoiced.id)))
}

fn charge_descr(invoiceables: &[Transaction]) -> String {
    match invoiceables {
        [single] => single.descr.clone(),
        many => format!("{} items", many.len()),
    }
}
