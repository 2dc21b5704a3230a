use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{PgConnection, Postgres, Transaction as DbTransaction};
use tracing::{debug, info, warn};

use crate::charges::{ChargeService, CompletionReport};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, factory, Account, BalanceQuery, Transaction};
use crate::money::Price;
use crate::organizations::{self, Organization};
use crate::periods::{PeriodCalculator, PeriodType};
use crate::plans::{self, Plan, RenewalType};
use crate::processor::ProcessorError;
use crate::signals::BillingSignal;
use crate::subscriptions::{self, Subscription};

/// Tally of one batch phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PhaseReport {
    fn new(phase: &'static str) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }
}

impl From<CompletionReport> for PhaseReport {
    fn from(report: CompletionReport) -> Self {
        Self {
            phase: "complete_charges",
            processed: report.settled + report.failed,
            skipped: report.pending,
            failed: report.errors,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RenewalReport {
    pub dry_run: bool,
    pub phases: Vec<PhaseReport>,
    /// Phases that aborted, with the error that stopped them.
    pub errors: Vec<(&'static str, String)>,
}

impl RenewalReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|phase| phase.phase == name)
    }

    fn record(&mut self, phase: &'static str, outcome: BillingResult<PhaseReport>) {
        match outcome {
            Ok(report) => {
                info!(
                    phase,
                    processed = report.processed,
                    skipped = report.skipped,
                    failed = report.failed,
                    dry_run = self.dry_run,
                    "renewal phase finished"
                );
                self.phases.push(report);
            }
            Err(err) => {
                warn!(?err, phase, "renewal phase aborted");
                self.errors.push((phase, err.to_string()));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BalanceOutcome {
    Charged,
    Skipped,
    Declined,
}

/// Notice owed to a subscriber whose subscription ends soon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExpirationNotice {
    /// Renews automatically but the card on file will not cover it.
    CardExpiresSoon,
    /// Repeating plan that must be picked again to continue.
    UpgradeSoon,
    ExpiresSoon,
}

/// Picks the notice for one subscription, or `None` when the renewal will
/// go through on its own.
pub fn classify_notice(
    subscription: &Subscription,
    plan: &Plan,
    organization: &Organization,
) -> Option<ExpirationNotice> {
    if subscription.auto_renew && plan.renews() {
        let card_ok = organization.has_card() && !organization.card_expires_by(subscription.ends_at.date_naive());
        if card_ok {
            None
        } else {
            Some(ExpirationNotice::CardExpiresSoon)
        }
    } else if plan.renewal_type == RenewalType::Repeat {
        Some(ExpirationNotice::UpgradeSoon)
    } else {
        Some(ExpirationNotice::ExpiresSoon)
    }
}

/// One subscription order as seen by income recognition: what it cost and
/// how many plan periods it paid for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderSpan {
    pub amount: i64,
    pub nb_periods: i64,
}

/// Income earned by `window_end` on orders laid end to end from `anchor`.
/// An order is earned pro rata over the periods it covers.
pub fn recognizable_amount(periods: &PeriodCalculator, anchor: DateTime<Utc>, orders: &[OrderSpan], window_end: DateTime<Utc>) -> i64 {
    let mut start_index = 0_i64;
    let mut total = 0_i64;
    for order in orders {
        let nb_periods = order.nb_periods.max(1);
        let starts_at = periods.end_of_period(anchor, start_index);
        let ends_at = periods.end_of_period(anchor, start_index + nb_periods);
        start_index += nb_periods;
        if window_end >= ends_at {
            total += order.amount;
        } else if window_end > starts_at {
            let covered = periods.nb_periods(anchor, starts_at, window_end) / nb_periods as f64;
            total += (order.amount as f64 * covered.clamp(0.0, 1.0)).floor() as i64;
        }
    }
    total
}

/// key: billing-renewals -> periodic sweep over the ledger
pub struct RenewalEngine {
    charges: Arc<ChargeService>,
}

impl RenewalEngine {
    pub fn new(charges: Arc<ChargeService>) -> Self {
        Self { charges }
    }

    pub fn charges(&self) -> &Arc<ChargeService> {
        &self.charges
    }

    /// Runs every phase in order. A phase that aborts is reported and the
    /// next one still runs.
    pub async fn run_renewals(&self, at_time: DateTime<Utc>, dry_run: bool) -> RenewalReport {
        let mut report = RenewalReport {
            dry_run,
            ..RenewalReport::default()
        };
        report.record("recognize_income", self.recognize_income(at_time, dry_run).await);
        report.record("extend_subscriptions", self.extend_subscriptions(at_time, dry_run).await);
        report.record(
            "create_charges_for_balance",
            self.create_charges_for_balance(at_time, dry_run).await,
        );
        report.record(
            "complete_charges",
            self.charges
                .complete_charges(at_time, dry_run)
                .await
                .map(PhaseReport::from),
        );
        for nb_days in self.charges.config().expiration_notice_days.clone() {
            report.record(
                "trigger_expiration_notices",
                self.trigger_expiration_notices(at_time, nb_days, dry_run).await,
            );
        }
        report
    }

    async fn finish(tx: DbTransaction<'_, Postgres>, dry_run: bool) -> BillingResult<()> {
        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Posts the income earned by every accepted subscription up to `until`.
    /// Each subscription commits on its own.
    pub async fn recognize_income(&self, until: DateTime<Utc>, dry_run: bool) -> BillingResult<PhaseReport> {
        let mut report = PhaseReport::new("recognize_income");
        let candidates = {
            let mut conn = self.charges.pool().acquire().await?;
            subscriptions::valid_until(&mut conn, until).await?
        };
        for subscription in candidates {
            match self.recognize_one(&subscription, until, dry_run).await {
                Ok(0) => report.skipped += 1,
                Ok(nb_postings) => {
                    debug!(subscription = subscription.id, nb_postings, "income recognized");
                    report.processed += 1;
                }
                Err(err) => {
                    warn!(?err, subscription = subscription.id, "skipping income recognition");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn recognize_one(&self, subscription: &Subscription, until: DateTime<Utc>, dry_run: bool) -> BillingResult<usize> {
        let mut tx = self.charges.pool().begin().await?;
        let nb_postings = recognize_subscription_income(&mut tx, subscription, until).await?;
        Self::finish(tx, dry_run).await?;
        Ok(nb_postings)
    }

    /// Orders one more period for every auto-renewing subscription in the
    /// last day of its current period.
    pub async fn extend_subscriptions(&self, at_time: DateTime<Utc>, dry_run: bool) -> BillingResult<PhaseReport> {
        let mut report = PhaseReport::new("extend_subscriptions");
        let candidates = {
            let mut conn = self.charges.pool().acquire().await?;
            subscriptions::renewal_candidates(&mut conn, at_time).await?
        };
        for subscription in candidates {
            match self.extend_one(&subscription, at_time, dry_run).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    warn!(?err, subscription = subscription.id, "failed to extend subscription");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn extend_one(&self, subscription: &Subscription, at_time: DateTime<Utc>, dry_run: bool) -> BillingResult<bool> {
        let mut tx = self.charges.pool().begin().await?;
        let extended = extend_subscription(&mut tx, subscription, at_time).await?;
        Self::finish(tx, dry_run).await?;
        Ok(extended)
    }

    /// Charges the card on file of every organization with an invoiceable
    /// balance, up to the renewal-attempt cap.
    ///
    /// Every organization runs in its own transaction, committed before the
    /// next card is charged, so a capture is never left pending on work for
    /// another organization.
    pub async fn create_charges_for_balance(&self, until: DateTime<Utc>, dry_run: bool) -> BillingResult<PhaseReport> {
        let mut report = PhaseReport::new("create_charges_for_balance");
        let candidates = {
            let mut conn = self.charges.pool().acquire().await?;
            organizations::renewal_candidates(&mut conn, self.charges.config()).await?
        };
        for organization in candidates {
            match self.charge_organization(&organization, until, dry_run).await {
                Ok(BalanceOutcome::Charged) => report.processed += 1,
                Ok(BalanceOutcome::Skipped) => report.skipped += 1,
                Ok(BalanceOutcome::Declined) => report.failed += 1,
                Err(err) => {
                    warn!(
                        ?err,
                        organization = %organization.slug,
                        retryable = err.is_retryable(),
                        "skipping charge for balance"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn charge_organization(
        &self,
        organization: &Organization,
        until: DateTime<Utc>,
        dry_run: bool,
    ) -> BillingResult<BalanceOutcome> {
        let mut tx = self.charges.pool().begin().await?;
        let outcome = match self.charge_balance(&mut tx, organization, until, dry_run).await {
            Ok(true) => BalanceOutcome::Charged,
            Ok(false) => BalanceOutcome::Skipped,
            Err(BillingError::Processor(ProcessorError::Card { code, .. })) => {
                // The failed charge row stays; the attempt counter moves.
                self.record_card_failure(&mut tx, organization, until, &code).await?;
                BalanceOutcome::Declined
            }
            Err(err) => return Err(err),
        };
        Self::finish(tx, dry_run).await?;
        Ok(outcome)
    }

    /// Returns whether a charge was made.
    async fn charge_balance(
        &self,
        conn: &mut PgConnection,
        organization: &Organization,
        until: DateTime<Utc>,
        dry_run: bool,
    ) -> BillingResult<bool> {
        let config = self.charges.config();
        if crate::charges::store::has_in_flight(conn, organization.id).await? {
            debug!(organization = %organization.slug, "charge already in flight");
            return Ok(false);
        }
        let invoiceables = ledger::get_invoiceables(conn, organization.id, until).await?;
        let Some(first) = invoiceables.first() else {
            return Ok(false);
        };
        let mut balance = Price::zero(first.dest_unit.clone());
        for invoiced in &invoiceables {
            balance = balance.checked_add(&invoiced.dest_price())?;
        }
        if balance.amount < config.minimum_charge_amount {
            debug!(
                organization = %organization.slug,
                amount = balance.amount,
                minimum = config.minimum_charge_amount,
                "balance below processor minimum"
            );
            return Ok(false);
        }

        let auto_renewed = subscriptions::active_for(conn, organization.id, until)
            .await?
            .into_iter()
            .any(|subscription| subscription.auto_renew);
        if !auto_renewed {
            info!(organization = %organization.slug, amount = balance.amount, "balance needs manual review");
            if !dry_run {
                self.charges
                    .signals()
                    .emit(BillingSignal::ManualReview {
                        organization_id: organization.id,
                        amount: balance.amount,
                        unit: balance.unit.clone(),
                    })
                    .await;
            }
            return Ok(false);
        }

        if dry_run {
            info!(organization = %organization.slug, amount = balance.amount, unit = %balance.unit, "would charge card");
            return Ok(true);
        }
        let charge = self
            .charges
            .charge_card(conn, organization, &invoiceables, None, until)
            .await?;
        info!(
            organization = %organization.slug,
            charge = %charge.processor_key,
            amount = charge.amount,
            state = charge.state.as_str(),
            "charged balance"
        );
        Ok(true)
    }

    async fn record_card_failure(
        &self,
        conn: &mut PgConnection,
        organization: &Organization,
        at_time: DateTime<Utc>,
        code: &str,
    ) -> BillingResult<()> {
        let max_attempts = self.charges.config().max_renewal_attempts;
        let nb_attempts = organizations::increment_renewal_attempts(conn, organization.id).await?;
        let final_notice = nb_attempts >= max_attempts;
        if final_notice {
            for subscription in subscriptions::active_for(conn, organization.id, at_time).await? {
                subscriptions::unsubscribe(conn, subscription.id, at_time).await?;
            }
        }
        warn!(
            organization = %organization.slug,
            nb_attempts,
            final_notice,
            code,
            "renewal charge declined"
        );
        self.charges
            .signals()
            .emit(BillingSignal::RenewalChargeFailed {
                organization_id: organization.id,
                nb_attempts,
                final_notice,
                code: code.to_string(),
            })
            .await;
        Ok(())
    }

    /// Warns subscribers whose subscriptions end `nb_days` from `at_time`,
    /// at most one signal per organization and notice kind.
    pub async fn trigger_expiration_notices(
        &self,
        at_time: DateTime<Utc>,
        nb_days: i64,
        dry_run: bool,
    ) -> BillingResult<PhaseReport> {
        let mut report = PhaseReport::new("trigger_expiration_notices");
        let lower = at_time + Duration::days(nb_days);
        let upper = lower + Duration::days(1);

        let mut conn = self.charges.pool().acquire().await?;
        let mut by_organization: BTreeMap<i64, Vec<Subscription>> = BTreeMap::new();
        for subscription in subscriptions::ending_between(&mut conn, lower, upper).await? {
            by_organization
                .entry(subscription.organization_id)
                .or_default()
                .push(subscription);
        }

        for (organization_id, ending) in by_organization {
            let organization = organizations::get(&mut conn, organization_id).await?;
            let mut notices: BTreeMap<ExpirationNotice, Vec<i64>> = BTreeMap::new();
            for subscription in ending {
                let plan = plans::get(&mut conn, subscription.plan_id).await?;
                match classify_notice(&subscription, &plan, &organization) {
                    Some(notice) => notices.entry(notice).or_default().push(subscription.id),
                    None => report.skipped += 1,
                }
            }
            for (notice, subscription_ids) in notices {
                report.processed += subscription_ids.len();
                let signal = match notice {
                    ExpirationNotice::CardExpiresSoon => BillingSignal::CardExpiresSoon {
                        organization_id,
                        nb_days,
                    },
                    ExpirationNotice::UpgradeSoon => BillingSignal::UpgradeSoon {
                        organization_id,
                        subscription_ids,
                        nb_days,
                    },
                    ExpirationNotice::ExpiresSoon => BillingSignal::ExpiresSoon {
                        organization_id,
                        subscription_ids,
                        nb_days,
                    },
                };
                if dry_run {
                    info!(organization = %organization.slug, kind = signal.kind(), nb_days, "would send notice");
                } else {
                    self.charges.signals().emit(signal).await;
                }
            }
        }
        Ok(report)
    }
}

/// Posts the catch-up income for one subscription, one monthly window at a
/// time. Returns the number of postings created.
pub async fn recognize_subscription_income(
    conn: &mut PgConnection,
    subscription: &Subscription,
    until: DateTime<Utc>,
) -> BillingResult<usize> {
    let plan = plans::get(conn, subscription.plan_id).await?;
    let provider_id = plan.organization_id;
    let event = subscription.event();
    let periods = plan.periods();
    let anchor = subscription.created_at;

    let mut orders = Vec::new();
    for order in ledger::store::subscription_orders(conn, &event, until).await? {
        let nb_periods = match order.order_periods() {
            Some((count, period_type)) if period_type == plan.period_type => {
                (count / i64::from(plan.period_length.max(1))).max(1)
            }
            _ => {
                return Err(BillingError::integrity(format!(
                    "order {} on subscription {} carries no usable period count",
                    order.id, subscription.id
                )))
            }
        };
        orders.push((order.created_at, OrderSpan { amount: order.dest_amount, nb_periods }));
    }
    let event_id = event.to_string();
    let use_charges = ledger::store::by_event(conn, &event)
        .await?
        .into_iter()
        .filter(|txn| {
            txn.event_id.as_deref() != Some(event_id.as_str())
                && txn.dest_account == Account::Payable
                && txn.orig_account == Account::Receivable
        })
        .collect::<Vec<Transaction>>();
    if orders.is_empty() && use_charges.is_empty() {
        return Ok(0);
    }

    let coverage_end = periods.end_of_period(anchor, orders.iter().map(|(_, span)| span.nb_periods).sum());
    let last = until.min(coverage_end.max(subscription.ends_at));
    let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
    let mut nb_postings = 0;
    let mut index = 1_i64;
    loop {
        let window_start = monthly.end_of_period(anchor, index - 1);
        if window_start >= last {
            break;
        }
        let window_end = monthly.end_of_period(anchor, index).min(until);
        index += 1;

        let spans = orders
            .iter()
            .filter(|(created_at, _)| *created_at <= window_end)
            .map(|(_, span)| *span)
            .collect::<Vec<_>>();
        let used = use_charges
            .iter()
            .filter(|txn| txn.created_at <= window_end)
            .map(|txn| txn.dest_amount)
            .sum::<i64>();
        let recognizable = recognizable_amount(&periods, anchor, &spans, window_end) + used;

        let balance = |account| BalanceQuery::account(provider_id, account).for_event(&event).through(window_end);
        let recognized = -ledger::get_balance(conn, &balance(Account::Income)).await?.amount;
        let delta = recognizable - recognized;
        if delta <= 0 {
            continue;
        }
        let backlog = -ledger::get_balance(conn, &balance(Account::Backlog)).await?.amount;
        let receivable = -ledger::get_balance(conn, &balance(Account::Receivable)).await?.amount;
        let descr = format!(
            "Recognize income for {} until {}",
            plan.title,
            window_end.format("%Y/%m/%d")
        );
        for posting in factory::create_income_recognized(
            provider_id,
            &Price::new(delta, plan.unit.clone()),
            window_end,
            &event,
            &descr,
            backlog,
            receivable,
        ) {
            let (_, created) = ledger::store::insert_once(conn, &posting).await?;
            if created {
                nb_postings += 1;
            }
        }
    }
    Ok(nb_postings)
}

/// Orders one more period for `subscription` when `at_time` sits in the last
/// day of its current period. Returns whether an order was recorded.
pub async fn extend_subscription(
    conn: &mut PgConnection,
    subscription: &Subscription,
    at_time: DateTime<Utc>,
) -> BillingResult<bool> {
    let plan = plans::get(conn, subscription.plan_id).await?;
    if !plan.renews() || !subscription.auto_renew {
        return Ok(false);
    }
    let horizon = (at_time + Duration::days(1)).min(plan.periods().end_of_period(at_time, 1));
    if subscription.ends_at <= at_time || subscription.ends_at > horizon {
        debug!(subscription = subscription.id, ends_at = %subscription.ends_at, "not in its last day");
        return Ok(false);
    }
    let order = factory::new_subscription_order(subscription, &plan, 1, at_time);
    let recorded = ledger::record_order(conn, &[order], None).await?;
    info!(
        subscription = subscription.id,
        plan = %plan.slug,
        amount = plan.period_amount,
        nb_orders = recorded.len(),
        "subscription renewed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::organizations::sample_organization;
    use crate::plans::sample_plan;
    use crate::subscriptions::sample_subscription;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn auto_renew_with_good_card_needs_no_notice() {
        let plan = sample_plan(PeriodType::Monthly, 17999);
        let mut subscription = sample_subscription(at(2014, 9, 10));
        subscription.ends_at = at(2014, 10, 10);
        let mut organization = sample_organization(1, "xia");
        organization.processor_card_key = Some("card_1".into());
        organization.card_exp_date = Some(at(2016, 1, 1).date_naive());
        assert_eq!(classify_notice(&subscription, &plan, &organization), None);

        organization.card_exp_date = Some(at(2014, 10, 1).date_naive());
        assert_eq!(
            classify_notice(&subscription, &plan, &organization),
            Some(ExpirationNotice::CardExpiresSoon)
        );
        organization.processor_card_key = None;
        assert_eq!(
            classify_notice(&subscription, &plan, &organization),
            Some(ExpirationNotice::CardExpiresSoon)
        );
    }

    #[test]
    fn non_renewing_subscriptions_expire_or_upgrade() {
        let mut plan = sample_plan(PeriodType::Monthly, 17999);
        let mut subscription = sample_subscription(at(2014, 9, 10));
        subscription.auto_renew = false;
        let organization = sample_organization(1, "xia");
        assert_eq!(
            classify_notice(&subscription, &plan, &organization),
            Some(ExpirationNotice::ExpiresSoon)
        );
        plan.renewal_type = RenewalType::Repeat;
        assert_eq!(
            classify_notice(&subscription, &plan, &organization),
            Some(ExpirationNotice::UpgradeSoon)
        );
    }

    #[test]
    fn income_is_earned_pro_rata_across_orders() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        let anchor = at(2014, 9, 10);
        let orders = [
            OrderSpan {
                amount: 30000,
                nb_periods: 3,
            },
            OrderSpan {
                amount: 10000,
                nb_periods: 1,
            },
        ];
        assert_eq!(recognizable_amount(&monthly, anchor, &orders, anchor), 0);
        assert_eq!(recognizable_amount(&monthly, anchor, &orders, at(2014, 10, 10)), 10000);
        assert_eq!(recognizable_amount(&monthly, anchor, &orders, at(2014, 12, 10)), 30000);
        assert_eq!(recognizable_amount(&monthly, anchor, &orders, at(2015, 1, 10)), 40000);
        assert_eq!(recognizable_amount(&monthly, anchor, &orders, at(2016, 1, 10)), 40000);
    }

    #[test]
    fn partial_window_rounds_down() {
        let daily = PeriodCalculator::new(PeriodType::Daily, 1);
        let anchor = at(2014, 9, 10);
        let orders = [OrderSpan {
            amount: 1001,
            nb_periods: 2,
        }];
        assert_eq!(recognizable_amount(&daily, anchor, &orders, anchor + Duration::days(1)), 500);
    }

    #[test]
    fn report_keeps_failed_phases() {
        let mut report = RenewalReport::default();
        report.record("recognize_income", Ok(PhaseReport::new("recognize_income")));
        report.record("extend_subscriptions", Err(BillingError::NotFound("plan")));
        assert!(report.phase("recognize_income").is_some());
        assert_eq!(report.errors, vec![("extend_subscriptions", "plan not found".to_string())]);
    }
}
