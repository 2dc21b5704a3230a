use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, warn};

use super::accounts::Account;
use super::event::EventRef;
use super::factory;
use super::models::{NewTransaction, Transaction};
use super::store;
use crate::error::{BillingError, BillingResult};
use crate::money::{as_money, Price};
use crate::{plans, subscriptions};

/// key: ledger-record-order
/// Persists checkout lines and applies their side effects: subscriptions
/// named by a line's event are extended by the periods it carries, and a
/// `payer_id` other than the subscriber assumes the payable (group buy).
///
/// Everything runs on `conn`; callers wrap it in one database transaction
/// so that either every line commits or none does.
pub async fn record_order(
    conn: &mut PgConnection,
    invoiced_items: &[NewTransaction],
    payer_id: Option<i64>,
) -> BillingResult<Vec<Transaction>> {
    let mut recorded = Vec::with_capacity(invoiced_items.len());
    for item in invoiced_items {
        let item = deferred_if_unlocked(conn, item).await?;
        let (transaction, created) = store::insert_once(conn, &item).await?;
        if created {
            extend_subscription(conn, &transaction).await?;
        }

        if let Some(payer_id) = payer_id {
            if payer_id != transaction.dest_organization_id
                && transaction.dest_account == Account::Payable
                && transaction.dest_amount > 0
            {
                let assumed = NewTransaction::transfer(
                    transaction.created_at,
                    (payer_id, Account::Liability),
                    (transaction.dest_organization_id, Account::Payable),
                    &transaction.dest_price(),
                    transaction.descr.clone(),
                )
                .with_event_id(transaction.event_id.clone());
                store::insert_once(conn, &assumed).await?;
            }
        }
        recorded.push(transaction);
    }
    Ok(recorded)
}

/// A zero-amount subscription line on a plan with an unlock event grants
/// access now and bills the full period price.
async fn deferred_if_unlocked(conn: &mut PgConnection, item: &NewTransaction) -> BillingResult<NewTransaction> {
    if item.dest_amount != 0 {
        return Ok(item.clone());
    }
    let Some(EventRef::Subscription { id, use_charge: None }) =
        item.event_id.as_deref().and_then(|event_id| event_id.parse::<EventRef>().ok())
    else {
        return Ok(item.clone());
    };
    let subscription = subscriptions::get(conn, id).await?;
    let plan = plans::get(conn, subscription.plan_id).await?;
    let Some(unlock_event) = plan.unlock_event.as_deref() else {
        return Ok(item.clone());
    };

    let nb_periods = item
        .nb_periods
        .map(i64::from)
        .unwrap_or_else(|| i64::from(plan.period_length))
        / i64::from(plan.period_length);
    let price = Price::new(plan.period_amount * nb_periods.max(1), plan.unit.clone());
    let mut deferred = item.clone();
    deferred.dest_amount = price.amount;
    deferred.dest_unit = price.unit.clone();
    deferred.orig_amount = price.amount;
    deferred.orig_unit = price.unit;
    deferred.descr = format!("{} (pay later, unlocked by {unlock_event})", item.descr);
    info!(
        subscription = subscription.id,
        plan = %plan.slug,
        unlock_event,
        amount = deferred.dest_amount,
        "zero-amount order converted to deferred payment"
    );
    Ok(deferred)
}

async fn extend_subscription(conn: &mut PgConnection, transaction: &Transaction) -> BillingResult<()> {
    let Some(EventRef::Subscription { id, use_charge: None }) = transaction.event() else {
        return Ok(());
    };
    if transaction.dest_account != Account::Payable {
        return Ok(());
    }
    let Some((count, period_type)) = transaction.order_periods() else {
        return Ok(());
    };

    let subscription = subscriptions::get(conn, id).await?;
    let plan = plans::get(conn, subscription.plan_id).await?;
    if period_type != plan.period_type {
        return Err(BillingError::integrity(format!(
            "order {} is priced in {} periods but plan {} is {}",
            transaction.id,
            period_type.as_str(),
            plan.slug,
            plan.period_type.as_str()
        )));
    }
    let nb_periods = count / i64::from(plan.period_length);
    if nb_periods <= 0 {
        return Ok(());
    }
    let ends_at = subscription.extended_ends_at(&plan, nb_periods);
    if subscriptions::extend(conn, subscription.id, ends_at).await? {
        info!(
            subscription = subscription.id,
            nb_periods,
            ends_at = %ends_at,
            "subscription extended"
        );
    }
    Ok(())
}

/// Cancels every outstanding statement line of `organization_id` as of
/// `at_time`, on the subscriber and provider side alike.
pub async fn writeoff_statement(
    conn: &mut PgConnection,
    organization_id: i64,
    at_time: DateTime<Utc>,
) -> BillingResult<Vec<Transaction>> {
    let balances = store::get_statement_balances(conn, organization_id, at_time, None).await?;
    let mut written_off = Vec::new();
    for (event_id, units) in balances {
        let Ok(event) = event_id.parse::<EventRef>() else {
            warn!(organization_id, event_id = %event_id, "statement line without a usable event, skipping writeoff");
            continue;
        };
        let order = store::by_event(conn, &event)
            .await?
            .into_iter()
            .find(|txn| {
                txn.event_id.as_deref() == Some(event_id.as_str())
                    && txn.dest_account == Account::Payable
                    && txn.orig_account == Account::Receivable
            })
            .ok_or_else(|| BillingError::integrity(format!("no order found for statement line {event_id}")))?;
        let owed_account = if order.dest_organization_id == organization_id {
            Account::Payable
        } else {
            Account::Liability
        };

        for (unit, amount) in units {
            if amount <= 0 {
                continue;
            }
            let price = Price::new(amount, unit);
            let descr = format!("write off {} for {}", as_money(price.amount, &price.unit), order.descr);
            let [mut subscriber_leg, provider_leg] = factory::writeoff(
                organization_id,
                order.orig_organization_id,
                &price,
                at_time,
                Some(event_id.clone()),
                &descr,
            );
            subscriber_leg.orig_account = owed_account;
            for leg in [subscriber_leg, provider_leg] {
                let (transaction, _) = store::insert_once(conn, &leg).await?;
                written_off.push(transaction);
            }
            info!(organization_id, event_id = %event_id, amount = price.amount, "statement line written off");
        }
    }
    Ok(written_off)
}
