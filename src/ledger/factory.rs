//! Constructors for the postings recorded by common billing events. Nothing
//! here touches the database; callers persist the results inside their own
//! transaction.

use chrono::{DateTime, Utc};

use super::accounts::Account;
use super::event::EventRef;
use super::models::NewTransaction;
use crate::money::Price;
use crate::plans::{Plan, UseCharge};
use crate::subscriptions::Subscription;

/// Residual backlog or receivable amounts at or below this many minor units
/// are recognized together with the current window instead of lingering.
pub const INCOME_DUST_TOLERANCE: i64 = 50;

/// Order placed: `subscriber:Payable <- provider:Receivable`.
pub fn new_payable(
    subscriber_id: i64,
    provider_id: i64,
    price: &Price,
    at_time: DateTime<Utc>,
    event: &EventRef,
    descr: impl Into<String>,
) -> NewTransaction {
    NewTransaction::transfer(
        at_time,
        (subscriber_id, Account::Payable),
        (provider_id, Account::Receivable),
        price,
        descr,
    )
    .with_event(event)
}

/// Order for `nb_periods` more periods of `subscription`, starting at its
/// current `ends_at`.
pub fn new_subscription_order(
    subscription: &Subscription,
    plan: &Plan,
    nb_periods: i64,
    at_time: DateTime<Utc>,
) -> NewTransaction {
    let ends_at = subscription.extended_ends_at(plan, nb_periods);
    let price = Price::new(plan.period_amount * nb_periods, plan.unit.clone());
    let descr = format!(
        "subscription to {} until {} ({})",
        plan.title,
        ends_at.format("%Y/%m/%d"),
        plan.periods().describe(nb_periods)
    );
    new_payable(
        subscription.organization_id,
        plan.organization_id,
        &price,
        at_time,
        &subscription.event(),
        descr,
    )
    .with_periods(nb_periods * i64::from(plan.period_length), plan.period_type)
}

/// Order for `quantity` units of a metered add-on.
pub fn new_use_charge(
    subscription: &Subscription,
    plan: &Plan,
    use_charge: &UseCharge,
    quantity: i64,
    at_time: DateTime<Utc>,
) -> NewTransaction {
    let price = Price::new(use_charge.use_amount * quantity, plan.unit.clone());
    let descr = format!("{quantity} {} ({})", use_charge.title, plan.title);
    new_payable(
        subscription.organization_id,
        plan.organization_id,
        &price,
        at_time,
        &EventRef::use_charge(subscription.id, use_charge.id),
        descr,
    )
}

/// Recognizes `amount` of income for `provider_id`, drawing on the backlog
/// (collected, unearned) first and on receivables (uncollected) second.
///
/// `backlog_available` and `receivable_available` are the positive amounts
/// still outstanding on each account for `event`. A residual at or below
/// [`INCOME_DUST_TOLERANCE`] is swept into the current recognition.
pub fn create_income_recognized(
    provider_id: i64,
    amount: &Price,
    at_time: DateTime<Utc>,
    event: &EventRef,
    descr: &str,
    backlog_available: i64,
    receivable_available: i64,
) -> Vec<NewTransaction> {
    let (backlog_part, receivable_part) =
        split_income(amount.amount, backlog_available.max(0), receivable_available.max(0));

    let mut postings = Vec::with_capacity(2);
    for (account, part) in [
        (Account::Backlog, backlog_part),
        (Account::Receivable, receivable_part),
    ] {
        if part > 0 {
            postings.push(
                NewTransaction::transfer(
                    at_time,
                    (provider_id, account),
                    (provider_id, Account::Income),
                    &Price::new(part, amount.unit.clone()),
                    descr,
                )
                .with_event(event),
            );
        }
    }
    postings
}

fn split_income(amount: i64, backlog_available: i64, receivable_available: i64) -> (i64, i64) {
    if amount <= 0 {
        return (0, 0);
    }
    let mut backlog_part = amount.min(backlog_available);
    if backlog_part > 0 && backlog_available - backlog_part <= INCOME_DUST_TOLERANCE {
        backlog_part = backlog_available;
    }

    let wanted = amount - backlog_part;
    let mut receivable_part = wanted.max(0).min(receivable_available);
    if receivable_part > 0 && receivable_available - receivable_part <= INCOME_DUST_TOLERANCE {
        receivable_part = receivable_available;
    }
    (backlog_part, receivable_part)
}

/// Payment collected outside the processor, recorded with the same legs a
/// card charge and its distribution would produce (without fees).
pub fn offline_payment(
    subscriber_id: i64,
    provider_id: i64,
    processor_id: i64,
    price: &Price,
    at_time: DateTime<Utc>,
    event: &EventRef,
    descr: &str,
) -> Vec<NewTransaction> {
    let leg = |dest: (i64, Account), orig: (i64, Account)| {
        NewTransaction::transfer(at_time, dest, orig, price, descr).with_event(event)
    };
    vec![
        leg((subscriber_id, Account::Liability), (subscriber_id, Account::Payable)),
        leg((processor_id, Account::Funds), (subscriber_id, Account::Liability)),
        leg((provider_id, Account::Receivable), (provider_id, Account::Backlog)),
        leg((provider_id, Account::Funds), (processor_id, Account::Funds)),
        leg((provider_id, Account::Offline), (provider_id, Account::Funds)),
    ]
}

/// Cancels an unpaid statement line on both sides of the order.
pub fn writeoff(
    subscriber_id: i64,
    provider_id: i64,
    price: &Price,
    at_time: DateTime<Utc>,
    event_id: Option<String>,
    descr: &str,
) -> [NewTransaction; 2] {
    [
        NewTransaction::transfer(
            at_time,
            (subscriber_id, Account::Writeoff),
            (subscriber_id, Account::Payable),
            price,
            descr,
        )
        .with_event_id(event_id.clone()),
        NewTransaction::transfer(
            at_time,
            (provider_id, Account::Canceled),
            (provider_id, Account::Receivable),
            price,
            descr,
        )
        .with_event_id(event_id),
    ]
}

/// Payout of `price` from a provider's funds to its bank account.
pub fn withdraw(
    provider_id: i64,
    price: &Price,
    at_time: DateTime<Utc>,
    descr: impl Into<String>,
) -> NewTransaction {
    NewTransaction::transfer(
        at_time,
        (provider_id, Account::Withdraw),
        (provider_id, Account::Funds),
        price,
        descr,
    )
}

#[cfg(test)]
pub(crate) fn persisted(id: i64, posting: &NewTransaction) -> super::models::Transaction {
    super::models::Transaction {
        id,
        created_at: posting.created_at,
        descr: posting.descr.clone(),
        event_id: posting.event_id.clone(),
        orig_organization_id: posting.orig_organization_id,
        orig_account: posting.orig_account,
        orig_amount: posting.orig_amount,
        orig_unit: posting.orig_unit.clone(),
        dest_organization_id: posting.dest_organization_id,
        dest_account: posting.dest_account,
        dest_amount: posting.dest_amount,
        dest_unit: posting.dest_unit.clone(),
        nb_periods: posting.nb_periods,
        period_type: posting.period_type,
    }
}
