//! Money leaving or entering the platform outside of card charges.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::info;

use crate::charges::apply_funds;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, factory, EventRef, Transaction};
use crate::money::Price;
use crate::organizations::{self, BillingParties};
use crate::processor::Processor;

/// Pays `price` out of the provider's funds to its deposit account.
///
/// The cached balance is debited first so two concurrent payouts can never
/// overdraw it; a failed transfer rolls the debit back with the caller's
/// database transaction.
pub async fn withdraw_funds(
    conn: &mut PgConnection,
    processor: &dyn Processor,
    provider_id: i64,
    price: &Price,
    at_time: DateTime<Utc>,
) -> BillingResult<Transaction> {
    if price.amount <= 0 {
        return Err(BillingError::integrity(format!("cannot withdraw {price}")));
    }
    let provider = organizations::debit_funds(conn, provider_id, price).await?;
    let descr = format!("Withdraw {price} to {}", provider.slug);
    let transfer = processor.create_transfer(&provider, price, &descr).await?;
    let posted = ledger::store::insert(
        conn,
        &factory::withdraw(provider.id, price, at_time, format!("{descr} ({})", transfer.transfer_id)),
    )
    .await?;
    info!(
        provider = %provider.slug,
        transfer = %transfer.transfer_id,
        amount = price.amount,
        remaining = provider.funds_balance,
        "funds withdrawn"
    );
    Ok(posted)
}

/// Records a payment the provider collected by other means (cash, check).
pub async fn pay_offline(
    conn: &mut PgConnection,
    config: &BillingConfig,
    subscriber_id: i64,
    provider_id: i64,
    price: &Price,
    event: &EventRef,
    at_time: DateTime<Utc>,
) -> BillingResult<Vec<Transaction>> {
    let parties = BillingParties::resolve(conn, config).await?;
    let descr = format!("Offline payment of {price}");
    let mut posted = Vec::new();
    for leg in factory::offline_payment(
        subscriber_id,
        provider_id,
        parties.processor.id,
        price,
        at_time,
        event,
        &descr,
    ) {
        let transaction = ledger::store::insert(conn, &leg).await?;
        apply_funds(conn, &transaction).await?;
        posted.push(transaction);
    }
    info!(subscriber_id, provider_id, amount = price.amount, event = %event, "offline payment recorded");
    Ok(posted)
}
