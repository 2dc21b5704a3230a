use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::models::{Charge, ChargeItem, ChargeRow, ChargeState};
use crate::error::{BillingError, BillingResult};
use crate::money::Price;
use crate::processor::ReceiptInfo;

const CHARGE_COLUMNS: &str = "id, created_at, amount, unit, broker_fee_amount, customer_id, \
    processor_id, processor_key, descr, state, last4, exp_date, card_name, updated_at";

const ITEM_COLUMNS: &str = "id, charge_id, invoiced_id, invoiced_processor_fee_id, \
    invoiced_broker_fee_id, invoiced_distribute_id, invoice_key, sync_on";

pub struct NewCharge<'a> {
    pub created_at: DateTime<Utc>,
    pub price: &'a Price,
    pub broker_fee_amount: i64,
    pub customer_id: i64,
    pub processor_id: i64,
    pub processor_key: &'a str,
    pub descr: &'a str,
    pub state: ChargeState,
    pub receipt: &'a ReceiptInfo,
}

pub async fn insert(conn: &mut PgConnection, charge: &NewCharge<'_>) -> BillingResult<Charge> {
    let row = sqlx::query_as::<_, ChargeRow>(&format!(
        r#"
        INSERT INTO charges (
            created_at, amount, unit, broker_fee_amount, customer_id, processor_id,
            processor_key, descr, state, last4, exp_date, card_name
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {CHARGE_COLUMNS}
        "#
    ))
    .bind(charge.created_at)
    .bind(charge.price.amount)
    .bind(&charge.price.unit)
    .bind(charge.broker_fee_amount)
    .bind(charge.customer_id)
    .bind(charge.processor_id)
    .bind(charge.processor_key)
    .bind(charge.descr)
    .bind(charge.state.as_str())
    .bind(charge.receipt.last4)
    .bind(charge.receipt.exp_date)
    .bind(&charge.receipt.card_name)
    .fetch_one(&mut *conn)
    .await?;
    Charge::try_from(row)
}

pub async fn get(conn: &mut PgConnection, id: i64) -> BillingResult<Charge> {
    let row = sqlx::query_as::<_, ChargeRow>(&format!("SELECT {CHARGE_COLUMNS} FROM charges WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(BillingError::NotFound("charge"))?;
    Charge::try_from(row)
}

pub async fn by_processor_key(conn: &mut PgConnection, processor_key: &str) -> BillingResult<Charge> {
    let row = sqlx::query_as::<_, ChargeRow>(&format!(
        "SELECT {CHARGE_COLUMNS} FROM charges WHERE processor_key = $1"
    ))
    .bind(processor_key)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("charge"))?;
    Charge::try_from(row)
}

/// Row-locks the charge without waiting. A lock held by another session
/// surfaces as [`BillingError::ChargeConflict`].
pub async fn lock(conn: &mut PgConnection, id: i64, expected: ChargeState) -> BillingResult<Charge> {
    let row = sqlx::query_as::<_, ChargeRow>(&format!(
        "SELECT {CHARGE_COLUMNS} FROM charges WHERE id = $1 FOR UPDATE NOWAIT"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| conflict_or_db(err, id, expected))?
    .ok_or(BillingError::NotFound("charge"))?;
    Charge::try_from(row)
}

fn conflict_or_db(err: sqlx::Error, charge_id: i64, expected: ChargeState) -> BillingError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("55P03") {
            return BillingError::ChargeConflict {
                charge_id,
                expected: expected.as_str().to_string(),
            };
        }
    }
    BillingError::Db(err)
}

/// Compare-and-swap on the charge state. Fails with
/// [`BillingError::ChargeConflict`] when the row is no longer in `from`.
pub async fn transition(
    conn: &mut PgConnection,
    id: i64,
    from: ChargeState,
    to: ChargeState,
    receipt: Option<&ReceiptInfo>,
) -> BillingResult<Charge> {
    let row = sqlx::query_as::<_, ChargeRow>(&format!(
        r#"
        UPDATE charges
        SET state = $3,
            last4 = COALESCE($4, last4),
            exp_date = COALESCE($5, exp_date),
            card_name = COALESCE($6, card_name),
            updated_at = NOW()
        WHERE id = $1
          AND state = $2
        RETURNING {CHARGE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(receipt.and_then(|receipt| receipt.last4))
    .bind(receipt.and_then(|receipt| receipt.exp_date))
    .bind(receipt.and_then(|receipt| receipt.card_name.clone()))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| conflict_or_db(err, id, from))?;

    match row {
        Some(row) => Charge::try_from(row),
        None => Err(BillingError::ChargeConflict {
            charge_id: id,
            expected: from.as_str().to_string(),
        }),
    }
}

pub async fn insert_item(conn: &mut PgConnection, charge_id: i64, invoiced_id: i64) -> BillingResult<ChargeItem> {
    let item = sqlx::query_as::<_, ChargeItem>(&format!(
        r#"
        INSERT INTO charge_items (charge_id, invoiced_id)
        VALUES ($1, $2)
        ON CONFLICT (charge_id, invoiced_id) DO UPDATE SET charge_id = EXCLUDED.charge_id
        RETURNING {ITEM_COLUMNS}
        "#
    ))
    .bind(charge_id)
    .bind(invoiced_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(item)
}

/// Items of a charge ordered by id.
pub async fn items(conn: &mut PgConnection, charge_id: i64) -> BillingResult<Vec<ChargeItem>> {
    let items = sqlx::query_as::<_, ChargeItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM charge_items WHERE charge_id = $1 ORDER BY id"
    ))
    .bind(charge_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(items)
}

pub async fn link_item_legs(
    conn: &mut PgConnection,
    item_id: i64,
    processor_fee_id: Option<i64>,
    broker_fee_id: Option<i64>,
    distribute_id: Option<i64>,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE charge_items
        SET invoiced_processor_fee_id = $2,
            invoiced_broker_fee_id = $3,
            invoiced_distribute_id = $4
        WHERE id = $1
        "#,
    )
    .bind(item_id)
    .bind(processor_fee_id)
    .bind(broker_fee_id)
    .bind(distribute_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn in_state(conn: &mut PgConnection, state: ChargeState) -> BillingResult<Vec<Charge>> {
    let rows = sqlx::query_as::<_, ChargeRow>(&format!(
        "SELECT {CHARGE_COLUMNS} FROM charges WHERE state = $1 ORDER BY id"
    ))
    .bind(state.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Charge::try_from).collect()
}

/// Whether `customer_id` already has a charge waiting on the processor.
pub async fn has_in_flight(conn: &mut PgConnection, customer_id: i64) -> BillingResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM charges WHERE customer_id = $1 AND state = $2)",
    )
    .bind(customer_id)
    .bind(ChargeState::Created.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}
