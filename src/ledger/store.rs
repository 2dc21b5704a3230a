use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::debug;

use super::accounts::Account;
use super::event::EventRef;
use super::models::{NewTransaction, Transaction, TransactionRow};
use super::statements::{fold_statement_balances, StatementBalances};
use crate::error::{BillingError, BillingResult};
use crate::money::{Price, DEFAULT_UNIT};

const TRANSACTION_COLUMNS: &str = "id, created_at, descr, event_id, \
    orig_organization_id, orig_account, orig_amount, orig_unit, \
    dest_organization_id, dest_account, dest_amount, dest_unit, \
    nb_periods, period_type";

/// key: ledger-balance-query
/// Filters applied identically to the destination and origin legs of a
/// balance computation over `[starts_at, ends_at)`.
#[derive(Clone, Debug, Default)]
pub struct BalanceQuery {
    pub organization_id: Option<i64>,
    pub account: Option<Account>,
    pub like_account: Option<String>,
    pub event: Option<EventRef>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Treat `ends_at` as inclusive, for postings stamped exactly at a
    /// window boundary.
    pub through_ends_at: bool,
}

impl BalanceQuery {
    pub fn account(organization_id: i64, account: Account) -> Self {
        Self {
            organization_id: Some(organization_id),
            account: Some(account),
            ..Self::default()
        }
    }

    pub fn for_event(mut self, event: &EventRef) -> Self {
        self.event = Some(event.clone());
        self
    }

    pub fn until(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self.through_ends_at = false;
        self
    }

    pub fn through(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self.through_ends_at = true;
        self
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'_, Postgres>, side: &str) {
        if let Some(organization_id) = self.organization_id {
            builder
                .push(format!(" AND {side}_organization_id = "))
                .push_bind(organization_id);
        }
        if let Some(account) = self.account {
            builder
                .push(format!(" AND {side}_account = "))
                .push_bind(account.as_str());
        }
        if let Some(like_account) = &self.like_account {
            builder
                .push(format!(" AND {side}_account LIKE "))
                .push_bind(like_account.clone());
        }
        if let Some(event) = &self.event {
            builder
                .push(" AND event_id LIKE ")
                .push_bind(event.like_pattern());
        }
        if let Some(starts_at) = self.starts_at {
            builder.push(" AND created_at >= ").push_bind(starts_at);
        }
        if let Some(ends_at) = self.ends_at {
            let op = if self.through_ends_at { " <= " } else { " < " };
            builder.push(" AND created_at").push(op).push_bind(ends_at);
        }
    }
}

/// key: ledger-store -> append-only journal
pub async fn insert(conn: &mut PgConnection, posting: &NewTransaction) -> BillingResult<Transaction> {
    posting.validate()?;
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        INSERT INTO transactions (
            created_at, descr, event_id,
            orig_organization_id, orig_account, orig_amount, orig_unit,
            dest_organization_id, dest_account, dest_amount, dest_unit,
            nb_periods, period_type
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(posting.created_at)
    .bind(&posting.descr)
    .bind(&posting.event_id)
    .bind(posting.orig_organization_id)
    .bind(posting.orig_account.as_str())
    .bind(posting.orig_amount)
    .bind(&posting.orig_unit)
    .bind(posting.dest_organization_id)
    .bind(posting.dest_account.as_str())
    .bind(posting.dest_amount)
    .bind(&posting.dest_unit)
    .bind(posting.nb_periods)
    .bind(posting.period_type.map(|period_type| period_type.as_str()))
    .fetch_one(&mut *conn)
    .await?;
    Transaction::try_from(row)
}

/// Looks up a posting identical in every field, so batch steps can be
/// replayed without doubling entries.
pub async fn find_identical(
    conn: &mut PgConnection,
    posting: &NewTransaction,
) -> BillingResult<Option<Transaction>> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions
        WHERE created_at = $1
          AND descr = $2
          AND event_id IS NOT DISTINCT FROM $3
          AND orig_organization_id = $4
          AND orig_account = $5
          AND orig_amount = $6
          AND orig_unit = $7
          AND dest_organization_id = $8
          AND dest_account = $9
          AND dest_amount = $10
          AND dest_unit = $11
        ORDER BY id
        LIMIT 1
        "#
    ))
    .bind(posting.created_at)
    .bind(&posting.descr)
    .bind(&posting.event_id)
    .bind(posting.orig_organization_id)
    .bind(posting.orig_account.as_str())
    .bind(posting.orig_amount)
    .bind(&posting.orig_unit)
    .bind(posting.dest_organization_id)
    .bind(posting.dest_account.as_str())
    .bind(posting.dest_amount)
    .bind(&posting.dest_unit)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Transaction::try_from).transpose()
}

/// Inserts `posting` unless an identical row already exists. Returns the
/// row and whether it was created by this call.
pub async fn insert_once(
    conn: &mut PgConnection,
    posting: &NewTransaction,
) -> BillingResult<(Transaction, bool)> {
    if let Some(existing) = find_identical(conn, posting).await? {
        debug!(
            transaction = existing.id,
            event_id = ?existing.event_id,
            "posting already recorded"
        );
        return Ok((existing, false));
    }
    Ok((insert(conn, posting).await?, true))
}

pub async fn get(conn: &mut PgConnection, id: i64) -> BillingResult<Transaction> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("transaction"))?;
    Transaction::try_from(row)
}

/// Destination legs minus origin legs matching `query`. Fails when the
/// matching rows span more than one unit.
pub async fn get_balance(conn: &mut PgConnection, query: &BalanceQuery) -> BillingResult<Price> {
    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    for (side, sign) in [("dest", 1_i64), ("orig", -1_i64)] {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {side}_unit AS unit, COALESCE(SUM({side}_amount), 0)::BIGINT AS amount \
             FROM transactions WHERE TRUE"
        ));
        query.push_filters(&mut builder, side);
        builder.push(format!(" GROUP BY {side}_unit"));
        let rows = builder
            .build_query_as::<(String, i64)>()
            .fetch_all(&mut *conn)
            .await?;
        for (unit, amount) in rows {
            *totals.entry(unit).or_default() += sign * amount;
        }
    }
    single_unit(totals)
}

fn single_unit(totals: BTreeMap<String, i64>) -> BillingResult<Price> {
    if totals.len() > 1 {
        return Err(BillingError::MixedUnits {
            units: totals.into_keys().collect(),
        });
    }
    Ok(totals
        .into_iter()
        .next()
        .map(|(unit, amount)| Price::new(amount, unit))
        .unwrap_or_else(|| Price::zero(DEFAULT_UNIT)))
}

/// Outstanding payable-or-liability amount per invoiced event for
/// `organization_id`, net of payments and cancellations.
pub async fn get_statement_balances(
    conn: &mut PgConnection,
    organization_id: i64,
    until: DateTime<Utc>,
    event: Option<&EventRef>,
) -> BillingResult<StatementBalances> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        WITH owed AS (
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE created_at < $2
              AND dest_organization_id = $1
              AND ($7::TEXT IS NULL OR event_id LIKE $7)
              AND (dest_account = $3
                   OR (dest_account = $4 AND orig_account = $3
                       AND orig_organization_id <> $1))
        )
        SELECT * FROM owed
        UNION ALL
        SELECT {TRANSACTION_COLUMNS} FROM transactions
        WHERE created_at < $2
          AND event_id IN (SELECT event_id FROM owed WHERE event_id IS NOT NULL)
          AND ((orig_account = $5 AND dest_account = $6)
               OR (orig_account = $6 AND dest_account = $8))
        "#
    ))
    .bind(organization_id)
    .bind(until)
    .bind(Account::Payable.as_str())
    .bind(Account::Liability.as_str())
    .bind(Account::Backlog.as_str())
    .bind(Account::Receivable.as_str())
    .bind(event.map(EventRef::like_pattern))
    .bind(Account::Canceled.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let transactions = rows
        .into_iter()
        .map(Transaction::try_from)
        .collect::<BillingResult<Vec<_>>>()?;
    Ok(fold_statement_balances(organization_id, &transactions))
}

/// Payable and liability legs of `organization_id` recorded up to and
/// including `until`, strictly after its most recent payment or write-off
/// (one made at `until` itself included). A renewal ordered at `until` is
/// therefore invoiceable in the same sweep.
pub async fn get_invoiceables(
    conn: &mut PgConnection,
    organization_id: i64,
    until: DateTime<Utc>,
) -> BillingResult<Vec<Transaction>> {
    let owed_accounts = vec![
        Account::Payable.as_str().to_string(),
        Account::Liability.as_str().to_string(),
    ];
    let settled_accounts = vec![
        Account::Funds.as_str().to_string(),
        Account::Writeoff.as_str().to_string(),
    ];
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions t
        WHERE t.dest_organization_id = $1
          AND t.dest_account = ANY($2)
          AND t.created_at <= $3
          AND t.created_at > COALESCE((
              SELECT MAX(s.created_at) FROM transactions s
              WHERE s.orig_organization_id = $1
                AND s.orig_account = ANY($2)
                AND s.dest_account = ANY($4)
                AND s.created_at <= $3
          ), '-infinity'::TIMESTAMPTZ)
          AND NOT (t.dest_account = $5 AND t.orig_account = $5)
          AND NOT EXISTS (
              SELECT 1 FROM transactions g
              WHERE t.dest_account = $5
                AND g.event_id = t.event_id
                AND g.orig_organization_id = $1
                AND g.orig_account = $5
                AND g.dest_account = $6
                AND g.dest_organization_id <> $1
          )
        ORDER BY t.created_at, t.id
        "#
    ))
    .bind(organization_id)
    .bind(&owed_accounts)
    .bind(until)
    .bind(&settled_accounts)
    .bind(Account::Payable.as_str())
    .bind(Account::Liability.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(Transaction::try_from).collect()
}

/// Every posting whose `event_id` falls under `event`, oldest first.
pub async fn by_event(conn: &mut PgConnection, event: &EventRef) -> BillingResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE event_id LIKE $1 ORDER BY created_at, id"
    ))
    .bind(event.like_pattern())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Transaction::try_from).collect()
}

/// Subscription order lines (payables carrying a period count) for `event`.
pub async fn subscription_orders(
    conn: &mut PgConnection,
    event: &EventRef,
    until: DateTime<Utc>,
) -> BillingResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions
        WHERE event_id = $1
          AND orig_account = $2
          AND dest_account = $3
          AND created_at <= $4
        ORDER BY created_at, id
        "#
    ))
    .bind(event.to_string())
    .bind(Account::Receivable.as_str())
    .bind(Account::Payable.as_str())
    .bind(until)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Transaction::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_of_nothing_is_zero_in_default_unit() {
        let price = single_unit(BTreeMap::new()).unwrap();
        assert_eq!(price, Price::zero(DEFAULT_UNIT));
    }

    #[test]
    fn balance_refuses_mixed_units() {
        let mut totals = BTreeMap::new();
        totals.insert("usd".to_string(), 100);
        totals.insert("eur".to_string(), -100);
        let err = single_unit(totals).expect_err("two units");
        match err {
            BillingError::MixedUnits { units } => assert_eq!(units, vec!["eur", "usd"]),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
