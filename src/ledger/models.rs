use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::accounts::Account;
use super::event::EventRef;
use crate::error::{BillingError, BillingResult};
use crate::money::Price;
use crate::periods::PeriodType;

/// key: ledger-transaction
/// One journal entry: `orig_amount` leaves `orig_account` of
/// `orig_organization_id` and `dest_amount` lands in `dest_account` of
/// `dest_organization_id`. Rows are never updated or deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub descr: String,
    pub event_id: Option<String>,
    pub orig_organization_id: i64,
    pub orig_account: Account,
    pub orig_amount: i64,
    pub orig_unit: String,
    pub dest_organization_id: i64,
    pub dest_account: Account,
    pub dest_amount: i64,
    pub dest_unit: String,
    pub nb_periods: Option<i32>,
    pub period_type: Option<PeriodType>,
}

impl Transaction {
    pub fn event(&self) -> Option<EventRef> {
        self.event_id
            .as_deref()
            .and_then(|event_id| event_id.parse::<EventRef>().ok())
    }

    pub fn dest_price(&self) -> Price {
        Price::new(self.dest_amount, self.dest_unit.clone())
    }

    pub fn orig_price(&self) -> Price {
        Price::new(self.orig_amount, self.orig_unit.clone())
    }

    /// Structured period count of an order line, falling back to the count
    /// embedded in the description for rows recorded without it.
    pub fn order_periods(&self) -> Option<(i64, PeriodType)> {
        match (self.nb_periods, self.period_type) {
            (Some(nb_periods), Some(period_type)) => Some((i64::from(nb_periods), period_type)),
            _ => crate::periods::period_number(&self.descr),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TransactionRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub descr: String,
    pub event_id: Option<String>,
    pub orig_organization_id: i64,
    pub orig_account: String,
    pub orig_amount: i64,
    pub orig_unit: String,
    pub dest_organization_id: i64,
    pub dest_account: String,
    pub dest_amount: i64,
    pub dest_unit: String,
    pub nb_periods: Option<i32>,
    pub period_type: Option<String>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        let account = |name: &str| {
            Account::from_str(name)
                .ok_or_else(|| BillingError::integrity(format!("unknown ledger account `{name}`")))
        };
        Ok(Transaction {
            id: row.id,
            created_at: row.created_at,
            descr: row.descr,
            event_id: row.event_id,
            orig_organization_id: row.orig_organization_id,
            orig_account: account(&row.orig_account)?,
            orig_amount: row.orig_amount,
            orig_unit: row.orig_unit,
            dest_organization_id: row.dest_organization_id,
            dest_account: account(&row.dest_account)?,
            dest_amount: row.dest_amount,
            dest_unit: row.dest_unit,
            nb_periods: row.nb_periods,
            period_type: row.period_type.as_deref().and_then(PeriodType::from_str),
        })
    }
}

/// A posting that has been computed but not necessarily persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub created_at: DateTime<Utc>,
    pub descr: String,
    pub event_id: Option<String>,
    pub orig_organization_id: i64,
    pub orig_account: Account,
    pub orig_amount: i64,
    pub orig_unit: String,
    pub dest_organization_id: i64,
    pub dest_account: Account,
    pub dest_amount: i64,
    pub dest_unit: String,
    pub nb_periods: Option<i32>,
    pub period_type: Option<PeriodType>,
}

impl NewTransaction {
    /// Same-unit transfer of `price` from `(orig, orig_account)` into
    /// `(dest, dest_account)`.
    pub fn transfer(
        created_at: DateTime<Utc>,
        (dest_organization_id, dest_account): (i64, Account),
        (orig_organization_id, orig_account): (i64, Account),
        price: &Price,
        descr: impl Into<String>,
    ) -> Self {
        Self {
            created_at,
            descr: descr.into(),
            event_id: None,
            orig_organization_id,
            orig_account,
            orig_amount: price.amount,
            orig_unit: price.unit.clone(),
            dest_organization_id,
            dest_account,
            dest_amount: price.amount,
            dest_unit: price.unit.clone(),
            nb_periods: None,
            period_type: None,
        }
    }

    pub fn with_event(mut self, event: &EventRef) -> Self {
        self.event_id = Some(event.to_string());
        self
    }

    pub fn with_event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_orig(mut self, price: &Price) -> Self {
        self.orig_amount = price.amount;
        self.orig_unit = price.unit.clone();
        self
    }

    pub fn with_periods(mut self, nb_periods: i64, period_type: PeriodType) -> Self {
        self.nb_periods = i32::try_from(nb_periods).ok();
        self.period_type = Some(period_type);
        self
    }

    pub fn dest_price(&self) -> Price {
        Price::new(self.dest_amount, self.dest_unit.clone())
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.orig_amount < 0 || self.dest_amount < 0 {
            return Err(BillingError::integrity(format!(
                "negative amount in posting `{}`",
                self.descr
            )));
        }
        if self.orig_unit == self.dest_unit && self.orig_amount != self.dest_amount {
            return Err(BillingError::integrity(format!(
                "unbalanced posting `{}`: {} {} vs {} {}",
                self.descr, self.orig_amount, self.orig_unit, self.dest_amount, self.dest_unit
            )));
        }
        Ok(())
    }
}
