use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{BillingError, BillingResult};
use crate::ledger::EventRef;
use crate::money::Price;

/// key: charge-state -> created, done, failed, disputed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Created,
    Done,
    Failed,
    Disputed,
}

impl ChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Created => "created",
            ChargeState::Done => "done",
            ChargeState::Failed => "failed",
            ChargeState::Disputed => "disputed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "created" => Some(ChargeState::Created),
            "done" => Some(ChargeState::Done),
            "failed" => Some(ChargeState::Failed),
            "disputed" => Some(ChargeState::Disputed),
            _ => None,
        }
    }

    /// Transitions the state machine allows. `Disputed -> Disputed` is the
    /// dispute-updated touch.
    pub fn can_become(&self, next: ChargeState) -> bool {
        matches!(
            (self, next),
            (ChargeState::Created, ChargeState::Done)
                | (ChargeState::Created, ChargeState::Failed)
                | (ChargeState::Done, ChargeState::Disputed)
                | (ChargeState::Disputed, ChargeState::Disputed)
                | (ChargeState::Disputed, ChargeState::Done)
                | (ChargeState::Disputed, ChargeState::Failed)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Charge {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub amount: i64,
    pub unit: String,
    pub broker_fee_amount: i64,
    pub customer_id: i64,
    pub processor_id: i64,
    pub processor_key: String,
    pub descr: String,
    pub state: ChargeState,
    pub last4: Option<i32>,
    pub exp_date: Option<NaiveDate>,
    pub card_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Charge {
    pub fn price(&self) -> Price {
        Price::new(self.amount, self.unit.clone())
    }

    pub fn event(&self) -> EventRef {
        EventRef::charge(self.id)
    }

    pub fn line_event(&self, line: i64) -> EventRef {
        EventRef::charge_item(self.id, line)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ChargeRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub amount: i64,
    pub unit: String,
    pub broker_fee_amount: i64,
    pub customer_id: i64,
    pub processor_id: i64,
    pub processor_key: String,
    pub descr: String,
    pub state: String,
    pub last4: Option<i32>,
    pub exp_date: Option<NaiveDate>,
    pub card_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ChargeRow> for Charge {
    type Error = BillingError;

    fn try_from(row: ChargeRow) -> BillingResult<Self> {
        let state = ChargeState::from_str(&row.state).ok_or_else(|| {
            BillingError::integrity(format!("charge {} has unknown state `{}`", row.id, row.state))
        })?;
        Ok(Charge {
            id: row.id,
            created_at: row.created_at,
            amount: row.amount,
            unit: row.unit,
            broker_fee_amount: row.broker_fee_amount,
            customer_id: row.customer_id,
            processor_id: row.processor_id,
            processor_key: row.processor_key,
            descr: row.descr,
            state,
            last4: row.last4,
            exp_date: row.exp_date,
            card_name: row.card_name,
            updated_at: row.updated_at,
        })
    }
}

/// key: charge-item -> invoiced line and its resolved legs
#[derive(Clone, Debug, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ChargeItem {
    pub id: i64,
    pub charge_id: i64,
    pub invoiced_id: i64,
    pub invoiced_processor_fee_id: Option<i64>,
    pub invoiced_broker_fee_id: Option<i64>,
    pub invoiced_distribute_id: Option<i64>,
    pub invoice_key: Option<String>,
    pub sync_on: Option<String>,
}

#[cfg(test)]
pub(crate) fn sample_charge(amount: i64) -> Charge {
    use chrono::TimeZone;

    let created_at = Utc.with_ymd_and_hms(2014, 9, 10, 0, 0, 0).unwrap();
    Charge {
        id: 7,
        created_at,
        amount,
        unit: "usd".into(),
        broker_fee_amount: amount / 10,
        customer_id: 1,
        processor_id: 3,
        processor_key: "ch_test".into(),
        descr: "Charge for subscription".into(),
        state: ChargeState::Created,
        last4: None,
        exp_date: None,
        card_name: None,
        updated_at: created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use ChargeState::*;
        assert!(Created.can_become(Done));
        assert!(Created.can_become(Failed));
        assert!(Done.can_become(Disputed));
        assert!(Disputed.can_become(Done));
        assert!(Disputed.can_become(Failed));
        assert!(!Done.can_become(Failed));
        assert!(!Failed.can_become(Done));
        assert!(!Created.can_become(Disputed));
    }

    #[test]
    fn line_events_nest_under_the_charge() {
        let charge = sample_charge(17999);
        assert_eq!(charge.event().to_string(), "cha_7/");
        assert_eq!(charge.line_event(3).to_string(), "cha_7/3/");
    }
}
