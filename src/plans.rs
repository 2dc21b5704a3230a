use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use tracing::info;

use crate::error::{BillingError, BillingResult};
use crate::money::{normalize_unit, Price};
use crate::periods::{PeriodCalculator, PeriodType};

const PLAN_COLUMNS: &str = "id, slug, version, title, organization_id, period_type, \
    period_length, period_amount, unit, broker_fee_percent, renewal_type, unlock_event, \
    is_active, created_at";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RenewalType {
    OneTime,
    AutoRenew,
    Repeat,
}

impl RenewalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalType::OneTime => "one_time",
            RenewalType::AutoRenew => "auto_renew",
            RenewalType::Repeat => "repeat",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "one_time" => Some(RenewalType::OneTime),
            "auto_renew" => Some(RenewalType::AutoRenew),
            "repeat" => Some(RenewalType::Repeat),
            _ => None,
        }
    }
}

/// key: plan-version -> pricing terms
/// Pricing terms are frozen per `(slug, version)`. Changing a price goes
/// through [`reprice_plan`], which retires this row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: i64,
    pub slug: String,
    pub version: i32,
    pub title: String,
    pub organization_id: i64,
    pub period_type: PeriodType,
    pub period_length: i32,
    pub period_amount: i64,
    pub unit: String,
    /// Basis points of each charge retained by the broker.
    pub broker_fee_percent: i32,
    pub renewal_type: RenewalType,
    pub unlock_event: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn periods(&self) -> PeriodCalculator {
        PeriodCalculator::new(self.period_type, self.period_length)
    }

    pub fn period_price(&self) -> Price {
        Price::new(self.period_amount, self.unit.clone())
    }

    pub fn broker_fee(&self, amount: i64) -> i64 {
        amount * i64::from(self.broker_fee_percent) / 10_000
    }

    pub fn renews(&self) -> bool {
        self.renewal_type != RenewalType::OneTime
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    id: i64,
    slug: String,
    version: i32,
    title: String,
    organization_id: i64,
    period_type: String,
    period_length: i32,
    period_amount: i64,
    unit: String,
    broker_fee_percent: i32,
    renewal_type: String,
    unlock_event: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        let period_type = PeriodType::from_str(&row.period_type).ok_or_else(|| {
            BillingError::integrity(format!(
                "plan {} has unknown period type `{}`",
                row.slug, row.period_type
            ))
        })?;
        let renewal_type = RenewalType::from_str(&row.renewal_type).ok_or_else(|| {
            BillingError::integrity(format!(
                "plan {} has unknown renewal type `{}`",
                row.slug, row.renewal_type
            ))
        })?;
        Ok(Plan {
            id: row.id,
            slug: row.slug,
            version: row.version,
            title: row.title,
            organization_id: row.organization_id,
            period_type,
            period_length: row.period_length,
            period_amount: row.period_amount,
            unit: row.unit,
            broker_fee_percent: row.broker_fee_percent,
            renewal_type,
            unlock_event: row.unlock_event,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewPlan {
    pub slug: String,
    pub title: String,
    pub organization_id: i64,
    pub period_type: PeriodType,
    pub period_length: i32,
    pub period_amount: i64,
    pub unit: String,
    pub broker_fee_percent: i32,
    pub renewal_type: RenewalType,
    pub unlock_event: Option<String>,
}

/// Metered add-on billed per unit of use on top of a plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, FromRow)]
pub struct UseCharge {
    pub id: i64,
    pub plan_id: i64,
    pub slug: String,
    pub title: String,
    pub use_amount: i64,
    pub quota: i64,
}

pub async fn create_plan(conn: &mut PgConnection, plan: &NewPlan) -> BillingResult<Plan> {
    insert_version(conn, plan, 1).await
}

async fn insert_version(conn: &mut PgConnection, plan: &NewPlan, version: i32) -> BillingResult<Plan> {
    let row = sqlx::query_as::<_, PlanRow>(&format!(
        r#"
        INSERT INTO plans (
            slug, version, title, organization_id, period_type, period_length,
            period_amount, unit, broker_fee_percent, renewal_type, unlock_event
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {PLAN_COLUMNS}
        "#
    ))
    .bind(&plan.slug)
    .bind(version)
    .bind(&plan.title)
    .bind(plan.organization_id)
    .bind(plan.period_type.as_str())
    .bind(plan.period_length)
    .bind(plan.period_amount)
    .bind(normalize_unit(&plan.unit))
    .bind(plan.broker_fee_percent)
    .bind(plan.renewal_type.as_str())
    .bind(&plan.unlock_event)
    .fetch_one(&mut *conn)
    .await?;
    Plan::try_from(row)
}

pub async fn get(conn: &mut PgConnection, id: i64) -> BillingResult<Plan> {
    let row = sqlx::query_as::<_, PlanRow>(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(BillingError::NotFound("plan"))?;
    Plan::try_from(row)
}

/// Current (active) version of the plan named `slug`.
pub async fn find_active(conn: &mut PgConnection, slug: &str) -> BillingResult<Plan> {
    let row = sqlx::query_as::<_, PlanRow>(&format!(
        "SELECT {PLAN_COLUMNS} FROM plans WHERE slug = $1 AND is_active ORDER BY version DESC LIMIT 1"
    ))
    .bind(slug)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("plan"))?;
    Plan::try_from(row)
}

/// Publishes a new version of `plan_id` priced at `period_amount` and
/// retires the previous one. Subscriptions and postings that reference the
/// old version keep its terms.
pub async fn reprice_plan(
    conn: &mut PgConnection,
    plan_id: i64,
    period_amount: i64,
) -> BillingResult<Plan> {
    if period_amount < 0 {
        return Err(BillingError::integrity(format!(
            "plan {plan_id} cannot be priced at {period_amount}"
        )));
    }
    let current = get(conn, plan_id).await?;
    let retired = sqlx::query("UPDATE plans SET is_active = FALSE WHERE id = $1 AND is_active RETURNING id")
        .bind(current.id)
        .fetch_optional(&mut *conn)
        .await?;
    if retired.is_none() {
        return Err(BillingError::integrity(format!(
            "plan {} version {} is already retired",
            current.slug, current.version
        )));
    }

    let next = NewPlan {
        slug: current.slug.clone(),
        title: current.title.clone(),
        organization_id: current.organization_id,
        period_type: current.period_type,
        period_length: current.period_length,
        period_amount,
        unit: current.unit.clone(),
        broker_fee_percent: current.broker_fee_percent,
        renewal_type: current.renewal_type,
        unlock_event: current.unlock_event.clone(),
    };
    let plan = insert_version(conn, &next, current.version + 1).await?;

    sqlx::query(
        r#"
        INSERT INTO use_charges (plan_id, slug, title, use_amount, quota)
        SELECT $2, slug, title, use_amount, quota FROM use_charges WHERE plan_id = $1
        "#,
    )
    .bind(current.id)
    .bind(plan.id)
    .execute(&mut *conn)
    .await?;

    info!(
        plan = %plan.slug,
        version = plan.version,
        old_amount = current.period_amount,
        new_amount = plan.period_amount,
        "plan repriced"
    );
    Ok(plan)
}

pub async fn create_use_charge(
    conn: &mut PgConnection,
    plan_id: i64,
    slug: &str,
    title: &str,
    use_amount: i64,
    quota: i64,
) -> BillingResult<UseCharge> {
    let use_charge = sqlx::query_as::<_, UseCharge>(
        r#"
        INSERT INTO use_charges (plan_id, slug, title, use_amount, quota)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, plan_id, slug, title, use_amount, quota
        "#,
    )
    .bind(plan_id)
    .bind(slug)
    .bind(title)
    .bind(use_amount)
    .bind(quota)
    .fetch_one(&mut *conn)
    .await?;
    Ok(use_charge)
}

pub async fn get_use_charge(conn: &mut PgConnection, id: i64) -> BillingResult<UseCharge> {
    sqlx::query_as::<_, UseCharge>(
        "SELECT id, plan_id, slug, title, use_amount, quota FROM use_charges WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("use charge"))
}

pub async fn use_charges_for_plan(conn: &mut PgConnection, plan_id: i64) -> BillingResult<Vec<UseCharge>> {
    let use_charges = sqlx::query_as::<_, UseCharge>(
        "SELECT id, plan_id, slug, title, use_amount, quota FROM use_charges WHERE plan_id = $1 ORDER BY id",
    )
    .bind(plan_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(use_charges)
}

#[cfg(test)]
pub(crate) fn sample_plan(period_type: PeriodType, period_amount: i64) -> Plan {
    use chrono::TimeZone;

    Plan {
        id: 1,
        slug: "open-space".into(),
        version: 1,
        title: "Open Space".into(),
        organization_id: 2,
        period_type,
        period_length: 1,
        period_amount,
        unit: "usd".into(),
        broker_fee_percent: 1000,
        renewal_type: RenewalType::AutoRenew,
        unlock_event: None,
        is_active: true,
        created_at: Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_type_names_round_trip() {
        for renewal_type in [RenewalType::OneTime, RenewalType::AutoRenew, RenewalType::Repeat] {
            assert_eq!(RenewalType::from_str(renewal_type.as_str()), Some(renewal_type));
        }
        assert_eq!(RenewalType::from_str("forever"), None);
    }

    #[test]
    fn broker_fee_uses_basis_points() {
        let plan = sample_plan(PeriodType::Monthly, 17999);
        assert_eq!(plan.broker_fee(17999), 1799);
        assert_eq!(plan.period_price(), Price::new(17999, "usd"));
        assert!(plan.renews());
    }
}
