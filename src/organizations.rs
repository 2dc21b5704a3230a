use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use tracing::{info, warn};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::money::{normalize_unit, Price};

const ORGANIZATION_COLUMNS: &str = "id, slug, full_name, funds_balance, funds_unit, \
    nb_renewal_attempts, processor_card_key, card_exp_date, processor_deposit_key, created_at";

/// key: organization-profile -> subscriber, provider, broker or processor
#[derive(Clone, Debug, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub id: i64,
    pub slug: String,
    pub full_name: String,
    /// Cached projection of the Funds account, maintained in the same
    /// database transaction as every posting that touches Funds.
    pub funds_balance: i64,
    pub funds_unit: String,
    pub nb_renewal_attempts: i32,
    pub processor_card_key: Option<String>,
    pub card_exp_date: Option<NaiveDate>,
    pub processor_deposit_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn funds(&self) -> Price {
        Price::new(self.funds_balance, self.funds_unit.clone())
    }

    pub fn has_card(&self) -> bool {
        self.processor_card_key.is_some()
    }

    /// Whether the card on file expires on or before `date`.
    pub fn card_expires_by(&self, date: NaiveDate) -> bool {
        match self.card_exp_date {
            Some(exp_date) => exp_date <= date,
            None => false,
        }
    }
}

/// The platform-side organizations every charge distributes to.
#[derive(Clone, Debug)]
pub struct BillingParties {
    pub broker: Organization,
    pub processor: Organization,
}

impl BillingParties {
    pub async fn resolve(conn: &mut PgConnection, config: &BillingConfig) -> BillingResult<Self> {
        let broker = by_slug(conn, &config.broker_slug).await?;
        let processor = by_slug(conn, &config.processor_slug).await?;
        Ok(Self { broker, processor })
    }
}

/// Creates `slug` or returns the existing organization untouched.
pub async fn ensure(conn: &mut PgConnection, slug: &str, full_name: &str) -> BillingResult<Organization> {
    if slug.trim().is_empty() {
        return Err(BillingError::integrity("organization slug required"));
    }
    sqlx::query(
        "INSERT INTO organizations (slug, full_name) VALUES ($1, $2) ON CONFLICT (slug) DO NOTHING",
    )
    .bind(slug.trim())
    .bind(full_name)
    .execute(&mut *conn)
    .await?;
    by_slug(conn, slug.trim()).await
}

pub async fn get(conn: &mut PgConnection, id: i64) -> BillingResult<Organization> {
    sqlx::query_as::<_, Organization>(&format!(
        "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("organization"))
}

pub async fn by_slug(conn: &mut PgConnection, slug: &str) -> BillingResult<Organization> {
    sqlx::query_as::<_, Organization>(&format!(
        "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE slug = $1"
    ))
    .bind(slug)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("organization"))
}

/// Adds `delta` (possibly negative) to the cached funds balance. A zero
/// balance adopts `unit`; otherwise units must match.
pub async fn adjust_funds_balance(
    conn: &mut PgConnection,
    organization_id: i64,
    delta: i64,
    unit: &str,
) -> BillingResult<Organization> {
    let unit = normalize_unit(unit);
    let updated = sqlx::query_as::<_, Organization>(&format!(
        r#"
        UPDATE organizations
        SET funds_balance = funds_balance + $2,
            funds_unit = CASE WHEN funds_balance = 0 THEN $3 ELSE funds_unit END
        WHERE id = $1
          AND (funds_unit = $3 OR funds_balance = 0)
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(organization_id)
    .bind(delta)
    .bind(&unit)
    .fetch_optional(&mut *conn)
    .await?;

    match updated {
        Some(organization) => Ok(organization),
        None => {
            let organization = get(conn, organization_id).await?;
            Err(BillingError::MixedUnits {
                units: vec![organization.funds_unit, unit],
            })
        }
    }
}

/// Decrements the cached funds balance only if it covers `price`.
pub async fn debit_funds(
    conn: &mut PgConnection,
    organization_id: i64,
    price: &Price,
) -> BillingResult<Organization> {
    let updated = sqlx::query_as::<_, Organization>(&format!(
        r#"
        UPDATE organizations
        SET funds_balance = funds_balance - $2
        WHERE id = $1
          AND funds_unit = $3
          AND funds_balance >= $2
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(organization_id)
    .bind(price.amount)
    .bind(&price.unit)
    .fetch_optional(&mut *conn)
    .await?;

    match updated {
        Some(organization) => Ok(organization),
        None => {
            let organization = get(conn, organization_id).await?;
            if organization.funds_balance != 0 && organization.funds_unit != price.unit {
                return Err(BillingError::MixedUnits {
                    units: vec![organization.funds_unit, price.unit.clone()],
                });
            }
            warn!(
                organization = %organization.slug,
                requested = price.amount,
                available = organization.funds_balance,
                "insufficient funds"
            );
            Err(BillingError::InsufficientFunds {
                organization: organization.slug,
                requested: price.amount,
                available: organization.funds_balance,
                unit: price.unit.clone(),
            })
        }
    }
}

pub async fn increment_renewal_attempts(conn: &mut PgConnection, organization_id: i64) -> BillingResult<i32> {
    let attempts: i32 = sqlx::query_scalar(
        "UPDATE organizations SET nb_renewal_attempts = nb_renewal_attempts + 1 WHERE id = $1 RETURNING nb_renewal_attempts",
    )
    .bind(organization_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("organization"))?;
    Ok(attempts)
}

pub async fn reset_renewal_attempts(conn: &mut PgConnection, organization_id: i64) -> BillingResult<()> {
    sqlx::query("UPDATE organizations SET nb_renewal_attempts = 0 WHERE id = $1 AND nb_renewal_attempts <> 0")
        .bind(organization_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Records the processor-side card reference and its expiry.
pub async fn update_card(
    conn: &mut PgConnection,
    organization_id: i64,
    card_key: Option<&str>,
    exp_date: Option<NaiveDate>,
) -> BillingResult<Organization> {
    let organization = sqlx::query_as::<_, Organization>(&format!(
        r#"
        UPDATE organizations
        SET processor_card_key = $2, card_exp_date = $3, nb_renewal_attempts = 0
        WHERE id = $1
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(organization_id)
    .bind(card_key)
    .bind(exp_date)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("organization"))?;
    info!(organization = %organization.slug, has_card = organization.has_card(), "card on file updated");
    Ok(organization)
}

pub async fn update_deposit_key(
    conn: &mut PgConnection,
    organization_id: i64,
    deposit_key: Option<&str>,
) -> BillingResult<()> {
    sqlx::query("UPDATE organizations SET processor_deposit_key = $2 WHERE id = $1")
        .bind(organization_id)
        .bind(deposit_key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Organizations that still have renewal attempts left, excluding the
/// platform parties.
pub async fn renewal_candidates(
    conn: &mut PgConnection,
    config: &BillingConfig,
) -> BillingResult<Vec<Organization>> {
    let organizations = sqlx::query_as::<_, Organization>(&format!(
        r#"
        SELECT {ORGANIZATION_COLUMNS} FROM organizations
        WHERE nb_renewal_attempts < $1
          AND slug <> $2
          AND slug <> $3
        ORDER BY id
        "#
    ))
    .bind(config.max_renewal_attempts)
    .bind(&config.broker_slug)
    .bind(&config.processor_slug)
    .fetch_all(&mut *conn)
    .await?;
    Ok(organizations)
}

#[cfg(test)]
pub(crate) fn sample_organization(id: i64, slug: &str) -> Organization {
    use chrono::TimeZone;

    Organization {
        id,
        slug: slug.to_string(),
        full_name: slug.to_string(),
        funds_balance: 0,
        funds_unit: "usd".to_string(),
        nb_renewal_attempts: 0,
        processor_card_key: None,
        card_exp_date: None,
        processor_deposit_key: None,
        created_at: Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_expiry_is_inclusive() {
        let mut organization = sample_organization(1, "xia");
        let day = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        assert!(!organization.card_expires_by(day));
        organization.card_exp_date = Some(day);
        assert!(organization.card_expires_by(day));
        assert!(!organization.card_expires_by(day.pred_opt().unwrap()));
    }
}
