use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use tracing::info;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, EventRef};
use crate::plans::Plan;

const SUBSCRIPTION_COLUMNS: &str =
    "id, organization_id, plan_id, created_at, ends_at, auto_renew, request_key, grant_key";

/// key: subscription-lifecycle -> pending opt-in, active, churned
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingOptIn,
    Active,
    Churned,
}

/// Periods are anchored at `created_at`; `ends_at` only moves forward
/// except when an unsubscribe clamps it.
#[derive(Clone, Debug, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: i64,
    pub organization_id: i64,
    pub plan_id: i64,
    pub created_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub auto_renew: bool,
    pub request_key: Option<String>,
    pub grant_key: Option<String>,
}

/// Who has to accept a subscription before it becomes active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptIn {
    /// The subscriber asked; the provider must accept the request.
    Request,
    /// The provider granted; the subscriber must accept the grant.
    Grant,
}

impl Subscription {
    pub fn event(&self) -> EventRef {
        EventRef::subscription(self.id)
    }

    pub fn is_pending(&self) -> bool {
        self.request_key.is_some() || self.grant_key.is_some()
    }

    pub fn status(&self, at_time: DateTime<Utc>) -> SubscriptionStatus {
        if self.is_pending() {
            SubscriptionStatus::PendingOptIn
        } else if self.ends_at > at_time {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Churned
        }
    }

    pub fn is_active(&self, at_time: DateTime<Utc>) -> bool {
        self.status(at_time) == SubscriptionStatus::Active
    }

    /// Half-open billing period `[lower, upper)` holding `at_time`.
    pub fn period_for(&self, plan: &Plan, at_time: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        plan.periods().period_for(self.created_at, at_time)
    }

    pub fn nb_periods(&self, plan: &Plan, start: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        plan.periods().nb_periods(self.created_at, start, until)
    }

    /// `ends_at` after adding `nb_periods` natural periods. When `ends_at`
    /// sits on a period boundary the result is recomputed from the anchor
    /// so month-end clamping does not drift.
    pub fn extended_ends_at(&self, plan: &Plan, nb_periods: i64) -> DateTime<Utc> {
        let periods = plan.periods();
        let index = periods.period_index(self.created_at, self.ends_at);
        if periods.end_of_period(self.created_at, index) == self.ends_at {
            periods.end_of_period(self.created_at, index + nb_periods)
        } else {
            periods.end_of_period(self.ends_at, nb_periods)
        }
    }
}

pub async fn create(
    conn: &mut PgConnection,
    organization_id: i64,
    plan: &Plan,
    created_at: DateTime<Utc>,
    opt_in: Option<OptIn>,
) -> BillingResult<Subscription> {
    let key = || Uuid::new_v4().simple().to_string();
    let (request_key, grant_key) = match opt_in {
        None => (None, None),
        Some(OptIn::Request) => (Some(key()), None),
        Some(OptIn::Grant) => (None, Some(key())),
    };
    let subscription = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        INSERT INTO subscriptions (organization_id, plan_id, created_at, ends_at, auto_renew, request_key, grant_key)
        VALUES ($1, $2, $3, $3, $4, $5, $6)
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(organization_id)
    .bind(plan.id)
    .bind(created_at)
    .bind(plan.renews())
    .bind(request_key)
    .bind(grant_key)
    .fetch_one(&mut *conn)
    .await?;
    info!(
        subscription = subscription.id,
        organization_id,
        plan = %plan.slug,
        pending = subscription.is_pending(),
        "subscription created"
    );
    Ok(subscription)
}

pub async fn get(conn: &mut PgConnection, id: i64) -> BillingResult<Subscription> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("subscription"))
}

/// Moves `ends_at` forward. Returns `false` when the stored value is already
/// at or past `ends_at`.
pub async fn extend(conn: &mut PgConnection, id: i64, ends_at: DateTime<Utc>) -> BillingResult<bool> {
    let row = sqlx::query("UPDATE subscriptions SET ends_at = $2 WHERE id = $1 AND ends_at < $2 RETURNING id")
        .bind(id)
        .bind(ends_at)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Clamps `ends_at` to `at_time` and turns auto-renewal off.
pub async fn unsubscribe(
    conn: &mut PgConnection,
    id: i64,
    at_time: DateTime<Utc>,
) -> BillingResult<Subscription> {
    let subscription = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        UPDATE subscriptions
        SET ends_at = GREATEST(created_at, LEAST(ends_at, $2)),
            auto_renew = FALSE
        WHERE id = $1
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(at_time)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("subscription"))?;
    info!(subscription = id, ends_at = %subscription.ends_at, "unsubscribed");
    Ok(subscription)
}

/// Provider accepts a subscriber's request.
pub async fn accept_request(conn: &mut PgConnection, request_key: &str) -> BillingResult<Subscription> {
    accept(conn, "request_key", request_key).await
}

/// Subscriber accepts a provider's grant.
pub async fn accept_grant(conn: &mut PgConnection, grant_key: &str) -> BillingResult<Subscription> {
    accept(conn, "grant_key", grant_key).await
}

async fn accept(conn: &mut PgConnection, column: &str, key: &str) -> BillingResult<Subscription> {
    let subscription = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        UPDATE subscriptions
        SET request_key = NULL, grant_key = NULL
        WHERE {column} = $1
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BillingError::NotFound("subscription opt-in"))?;
    info!(subscription = subscription.id, via = column, "subscription opt-in accepted");
    Ok(subscription)
}

/// True while the subscription's own events still carry an unpaid
/// statement balance.
pub async fn is_locked(
    conn: &mut PgConnection,
    subscription: &Subscription,
    at_time: DateTime<Utc>,
) -> BillingResult<bool> {
    let event = subscription.event();
    let balances = ledger::store::get_statement_balances(
        conn,
        subscription.organization_id,
        at_time,
        Some(&event),
    )
    .await?;
    Ok(balances.values().flat_map(|units| units.values()).any(|amount| *amount > 0))
}

/// Accepted subscriptions created on or before `until`.
pub async fn valid_until(conn: &mut PgConnection, until: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
        WHERE created_at <= $1
          AND request_key IS NULL
          AND grant_key IS NULL
        ORDER BY id
        "#
    ))
    .bind(until)
    .fetch_all(&mut *conn)
    .await?;
    Ok(subscriptions)
}

/// Auto-renewing accepted subscriptions ending in `(at_time, at_time + 1 day]`.
pub async fn renewal_candidates(
    conn: &mut PgConnection,
    at_time: DateTime<Utc>,
) -> BillingResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
        WHERE auto_renew
          AND request_key IS NULL
          AND grant_key IS NULL
          AND ends_at > $1
          AND ends_at <= $2
        ORDER BY id
        "#
    ))
    .bind(at_time)
    .bind(at_time + Duration::days(1))
    .fetch_all(&mut *conn)
    .await?;
    Ok(subscriptions)
}

/// Accepted subscriptions whose `ends_at` falls in `[lower, upper)`.
pub async fn ending_between(
    conn: &mut PgConnection,
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
) -> BillingResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
        WHERE ends_at >= $1
          AND ends_at < $2
          AND request_key IS NULL
          AND grant_key IS NULL
        ORDER BY organization_id, id
        "#
    ))
    .bind(lower)
    .bind(upper)
    .fetch_all(&mut *conn)
    .await?;
    Ok(subscriptions)
}

/// Subscriptions of `organization_id` still running at `at_time`.
pub async fn active_for(
    conn: &mut PgConnection,
    organization_id: i64,
    at_time: DateTime<Utc>,
) -> BillingResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
        r#"
        SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
        WHERE organization_id = $1
          AND ends_at > $2
          AND request_key IS NULL
          AND grant_key IS NULL
        ORDER BY id
        "#
    ))
    .bind(organization_id)
    .bind(at_time)
    .fetch_all(&mut *conn)
    .await?;
    Ok(subscriptions)
}

#[cfg(test)]
pub(crate) fn sample_subscription(created_at: DateTime<Utc>) -> Subscription {
    Subscription {
        id: 12,
        organization_id: 1,
        plan_id: 1,
        created_at,
        ends_at: created_at,
        auto_renew: true,
        request_key: None,
        grant_key: None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::periods::PeriodType;
    use crate::plans::sample_plan;

    #[test]
    fn status_follows_keys_and_ends_at() {
        let t0 = Utc.with_ymd_and_hms(2014, 9, 10, 0, 0, 0).unwrap();
        let mut subscription = sample_subscription(t0);
        subscription.ends_at = t0 + Duration::days(30);
        assert_eq!(subscription.status(t0), SubscriptionStatus::Active);
        assert_eq!(
            subscription.status(t0 + Duration::days(30)),
            SubscriptionStatus::Churned
        );
        subscription.grant_key = Some("abc".into());
        assert_eq!(subscription.status(t0), SubscriptionStatus::PendingOptIn);
    }

    #[test]
    fn extension_stays_anchored_at_month_end() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let plan = sample_plan(PeriodType::Monthly, 1000);
        let mut subscription = sample_subscription(t0);

        subscription.ends_at = subscription.extended_ends_at(&plan, 1);
        assert_eq!(subscription.ends_at, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        subscription.ends_at = subscription.extended_ends_at(&plan, 1);
        assert_eq!(subscription.ends_at, Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn extension_from_clamped_end_moves_by_whole_periods() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let plan = sample_plan(PeriodType::Daily, 100);
        let mut subscription = sample_subscription(t0);
        subscription.ends_at = t0 + Duration::hours(36);
        assert_eq!(
            subscription.extended_ends_at(&plan, 2),
            t0 + Duration::hours(36) + Duration::days(2)
        );
    }
}
