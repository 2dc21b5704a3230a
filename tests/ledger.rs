use billing_engine::ledger::{self, factory, statements, Account, BalanceQuery};
use billing_engine::organizations::{self, Organization};
use billing_engine::periods::PeriodType;
use billing_engine::plans::{self, NewPlan, Plan, RenewalType};
use billing_engine::subscriptions::{self, OptIn, SubscriptionStatus};
use billing_engine::{payouts, BillingConfig, Price};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{PgConnection, PgPool};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2014, 9, 10, 0, 0, 0).unwrap()
}

async fn provider_plan(conn: &mut PgConnection, unlock_event: Option<&str>) -> (Organization, Plan) {
    organizations::ensure(conn, "broker", "Broker").await.unwrap();
    organizations::ensure(conn, "processor", "Processor").await.unwrap();
    let cowork = organizations::ensure(conn, "cowork", "Cowork Space").await.unwrap();
    let plan = plans::create_plan(
        conn,
        &NewPlan {
            slug: "open-space".into(),
            title: "Open Space".into(),
            organization_id: cowork.id,
            period_type: PeriodType::Monthly,
            period_length: 1,
            period_amount: 17999,
            unit: "usd".into(),
            broker_fee_percent: 1000,
            renewal_type: RenewalType::AutoRenew,
            unlock_event: unlock_event.map(str::to_string),
        },
    )
    .await
    .unwrap();
    (cowork, plan)
}

// key: ledger-tests -> group buy moves the debt to the payer
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn payer_assumes_subscriber_order(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let (_, plan) = provider_plan(&mut conn, None).await;
    let xia = organizations::ensure(&mut conn, "xia", "Xia Lee").await.unwrap();
    let acme = organizations::ensure(&mut conn, "acme", "Acme Corp").await.unwrap();
    let subscription = subscriptions::create(&mut conn, xia.id, &plan, t0(), None).await.unwrap();

    let order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    ledger::record_order(&mut conn, &[order], Some(acme.id)).await.unwrap();

    let until = t0() + Duration::hours(1);
    assert!(ledger::get_invoiceables(&mut conn, xia.id, until).await.unwrap().is_empty());
    let invoiceables = ledger::get_invoiceables(&mut conn, acme.id, until).await.unwrap();
    assert_eq!(invoiceables.len(), 1);
    assert_eq!(invoiceables[0].dest_account, Account::Liability);

    let balances = ledger::get_statement_balances(&mut conn, acme.id, until, None).await.unwrap();
    assert_eq!(
        statements::total_for_prefix(&balances, &subscription.event().to_string(), "usd"),
        17999
    );
    let subscription = subscriptions::get(&mut conn, subscription.id).await.unwrap();
    assert_eq!(subscription.ends_at, Utc.with_ymd_and_hms(2014, 10, 10, 0, 0, 0).unwrap());
}

// key: ledger-tests -> writeoff clears the statement
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn writeoff_settles_unpaid_orders(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let (cowork, plan) = provider_plan(&mut conn, None).await;
    let xia = organizations::ensure(&mut conn, "xia", "Xia Lee").await.unwrap();
    let subscription = subscriptions::create(&mut conn, xia.id, &plan, t0(), None).await.unwrap();
    let order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    ledger::record_order(&mut conn, &[order], None).await.unwrap();
    assert!(subscriptions::is_locked(&mut conn, &subscription, t0() + Duration::hours(1))
        .await
        .unwrap());

    let written_off = ledger::writeoff_statement(&mut conn, xia.id, t0() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(written_off.len(), 2);
    assert_eq!(written_off[0].dest_account, Account::Writeoff);
    assert_eq!(written_off[1].dest_organization_id, cowork.id);
    assert_eq!(written_off[1].dest_account, Account::Canceled);

    let later = t0() + Duration::days(2);
    assert!(ledger::get_statement_balances(&mut conn, xia.id, later, None)
        .await
        .unwrap()
        .is_empty());
    assert!(ledger::get_invoiceables(&mut conn, xia.id, later).await.unwrap().is_empty());
    assert!(!subscriptions::is_locked(&mut conn, &subscription, later).await.unwrap());

    // Running it again finds nothing left to write off.
    assert!(ledger::writeoff_statement(&mut conn, xia.id, later).await.unwrap().is_empty());
}

// key: ledger-tests -> offline payments net out of funds
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn offline_payment_pays_the_statement(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let (cowork, plan) = provider_plan(&mut conn, None).await;
    let xia = organizations::ensure(&mut conn, "xia", "Xia Lee").await.unwrap();
    let subscription = subscriptions::create(&mut conn, xia.id, &plan, t0(), None).await.unwrap();
    let order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    ledger::record_order(&mut conn, &[order], None).await.unwrap();

    let paid_at = t0() + Duration::hours(2);
    let legs = payouts::pay_offline(
        &mut conn,
        &BillingConfig::default(),
        xia.id,
        cowork.id,
        &Price::new(17999, "usd"),
        &subscription.event(),
        paid_at,
    )
    .await
    .unwrap();
    assert_eq!(legs.len(), 5);

    let later = paid_at + Duration::hours(1);
    assert!(ledger::get_statement_balances(&mut conn, xia.id, later, None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(organizations::get(&mut conn, cowork.id).await.unwrap().funds_balance, 0);
    let offline = ledger::get_balance(&mut conn, &BalanceQuery::account(cowork.id, Account::Offline))
        .await
        .unwrap();
    assert_eq!(offline, Price::new(17999, "usd"));
}

// key: ledger-tests -> pay-later orders on unlockable plans
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn zero_amount_order_is_deferred_until_unlock(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let (_, plan) = provider_plan(&mut conn, Some("first-visit")).await;
    let xia = organizations::ensure(&mut conn, "xia", "Xia Lee").await.unwrap();
    let subscription = subscriptions::create(&mut conn, xia.id, &plan, t0(), None).await.unwrap();

    let mut order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    order.dest_amount = 0;
    order.orig_amount = 0;
    let recorded = ledger::record_order(&mut conn, &[order], None).await.unwrap();
    assert_eq!(recorded[0].dest_amount, 17999);
    assert!(recorded[0].descr.ends_with("(pay later, unlocked by first-visit)"));
    let subscription = subscriptions::get(&mut conn, subscription.id).await.unwrap();
    assert!(subscription.is_active(t0() + Duration::days(1)));
}

// key: ledger-tests -> repricing keeps existing terms
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn repriced_plan_grandfathers_subscriptions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let (_, plan) = provider_plan(&mut conn, None).await;
    let xia = organizations::ensure(&mut conn, "xia", "Xia Lee").await.unwrap();
    let subscription = subscriptions::create(&mut conn, xia.id, &plan, t0(), Some(OptIn::Grant))
        .await
        .unwrap();
    assert_eq!(subscription.status(t0()), SubscriptionStatus::PendingOptIn);
    let grant_key = subscription.grant_key.clone().unwrap();
    let subscription = subscriptions::accept_grant(&mut conn, &grant_key).await.unwrap();
    assert!(!subscription.is_pending());

    let repriced = plans::reprice_plan(&mut conn, plan.id, 19999).await.unwrap();
    assert_eq!(repriced.version, 2);
    assert_eq!(plans::find_active(&mut conn, "open-space").await.unwrap().id, repriced.id);
    assert!(!plans::get(&mut conn, plan.id).await.unwrap().is_active);
    assert!(plans::reprice_plan(&mut conn, plan.id, 20999).await.is_err());

    let current = plans::get(&mut conn, subscription.plan_id).await.unwrap();
    let order = factory::new_subscription_order(&subscription, &current, 1, t0());
    assert_eq!(order.dest_amount, 17999);
}
