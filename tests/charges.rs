use std::sync::Arc;

use billing_engine::charges::{ChargeService, ChargeState};
use billing_engine::ledger::{self, factory, Account, BalanceQuery};
use billing_engine::organizations::{self, Organization};
use billing_engine::periods::PeriodType;
use billing_engine::plans::{self, NewPlan, RenewalType};
use billing_engine::processor::{ChargeEvent, LocalProcessor, Processor};
use billing_engine::signals::{BillingSignal, RecordingSignalSink};
use billing_engine::subscriptions::{self, Subscription};
use billing_engine::{payouts, BillingConfig, BillingError, Price};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{PgConnection, PgPool};

struct Fixture {
    xia: Organization,
    cowork: Organization,
    subscription: Subscription,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2014, 9, 10, 0, 0, 0).unwrap()
}

async fn fixture(conn: &mut PgConnection) -> Fixture {
    organizations::ensure(conn, "broker", "Broker").await.unwrap();
    organizations::ensure(conn, "processor", "Processor").await.unwrap();
    let xia = organizations::ensure(conn, "xia", "Xia Lee").await.unwrap();
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
            unlock_event: None,
        },
    )
    .await
    .unwrap();
    let subscription = subscriptions::create(conn, xia.id, &plan, t0(), None).await.unwrap();
    let order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    ledger::record_order(conn, &[order], None).await.unwrap();
    Fixture {
        xia,
        cowork,
        subscription,
    }
}

fn service(pool: &PgPool, signals: Arc<RecordingSignalSink>) -> ChargeService {
    ChargeService::new(
        pool.clone(),
        Arc::new(LocalProcessor::new(290, 0)),
        signals,
        BillingConfig::default(),
    )
}

fn service_with(pool: &PgPool, processor: Arc<LocalProcessor>) -> ChargeService {
    ChargeService::new(
        pool.clone(),
        processor,
        Arc::new(RecordingSignalSink::default()),
        BillingConfig::default(),
    )
}

/// Adds a $10.01 locker plan from the same provider to xia's orders.
async fn add_locker(conn: &mut PgConnection, fixture: &Fixture) -> Subscription {
    let plan = plans::create_plan(
        conn,
        &NewPlan {
            slug: "locker".into(),
            title: "Locker".into(),
            organization_id: fixture.cowork.id,
            period_type: PeriodType::Monthly,
            period_length: 1,
            period_amount: 1001,
            unit: "usd".into(),
            broker_fee_percent: 1000,
            renewal_type: RenewalType::AutoRenew,
            unlock_event: None,
        },
    )
    .await
    .unwrap();
    let subscription = subscriptions::create(conn, fixture.xia.id, &plan, t0(), None).await.unwrap();
    let order = factory::new_subscription_order(&subscription, &plan, 1, t0());
    ledger::record_order(conn, &[order], None).await.unwrap();
    subscription
}

fn legs_between(legs: &[ledger::Transaction], dest: Account, orig: Account) -> Vec<i64> {
    legs.iter()
        .filter(|txn| txn.dest_account == dest && txn.orig_account == orig)
        .map(|txn| txn.dest_amount)
        .collect()
}

async fn funds(conn: &mut PgConnection, slug: &str) -> i64 {
    organizations::by_slug(conn, slug).await.unwrap().funds_balance
}

// key: charge-tests -> distribution of a $179.99 charge
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn successful_charge_distributes_funds(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    let signals = Arc::new(RecordingSignalSink::default());
    let service = service(&pool, signals.clone());

    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(invoiceables.len(), 1);
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();
    assert_eq!(charge.state, ChargeState::Done);
    assert_eq!(charge.amount, 17999);
    assert_eq!(charge.broker_fee_amount, 1799);

    let payment = ledger::store::by_event(&mut conn, &charge.event()).await.unwrap();
    assert_eq!(payment.len(), 1);
    assert_eq!(payment[0].dest_account, Account::Funds);
    assert_eq!(payment[0].orig_organization_id, fixture.xia.id);
    assert_eq!(payment[0].orig_account, Account::Liability);

    let legs = ledger::store::by_event(&mut conn, &fixture.subscription.event()).await.unwrap();
    let leg = |dest: Account, orig: Account| {
        legs.iter()
            .filter(|txn| txn.dest_account == dest && txn.orig_account == orig)
            .map(|txn| txn.dest_amount)
            .collect::<Vec<_>>()
    };
    assert_eq!(leg(Account::Expenses, Account::Backlog), vec![522, 1799]);
    assert_eq!(leg(Account::Funds, Account::Funds), vec![1799, 15678]);
    assert_eq!(leg(Account::Receivable, Account::Backlog), vec![17999]);
    assert_eq!(leg(Account::Liability, Account::Payable), vec![17999]);

    assert_eq!(funds(&mut conn, "cowork").await, 15678);
    assert_eq!(funds(&mut conn, "broker").await, 1799);
    assert_eq!(funds(&mut conn, "processor").await, 522);

    let payable = ledger::get_balance(
        &mut conn,
        &BalanceQuery::account(fixture.xia.id, Account::Payable).for_event(&fixture.subscription.event()),
    )
    .await
    .unwrap();
    assert!(payable.is_zero());
    assert!(ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1))
        .await
        .unwrap()
        .is_empty());

    let items = billing_engine::charges::store::items(&mut conn, charge.id).await.unwrap();
    assert!(items[0].invoiced_processor_fee_id.is_some());
    assert!(items[0].invoiced_distribute_id.is_some());
    assert!(signals
        .take()
        .await
        .iter()
        .any(|signal| matches!(signal, BillingSignal::ChargeUpdated { state, .. } if state == "done")));
}

// key: charge-tests -> partial refund and insufficient funds
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refund_requires_provider_funds(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    let service = service(&pool, Arc::new(RecordingSignalSink::default()));
    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();
    let line = billing_engine::charges::store::items(&mut conn, charge.id).await.unwrap()[0].id;

    let postings = service.refund(&mut conn, charge.id, line, Some(5000), t0()).await.unwrap();
    assert_eq!(postings[0].dest_organization_id, fixture.cowork.id);
    assert_eq!(postings[0].dest_account, Account::Refund);
    assert_eq!(postings[0].orig_organization_id, fixture.xia.id);
    assert_eq!(postings[0].orig_account, Account::Refunded);
    assert_eq!(postings[0].dest_amount, 5000);
    assert_eq!(funds(&mut conn, "cowork").await, 15678 - 4355);

    // More than what is left on the line.
    assert!(matches!(
        service.refund(&mut conn, charge.id, line, Some(13000), t0()).await,
        Err(BillingError::InvalidRefund(_))
    ));

    payouts::withdraw_funds(
        &mut conn,
        service.processor().as_ref(),
        fixture.cowork.id,
        &Price::new(15678 - 4355, "usd"),
        t0(),
    )
    .await
    .unwrap();
    assert_eq!(funds(&mut conn, "cowork").await, 0);

    assert!(matches!(
        service.refund(&mut conn, charge.id, line, Some(5000), t0()).await,
        Err(BillingError::InsufficientFunds { .. })
    ));
}

// key: charge-tests -> chargeback and reversal
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dispute_won_reverses_chargeback(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    let service = service(&pool, Arc::new(RecordingSignalSink::default()));
    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();

    let disputed = service
        .update_charge_state(&mut conn, &charge, ChargeEvent::DisputeCreated, t0())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(disputed.state, ChargeState::Disputed);
    assert_eq!(funds(&mut conn, "cowork").await, -1500);

    // A stale copy of the charge loses the compare-and-swap.
    assert!(matches!(
        service
            .update_charge_state(&mut conn, &charge, ChargeEvent::DisputeCreated, t0())
            .await,
        Err(BillingError::ChargeConflict { .. })
    ));
    // A redelivered webhook is a no-op.
    assert!(service
        .update_charge_state(&mut conn, &disputed, ChargeEvent::DisputeCreated, t0())
        .await
        .unwrap()
        .is_none());

    let won = service
        .update_charge_state(&mut conn, &disputed, ChargeEvent::DisputeWon, t0())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(won.state, ChargeState::Done);
    assert_eq!(funds(&mut conn, "cowork").await, 15678 - 1500);
}

// key: charge-tests -> refund issued from the processor dashboard
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn processor_refund_event_is_recorded(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    let processor = Arc::new(LocalProcessor::new(290, 0));
    let service = service_with(&pool, processor.clone());
    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();
    let line = billing_engine::charges::store::items(&mut conn, charge.id).await.unwrap()[0].id;

    processor.refund_charge(&charge, 5000, 0).await.unwrap();
    let synced = service
        .apply_event(&charge.processor_key, ChargeEvent::Refunded, t0() + Duration::days(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.state, ChargeState::Done);

    let legs = ledger::store::by_event(&mut conn, &charge.line_event(line)).await.unwrap();
    assert_eq!(legs_between(&legs, Account::Refund, Account::Refunded), vec![5000]);
    assert_eq!(legs_between(&legs, Account::Funds, Account::Funds), vec![4355, 500]);
    assert_eq!(legs_between(&legs, Account::Backlog, Account::Expenses), vec![145, 500]);
    assert_eq!(funds(&mut conn, "cowork").await, 15678 - 4355);
    assert_eq!(funds(&mut conn, "broker").await, 1799 - 500);

    // The ledger now agrees with the processor; a redelivery is a no-op.
    assert!(service
        .apply_event(&charge.processor_key, ChargeEvent::Refunded, t0() + Duration::days(1))
        .await
        .unwrap()
        .is_none());
    assert_eq!(funds(&mut conn, "cowork").await, 15678 - 4355);

    // The rest of the line can still be refunded locally.
    let postings = service.refund(&mut conn, charge.id, line, None, t0() + Duration::days(2)).await.unwrap();
    assert_eq!(postings[0].dest_amount, 17999 - 5000);
    assert_eq!(processor.refunded(&charge.processor_key), Some(17999));
    assert_eq!(funds(&mut conn, "cowork").await, 0);
}

// key: charge-tests -> two items, remainder on the last one
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn multi_item_charge_splits_every_fee(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    let locker = add_locker(&mut conn, &fixture).await;
    let service = service_with(&pool, Arc::new(LocalProcessor::new(290, 30)));

    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(invoiceables.len(), 2);
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();
    assert_eq!(charge.amount, 19000);
    assert_eq!(charge.broker_fee_amount, 1899);

    let open_space = ledger::store::by_event(&mut conn, &fixture.subscription.event()).await.unwrap();
    assert_eq!(legs_between(&open_space, Account::Expenses, Account::Backlog), vec![550, 1798]);
    assert_eq!(legs_between(&open_space, Account::Funds, Account::Funds), vec![1798, 15649]);
    let lockers = ledger::store::by_event(&mut conn, &locker.event()).await.unwrap();
    assert_eq!(legs_between(&lockers, Account::Expenses, Account::Backlog), vec![31, 101]);
    assert_eq!(legs_between(&lockers, Account::Funds, Account::Funds), vec![101, 871]);

    let cowork = funds(&mut conn, "cowork").await;
    let broker = funds(&mut conn, "broker").await;
    let processor = funds(&mut conn, "processor").await;
    assert_eq!((cowork, broker, processor), (16520, 1899, 581));
    assert_eq!(cowork + broker + processor, charge.amount);
}

// key: charge-tests -> per-line refund then dispute on a two-item charge
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dispute_after_line_refund_takes_back_the_rest(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let fixture = fixture(&mut conn).await;
    add_locker(&mut conn, &fixture).await;
    let service = service_with(&pool, Arc::new(LocalProcessor::new(290, 30)));
    let invoiceables = ledger::get_invoiceables(&mut conn, fixture.xia.id, t0() + Duration::hours(1)).await.unwrap();
    let charge = service
        .charge_card(&mut conn, &fixture.xia, &invoiceables, Some("tok_visa"), t0())
        .await
        .unwrap();
    let items = billing_engine::charges::store::items(&mut conn, charge.id).await.unwrap();
    let (first, second) = (items[0].id, items[1].id);

    let postings = service.refund(&mut conn, charge.id, second, None, t0()).await.unwrap();
    assert_eq!(postings[0].dest_amount, 1001);
    let refunded = ledger::store::by_event(&mut conn, &charge.line_event(second)).await.unwrap();
    assert_eq!(legs_between(&refunded, Account::Funds, Account::Funds), vec![871, 101]);
    assert_eq!(legs_between(&refunded, Account::Backlog, Account::Expenses), vec![29, 101]);
    assert_eq!(funds(&mut conn, "cowork").await, 15649);
    assert_eq!(funds(&mut conn, "broker").await, 1798);
    assert!(matches!(
        service.refund(&mut conn, charge.id, second, None, t0()).await,
        Err(BillingError::InvalidRefund(_))
    ));

    service
        .update_charge_state(&mut conn, &charge, ChargeEvent::DisputeCreated, t0() + Duration::days(1))
        .await
        .unwrap()
        .unwrap();
    let disputed = ledger::store::by_event(&mut conn, &charge.line_event(first)).await.unwrap();
    assert_eq!(legs_between(&disputed, Account::Chargeback, Account::Refunded), vec![17999]);
    assert_eq!(legs_between(&disputed, Account::Funds, Account::Funds), vec![15649, 1798]);
    let untouched = ledger::store::by_event(&mut conn, &charge.line_event(second)).await.unwrap();
    assert!(legs_between(&untouched, Account::Chargeback, Account::Refunded).is_empty());

    // Chargeback and dispute fee are posted even past what cowork holds.
    assert_eq!(funds(&mut conn, "cowork").await, -1500);
    assert_eq!(funds(&mut conn, "broker").await, 0);
    assert_eq!(funds(&mut conn, "processor").await, 19000 + 1500);
}
