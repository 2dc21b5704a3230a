use std::collections::{BTreeMap, BTreeSet};

use super::accounts::Account;
use super::models::Transaction;

/// Outstanding amount per `event_id`, then per unit. Events that net to
/// zero in every unit are absent.
pub type StatementBalances = BTreeMap<String, BTreeMap<String, i64>>;

/// Folds raw postings into statement balances for `organization_id`.
///
/// Owed amounts are payables landing on the organization plus liabilities
/// it assumed for another organization's order. Receivable markers
/// (`Backlog -> Receivable` once paid, `Receivable -> Canceled` once written
/// off) reduce the owed amount of the same event.
pub fn fold_statement_balances(
    organization_id: i64,
    transactions: &[Transaction],
) -> StatementBalances {
    let mut balances: StatementBalances = BTreeMap::new();
    let mut owed_events = BTreeSet::new();

    for txn in transactions {
        if is_owed(organization_id, txn) {
            let event_id = txn.event_id.clone().unwrap_or_default();
            *balances
                .entry(event_id.clone())
                .or_default()
                .entry(txn.dest_unit.clone())
                .or_default() += txn.dest_amount;
            owed_events.insert(event_id);
        }
    }

    for txn in transactions {
        let Some(event_id) = txn.event_id.as_ref() else {
            continue;
        };
        if !is_settlement_marker(txn) || !owed_events.contains(event_id) {
            continue;
        }
        *balances
            .entry(event_id.clone())
            .or_default()
            .entry(txn.dest_unit.clone())
            .or_default() -= txn.dest_amount;
    }

    balances.retain(|_, units| {
        units.retain(|_, amount| *amount != 0);
        !units.is_empty()
    });
    balances
}

fn is_owed(organization_id: i64, txn: &Transaction) -> bool {
    if txn.dest_organization_id != organization_id {
        return false;
    }
    match txn.dest_account {
        Account::Payable => true,
        Account::Liability => {
            txn.orig_account == Account::Payable && txn.orig_organization_id != organization_id
        }
        _ => false,
    }
}

fn is_settlement_marker(txn: &Transaction) -> bool {
    matches!(
        (txn.orig_account, txn.dest_account),
        (Account::Backlog, Account::Receivable) | (Account::Receivable, Account::Canceled)
    )
}

/// Sum of the balances for events under `prefix` in `unit`.
pub fn total_for_prefix(balances: &StatementBalances, prefix: &str, unit: &str) -> i64 {
    balances
        .iter()
        .filter(|(event_id, _)| event_id.starts_with(prefix))
        .filter_map(|(_, units)| units.get(unit))
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    const SUBSCRIBER: i64 = 1;
    const PROVIDER: i64 = 2;
    const PAYER: i64 = 3;

    fn txn(
        id: i64,
        event_id: &str,
        (dest_organization_id, dest_account): (i64, Account),
        (orig_organization_id, orig_account): (i64, Account),
        amount: i64,
    ) -> Transaction {
        Transaction {
            id,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            descr: String::new(),
            event_id: Some(event_id.to_string()),
            orig_organization_id,
            orig_account,
            orig_amount: amount,
            orig_unit: "usd".into(),
            dest_organization_id,
            dest_account,
            dest_amount: amount,
            dest_unit: "usd".into(),
            nb_periods: None,
            period_type: None,
        }
    }

    fn order(id: i64, event_id: &str, amount: i64) -> Transaction {
        txn(
            id,
            event_id,
            (SUBSCRIBER, Account::Payable),
            (PROVIDER, Account::Receivable),
            amount,
        )
    }

    #[test]
    fn unpaid_orders_show_up_per_event() {
        let rows = vec![order(1, "sub_1/", 1000), order(2, "sub_2/", 250), order(3, "sub_1/", 500)];
        let balances = fold_statement_balances(SUBSCRIBER, &rows);
        assert_eq!(balances["sub_1/"]["usd"], 1500);
        assert_eq!(balances["sub_2/"]["usd"], 250);
        assert_eq!(total_for_prefix(&balances, "sub_", "usd"), 1750);
    }

    #[test]
    fn paid_and_canceled_events_are_dropped() {
        let rows = vec![
            order(1, "sub_1/", 1000),
            order(2, "sub_2/", 400),
            txn(
                3,
                "sub_1/",
                (PROVIDER, Account::Receivable),
                (PROVIDER, Account::Backlog),
                1000,
            ),
            txn(
                4,
                "sub_2/",
                (PROVIDER, Account::Canceled),
                (PROVIDER, Account::Receivable),
                400,
            ),
        ];
        assert!(fold_statement_balances(SUBSCRIBER, &rows).is_empty());
    }

    #[test]
    fn partial_payment_leaves_remainder() {
        let rows = vec![
            order(1, "sub_1/", 1000),
            txn(
                2,
                "sub_1/",
                (PROVIDER, Account::Receivable),
                (PROVIDER, Account::Backlog),
                600,
            ),
        ];
        assert_eq!(fold_statement_balances(SUBSCRIBER, &rows)["sub_1/"]["usd"], 400);
    }

    #[test]
    fn payer_sees_assumed_liability() {
        let rows = vec![
            order(1, "sub_9/", 700),
            txn(
                2,
                "sub_9/",
                (PAYER, Account::Liability),
                (SUBSCRIBER, Account::Payable),
                700,
            ),
        ];
        let balances = fold_statement_balances(PAYER, &rows);
        assert_eq!(balances["sub_9/"]["usd"], 700);
    }

    #[test]
    fn markers_for_foreign_events_are_ignored() {
        let rows = vec![txn(
            1,
            "sub_5/",
            (PROVIDER, Account::Receivable),
            (PROVIDER, Account::Backlog),
            300,
        )];
        assert!(fold_statement_balances(SUBSCRIBER, &rows).is_empty());
    }
}
