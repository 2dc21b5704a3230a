use serde::{Deserialize, Serialize};

/// key: ledger-accounts
/// Named buckets an organization holds in the ledger. A posting moves an
/// amount out of `orig_account` and into `dest_account`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    Funds,
    Withdraw,
    Refund,
    Chargeback,
    Canceled,
    Writeoff,
    Receivable,
    Backlog,
    Income,
    Offline,
    Expenses,
    Payable,
    Liability,
    Refunded,
    Settled,
}

impl Account {
    pub const ALL: [Account; 15] = [
        Account::Funds,
        Account::Withdraw,
        Account::Refund,
        Account::Chargeback,
        Account::Canceled,
        Account::Writeoff,
        Account::Receivable,
        Account::Backlog,
        Account::Income,
        Account::Offline,
        Account::Expenses,
        Account::Payable,
        Account::Liability,
        Account::Refunded,
        Account::Settled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Account::Funds => "Funds",
            Account::Withdraw => "Withdraw",
            Account::Refund => "Refund",
            Account::Chargeback => "Chargeback",
            Account::Canceled => "Canceled",
            Account::Writeoff => "Writeoff",
            Account::Receivable => "Receivable",
            Account::Backlog => "Backlog",
            Account::Income => "Income",
            Account::Offline => "Offline",
            Account::Expenses => "Expenses",
            Account::Payable => "Payable",
            Account::Liability => "Liability",
            Account::Refunded => "Refunded",
            Account::Settled => "Settled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Account::ALL
            .iter()
            .copied()
            .find(|account| account.as_str().eq_ignore_ascii_case(value))
    }

    /// Expected sign of the account balance seen from its owner, `None` when
    /// the account may legitimately swing both ways.
    pub fn balance_sign(&self) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match self {
            Account::Receivable | Account::Backlog | Account::Income | Account::Refunded => {
                Some(Ordering::Less)
            }
            Account::Payable | Account::Liability => Some(Ordering::Greater),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Account;

    #[test]
    fn account_names_round_trip() {
        for account in Account::ALL {
            assert_eq!(Account::from_str(account.as_str()), Some(account));
        }
        assert_eq!(Account::from_str("payable"), Some(Account::Payable));
        assert_eq!(Account::from_str("Escrow"), None);
    }
}
