//! Double-entry journal. Each row moves an amount out of one organization's
//! account and into another's; balances are always recomputed from rows.

pub mod accounts;
pub mod event;
pub mod factory;
pub mod models;
pub mod orders;
pub mod statements;
pub mod store;

pub use accounts::Account;
pub use event::EventRef;
pub use models::{NewTransaction, Transaction};
pub use orders::{record_order, writeoff_statement};
pub use statements::StatementBalances;
pub use store::{get_balance, get_invoiceables, get_statement_balances, BalanceQuery};
