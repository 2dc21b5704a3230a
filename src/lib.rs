pub mod billing;
pub mod charges;
pub mod config;
pub mod error;
pub mod ledger;
pub mod money;
pub mod organizations;
pub mod payouts;
pub mod periods;
pub mod plans;
pub mod processor;
pub mod signals;
pub mod subscriptions;
pub mod webhooks;

pub use config::BillingConfig;
pub use error::{BillingError, BillingResult};
pub use money::Price;
