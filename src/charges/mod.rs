//! Charges: the card payments collected from customers and the state
//! machine that settles, refunds and disputes them.

pub mod distribution;
pub mod models;
pub mod service;
pub mod store;

pub use models::{Charge, ChargeItem, ChargeState};
pub use service::{apply_funds, ChargeService, CompletionReport};

#[cfg(test)]
pub(crate) use models::sample_charge;
