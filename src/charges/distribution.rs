//! Splitting a charge's fees and distributable amount across its items.
//!
//! Every share is computed with floor division against the charge total.
//! The last item (by position, which callers order by item id) absorbs the
//! rounding remainder so per-item sums always equal the charge totals.

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::processor::ChargeDistribution;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Shares {
    pub processor_fee: i64,
    pub broker_fee: i64,
    pub distribute: i64,
}

impl Shares {
    pub fn total(&self) -> i64 {
        self.processor_fee + self.broker_fee + self.distribute
    }

    pub fn from_distribution(distribution: &ChargeDistribution) -> Self {
        Self {
            processor_fee: distribution.processor_fee.amount,
            broker_fee: distribution.broker_fee.amount,
            distribute: distribution.distribute.amount,
        }
    }
}

/// `value` split across `weights`, floor per weight, remainder on the last.
pub fn split_proportionally(value: i64, weights: &[i64], weight_total: i64) -> Vec<i64> {
    let Some(last) = weights.len().checked_sub(1) else {
        return Vec::new();
    };
    let mut parts = Vec::with_capacity(weights.len());
    let mut allotted = 0_i64;
    for (idx, weight) in weights.iter().enumerate() {
        let part = if idx == last {
            value - allotted
        } else if weight_total > 0 {
            (i128::from(value) * i128::from(*weight) / i128::from(weight_total)) as i64
        } else {
            0
        };
        allotted += part;
        parts.push(part);
    }
    parts
}

/// Per-item shares of `totals`, weighted by each item's amount in the
/// charge unit against `charge_amount`.
pub fn split_distribution(totals: Shares, item_amounts: &[i64], charge_amount: i64) -> Vec<Shares> {
    let processor_fees = split_proportionally(totals.processor_fee, item_amounts, charge_amount);
    let broker_fees = split_proportionally(totals.broker_fee, item_amounts, charge_amount);
    let distributes = split_proportionally(totals.distribute, item_amounts, charge_amount);
    processor_fees
        .into_iter()
        .zip(broker_fees)
        .zip(distributes)
        .map(|((processor_fee, broker_fee), distribute)| Shares {
            processor_fee,
            broker_fee,
            distribute,
        })
        .collect()
}

/// What a refund takes back: the processor's breakdown before the refund
/// minus its breakdown after it.
pub fn refund_delta(before: &ChargeDistribution, after: &ChargeDistribution) -> BillingResult<Shares> {
    for (lhs, rhs) in [
        (&before.distribute, &after.distribute),
        (&before.processor_fee, &after.processor_fee),
        (&before.broker_fee, &after.broker_fee),
    ] {
        if lhs.unit != rhs.unit && !lhs.is_zero() && !rhs.is_zero() {
            return Err(BillingError::MixedUnits {
                units: vec![lhs.unit.clone(), rhs.unit.clone()],
            });
        }
    }
    Ok(Shares {
        processor_fee: (before.processor_fee.amount - after.processor_fee.amount).max(0),
        broker_fee: (before.broker_fee.amount - after.broker_fee.amount).max(0),
        distribute: (before.distribute.amount - after.distribute.amount).max(0),
    })
}

/// Converts `amount`, part of `from_total`, into the matching part of
/// `to_total`. Used when the processor settles in a unit other than the
/// charge's.
pub fn convert(amount: i64, from_total: i64, to_total: i64) -> i64 {
    if from_total == 0 || from_total == to_total {
        return amount;
    }
    (i128::from(amount) * i128::from(to_total) / i128::from(from_total)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::LocalProcessor;

    #[test]
    fn single_item_takes_everything() {
        let totals = Shares {
            processor_fee: 522,
            broker_fee: 1799,
            distribute: 15678,
        };
        assert_eq!(split_distribution(totals, &[17999], 17999), vec![totals]);
    }

    #[test]
    fn remainder_lands_on_the_last_item() {
        let totals = Shares {
            processor_fee: 522,
            broker_fee: 1799,
            distribute: 15678,
        };
        let shares = split_distribution(totals, &[10000, 7999], 17999);
        assert_eq!(
            shares[0],
            Shares {
                processor_fee: 290,
                broker_fee: 999,
                distribute: 8710,
            }
        );
        assert_eq!(
            shares[1],
            Shares {
                processor_fee: 232,
                broker_fee: 800,
                distribute: 6968,
            }
        );
        let sum: i64 = shares.iter().map(Shares::total).sum();
        assert_eq!(sum, totals.total());
    }

    #[test]
    fn equal_items_never_exceed_totals() {
        assert_eq!(split_proportionally(100, &[1, 1, 1], 3), vec![33, 33, 34]);
        assert_eq!(split_proportionally(0, &[5, 5], 10), vec![0, 0]);
        assert!(split_proportionally(10, &[], 0).is_empty());
    }

    #[test]
    fn refund_delta_comes_from_two_breakdowns() {
        let processor = LocalProcessor::new(290, 0);
        let before = processor.distribution_for(17999, 1799, 0, "usd");
        let after = processor.distribution_for(17999, 1799, 5000, "usd");
        let delta = refund_delta(&before, &after).unwrap();
        assert_eq!(
            delta,
            Shares {
                processor_fee: 145,
                broker_fee: 500,
                distribute: 4355,
            }
        );
        assert_eq!(delta.total(), 5000);
    }

    #[test]
    fn conversion_is_proportional() {
        assert_eq!(convert(500, 1000, 1100), 550);
        assert_eq!(convert(500, 1000, 1000), 500);
        assert_eq!(convert(500, 0, 1000), 500);
    }
}
