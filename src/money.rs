use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_UNIT: &str = "usd";

/// An amount in minor units (cents) tagged with its ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub amount: i64,
    pub unit: String,
}

impl Price {
    pub fn new(amount: i64, unit: impl Into<String>) -> Self {
        Self {
            amount,
            unit: normalize_unit(&unit.into()),
        }
    }

    pub fn zero(unit: impl Into<String>) -> Self {
        Self::new(0, unit)
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Adds two prices of the same unit. A zero-amount side adopts the
    /// other side's unit so empty accumulators can start without one.
    pub fn checked_add(&self, other: &Price) -> BillingResult<Price> {
        let unit = self.merge_unit(other)?;
        Ok(Price {
            amount: self.amount + other.amount,
            unit,
        })
    }

    pub fn checked_sub(&self, other: &Price) -> BillingResult<Price> {
        let unit = self.merge_unit(other)?;
        Ok(Price {
            amount: self.amount - other.amount,
            unit,
        })
    }

    fn merge_unit(&self, other: &Price) -> BillingResult<String> {
        if self.unit == other.unit || other.amount == 0 {
            Ok(self.unit.clone())
        } else if self.amount == 0 {
            Ok(other.unit.clone())
        } else {
            Err(BillingError::MixedUnits {
                units: vec![self.unit.clone(), other.unit.clone()],
            })
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&as_money(self.amount, &self.unit))
    }
}

pub fn normalize_unit(unit: &str) -> String {
    let unit = unit.trim().to_ascii_lowercase();
    if unit.is_empty() {
        DEFAULT_UNIT.to_string()
    } else {
        unit
    }
}

fn currency_symbol(unit: &str) -> Option<&'static str> {
    match unit {
        "usd" | "cad" | "aud" => Some("$"),
        "eur" => Some("\u{20ac}"),
        "gbp" => Some("\u{a3}"),
        "jpy" => Some("\u{a5}"),
        _ => None,
    }
}

/// Formats minor units the way line items are described, e.g. `$179.99`.
pub fn as_money(amount: i64, unit: &str) -> String {
    let unit = normalize_unit(unit);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let body = format!("{}.{:02}", group_thousands(abs / 100), abs % 100);
    match currency_symbol(&unit) {
        Some(symbol) => format!("{sign}{symbol}{body}"),
        None => format!("{sign}{body} {}", unit.to_ascii_uppercase()),
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_dollars_and_cents() {
        assert_eq!(as_money(17999, "usd"), "$179.99");
        assert_eq!(as_money(5, "USD"), "$0.05");
        assert_eq!(as_money(123456789, "usd"), "$1,234,567.89");
        assert_eq!(as_money(-1500, "eur"), "-\u{20ac}15.00");
        assert_eq!(as_money(1000, "chf"), "10.00 CHF");
    }

    #[test]
    fn zero_price_adopts_other_unit() {
        let total = Price::zero("usd").checked_add(&Price::new(100, "eur")).unwrap();
        assert_eq!(total, Price::new(100, "eur"));
    }

    #[test]
    fn mixed_units_are_rejected() {
        let err = Price::new(100, "usd")
            .checked_add(&Price::new(100, "eur"))
            .expect_err("usd + eur should fail");
        assert!(matches!(err, BillingError::MixedUnits { .. }));
    }
}
