use once_cell::sync::Lazy;
use std::fs;

use crate::money::{normalize_unit, DEFAULT_UNIT};

/// Postgres connection string. Must be set via the `DATABASE_URL` env variable.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// Slug of the organization operating the platform. Defaults to `broker`.
pub static BILLING_BROKER_SLUG: Lazy<String> = Lazy::new(|| {
    read_optional_env("BILLING_BROKER_SLUG").unwrap_or_else(|| "broker".to_string())
});

/// Slug of the organization standing for the payment processor. Defaults to `processor`.
pub static BILLING_PROCESSOR_SLUG: Lazy<String> = Lazy::new(|| {
    read_optional_env("BILLING_PROCESSOR_SLUG").unwrap_or_else(|| "processor".to_string())
});

/// Currency used when nothing else determines one. Defaults to `usd`.
pub static BILLING_DEFAULT_UNIT: Lazy<String> = Lazy::new(|| {
    read_optional_env("BILLING_DEFAULT_UNIT")
        .map(|unit| normalize_unit(&unit))
        .unwrap_or_else(|| DEFAULT_UNIT.to_string())
});

/// key: billing-config -> failed renewal charges before unsubscribing
pub static BILLING_MAX_RENEWAL_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("BILLING_MAX_RENEWAL_ATTEMPTS")
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

/// key: billing-config -> smallest amount the processor accepts
pub static BILLING_MINIMUM_CHARGE_AMOUNT: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_MINIMUM_CHARGE_AMOUNT")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(50)
});

/// Flat fee charged to a provider when a dispute is opened, in minor units.
pub static BILLING_DISPUTE_FEE_AMOUNT: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_DISPUTE_FEE_AMOUNT")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(1500)
});

/// Variable processor fee in basis points, used by the local processor.
pub static BILLING_PROCESSOR_FEE_BPS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_PROCESSOR_FEE_BPS")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| (0..10_000).contains(value))
        .unwrap_or(290)
});

/// Fixed processor fee per charge, in minor units.
pub static BILLING_PROCESSOR_FEE_FIXED: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_PROCESSOR_FEE_FIXED")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(0)
});

/// key: billing-config -> renewal scan cadence
pub static BILLING_RENEWAL_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_RENEWAL_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(86_400)
});

/// Days before `ends_at` at which expiration notices go out. Provide a
/// comma-separated list such as `7,30` via `BILLING_EXPIRATION_NOTICE_DAYS`.
pub static BILLING_EXPIRATION_NOTICE_DAYS: Lazy<Vec<i64>> = Lazy::new(|| {
    std::env::var("BILLING_EXPIRATION_NOTICE_DAYS")
        .ok()
        .map(|value| parse_day_list(&value))
        .filter(|days| !days.is_empty())
        .unwrap_or_else(|| vec![7, 30])
});

/// When set to a truthy value, batch runs compute and log everything but
/// roll back their postings. Defaults to `false`.
pub static BILLING_DRY_RUN: Lazy<bool> = Lazy::new(|| {
    std::env::var("BILLING_DRY_RUN")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Shared secret for processor webhook signatures. Read from
/// `BILLING_WEBHOOK_SECRET` or the file named by `BILLING_WEBHOOK_SECRET_FILE`.
pub static BILLING_WEBHOOK_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("BILLING_WEBHOOK_SECRET", "BILLING_WEBHOOK_SECRET_FILE"));

/// key: billing-config -> injected settings
/// Snapshot of the billing knobs handed to services at construction time.
#[derive(Clone, Debug, PartialEq)]
pub struct BillingConfig {
    pub broker_slug: String,
    pub processor_slug: String,
    pub default_unit: String,
    pub max_renewal_attempts: i32,
    pub minimum_charge_amount: i64,
    pub dispute_fee_amount: i64,
    pub processor_fee_bps: i64,
    pub processor_fee_fixed: i64,
    pub renewal_scan_interval_secs: u64,
    pub expiration_notice_days: Vec<i64>,
    pub dry_run: bool,
    pub webhook_secret: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> Self {
        Self {
            broker_slug: BILLING_BROKER_SLUG.clone(),
            processor_slug: BILLING_PROCESSOR_SLUG.clone(),
            default_unit: BILLING_DEFAULT_UNIT.clone(),
            max_renewal_attempts: *BILLING_MAX_RENEWAL_ATTEMPTS,
            minimum_charge_amount: *BILLING_MINIMUM_CHARGE_AMOUNT,
            dispute_fee_amount: *BILLING_DISPUTE_FEE_AMOUNT,
            processor_fee_bps: *BILLING_PROCESSOR_FEE_BPS,
            processor_fee_fixed: *BILLING_PROCESSOR_FEE_FIXED,
            renewal_scan_interval_secs: *BILLING_RENEWAL_SCAN_INTERVAL_SECS,
            expiration_notice_days: BILLING_EXPIRATION_NOTICE_DAYS.clone(),
            dry_run: *BILLING_DRY_RUN,
            webhook_secret: BILLING_WEBHOOK_SECRET.clone(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            broker_slug: "broker".to_string(),
            processor_slug: "processor".to_string(),
            default_unit: DEFAULT_UNIT.to_string(),
            max_renewal_attempts: 3,
            minimum_charge_amount: 50,
            dispute_fee_amount: 1500,
            processor_fee_bps: 290,
            processor_fee_fixed: 0,
            renewal_scan_interval_secs: 86_400,
            expiration_notice_days: vec![7, 30],
            dry_run: false,
            webhook_secret: None,
        }
    }
}

fn parse_day_list(value: &str) -> Vec<i64> {
    let mut days = value
        .split(',')
        .filter_map(|raw| raw.trim().parse::<i64>().ok())
        .filter(|day| *day >= 0)
        .collect::<Vec<_>>();
    days.sort_unstable();
    days.dedup();
    days
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_days_are_sorted_and_deduplicated() {
        assert_eq!(parse_day_list("30, 7,7, x, -1"), vec![7, 30]);
        assert!(parse_day_list("").is_empty());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BillingConfig::default();
        assert_eq!(config.minimum_charge_amount, 50);
        assert_eq!(config.max_renewal_attempts, 3);
        assert_eq!(config.expiration_notice_days, vec![7, 30]);
    }
}
