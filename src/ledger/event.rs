use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BillingError;

/// key: ledger-event-ref
/// Correlation key stored in `transactions.event_id`. The textual forms are
/// `sub_<id>/`, `sub_<id>/use_<id>/`, `cha_<id>/`, `cha_<id>/<line>/` and
/// `cpn_<code>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventRef {
    Subscription { id: i64, use_charge: Option<i64> },
    Charge { id: i64, line: Option<i64> },
    Coupon { code: String },
}

impl EventRef {
    pub fn subscription(id: i64) -> Self {
        EventRef::Subscription {
            id,
            use_charge: None,
        }
    }

    pub fn use_charge(subscription_id: i64, use_charge_id: i64) -> Self {
        EventRef::Subscription {
            id: subscription_id,
            use_charge: Some(use_charge_id),
        }
    }

    pub fn charge(id: i64) -> Self {
        EventRef::Charge { id, line: None }
    }

    pub fn charge_item(id: i64, line: i64) -> Self {
        EventRef::Charge {
            id,
            line: Some(line),
        }
    }

    pub fn subscription_id(&self) -> Option<i64> {
        match self {
            EventRef::Subscription { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn charge_id(&self) -> Option<i64> {
        match self {
            EventRef::Charge { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// SQL `LIKE` pattern matching this event and every event nested under it.
    pub fn like_pattern(&self) -> String {
        let text = escape_like(&self.to_string());
        match self {
            EventRef::Coupon { .. } => text,
            _ => format!("{text}%"),
        }
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventRef::Subscription {
                id,
                use_charge: None,
            } => write!(f, "sub_{id}/"),
            EventRef::Subscription {
                id,
                use_charge: Some(use_charge),
            } => write!(f, "sub_{id}/use_{use_charge}/"),
            EventRef::Charge { id, line: None } => write!(f, "cha_{id}/"),
            EventRef::Charge {
                id,
                line: Some(line),
            } => write!(f, "cha_{id}/{line}/"),
            EventRef::Coupon { code } => write!(f, "cpn_{code}"),
        }
    }
}

impl FromStr for EventRef {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || BillingError::InvalidEventId(value.to_string());
        if let Some(code) = value.strip_prefix("cpn_") {
            if code.is_empty() {
                return Err(invalid());
            }
            return Ok(EventRef::Coupon {
                code: code.to_string(),
            });
        }

        let (kind, rest) = value.split_once('_').ok_or_else(invalid)?;
        let mut segments = rest.split('/').filter(|segment| !segment.is_empty());
        let id = segments
            .next()
            .and_then(|segment| segment.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let nested = segments.next();
        if segments.next().is_some() {
            return Err(invalid());
        }

        match kind {
            "sub" => {
                let use_charge = match nested {
                    None => None,
                    Some(segment) => Some(
                        segment
                            .strip_prefix("use_")
                            .and_then(|id| id.parse::<i64>().ok())
                            .ok_or_else(invalid)?,
                    ),
                };
                Ok(EventRef::Subscription { id, use_charge })
            }
            "cha" => {
                let line = match nested {
                    None => None,
                    Some(segment) => Some(segment.parse::<i64>().map_err(|_| invalid())?),
                };
                Ok(EventRef::Charge { id, line })
            }
            _ => Err(invalid()),
        }
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
