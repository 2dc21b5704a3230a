use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::billing::{ReconciliationHandle, ReconciliationJob};
use crate::processor::ChargeEvent;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook signature missing")]
    MissingSignature,
    #[error("webhook signature mismatch")]
    BadSignature,
    #[error("malformed webhook payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to enqueue webhook: {0}")]
    Dispatch(String),
}

/// key: webhooks-processor -> envelope posted by the payment processor
#[derive(Debug, Deserialize)]
pub struct ProcessorWebhook {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Seconds since the epoch.
    #[serde(default)]
    pub created: Option<i64>,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: WebhookObject,
}

/// A charge, or a dispute whose `charge` field names the charge.
#[derive(Debug, Deserialize)]
pub struct WebhookObject {
    pub id: String,
    #[serde(default)]
    pub charge: Option<String>,
}

impl ProcessorWebhook {
    pub fn processor_key(&self) -> &str {
        self.data.object.charge.as_deref().unwrap_or(&self.data.object.id)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

fn expected_signature(secret: &str, body: &[u8]) -> Result<Hmac<Sha256>, WebhookError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 of `body`, as the processor sends it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mac = expected_signature(secret, body)?;
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks `signature` (`sha256=<hex>` or bare hex) in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let encoded = signature.strip_prefix("sha256=").unwrap_or(signature);
    let provided = hex::decode(encoded.trim()).map_err(|_| WebhookError::BadSignature)?;
    expected_signature(secret, body)?
        .verify_slice(&provided)
        .map_err(|_| WebhookError::BadSignature)
}

/// Verifies and decodes a webhook body into a reconciliation job. Event
/// types outside the charge taxonomy decode to `None` and are acknowledged
/// without further work.
pub fn parse_webhook(
    body: &[u8],
    signature: Option<&str>,
    secret: Option<&str>,
) -> Result<Option<ReconciliationJob>, WebhookError> {
    if let Some(secret) = secret {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        verify_signature(secret, body, signature)?;
    }
    let webhook: ProcessorWebhook = serde_json::from_slice(body)?;
    let Some(event) = ChargeEvent::from_event_type(&webhook.event_type) else {
        debug!(event_type = %webhook.event_type, "ignoring webhook");
        return Ok(None);
    };
    Ok(Some(ReconciliationJob::ChargeEvent {
        processor_key: webhook.processor_key().to_string(),
        event,
        at_time: webhook.occurred_at(),
    }))
}

/// Entry point for the processor's webhook calls. Returns whether a job
/// was queued.
pub async fn handle_webhook(
    reconciliation: &ReconciliationHandle,
    body: &[u8],
    signature: Option<&str>,
    secret: Option<&str>,
) -> Result<bool, WebhookError> {
    let job = match parse_webhook(body, signature, secret) {
        Ok(Some(job)) => job,
        Ok(None) => return Ok(false),
        Err(err) => {
            warn!(?err, "rejected processor webhook");
            return Err(err);
        }
    };
    reconciliation
        .dispatch(job)
        .await
        .map_err(|err| WebhookError::Dispatch(err.to_string()))?;
    Ok(true)
}
