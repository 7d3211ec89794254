//! Processor notification parsing and signature verification
//!
//! Notifications are accepted as raw JSON so that API version drift in the
//! processor's event schema never breaks reconciliation. Only the handful of
//! fields the payment service needs are extracted.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Payment outcome a notification reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    PaymentSucceeded,
    PaymentFailed,
    /// Processor canceled the charge; reconciled as a failure
    PaymentCanceled,
    Refunded,
    /// Event types the engine does not reconcile
    Unsupported(String),
}

impl NotificationKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" => Self::PaymentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentFailed,
            "payment_intent.canceled" => Self::PaymentCanceled,
            "charge.refunded" => Self::Refunded,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

/// The fields of a processor notification used for reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderNotification {
    pub kind: NotificationKind,
    /// Processor transaction (PaymentIntent) id
    pub transaction_id: Option<String>,
    /// Our payment id, echoed back from charge metadata
    pub payment_id: Option<Uuid>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    /// Refunded amount in minor units, for refund notifications
    pub amount_refunded: Option<i64>,
}

impl ProviderNotification {
    /// Extract reconciliation fields from a notification payload.
    ///
    /// `payload` may be the full event (`{"type": .., "data": {"object": ..}}`)
    /// or the bare object.
    pub fn parse(event_type: &str, payload: &serde_json::Value) -> BillingResult<Self> {
        let kind = NotificationKind::from_event_type(event_type);
        let object = payload
            .get("data")
            .and_then(|d| d.get("object"))
            .unwrap_or(payload);
        if !object.is_object() {
            return Err(BillingError::WebhookPayloadInvalid(format!(
                "{} payload has no object",
                event_type
            )));
        }

        let str_field = |value: &serde_json::Value, key: &str| -> Option<String> {
            value.get(key).and_then(|v| v.as_str()).map(str::to_string)
        };

        // Refund events describe the charge; the transaction is its PaymentIntent
        let transaction_id = match kind {
            NotificationKind::Refunded => str_field(object, "payment_intent"),
            _ => str_field(object, "id"),
        };

        let payment_id = object
            .get("metadata")
            .and_then(|m| m.get("payment_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        let error = object.get("last_payment_error").filter(|e| e.is_object());
        let failure_code = error.and_then(|e| str_field(e, "decline_code").or_else(|| str_field(e, "code")));
        let failure_message = error.and_then(|e| str_field(e, "message"));

        let (failure_code, failure_message) = match kind {
            NotificationKind::PaymentCanceled => (
                Some("canceled".to_string()),
                str_field(object, "cancellation_reason").or(failure_message),
            ),
            _ => (failure_code, failure_message),
        };

        Ok(Self {
            kind,
            transaction_id,
            payment_id,
            failure_code,
            failure_message,
            amount_refunded: object.get("amount_refunded").and_then(|v| v.as_i64()),
        })
    }
}

/// Envelope of a processor event as delivered over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl ProcessorEvent {
    pub fn parse(raw: &str) -> BillingResult<Self> {
        serde_json::from_str(raw).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse processor event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }
}

/// Verify a `t=<unix>,v1=<hex hmac>` signature header over `payload`.
///
/// The signed message is `"{t}.{payload}"` keyed with the endpoint secret.
/// Any of several `v1` entries may match (secret rotation).
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::error!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let age = (now.unix_timestamp() - timestamp).abs();
    if age > tolerance_secs {
        tracing::error!(timestamp = timestamp, age_secs = age, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::error!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

/// Header value for `payload` signed at `timestamp`, as the processor would send it
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())))
}
