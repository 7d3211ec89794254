//! Payment processor boundary
//!
//! The payment service talks to the processor only through
//! [`PaymentProcessor`]. [`StripeProcessor`] is the production adapter:
//! off-session PaymentIntents confirmed at creation, refunds against the
//! PaymentIntent, one idempotency key per payment, and a bounded timeout on
//! every call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meterline_shared::to_minor_units;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Off-session charge for one payment attempt
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    /// Customer reference at the processor
    pub customer_ref: String,
    /// Stored payment method at the processor
    pub payment_method_ref: String,
    pub amount: Decimal,
    pub currency: String,
    /// Identical across retries of the same payment
    pub idempotency_key: String,
}

/// Synchronous answer to a charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded {
        transaction_id: String,
    },
    /// Customer authentication needed; the outcome arrives by notification
    RequiresAction {
        transaction_id: String,
    },
    /// Accepted, outcome arrives by notification
    Processing {
        transaction_id: String,
    },
    /// Business decline, terminal for this attempt
    Declined {
        transaction_id: Option<String>,
        code: String,
        message: String,
    },
}

impl ChargeOutcome {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Succeeded { transaction_id }
            | Self::RequiresAction { transaction_id }
            | Self::Processing { transaction_id } => Some(transaction_id),
            Self::Declined { transaction_id, .. } => transaction_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create and confirm a charge without the customer present
    async fn charge_off_session(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome>;

    async fn refund(&self, request: RefundRequest) -> BillingResult<RefundReceipt>;
}

/// Form body for `POST /v1/payment_intents`
#[derive(Debug, Serialize)]
struct PaymentIntentForm<'a> {
    amount: i64,
    currency: String,
    customer: &'a str,
    payment_method: &'a str,
    confirm: bool,
    off_session: bool,
    metadata: HashMap<&'static str, String>,
}

/// Fields of a PaymentIntent the engine reads
#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    status: String,
    #[serde(default)]
    last_payment_error: Option<PaymentIntentError>,
    #[serde(default)]
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn outcome_from_intent(intent: PaymentIntentResponse) -> ChargeOutcome {
    let transaction_id = intent.id;
    match intent.status.as_str() {
        "succeeded" => ChargeOutcome::Succeeded { transaction_id },
        "requires_action" | "requires_confirmation" => ChargeOutcome::RequiresAction { transaction_id },
        "requires_payment_method" => {
            let error = intent.last_payment_error;
            let code = error
                .as_ref()
                .and_then(|e| e.decline_code.clone().or_else(|| e.code.clone()))
                .unwrap_or_else(|| "requires_payment_method".to_string());
            let message = error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Payment method was declined".to_string());
            ChargeOutcome::Declined {
                transaction_id: Some(transaction_id),
                code,
                message,
            }
        }
        "canceled" => ChargeOutcome::Declined {
            transaction_id: Some(transaction_id),
            code: "canceled".to_string(),
            message: intent
                .cancellation_reason
                .unwrap_or_else(|| "Payment was canceled".to_string()),
        },
        // processing, requires_capture and statuses added later
        _ => ChargeOutcome::Processing { transaction_id },
    }
}

/// Stripe-backed payment processor
#[derive(Clone)]
pub struct StripeProcessor {
    stripe: StripeClient,
    timeout: Duration,
}

impl StripeProcessor {
    pub fn new(stripe: StripeClient, timeout: Duration) -> Self {
        Self { stripe, timeout }
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn charge_off_session(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome> {
        let amount = to_minor_units(request.amount, &request.currency)?;
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "cannot charge {} {}",
                request.amount, request.currency
            )));
        }

        let mut metadata = HashMap::new();
        metadata.insert("payment_id", request.payment_id.to_string());
        metadata.insert("invoice_id", request.invoice_id.to_string());
        let form = PaymentIntentForm {
            amount,
            currency: request.currency.to_lowercase(),
            customer: &request.customer_ref,
            payment_method: &request.payment_method_ref,
            confirm: true,
            off_session: true,
            metadata,
        };

        let client = self.stripe.idempotent(&request.idempotency_key);
        let response = tokio::time::timeout(
            self.timeout,
            client.post_form::<PaymentIntentResponse, _>("/payment_intents", &form),
        )
        .await
        .map_err(|_| {
            BillingError::dependency(
                "payment_processor",
                format!("charge timed out after {}s", self.timeout.as_secs()),
            )
        })?;

        match response {
            Ok(intent) => {
                let outcome = outcome_from_intent(intent);
                tracing::info!(
                    payment_id = %request.payment_id,
                    transaction_id = ?outcome.transaction_id(),
                    amount_minor = amount,
                    "Off-session charge submitted"
                );
                Ok(outcome)
            }
            Err(err) => match BillingError::from(err) {
                BillingError::PaymentDeclined { code, message, .. } => Ok(ChargeOutcome::Declined {
                    transaction_id: None,
                    code,
                    message,
                }),
                other => Err(other),
            },
        }
    }

    async fn refund(&self, request: RefundRequest) -> BillingResult<RefundReceipt> {
        let amount = to_minor_units(request.amount, &request.currency)?;
        let payment_intent = request
            .transaction_id
            .parse::<stripe::PaymentIntentId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment intent ID: {}", e)))?;

        let mut params = stripe::CreateRefund::new();
        params.payment_intent = Some(payment_intent);
        params.amount = Some(amount);

        let client = self.stripe.idempotent(&request.idempotency_key);
        let refund = tokio::time::timeout(self.timeout, stripe::Refund::create(&client, params))
            .await
            .map_err(|_| {
                BillingError::dependency(
                    "payment_processor",
                    format!("refund timed out after {}s", self.timeout.as_secs()),
                )
            })??;

        tracing::info!(
            payment_id = %request.payment_id,
            refund_id = %refund.id,
            amount_minor = amount,
            "Refund created"
        );

        Ok(RefundReceipt {
            refund_id: refund.id.to_string(),
        })
    }
}
