//! Outbound notifications and domain events
//!
//! Both collaborators are invoked after a state transition has been committed.
//! Delivery problems are logged and reported as `Ok(false)`, never as errors,
//! so a mail outage can not roll back or repeat billing work.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

/// Event topics published by the engine
pub mod topics {
    pub const INVOICE_CREATED: &str = "billing.invoice.created";
    pub const INVOICE_FINALIZED: &str = "billing.invoice.finalized";
    pub const INVOICE_VOIDED: &str = "billing.invoice.voided";
    pub const PAYMENT_SUCCEEDED: &str = "billing.payment.succeeded";
    pub const PAYMENT_FAILED: &str = "billing.payment.failed";
    pub const PAYMENT_REFUNDED: &str = "billing.payment.refunded";
    /// Funds captured on a payment already recorded as failed
    pub const PAYMENT_CONFLICT: &str = "billing.payment.conflict";
}

/// Customer-facing notification templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    InvoiceCreated,
    PaymentSucceeded,
    /// Distinct from success and carries the decline reason
    PaymentFailed,
    PaymentRefunded,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceCreated => "invoice_created",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRefunded => "payment_refunded",
        }
    }
}

impl std::fmt::Display for NotificationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns `Ok(true)` when delivered, `Ok(false)` when delivery failed
    async fn send_notification(
        &self,
        template: NotificationTemplate,
        recipient: &str,
        data: serde_json::Value,
    ) -> BillingResult<bool>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, topic: &str, key: &str, payload: serde_json::Value) -> BillingResult<()>;
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Meterline Billing <billing@meterline.io>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Meterline".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@meterline.io".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://app.meterline.io".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Email notifier backed by the Resend API
#[derive(Clone)]
pub struct ResendNotifier {
    config: EmailConfig,
    client: reqwest::Client,
    retry_attempts: usize,
    retry_backoff: Duration,
}

impl ResendNotifier {
    pub fn new(config: EmailConfig, retry_attempts: usize, retry_backoff: Duration) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry_attempts,
            retry_backoff,
        }
    }

    /// Subject and HTML body for a template
    fn render(&self, template: NotificationTemplate, data: &serde_json::Value) -> (String, String) {
        let field = |key: &str| {
            data.get(key)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        let app = &self.config.app_name;
        let amount = format!("{} {}", field("amount"), field("currency"));
        let number = field("invoice_number");

        let (subject, body) = match template {
            NotificationTemplate::InvoiceCreated => (
                format!("{} invoice {}", app, number),
                format!(
                    "<p>Invoice <strong>{}</strong> for {} is available. It is due on {}.</p>",
                    number,
                    amount,
                    field("due_date")
                ),
            ),
            NotificationTemplate::PaymentSucceeded => (
                format!("Payment received for invoice {}", number),
                format!("<p>We received your payment of {}. Thank you!</p>", amount),
            ),
            NotificationTemplate::PaymentFailed => {
                let reason = field("failure_message");
                let reason = if reason.is_empty() {
                    "Your payment method was declined.".to_string()
                } else {
                    reason
                };
                (
                    format!("Action required: payment failed for invoice {}", number),
                    format!(
                        "<p>We could not collect {} for invoice {}.</p><p>Reason: {}</p>",
                        amount, number, reason
                    ),
                )
            }
            NotificationTemplate::PaymentRefunded => (
                format!("Refund issued for invoice {}", number),
                format!("<p>A refund of {} is on its way to your payment method.</p>", amount),
            ),
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;">
{}
<p><a href="{}/billing">View billing</a></p>
<p style="color: #666; font-size: 12px;">Questions? Contact {}</p>
</body>
</html>"#,
            body, self.config.dashboard_url, self.config.support_email
        );

        (subject, html)
    }

    async fn deliver(&self, to: &str, subject: &str, html: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(format!("HTTP {}: {}", status, body))
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send_notification(
        &self,
        template: NotificationTemplate,
        recipient: &str,
        data: serde_json::Value,
    ) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %recipient,
                template = %template,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        let (subject, html) = self.render(template, &data);

        // Delays of backoff, 2×backoff, 4×backoff, ...
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.retry_backoff.as_millis() as u64 / 2).max(1))
            .map(jitter)
            .take(self.retry_attempts.saturating_sub(1));

        match Retry::start(strategy, || self.deliver(recipient, &subject, &html)).await {
            Ok(()) => {
                tracing::info!(to = %recipient, template = %template, "Billing email sent");
                Ok(true)
            }
            Err(error) => {
                tracing::error!(
                    to = %recipient,
                    template = %template,
                    error = %error,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }
}

/// Publishes events to an HTTP event gateway: `POST {endpoint}/topics/{topic}`
#[derive(Clone)]
pub struct HttpEventPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventPublisher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("event publisher client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// `EVENT_GATEWAY_URL`; `None` when unset
    pub fn from_env(timeout: Duration) -> BillingResult<Option<Self>> {
        match std::env::var("EVENT_GATEWAY_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url, timeout).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish_event(&self, topic: &str, key: &str, payload: serde_json::Value) -> BillingResult<()> {
        let response = self
            .client
            .post(format!("{}/topics/{}", self.endpoint, topic))
            .json(&serde_json::json!({ "key": key, "payload": payload }))
            .send()
            .await
            .map_err(|e| BillingError::dependency("event_gateway", e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::dependency(
                "event_gateway",
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish_event(&self, topic: &str, key: &str, payload: serde_json::Value) -> BillingResult<()> {
        tracing::info!(topic = %topic, key = %key, payload = %payload, "Billing event");
        Ok(())
    }
}

/// Publish without letting a failure reach the caller
pub(crate) async fn publish_quietly(
    publisher: &dyn EventPublisher,
    topic: &str,
    key: &str,
    payload: serde_json::Value,
) {
    if let Err(e) = publisher.publish_event(topic, key, payload).await {
        tracing::error!(topic = %topic, key = %key, error = %e, "Failed to publish billing event - non-fatal");
    }
}

/// Notify without letting a failure reach the caller
pub(crate) async fn notify_quietly(
    notifier: &dyn Notifier,
    template: NotificationTemplate,
    recipient: &str,
    data: serde_json::Value,
) -> bool {
    match notifier.send_notification(template, recipient, data).await {
        Ok(delivered) => delivered,
        Err(e) => {
            tracing::error!(template = %template, error = %e, "Failed to send notification - non-fatal");
            false
        }
    }
}
