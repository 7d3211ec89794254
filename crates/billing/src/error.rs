//! Billing error types

use meterline_shared::DomainError;
use thiserror::Error;
use uuid::Uuid;

/// Unique constraint guarding invoice numbers
pub const INVOICE_NUMBER_CONSTRAINT: &str = "invoices_invoice_number_key";
/// Unique constraint guarding one invoice per (subscription, period)
pub const INVOICE_PERIOD_CONSTRAINT: &str = "invoices_subscription_period_key";
/// Partial unique index allowing a single pending payment per invoice
pub const PENDING_PAYMENT_CONSTRAINT: &str = "payments_one_pending_per_invoice";

/// Postgres SQLSTATE for a statement cancelled by `statement_timeout`
const QUERY_CANCELED: &str = "57014";
/// Postgres SQLSTATE for a serialization failure
const SERIALIZATION_FAILURE: &str = "40001";

/// Coarse classification callers use to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or inconsistent input, never retried
    Validation,
    NotFound,
    /// Re-derive state, then retry or abort
    Conflict,
    /// Safe to retry with backoff
    DependencyUnavailable,
    /// Terminal for this attempt
    PaymentDeclined,
    Internal,
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Organization not found: {0}")]
    OrganizationNotFound(Uuid),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invoice number already allocated: {0}")]
    InvoiceNumberConflict(String),

    #[error("Invoice already exists for this period: {0}")]
    DuplicateInvoice(String),

    #[error("Invoice {0} is already paid")]
    AlreadyPaid(Uuid),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("Payment already in flight for invoice {0}")]
    PaymentPending(Uuid),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Refund already in progress for payment {0}")]
    RefundInProgress(Uuid),

    #[error("Invoice {invoice_id} has unreconciled captured funds on payment {payment_id}")]
    PaymentConflict { invoice_id: Uuid, payment_id: Uuid },

    #[error("Payment declined ({code}): {message}")]
    PaymentDeclined {
        payment_id: Option<Uuid>,
        code: String,
        message: String,
    },

    #[error("Dependency unavailable ({dependency}): {message}")]
    DependencyUnavailable {
        dependency: &'static str,
        message: String,
    },

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidAmount(_)
            | Self::WebhookSignatureInvalid
            | Self::WebhookPayloadInvalid(_) => ErrorKind::Validation,
            Self::OrganizationNotFound(_)
            | Self::SubscriptionNotFound(_)
            | Self::InvoiceNotFound(_)
            | Self::PaymentNotFound(_)
            | Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvoiceNumberConflict(_)
            | Self::DuplicateInvoice(_)
            | Self::AlreadyPaid(_)
            | Self::InvalidTransition(_)
            | Self::PaymentPending(_)
            | Self::ConcurrentModification(_)
            | Self::RefundInProgress(_)
            | Self::PaymentConflict { .. } => ErrorKind::Conflict,
            Self::PaymentDeclined { .. } => ErrorKind::PaymentDeclined,
            Self::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            Self::Config(_) | Self::StripeApi(_) | Self::Database(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether repeating the whole operation may succeed.
    /// Collisions on the invoice number and lost compare-and-set races are
    /// retried in-process; dependency failures are retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable { .. }
                | Self::InvoiceNumberConflict(_)
                | Self::ConcurrentModification(_)
        )
    }

    pub fn dependency(dependency: &'static str, message: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            dependency,
            message: message.into(),
        }
    }
}

impl From<DomainError> for BillingError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { .. } => BillingError::InvalidTransition(err.to_string()),
            other => BillingError::InvalidInput(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request) => {
                let message = request
                    .message
                    .clone()
                    .unwrap_or_else(|| "no message from processor".to_string());
                match request.http_status {
                    402 => BillingError::PaymentDeclined {
                        payment_id: None,
                        code: request
                            .decline_code
                            .clone()
                            .or_else(|| request.code.as_ref().map(|c| format!("{:?}", c).to_lowercase()))
                            .unwrap_or_else(|| "card_declined".to_string()),
                        message,
                    },
                    429 | 500..=599 => BillingError::dependency("payment_processor", message),
                    status => BillingError::StripeApi(format!("HTTP {}: {}", status, message)),
                }
            }
            stripe::StripeError::Timeout => {
                BillingError::dependency("payment_processor", "request timed out")
            }
            stripe::StripeError::ClientError(message) => {
                BillingError::dependency("payment_processor", message)
            }
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => match db.constraint() {
                Some(INVOICE_NUMBER_CONSTRAINT) => {
                    BillingError::InvoiceNumberConflict(db.message().to_string())
                }
                Some(INVOICE_PERIOD_CONSTRAINT) => {
                    BillingError::DuplicateInvoice(db.message().to_string())
                }
                _ => BillingError::ConcurrentModification(db.message().to_string()),
            },
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(QUERY_CANCELED) => BillingError::dependency("database", db.message()),
                Some(SERIALIZATION_FAILURE) => {
                    BillingError::ConcurrentModification(db.message().to_string())
                }
                _ => BillingError::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => BillingError::dependency("database", err.to_string()),
            sqlx::Error::RowNotFound => BillingError::NotFound(err.to_string()),
            _ => BillingError::Database(err.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
