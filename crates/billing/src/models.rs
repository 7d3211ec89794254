//! Billing domain records
//!
//! Rows map one-to-one onto the tables in `migrations/`.
//! Money is `Decimal` throughout, times are `OffsetDateTime` in UTC.

use std::collections::BTreeMap;

use meterline_shared::{
    BillingInterval, CreditStatus, InvoiceStatus, LineItemKind, MetricType, OrganizationStatus,
    PaymentStatus, SubscriptionStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Billing account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub billing_email: String,
    /// ISO 4217 billing currency
    pub currency: String,
    /// Day of month billing periods start on
    pub billing_anchor_day: i16,
    /// Customer reference at the payment processor
    pub processor_customer_id: Option<String>,
    pub default_payment_method: Option<String>,
    pub auto_pay: bool,
    pub status: OrganizationStatus,
    pub created_at: OffsetDateTime,
}

/// One immutable version of a plan.
/// Changing prices means inserting a new version, never updating this row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub base_price: Decimal,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub included_api_calls: Decimal,
    pub included_storage_gb: Decimal,
    pub included_transfer_gb: Decimal,
    pub api_call_unit_price: Decimal,
    pub storage_gb_unit_price: Decimal,
    pub transfer_gb_unit_price: Decimal,
    pub included_seats: i32,
    pub price_per_additional_seat: Decimal,
    pub created_at: OffsetDateTime,
}

impl SubscriptionPlan {
    /// Quantity of a metric covered by the base price
    pub fn included(&self, metric: MetricType) -> Decimal {
        match metric {
            MetricType::ApiCalls => self.included_api_calls,
            MetricType::StorageGb => self.included_storage_gb,
            MetricType::TransferGb => self.included_transfer_gb,
        }
    }

    /// Flat overage price per unit beyond the included quantity
    pub fn unit_price(&self, metric: MetricType) -> Decimal {
        match metric {
            MetricType::ApiCalls => self.api_call_unit_price,
            MetricType::StorageGb => self.storage_gb_unit_price,
            MetricType::TransferGb => self.transfer_gb_unit_price,
        }
    }
}

/// Volume band for a metric. `tier_end` of `None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricingTier {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub metric_type: MetricType,
    pub tier_start: Decimal,
    pub tier_end: Option<Decimal>,
    pub unit_price: Decimal,
    pub flat_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    /// Seat quantity
    pub quantity: i32,
    /// Negotiated price replacing the plan's base price
    pub custom_price: Option<Decimal>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Everything needed to price one subscription period
#[derive(Debug, Clone)]
pub struct SubscriptionWithPlan {
    pub organization: Organization,
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
    pub tiers: Vec<PricingTier>,
}

/// Summed usage per metric for an organization over `[period_start, period_end)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub totals: BTreeMap<MetricType, Decimal>,
}

impl UsageSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: MetricType, quantity: Decimal) -> Self {
        self.totals.insert(metric, quantity);
        self
    }

    /// Usage for a metric, zero when nothing was recorded
    pub fn get(&self, metric: MetricType) -> Decimal {
        self.totals.get(&metric).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Prepaid or promotional balance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credit {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub description: String,
    pub total_amount: Decimal,
    pub remaining_amount: Decimal,
    pub currency: String,
    pub valid_from: OffsetDateTime,
    pub valid_until: Option<OffsetDateTime>,
    pub status: CreditStatus,
    pub created_at: OffsetDateTime,
}

impl Credit {
    /// Whether the credit can be drawn on at `at`
    pub fn is_usable_at(&self, at: OffsetDateTime) -> bool {
        self.status == CreditStatus::Active
            && self.remaining_amount > Decimal::ZERO
            && self.valid_from <= at
            && self.valid_until.map_or(true, |until| until > at)
    }
}

/// A priced component produced by the pricing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub kind: LineItemKind,
    pub description: String,
    pub metric_type: Option<MetricType>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub included_quantity: Option<Decimal>,
    pub actual_quantity: Option<Decimal>,
    pub overage_quantity: Option<Decimal>,
}

impl LineItem {
    pub fn flat(kind: LineItemKind, description: impl Into<String>, amount: Decimal) -> Self {
        Self {
            kind,
            description: description.into(),
            metric_type: None,
            quantity: Decimal::ONE,
            unit_price: amount,
            amount,
            included_quantity: None,
            actual_quantity: None,
            overage_quantity: None,
        }
    }
}

/// Persisted line item. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub position: i32,
    pub kind: LineItemKind,
    pub description: String,
    pub metric_type: Option<MetricType>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub included_quantity: Option<Decimal>,
    pub actual_quantity: Option<Decimal>,
    pub overage_quantity: Option<Decimal>,
}

impl InvoiceLineItem {
    pub fn from_line(invoice_id: Uuid, position: i32, line: &LineItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            position,
            kind: line.kind,
            description: line.description.clone(),
            metric_type: line.metric_type,
            quantity: line.quantity,
            unit_price: line.unit_price,
            amount: line.amount,
            included_quantity: line.included_quantity,
            actual_quantity: line.actual_quantity,
            overage_quantity: line.overage_quantity,
        }
    }
}

/// Amount drawn from a single credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditApplication {
    pub credit_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_number: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub subtotal: Decimal,
    pub credits_applied: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_date: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub finalized_at: Option<OffsetDateTime>,
    pub voided_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Invoice together with its line items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceWithLines {
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
}

/// Priced invoice ready to be written. Number and id are allocated by the store.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub currency: String,
    pub subtotal: Decimal,
    pub credits_applied: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub line_items: Vec<LineItem>,
    pub credit_applications: Vec<CreditApplication>,
    pub due_date: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Compare-and-set on an invoice's status
#[derive(Debug, Clone)]
pub struct InvoiceTransition {
    pub invoice_id: Uuid,
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
    pub at: OffsetDateTime,
    /// Amount settled when moving to paid
    pub amount_paid: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub organization_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub processor_transaction_id: Option<String>,
    /// Sent to the processor on every attempt of this payment
    pub idempotency_key: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub refunded_amount: Option<Decimal>,
    pub attempted_at: OffsetDateTime,
    pub succeeded_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
    pub refunded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn pending(invoice: &Invoice, payment_method: Option<String>, at: OffsetDateTime) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            invoice_id: invoice.id,
            organization_id: invoice.organization_id,
            amount: invoice.amount_due,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Pending,
            payment_method,
            processor_transaction_id: None,
            idempotency_key: format!("payment-{}", id),
            failure_code: None,
            failure_message: None,
            refunded_amount: None,
            attempted_at: at,
            succeeded_at: None,
            failed_at: None,
            refunded_at: None,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Compare-and-set on a payment's status
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub payment_id: Uuid,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub at: OffsetDateTime,
    pub processor_transaction_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub refunded_amount: Option<Decimal>,
}

impl PaymentTransition {
    pub fn new(payment_id: Uuid, from: PaymentStatus, to: PaymentStatus, at: OffsetDateTime) -> Self {
        Self {
            payment_id,
            from,
            to,
            at,
            processor_transaction_id: None,
            failure_code: None,
            failure_message: None,
            refunded_amount: None,
        }
    }

    pub fn transaction(mut self, transaction_id: Option<String>) -> Self {
        self.processor_transaction_id = transaction_id;
        self
    }

    pub fn failure(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.failure_code = Some(code.into());
        self.failure_message = Some(message.into());
        self
    }

    pub fn refunded(mut self, amount: Decimal) -> Self {
        self.refunded_amount = Some(amount);
        self
    }
}

/// Result of applying a payment transition.
/// `invoice` is set when the transition settled the invoice.
#[derive(Debug, Clone)]
pub struct AppliedPayment {
    pub payment: Payment,
    pub invoice: Option<Invoice>,
}

/// Funds the processor captured on a payment already recorded as failed.
/// While unresolved the invoice is not charged again.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentConflict {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub organization_id: Uuid,
    pub processor_transaction_id: Option<String>,
    pub detected_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<Uuid>,
}

impl PaymentConflict {
    pub fn detected(payment: &Payment, transaction_id: Option<String>, at: OffsetDateTime) -> Self {
        Self {
            payment_id: payment.id,
            invoice_id: payment.invoice_id,
            organization_id: payment.organization_id,
            processor_transaction_id: transaction_id.or_else(|| payment.processor_transaction_id.clone()),
            detected_at: at,
            resolved_at: None,
            resolved_by: None,
        }
    }
}

/// Result of claiming the refund of a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundClaim {
    /// The caller owns the refund for the requested amount
    Claimed,
    /// Another refund of a different amount holds the payment
    Held { amount: Decimal },
    /// The payment is not in a refundable state
    NotRefundable(PaymentStatus),
}

/// Consecutive billing-cycle failures of one subscription
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingFailure {
    pub subscription_id: Uuid,
    pub failures: i32,
    pub last_error: String,
    pub retry_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
