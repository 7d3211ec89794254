//! Persistence boundary for the billing engine
//!
//! Every method is a domain operation carrying its own transactional
//! guarantee, so services never hold a transaction open across I/O with the
//! payment processor or the notification system.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use meterline_shared::InvoiceStatus;
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{AuditEntry, AuditEntryBuilder, AuditEventType, EntityType};
use crate::models::{
    AppliedPayment, BillingFailure, Credit, CreditApplication, Invoice, InvoiceTransition,
    InvoiceWithLines, NewInvoice, Organization, Payment, PaymentConflict, PaymentTransition,
    RefundClaim, Subscription, SubscriptionWithPlan,
};

/// First pause after a subscription fails a billing cycle
const BILLING_RETRY_BASE: Duration = Duration::hours(1);
/// Longest pause between billing attempts of a failing subscription
const BILLING_RETRY_MAX: Duration = Duration::hours(24);

/// Filter for listing an organization's invoices, newest first
#[derive(Debug, Clone)]
pub struct InvoiceQuery {
    pub status: Option<InvoiceStatus>,
    pub subscription_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for InvoiceQuery {
    fn default() -> Self {
        Self {
            status: None,
            subscription_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn organization(&self, organization_id: Uuid) -> BillingResult<Option<Organization>>;

    /// Subscription with its plan version, pricing tiers and organization
    async fn subscription_with_plan(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<SubscriptionWithPlan>>;

    /// Credits with status active and remaining balance, ordered by `valid_from`.
    /// Callers must not rely on the ordering for correctness.
    async fn active_credits(
        &self,
        organization_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<Credit>>;

    async fn invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<Invoice>>;

    /// Atomically allocate the next `{prefix}-{year}-{sequence}` number, write
    /// the draft invoice with its line items, draw down the applied credits and
    /// append the audit entry plus one `CREDIT_APPLIED` entry per draw.
    ///
    /// Fails with `InvoiceNumberConflict` when a concurrent writer took the
    /// number, `DuplicateInvoice` when the period is already invoiced and
    /// `ConcurrentModification` when a credit no longer covers its application.
    /// Nothing is written on failure.
    async fn insert_invoice_bundle(
        &self,
        invoice: NewInvoice,
        number_prefix: &str,
        audit: AuditEntry,
    ) -> BillingResult<InvoiceWithLines>;

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<InvoiceWithLines>>;

    async fn list_invoices(
        &self,
        organization_id: Uuid,
        query: &InvoiceQuery,
    ) -> BillingResult<Vec<Invoice>>;

    /// Compare-and-set on invoice status. `None` when the invoice was not in
    /// `from` anymore.
    async fn transition_invoice(
        &self,
        transition: InvoiceTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<Invoice>>;

    /// Insert a pending payment. Fails with `PaymentPending` when the invoice
    /// already has one.
    async fn insert_payment(&self, payment: Payment, audit: AuditEntry) -> BillingResult<Payment>;

    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>>;

    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>>;

    async fn pending_payment_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Payment>>;

    /// Attach the processor transaction id to a payment that has none yet.
    /// Returns false when a different id was already attached.
    async fn attach_transaction_id(&self, payment_id: Uuid, transaction_id: &str) -> BillingResult<bool>;

    /// Compare-and-set on payment status. A transition to succeeded also
    /// settles the invoice in the same transaction. `None` when the payment
    /// was not in `from` anymore.
    async fn transition_payment(
        &self,
        transition: PaymentTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<AppliedPayment>>;

    async fn record_audit(&self, entry: AuditEntry) -> BillingResult<()>;

    /// Audit entries for an entity, oldest first
    async fn audit_trail(&self, entity_id: Uuid) -> BillingResult<Vec<AuditEntry>>;

    /// Claim the single refund of a succeeded payment. Claiming again with
    /// the same amount succeeds, so a refund whose processor call went
    /// unanswered can be retried under the same idempotency key.
    async fn claim_refund(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        at: OffsetDateTime,
    ) -> BillingResult<RefundClaim>;

    /// Drop a claim the processor rejected so a corrected refund can be made
    async fn release_refund(&self, payment_id: Uuid, amount: Decimal) -> BillingResult<()>;

    /// Record captured funds on a failed payment. Returns false when the
    /// conflict was already recorded.
    async fn record_payment_conflict(
        &self,
        conflict: PaymentConflict,
        audit: AuditEntry,
    ) -> BillingResult<bool>;

    /// Unresolved conflict blocking charges of the invoice
    async fn open_payment_conflict(&self, invoice_id: Uuid) -> BillingResult<Option<PaymentConflict>>;

    /// Mark the payment's conflict resolved. `None` when there was no
    /// unresolved conflict.
    async fn resolve_payment_conflict(
        &self,
        payment_id: Uuid,
        resolved_by: Uuid,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<Option<PaymentConflict>>;

    /// Billable subscriptions whose current period ended at or before `cutoff`,
    /// skipping those whose last billing failure defers them past `now`
    async fn subscriptions_due(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Count a failed billing attempt and defer the subscription by
    /// [`billing_retry_delay`]
    async fn record_billing_failure(
        &self,
        subscription_id: Uuid,
        error: &str,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<BillingFailure>;

    /// Roll the subscription into its next period if it is still on
    /// `expected_period_end` and clear its billing failures. Returns false
    /// when another worker already did.
    async fn advance_subscription_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: OffsetDateTime,
        next_period_end: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<bool>;
}

/// Pause before the next billing attempt after `failures` consecutive
/// failures: one hour, doubling, capped at a day
pub fn billing_retry_delay(failures: i32) -> Duration {
    let exponent = failures.saturating_sub(1).clamp(0, 16) as u32;
    let delay = BILLING_RETRY_BASE
        .checked_mul(2i32.pow(exponent))
        .unwrap_or(BILLING_RETRY_MAX);
    delay.min(BILLING_RETRY_MAX)
}

/// Audit entry for one credit drawn by a new invoice
pub(crate) fn credit_applied_audit(
    invoice: &NewInvoice,
    application: &CreditApplication,
    remaining_before: Decimal,
) -> AuditEntry {
    AuditEntryBuilder::new(
        invoice.organization_id,
        EntityType::Credit,
        application.credit_id,
        AuditEventType::CreditApplied,
    )
    .field("invoice_id", invoice.id)
    .field("amount", application.amount)
    .change(
        "remaining_amount",
        remaining_before,
        remaining_before - application.amount,
    )
    .build(invoice.created_at)
}

/// Invoice number for the `sequence`-th invoice of `year`
pub fn format_invoice_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}

/// Prefix shared by all invoice numbers of a year, used for counting
pub fn invoice_number_year_prefix(prefix: &str, year: i32) -> String {
    format!("{}-{}-", prefix, year)
}
