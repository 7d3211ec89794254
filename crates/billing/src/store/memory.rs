//! In-memory billing store
//!
//! Enforces the same uniqueness and compare-and-set rules as the Postgres
//! schema behind a single async mutex. Used by the test suite and for local
//! runs without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use meterline_shared::{CreditStatus, InvoiceStatus, PaymentStatus};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    billing_retry_delay, credit_applied_audit, format_invoice_number, invoice_number_year_prefix,
    BillingStore, InvoiceQuery,
};
use crate::error::{BillingError, BillingResult};
use crate::events::AuditEntry;
use crate::models::{
    AppliedPayment, BillingFailure, Credit, CreditApplication, Invoice, InvoiceLineItem,
    InvoiceTransition, InvoiceWithLines, NewInvoice, Organization, Payment, PaymentConflict,
    PaymentTransition, PricingTier, RefundClaim, Subscription, SubscriptionPlan,
    SubscriptionWithPlan,
};

#[derive(Default)]
struct State {
    organizations: HashMap<Uuid, Organization>,
    plans: HashMap<Uuid, SubscriptionPlan>,
    tiers: Vec<PricingTier>,
    subscriptions: HashMap<Uuid, Subscription>,
    credits: HashMap<Uuid, Credit>,
    invoices: HashMap<Uuid, Invoice>,
    line_items: HashMap<Uuid, Vec<InvoiceLineItem>>,
    credit_applications: Vec<(Uuid, CreditApplication)>,
    payments: HashMap<Uuid, Payment>,
    refund_claims: HashMap<Uuid, Decimal>,
    payment_conflicts: HashMap<Uuid, PaymentConflict>,
    billing_failures: HashMap<Uuid, BillingFailure>,
    audit: Vec<AuditEntry>,
}

/// Billing store kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_organization(&self, organization: Organization) {
        self.state.lock().await.organizations.insert(organization.id, organization);
    }

    pub async fn insert_plan(&self, plan: SubscriptionPlan) {
        self.state.lock().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_pricing_tier(&self, tier: PricingTier) {
        self.state.lock().await.tiers.push(tier);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state.lock().await.subscriptions.insert(subscription.id, subscription);
    }

    pub async fn insert_credit(&self, credit: Credit) {
        self.state.lock().await.credits.insert(credit.id, credit);
    }

    pub async fn credit(&self, credit_id: Uuid) -> Option<Credit> {
        self.state.lock().await.credits.get(&credit_id).cloned()
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.state.lock().await.subscriptions.get(&subscription_id).cloned()
    }

    /// Credit draws recorded against an invoice
    pub async fn credit_applications(&self, invoice_id: Uuid) -> Vec<CreditApplication> {
        self.state
            .lock()
            .await
            .credit_applications
            .iter()
            .filter(|(id, _)| *id == invoice_id)
            .map(|(_, application)| *application)
            .collect()
    }

    pub async fn payments_for_invoice(&self, invoice_id: Uuid) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn billing_failure(&self, subscription_id: Uuid) -> Option<BillingFailure> {
        self.state.lock().await.billing_failures.get(&subscription_id).cloned()
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn organization(&self, organization_id: Uuid) -> BillingResult<Option<Organization>> {
        Ok(self.state.lock().await.organizations.get(&organization_id).cloned())
    }

    async fn subscription_with_plan(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<SubscriptionWithPlan>> {
        let state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get(&subscription_id).cloned() else {
            return Ok(None);
        };
        let plan = state.plans.get(&subscription.plan_id).cloned().ok_or_else(|| {
            BillingError::NotFound(format!(
                "plan {} of subscription {}",
                subscription.plan_id, subscription.id
            ))
        })?;
        let organization = state
            .organizations
            .get(&subscription.organization_id)
            .cloned()
            .ok_or(BillingError::OrganizationNotFound(subscription.organization_id))?;
        let tiers = state
            .tiers
            .iter()
            .filter(|t| t.plan_id == plan.id)
            .cloned()
            .collect();

        Ok(Some(SubscriptionWithPlan {
            organization,
            subscription,
            plan,
            tiers,
        }))
    }

    async fn active_credits(
        &self,
        organization_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<Credit>> {
        let state = self.state.lock().await;
        let mut credits: Vec<Credit> = state
            .credits
            .values()
            .filter(|c| c.organization_id == organization_id && c.is_usable_at(as_of))
            .cloned()
            .collect();
        credits.sort_by_key(|c| (c.valid_from, c.created_at, c.id));
        Ok(credits)
    }

    async fn invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.subscription_id == subscription_id
                    && i.period_start == period_start
                    && i.period_end == period_end
            })
            .cloned())
    }

    async fn insert_invoice_bundle(
        &self,
        new: NewInvoice,
        number_prefix: &str,
        audit: AuditEntry,
    ) -> BillingResult<InvoiceWithLines> {
        let mut state = self.state.lock().await;

        if state.invoices.values().any(|i| {
            i.subscription_id == new.subscription_id
                && i.period_start == new.period_start
                && i.period_end == new.period_end
        }) {
            return Err(BillingError::DuplicateInvoice(format!(
                "subscription {} already invoiced for {} - {}",
                new.subscription_id, new.period_start, new.period_end
            )));
        }

        let year = new.created_at.year();
        let year_prefix = invoice_number_year_prefix(number_prefix, year);
        let count = state
            .invoices
            .values()
            .filter(|i| i.invoice_number.starts_with(&year_prefix))
            .count();
        let invoice_number = format_invoice_number(number_prefix, year, count as i64 + 1);
        if state.invoices.values().any(|i| i.invoice_number == invoice_number) {
            return Err(BillingError::InvoiceNumberConflict(invoice_number));
        }

        // Check every draw before mutating anything
        for application in &new.credit_applications {
            let covered = state.credits.get(&application.credit_id).is_some_and(|c| {
                c.status == CreditStatus::Active && c.remaining_amount >= application.amount
            });
            if !covered {
                return Err(BillingError::ConcurrentModification(format!(
                    "credit {} no longer covers {}",
                    application.credit_id, application.amount
                )));
            }
        }
        for application in &new.credit_applications {
            if let Some(credit) = state.credits.get_mut(&application.credit_id) {
                let before = credit.remaining_amount;
                credit.remaining_amount -= application.amount;
                if credit.remaining_amount.is_zero() {
                    credit.status = CreditStatus::Exhausted;
                }
                state.audit.push(credit_applied_audit(&new, application, before));
            }
            state.credit_applications.push((new.id, *application));
        }

        let invoice = Invoice {
            id: new.id,
            organization_id: new.organization_id,
            subscription_id: new.subscription_id,
            invoice_number,
            period_start: new.period_start,
            period_end: new.period_end,
            subtotal: new.subtotal,
            credits_applied: new.credits_applied,
            tax_amount: new.tax_amount,
            total: new.total,
            amount_due: new.total,
            amount_paid: Decimal::ZERO,
            currency: new.currency.clone(),
            status: InvoiceStatus::Draft,
            due_date: new.due_date,
            paid_at: None,
            finalized_at: None,
            voided_at: None,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        let line_items: Vec<InvoiceLineItem> = new
            .line_items
            .iter()
            .enumerate()
            .map(|(position, line)| InvoiceLineItem::from_line(invoice.id, position as i32, line))
            .collect();

        state.invoices.insert(invoice.id, invoice.clone());
        state.line_items.insert(invoice.id, line_items.clone());
        state.audit.push(audit);

        Ok(InvoiceWithLines { invoice, line_items })
    }

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<InvoiceWithLines>> {
        let state = self.state.lock().await;
        Ok(state.invoices.get(&invoice_id).map(|invoice| InvoiceWithLines {
            invoice: invoice.clone(),
            line_items: state.line_items.get(&invoice_id).cloned().unwrap_or_default(),
        }))
    }

    async fn list_invoices(
        &self,
        organization_id: Uuid,
        query: &InvoiceQuery,
    ) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.organization_id == organization_id)
            .filter(|i| query.status.map_or(true, |s| i.status == s))
            .filter(|i| query.subscription_id.map_or(true, |s| i.subscription_id == s))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.invoice_number.cmp(&a.invoice_number))
        });

        Ok(invoices
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn transition_invoice(
        &self,
        transition: InvoiceTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<Invoice>> {
        let mut state = self.state.lock().await;
        let Some(invoice) = state.invoices.get_mut(&transition.invoice_id) else {
            return Ok(None);
        };
        if invoice.status != transition.from {
            return Ok(None);
        }

        invoice.status = transition.to;
        invoice.updated_at = transition.at;
        match transition.to {
            InvoiceStatus::Open => invoice.finalized_at = Some(transition.at),
            InvoiceStatus::Void => invoice.voided_at = Some(transition.at),
            InvoiceStatus::Paid => {
                invoice.paid_at = Some(transition.at);
                invoice.amount_paid += transition.amount_paid.unwrap_or(invoice.amount_due);
                invoice.amount_due = Decimal::ZERO;
            }
            InvoiceStatus::Draft | InvoiceStatus::Uncollectible => {}
        }
        let updated = invoice.clone();
        state.audit.push(audit);

        Ok(Some(updated))
    }

    async fn insert_payment(&self, payment: Payment, audit: AuditEntry) -> BillingResult<Payment> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .values()
            .any(|p| p.invoice_id == payment.invoice_id && p.status == PaymentStatus::Pending)
        {
            return Err(BillingError::PaymentPending(payment.invoice_id));
        }
        if state.payments.values().any(|p| p.idempotency_key == payment.idempotency_key) {
            return Err(BillingError::ConcurrentModification(format!(
                "idempotency key {} already used",
                payment.idempotency_key
            )));
        }

        state.payments.insert(payment.id, payment.clone());
        state.audit.push(audit);
        Ok(payment)
    }

    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.processor_transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn pending_payment_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.invoice_id == invoice_id && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn attach_transaction_id(&self, payment_id: Uuid, transaction_id: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.payments.values().any(|p| {
            p.id != payment_id && p.processor_transaction_id.as_deref() == Some(transaction_id)
        }) {
            return Err(BillingError::ConcurrentModification(format!(
                "transaction {} belongs to another payment",
                transaction_id
            )));
        }
        let Some(payment) = state.payments.get_mut(&payment_id) else {
            return Ok(false);
        };
        match payment.processor_transaction_id.as_deref() {
            None => {
                payment.processor_transaction_id = Some(transaction_id.to_string());
                payment.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            Some(existing) => Ok(existing == transaction_id),
        }
    }

    async fn transition_payment(
        &self,
        transition: PaymentTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<AppliedPayment>> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(&transition.payment_id) else {
            return Ok(None);
        };
        if payment.status != transition.from {
            return Ok(None);
        }

        payment.status = transition.to;
        payment.updated_at = transition.at;
        if payment.processor_transaction_id.is_none() {
            payment.processor_transaction_id = transition.processor_transaction_id.clone();
        }
        if transition.failure_code.is_some() {
            payment.failure_code = transition.failure_code.clone();
        }
        if transition.failure_message.is_some() {
            payment.failure_message = transition.failure_message.clone();
        }
        if transition.refunded_amount.is_some() {
            payment.refunded_amount = transition.refunded_amount;
        }
        match transition.to {
            PaymentStatus::Succeeded => payment.succeeded_at = Some(transition.at),
            PaymentStatus::Failed => payment.failed_at = Some(transition.at),
            PaymentStatus::Refunded => payment.refunded_at = Some(transition.at),
            PaymentStatus::Pending | PaymentStatus::Canceled => {}
        }
        let payment = payment.clone();

        let invoice = if transition.to == PaymentStatus::Succeeded {
            match state.invoices.get_mut(&payment.invoice_id) {
                Some(invoice) if invoice.status.is_collectible() => {
                    invoice.status = InvoiceStatus::Paid;
                    invoice.paid_at = Some(transition.at);
                    invoice.updated_at = transition.at;
                    invoice.amount_paid += payment.amount;
                    invoice.amount_due = Decimal::ZERO;
                    Some(invoice.clone())
                }
                _ => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        invoice_id = %payment.invoice_id,
                        "Payment succeeded but invoice was not collectible"
                    );
                    None
                }
            }
        } else {
            None
        };

        state.audit.push(audit);
        Ok(Some(AppliedPayment { payment, invoice }))
    }

    async fn record_audit(&self, entry: AuditEntry) -> BillingResult<()> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }

    async fn audit_trail(&self, entity_id: Uuid) -> BillingResult<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn claim_refund(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        _at: OffsetDateTime,
    ) -> BillingResult<RefundClaim> {
        let mut state = self.state.lock().await;
        let status = state
            .payments
            .get(&payment_id)
            .map(|p| p.status)
            .ok_or(BillingError::PaymentNotFound(payment_id))?;
        if status != PaymentStatus::Succeeded {
            return Ok(RefundClaim::NotRefundable(status));
        }
        match state.refund_claims.get(&payment_id) {
            Some(held) if *held == amount => Ok(RefundClaim::Claimed),
            Some(held) => Ok(RefundClaim::Held { amount: *held }),
            None => {
                state.refund_claims.insert(payment_id, amount);
                Ok(RefundClaim::Claimed)
            }
        }
    }

    async fn release_refund(&self, payment_id: Uuid, amount: Decimal) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.refund_claims.get(&payment_id) == Some(&amount) {
            state.refund_claims.remove(&payment_id);
        }
        Ok(())
    }

    async fn record_payment_conflict(
        &self,
        conflict: PaymentConflict,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.payment_conflicts.contains_key(&conflict.payment_id) {
            return Ok(false);
        }
        state.payment_conflicts.insert(conflict.payment_id, conflict);
        state.audit.push(audit);
        Ok(true)
    }

    async fn open_payment_conflict(&self, invoice_id: Uuid) -> BillingResult<Option<PaymentConflict>> {
        let state = self.state.lock().await;
        Ok(state
            .payment_conflicts
            .values()
            .filter(|c| c.invoice_id == invoice_id && c.resolved_at.is_none())
            .min_by_key(|c| c.detected_at)
            .cloned())
    }

    async fn resolve_payment_conflict(
        &self,
        payment_id: Uuid,
        resolved_by: Uuid,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<Option<PaymentConflict>> {
        let mut state = self.state.lock().await;
        let Some(conflict) = state.payment_conflicts.get_mut(&payment_id) else {
            return Ok(None);
        };
        if conflict.resolved_at.is_some() {
            return Ok(None);
        }
        conflict.resolved_at = Some(at);
        conflict.resolved_by = Some(resolved_by);
        let resolved = conflict.clone();
        state.audit.push(audit);
        Ok(Some(resolved))
    }

    async fn subscriptions_due(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status.is_billable() && s.current_period_end <= cutoff)
            .filter(|s| {
                state
                    .billing_failures
                    .get(&s.id)
                    .map_or(true, |f| f.retry_at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.current_period_end, s.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn advance_subscription_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: OffsetDateTime,
        next_period_end: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        if subscription.current_period_end != expected_period_end {
            return Ok(false);
        }
        subscription.current_period_start = subscription.current_period_end;
        subscription.current_period_end = next_period_end;
        state.billing_failures.remove(&subscription_id);
        state.audit.push(audit);
        Ok(true)
    }

    async fn record_billing_failure(
        &self,
        subscription_id: Uuid,
        error: &str,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<BillingFailure> {
        let mut state = self.state.lock().await;
        if !state.subscriptions.contains_key(&subscription_id) {
            return Err(BillingError::SubscriptionNotFound(subscription_id));
        }
        let failures = state
            .billing_failures
            .get(&subscription_id)
            .map_or(1, |f| f.failures.saturating_add(1));
        let failure = BillingFailure {
            subscription_id,
            failures,
            last_error: error.to_string(),
            retry_at: at + billing_retry_delay(failures),
            updated_at: at,
        };
        state.billing_failures.insert(subscription_id, failure.clone());
        state.audit.push(audit);
        Ok(failure)
    }
}
