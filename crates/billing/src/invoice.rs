//! Invoice service
//!
//! Orchestrates invoice generation around the pure pricing engine:
//! load the subscription, aggregate usage, load credits, price, then hand the
//! result to the store which allocates the number and writes everything in
//! one transaction. The preview path (`get_upcoming_invoice`) shares the
//! pricing step and persists nothing.

use std::sync::Arc;

use meterline_shared::InvoiceStatus;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::events::{AuditEntryBuilder, AuditEventType, ActorType, EntityType};
use crate::invariants;
use crate::models::{
    Credit, Invoice, InvoiceTransition, InvoiceWithLines, NewInvoice, SubscriptionWithPlan,
};
use crate::notify::{self, topics, EventPublisher, NotificationTemplate, Notifier};
use crate::pricing::{self, ChargeBreakdown, PricingContext};
use crate::store::{BillingStore, InvoiceQuery};
use crate::usage::UsageAggregator;

/// Priced but unpersisted invoice for the current period
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingInvoice {
    pub subscription_id: Uuid,
    pub organization_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub due_date: OffsetDateTime,
    pub breakdown: ChargeBreakdown,
}

enum Generated {
    Created(InvoiceWithLines),
    Existing(InvoiceWithLines),
}

pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    usage: Arc<dyn UsageAggregator>,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn EventPublisher>,
    config: BillingConfig,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageAggregator>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn EventPublisher>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            usage,
            notifier,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Generate the draft invoice for a subscription's current period.
    ///
    /// Idempotent per period: when the period is already invoiced the stored
    /// invoice is returned. Invoice number collisions and lost credit races
    /// retry the whole generation a bounded number of times.
    pub async fn generate_invoice(&self, subscription_id: Uuid) -> BillingResult<InvoiceWithLines> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(5)
            .map(jitter)
            .take(self.config.invoice_generation_max_attempts.saturating_sub(1) as usize);

        let result = RetryIf::start(
            strategy,
            || self.try_generate(subscription_id),
            |e: &BillingError| {
                let retry = matches!(
                    e,
                    BillingError::InvoiceNumberConflict(_) | BillingError::ConcurrentModification(_)
                );
                if retry {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Invoice generation lost a race, retrying"
                    );
                }
                retry
            },
        )
        .await;

        match result {
            Ok(Generated::Created(created)) => {
                self.on_created(&created).await;
                Ok(created)
            }
            Ok(Generated::Existing(existing)) => Ok(existing),
            // A concurrent generator committed the same period first
            Err(BillingError::DuplicateInvoice(detail)) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    detail = %detail,
                    "Period invoiced concurrently, returning existing invoice"
                );
                let loaded = self.load_subscription(subscription_id).await?;
                let subscription = &loaded.subscription;
                let invoice = self
                    .store
                    .invoice_for_period(
                        subscription_id,
                        subscription.current_period_start,
                        subscription.current_period_end,
                    )
                    .await?
                    .ok_or(BillingError::DuplicateInvoice(detail))?;
                self.get_invoice(invoice.id).await
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Could not generate invoice"
                );
                Err(e)
            }
        }
    }

    async fn try_generate(&self, subscription_id: Uuid) -> BillingResult<Generated> {
        let loaded = self.load_subscription(subscription_id).await?;
        let subscription = &loaded.subscription;

        if !subscription.status.is_billable() {
            return Err(BillingError::InvalidInput(format!(
                "subscription {} is {} and can not be invoiced",
                subscription.id, subscription.status
            )));
        }

        if let Some(existing) = self
            .store
            .invoice_for_period(
                subscription.id,
                subscription.current_period_start,
                subscription.current_period_end,
            )
            .await?
        {
            tracing::debug!(
                subscription_id = %subscription.id,
                invoice_id = %existing.id,
                "Period already invoiced"
            );
            return self.get_invoice(existing.id).await.map(Generated::Existing);
        }

        let now = OffsetDateTime::now_utc();
        let (breakdown, credits) = self.price_period(&loaded, now).await?;
        invariants::ensure(subscription.id, invariants::check_breakdown(&breakdown, &credits))?;

        let new = NewInvoice {
            id: Uuid::new_v4(),
            organization_id: subscription.organization_id,
            subscription_id: subscription.id,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            currency: breakdown.currency.clone(),
            subtotal: breakdown.subtotal,
            credits_applied: breakdown.credits_applied,
            tax_amount: breakdown.tax_amount,
            total: breakdown.total,
            line_items: breakdown.line_items.clone(),
            credit_applications: breakdown.credit_applications.clone(),
            due_date: now + time::Duration::days(self.config.due_days),
            created_at: now,
        };

        let audit = AuditEntryBuilder::new(
            new.organization_id,
            EntityType::Invoice,
            new.id,
            AuditEventType::InvoiceCreated,
        )
        .field("subscription_id", subscription.id)
        .field("plan_version", loaded.plan.version)
        .field("period_start", subscription.current_period_start)
        .field("period_end", subscription.current_period_end)
        .field("subtotal", breakdown.subtotal)
        .field("credits_applied", breakdown.credits_applied)
        .field("credit_applications", &breakdown.credit_applications)
        .field("tax_amount", breakdown.tax_amount)
        .field("total", breakdown.total)
        .build(now);

        let created = self
            .store
            .insert_invoice_bundle(new, &self.config.invoice_number_prefix, audit)
            .await?;

        tracing::info!(
            invoice_id = %created.invoice.id,
            invoice_number = %created.invoice.invoice_number,
            subscription_id = %subscription.id,
            total = %created.invoice.total,
            currency = %created.invoice.currency,
            "Invoice generated"
        );

        Ok(Generated::Created(created))
    }

    /// Price the subscription's current period without persisting anything
    pub async fn get_upcoming_invoice(&self, subscription_id: Uuid) -> BillingResult<UpcomingInvoice> {
        let loaded = self.load_subscription(subscription_id).await?;
        let now = OffsetDateTime::now_utc();
        let (breakdown, _) = self.price_period(&loaded, now).await?;
        let subscription = &loaded.subscription;

        Ok(UpcomingInvoice {
            subscription_id: subscription.id,
            organization_id: subscription.organization_id,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            due_date: subscription.current_period_end + time::Duration::days(self.config.due_days),
            breakdown,
        })
    }

    /// Shared calculation path of generation and preview
    async fn price_period(
        &self,
        loaded: &SubscriptionWithPlan,
        as_of: OffsetDateTime,
    ) -> BillingResult<(ChargeBreakdown, Vec<Credit>)> {
        let subscription = &loaded.subscription;
        let organization = &loaded.organization;

        let usage = tokio::time::timeout(
            self.config.usage_query_timeout,
            self.usage.usage_for_period(
                organization.id,
                subscription.current_period_start,
                subscription.current_period_end,
            ),
        )
        .await
        .map_err(|_| {
            BillingError::dependency(
                "usage_aggregator",
                format!(
                    "usage query timed out after {}ms",
                    self.config.usage_query_timeout.as_millis()
                ),
            )
        })?
        .map_err(|e| as_dependency("usage_aggregator", e))?;

        let credits = if self.config.features.credits {
            self.store
                .active_credits(organization.id, as_of)
                .await
                .map_err(|e| as_dependency("credit_store", e))?
        } else {
            Vec::new()
        };

        let ctx = PricingContext {
            as_of,
            currency: self.config.billing_currency(&organization.currency).to_string(),
            tax_rate: self.config.default_tax_rate,
            features: self.config.features,
        };

        let breakdown = pricing::calculate_charge(
            subscription,
            &loaded.plan,
            &loaded.tiers,
            &usage,
            &credits,
            &ctx,
        )?;

        Ok((breakdown, credits))
    }

    /// Draft → open. An invoice with nothing due settles immediately.
    pub async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let stored = self.get_invoice(invoice_id).await?;
        invariants::ensure(invoice_id, invariants::check_invoice(&stored))?;
        let invoice = stored.invoice;

        let open = self
            .transition(&invoice, InvoiceStatus::Open, AuditEventType::InvoiceFinalized, None, ActorType::System)
            .await?;

        notify::publish_quietly(
            self.publisher.as_ref(),
            topics::INVOICE_FINALIZED,
            &open.id.to_string(),
            invoice_event(&open),
        )
        .await;

        if open.amount_due.is_zero() {
            tracing::info!(invoice_id = %open.id, "Nothing due, settling invoice at finalization");
            return self
                .transition(
                    &open,
                    InvoiceStatus::Paid,
                    AuditEventType::InvoicePaid,
                    Some(Decimal::ZERO),
                    ActorType::System,
                )
                .await;
        }

        if let Some(organization) = self.store.organization(open.organization_id).await? {
            notify::notify_quietly(
                self.notifier.as_ref(),
                NotificationTemplate::InvoiceCreated,
                &organization.billing_email,
                serde_json::json!({
                    "invoice_id": open.id,
                    "invoice_number": open.invoice_number,
                    "amount": open.amount_due,
                    "currency": open.currency,
                    "due_date": open.due_date,
                }),
            )
            .await;
        }

        Ok(open)
    }

    /// Record a payment received outside the processor (bank transfer, check)
    pub async fn mark_paid(&self, invoice_id: Uuid, amount: Decimal, actor_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.get_invoice(invoice_id).await?.invoice;
        if invoice.status == InvoiceStatus::Paid {
            return Err(BillingError::AlreadyPaid(invoice.id));
        }
        if amount < Decimal::ZERO || amount < invoice.amount_due {
            return Err(BillingError::InvalidAmount(format!(
                "{} {} does not cover the {} {} due on invoice {}",
                amount, invoice.currency, invoice.amount_due, invoice.currency, invoice.invoice_number
            )));
        }

        self.transition(
            &invoice,
            InvoiceStatus::Paid,
            AuditEventType::InvoicePaid,
            Some(amount),
            ActorType::Admin,
        )
        .await
        .map(|paid| {
            tracing::info!(
                invoice_id = %paid.id,
                amount = %amount,
                actor_id = %actor_id,
                "Invoice marked paid manually"
            );
            paid
        })
    }

    /// Void any invoice that is not paid. Voiding a void invoice is a no-op.
    pub async fn void_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.get_invoice(invoice_id).await?.invoice;
        if invoice.status == InvoiceStatus::Void {
            return Ok(invoice);
        }
        if invoice.status == InvoiceStatus::Paid {
            return Err(BillingError::AlreadyPaid(invoice.id));
        }

        let voided = self
            .transition(&invoice, InvoiceStatus::Void, AuditEventType::InvoiceVoided, None, ActorType::Admin)
            .await?;
        notify::publish_quietly(
            self.publisher.as_ref(),
            topics::INVOICE_VOIDED,
            &voided.id.to_string(),
            invoice_event(&voided),
        )
        .await;
        Ok(voided)
    }

    /// Open → uncollectible, after collection has been given up on
    pub async fn mark_uncollectible(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.get_invoice(invoice_id).await?.invoice;
        self.transition(
            &invoice,
            InvoiceStatus::Uncollectible,
            AuditEventType::InvoiceUncollectible,
            None,
            ActorType::Admin,
        )
        .await
    }

    pub async fn list_invoices(&self, organization_id: Uuid, query: &InvoiceQuery) -> BillingResult<Vec<Invoice>> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(BillingError::InvalidInput(format!(
                "invalid page limit={} offset={}",
                query.limit, query.offset
            )));
        }
        self.store.list_invoices(organization_id, query).await
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<InvoiceWithLines> {
        self.store
            .invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    /// Adjustment owed when the subscription moves to `new_unit_price` ×
    /// `new_quantity` at `at`. Positive amounts are charges, negative amounts
    /// are credits.
    pub async fn calculate_proration(
        &self,
        subscription_id: Uuid,
        new_unit_price: Decimal,
        new_quantity: i32,
        at: OffsetDateTime,
    ) -> BillingResult<Decimal> {
        if new_unit_price < Decimal::ZERO || new_quantity < 0 {
            return Err(BillingError::InvalidInput(
                "new price and quantity must not be negative".to_string(),
            ));
        }
        let loaded = self.load_subscription(subscription_id).await?;
        let subscription = &loaded.subscription;
        let old_unit_price = subscription.custom_price.unwrap_or(loaded.plan.base_price);

        Ok(pricing::prorate(
            old_unit_price * Decimal::from(subscription.quantity),
            new_unit_price * Decimal::from(new_quantity),
            subscription.current_period_start,
            subscription.current_period_end,
            at,
            self.config.billing_currency(&loaded.organization.currency),
            self.config.features.proration,
        ))
    }

    async fn load_subscription(&self, subscription_id: Uuid) -> BillingResult<SubscriptionWithPlan> {
        self.store
            .subscription_with_plan(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }

    async fn transition(
        &self,
        invoice: &Invoice,
        to: InvoiceStatus,
        event: AuditEventType,
        amount_paid: Option<Decimal>,
        actor: ActorType,
    ) -> BillingResult<Invoice> {
        invoice.status.transition(to)?;
        let now = OffsetDateTime::now_utc();

        let mut audit = AuditEntryBuilder::new(invoice.organization_id, EntityType::Invoice, invoice.id, event)
            .change("status", invoice.status, to)
            .actor_type(actor);
        if let Some(amount) = amount_paid {
            audit = audit.change("amount_paid", invoice.amount_paid, invoice.amount_paid + amount);
        }

        let updated = self
            .store
            .transition_invoice(
                InvoiceTransition {
                    invoice_id: invoice.id,
                    from: invoice.status,
                    to,
                    at: now,
                    amount_paid,
                },
                audit.build(now),
            )
            .await?
            .ok_or_else(|| {
                BillingError::ConcurrentModification(format!(
                    "invoice {} left {} before it could become {}",
                    invoice.id, invoice.status, to
                ))
            })?;

        tracing::info!(
            invoice_id = %updated.id,
            from = %invoice.status,
            to = %updated.status,
            "Invoice status changed"
        );
        Ok(updated)
    }

    async fn on_created(&self, created: &InvoiceWithLines) {
        notify::publish_quietly(
            self.publisher.as_ref(),
            topics::INVOICE_CREATED,
            &created.invoice.id.to_string(),
            invoice_event(&created.invoice),
        )
        .await;
    }
}

/// Failures of a data dependency surface as `DependencyUnavailable` unless
/// they describe bad input
fn as_dependency(dependency: &'static str, error: BillingError) -> BillingError {
    match error.kind() {
        ErrorKind::Validation | ErrorKind::DependencyUnavailable => error,
        _ => BillingError::dependency(dependency, error.to_string()),
    }
}

pub(crate) fn invoice_event(invoice: &Invoice) -> serde_json::Value {
    serde_json::json!({
        "invoice_id": invoice.id,
        "invoice_number": invoice.invoice_number,
        "organization_id": invoice.organization_id,
        "subscription_id": invoice.subscription_id,
        "status": invoice.status,
        "total": invoice.total,
        "amount_due": invoice.amount_due,
        "currency": invoice.currency,
    })
}
