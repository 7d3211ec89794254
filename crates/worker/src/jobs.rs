//! Billing cycle job
//!
//! Picks up subscriptions whose period ended more than the usage settlement
//! grace ago, invoices them, collects payment when auto-pay applies and rolls
//! them into their next period. Every step is idempotent, so a crashed or
//! overlapping run simply redoes the remaining work.
//!
//! A subscription that still fails after the in-run retries is recorded and
//! left out of later batches until its backoff expires, so it can not hold
//! the head of the queue.

use std::time::Duration;

use meterline_billing::{
    ActorType, AuditEntryBuilder, AuditEventType, BillingError, BillingResult, BillingService,
    EntityType, Subscription,
};
use meterline_shared::InvoiceStatus;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

/// Outcome counts of one billing cycle run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub invoiced: usize,
    pub charged: usize,
    pub declined: usize,
    pub failed: usize,
}

/// What happened to a single subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Billed {
    /// Invoiced and settled, or left open for manual collection
    Invoiced { charged: bool },
    /// Invoiced; the charge was declined
    Declined,
    /// Another run already closed this period
    Skipped,
}

/// Run one pass over the due subscriptions
pub async fn run_billing_cycle(billing: &BillingService, batch_size: i64, max_retries: usize) -> CycleReport {
    let now = OffsetDateTime::now_utc();
    let cutoff = now - billing.config.usage_settlement_grace;

    let due = match billing.store.subscriptions_due(cutoff, now, batch_size).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to load subscriptions due for billing");
            return CycleReport::default();
        }
    };

    if due.is_empty() {
        return CycleReport::default();
    }

    info!(count = due.len(), cutoff = %cutoff, "Billing due subscriptions");

    let mut report = CycleReport::default();
    for subscription in due {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(max_retries);

        let result = RetryIf::start(
            strategy,
            || bill_subscription(billing, &subscription),
            |e: &BillingError| {
                if e.is_retryable() {
                    warn!(subscription_id = %subscription.id, error = %e, "Billing step failed, retrying");
                }
                e.is_retryable()
            },
        )
        .await;

        match result {
            Ok(Billed::Invoiced { charged }) => {
                report.invoiced += 1;
                if charged {
                    report.charged += 1;
                }
            }
            Ok(Billed::Declined) => {
                report.invoiced += 1;
                report.declined += 1;
            }
            Ok(Billed::Skipped) => {}
            Err(e) => {
                report.failed += 1;
                defer(billing, &subscription, &e).await;
            }
        }
    }

    info!(
        invoiced = report.invoiced,
        charged = report.charged,
        declined = report.declined,
        failed = report.failed,
        "Billing cycle complete"
    );
    report
}

/// Record the failure so the subscription sits out until its backoff expires
async fn defer(billing: &BillingService, subscription: &Subscription, failure: &BillingError) {
    let now = OffsetDateTime::now_utc();
    let audit = AuditEntryBuilder::new(
        subscription.organization_id,
        EntityType::Subscription,
        subscription.id,
        AuditEventType::SubscriptionBillingFailed,
    )
    .field("period_end", subscription.current_period_end)
    .field("error", failure.to_string())
    .actor_type(ActorType::System)
    .build(now);

    match billing
        .store
        .record_billing_failure(subscription.id, &failure.to_string(), now, audit)
        .await
    {
        Ok(recorded) => error!(
            subscription_id = %subscription.id,
            period_end = %subscription.current_period_end,
            failures = recorded.failures,
            retry_at = %recorded.retry_at,
            error = %failure,
            "Could not bill subscription, deferred"
        ),
        Err(e) => error!(
            subscription_id = %subscription.id,
            error = %failure,
            record_error = %e,
            "Could not bill subscription or record the failure"
        ),
    }
}

async fn bill_subscription(billing: &BillingService, subscription: &Subscription) -> BillingResult<Billed> {
    // Invoice generation works on the stored period, which may have moved on
    if renewed_elsewhere(billing, subscription).await? {
        return Ok(Billed::Skipped);
    }

    let generated = billing.invoices.generate_invoice(subscription.id).await?;
    let mut invoice = generated.invoice;

    if invoice.status == InvoiceStatus::Draft {
        invoice = billing.invoices.finalize_invoice(invoice.id).await?;
    }

    let organization = billing
        .store
        .organization(subscription.organization_id)
        .await?
        .ok_or(BillingError::OrganizationNotFound(subscription.organization_id))?;

    let mut outcome = Billed::Invoiced { charged: false };
    let collect = billing.config.features.auto_payment
        && organization.auto_pay
        && invoice.status == InvoiceStatus::Open;
    if collect {
        match billing.payments.charge_invoice(invoice.id).await {
            Ok(payment) => {
                info!(
                    invoice_id = %invoice.id,
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Auto-payment submitted"
                );
                outcome = Billed::Invoiced { charged: true };
            }
            // Decline is terminal for this attempt; the customer has been notified
            Err(BillingError::PaymentDeclined { code, .. }) => {
                warn!(invoice_id = %invoice.id, code = %code, "Auto-payment declined");
                outcome = Billed::Declined;
            }
            Err(BillingError::PaymentPending(_)) | Err(BillingError::AlreadyPaid(_)) => {}
            // Captured funds await reconciliation; the invoice stays open
            Err(BillingError::PaymentConflict { payment_id, .. }) => {
                warn!(
                    invoice_id = %invoice.id,
                    payment_id = %payment_id,
                    "Auto-payment held by payment conflict"
                );
            }
            Err(e) => return Err(e),
        }
    }

    renew(billing, subscription).await?;
    Ok(outcome)
}

async fn renewed_elsewhere(billing: &BillingService, subscription: &Subscription) -> BillingResult<bool> {
    let current = billing
        .store
        .subscription_with_plan(subscription.id)
        .await?
        .ok_or(BillingError::SubscriptionNotFound(subscription.id))?;
    Ok(current.subscription.current_period_end != subscription.current_period_end)
}

/// Roll the subscription into its next period
async fn renew(billing: &BillingService, subscription: &Subscription) -> BillingResult<()> {
    let loaded = billing
        .store
        .subscription_with_plan(subscription.id)
        .await?
        .ok_or(BillingError::SubscriptionNotFound(subscription.id))?;

    // Already advanced by an overlapping run
    if loaded.subscription.current_period_end != subscription.current_period_end {
        return Ok(());
    }

    let next_end = loaded.plan.billing_interval.advance(subscription.current_period_end)?;
    let now = OffsetDateTime::now_utc();
    let audit = AuditEntryBuilder::new(
        subscription.organization_id,
        EntityType::Subscription,
        subscription.id,
        AuditEventType::SubscriptionRenewed,
    )
    .change("current_period_start", subscription.current_period_start, subscription.current_period_end)
    .change("current_period_end", subscription.current_period_end, next_end)
    .actor_type(ActorType::System)
    .build(now);

    let advanced = billing
        .store
        .advance_subscription_period(subscription.id, subscription.current_period_end, next_end, audit)
        .await?;
    if advanced {
        info!(
            subscription_id = %subscription.id,
            period_end = %next_end,
            "Subscription renewed"
        );
    }
    Ok(())
}
