//! Invoice generation, preview and lifecycle

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meterline_billing::events::AuditEntry;
use meterline_billing::models::{
    AppliedPayment, InvoiceTransition, NewInvoice, PaymentTransition, SubscriptionWithPlan,
};
use meterline_billing::{
    BillingConfig, BillingError, BillingFailure, BillingResult, BillingStore, Credit, ErrorKind,
    InMemoryStore, Invoice, InvoiceQuery, InvoiceWithLines, NotificationTemplate, Organization,
    Payment, PaymentConflict, RefundClaim, Subscription, UsageAggregator, UsageSummary,
};
use meterline_shared::{CreditStatus, InvoiceStatus, LineItemKind, MetricType};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::common::{plan, test_config, Harness, PERIOD_END, PERIOD_START};

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn test_overage_tax_scenario() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(99.00)), 1).await;
    h.record_usage(seeded.organization_id, MetricType::ApiCalls, dec!(1200000)).await;

    let generated = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap();
    let invoice = &generated.invoice;

    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.subtotal, dec!(100.00));
    assert_eq!(invoice.credits_applied, dec!(0));
    assert_eq!(invoice.tax_amount, dec!(10.00));
    assert_eq!(invoice.total, dec!(110.00));
    assert_eq!(invoice.amount_due, dec!(110.00));
    assert_eq!(invoice.period_start, PERIOD_START);
    assert_eq!(invoice.period_end, PERIOD_END);

    let usage_line = generated
        .line_items
        .iter()
        .find(|l| l.kind == LineItemKind::Usage)
        .unwrap();
    assert_eq!(usage_line.metric_type, Some(MetricType::ApiCalls));
    assert_eq!(usage_line.amount, dec!(1.00));
    assert_eq!(usage_line.included_quantity, Some(dec!(1000000)));
    assert_eq!(usage_line.actual_quantity, Some(dec!(1200000)));
    assert_eq!(usage_line.overage_quantity, Some(dec!(200000)));

    let line_sum: Decimal = generated.line_items.iter().map(|l| l.amount).sum();
    assert_eq!(line_sum, invoice.total);

    let year = OffsetDateTime::now_utc().year();
    assert_eq!(invoice.invoice_number, format!("INV-{}-000001", year));
}

#[tokio::test]
async fn test_credits_consumed_oldest_first() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let older = h
        .add_credit(seeded.organization_id, dec!(30.00), datetime!(2025-01-01 00:00 UTC))
        .await;
    let newer = h
        .add_credit(seeded.organization_id, dec!(50.00), datetime!(2025-02-01 00:00 UTC))
        .await;

    let generated = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap();
    let invoice = &generated.invoice;

    assert_eq!(invoice.subtotal, dec!(100.00));
    assert_eq!(invoice.credits_applied, dec!(80.00));
    assert_eq!(invoice.tax_amount, dec!(2.00));
    assert_eq!(invoice.total, dec!(22.00));

    for id in [older, newer] {
        let credit = h.store.credit(id).await.unwrap();
        assert_eq!(credit.remaining_amount, dec!(0));
        assert_eq!(credit.status, CreditStatus::Exhausted);
    }

    let credit_lines: Vec<_> = generated
        .line_items
        .iter()
        .filter(|l| l.kind == LineItemKind::Credit)
        .collect();
    assert_eq!(credit_lines.len(), 1);
    assert_eq!(credit_lines[0].amount, dec!(-80.00));
}

#[tokio::test]
async fn test_credit_order_follows_validity_not_insertion() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    // Larger, newer credit inserted first
    let newer = h
        .add_credit(seeded.organization_id, dec!(200.00), datetime!(2025-02-01 00:00 UTC))
        .await;
    let older = h
        .add_credit(seeded.organization_id, dec!(30.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let generated = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap();

    assert_eq!(generated.invoice.credits_applied, dec!(100.00));
    assert_eq!(generated.invoice.total, dec!(0.00));
    assert_eq!(h.store.credit(older).await.unwrap().remaining_amount, dec!(0));
    assert_eq!(h.store.credit(newer).await.unwrap().remaining_amount, dec!(130.00));

    let applications = h.store.credit_applications(generated.invoice.id).await;
    assert_eq!(applications.len(), 2);
    assert_eq!(applications[0].credit_id, older);
    assert_eq!(applications[0].amount, dec!(30.00));
    assert_eq!(applications[1].credit_id, newer);
    assert_eq!(applications[1].amount, dec!(70.00));
}

#[tokio::test]
async fn test_each_credit_draw_is_audited_on_the_credit() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let credit = h
        .add_credit(seeded.organization_id, dec!(150.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let generated = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap();

    let trail = h.store.audit_trail(credit).await.unwrap();
    assert_eq!(trail.len(), 1);
    let entry = &trail[0];
    assert_eq!(entry.event_type, "CREDIT_APPLIED");
    assert_eq!(entry.entity_type, "credit");
    assert_eq!(entry.organization_id, seeded.organization_id);
    assert_eq!(entry.diff["invoice_id"], generated.invoice.id.to_string());
    assert_eq!(entry.diff["amount"], serde_json::to_value(dec!(100.00)).unwrap());
    assert_eq!(
        entry.diff["remaining_amount"]["from"],
        serde_json::to_value(dec!(150.00)).unwrap()
    );
    assert_eq!(
        entry.diff["remaining_amount"]["to"],
        serde_json::to_value(dec!(50.00)).unwrap()
    );
}

#[tokio::test]
async fn test_generation_is_idempotent_per_period() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let credit = h
        .add_credit(seeded.organization_id, dec!(40.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let first = h.billing.invoices.generate_invoice(seeded.subscription_id).await.unwrap();
    let second = h.billing.invoices.generate_invoice(seeded.subscription_id).await.unwrap();

    assert_eq!(first.invoice.id, second.invoice.id);
    assert_eq!(h.store.invoice_count().await, 1);
    assert_eq!(h.store.credit(credit).await.unwrap().remaining_amount, dec!(0));
    assert_eq!(h.publisher.count("billing.invoice.created"), 1);
}

#[tokio::test]
async fn test_concurrent_generation_allocates_unique_numbers() {
    let h = Harness::new();
    let mut subscriptions = Vec::new();
    for _ in 0..20 {
        subscriptions.push(h.seed(plan(dec!(49.00)), 1).await.subscription_id);
    }

    let handles: Vec<_> = subscriptions
        .into_iter()
        .map(|id| {
            let billing = h.billing.clone();
            tokio::spawn(async move { billing.invoices.generate_invoice(id).await })
        })
        .collect();

    let mut numbers = HashSet::new();
    for handle in handles {
        let generated = handle.await.unwrap().unwrap();
        assert!(numbers.insert(generated.invoice.invoice_number));
    }

    let year = OffsetDateTime::now_utc().year();
    let expected: HashSet<String> = (1..=20).map(|n| format!("INV-{}-{:06}", year, n)).collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn test_number_collision_retries_whole_generation() {
    let collisions = Arc::new(AtomicU32::new(2));
    let counter = collisions.clone();
    let h = Harness::with_store(test_config(), move |inner| {
        Arc::new(CollidingStore { inner, collisions: counter }) as Arc<dyn BillingStore>
    });
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let credit = h
        .add_credit(seeded.organization_id, dec!(10.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let generated = h.billing.invoices.generate_invoice(seeded.subscription_id).await.unwrap();

    assert_eq!(collisions.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.invoice_count().await, 1);
    assert_eq!(generated.invoice.credits_applied, dec!(10.00));
    assert_eq!(h.store.credit(credit).await.unwrap().remaining_amount, dec!(0));
}

#[tokio::test]
async fn test_persistent_collision_leaves_nothing_behind() {
    let h = Harness::with_store(test_config(), |inner| {
        Arc::new(CollidingStore {
            inner,
            collisions: Arc::new(AtomicU32::new(u32::MAX)),
        }) as Arc<dyn BillingStore>
    });
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let credit = h
        .add_credit(seeded.organization_id, dec!(10.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let err = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::InvoiceNumberConflict(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.store.invoice_count().await, 0);
    assert_eq!(h.store.credit(credit).await.unwrap().remaining_amount, dec!(10.00));
    assert!(h.store.audit_trail(credit).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_usage_timeout_is_dependency_failure() {
    let config = BillingConfig {
        usage_query_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let h = Harness::with_usage(config, Arc::new(StalledUsage));
    let seeded = h.seed(plan(dec!(100.00)), 1).await;

    let err = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DependencyUnavailable);
    assert!(err.is_retryable());
    assert_eq!(h.store.invoice_count().await, 0);
}

#[tokio::test]
async fn test_unknown_subscription() {
    let h = Harness::new();
    let missing = Uuid::new_v4();
    let err = h.billing.invoices.generate_invoice(missing).await.unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_usage_below_allowance_bills_base_and_seats_only() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(99.00)), 3).await;
    h.record_usage(seeded.organization_id, MetricType::ApiCalls, dec!(999999)).await;
    h.record_usage(seeded.organization_id, MetricType::StorageGb, dec!(100)).await;

    let generated = h.billing.invoices.generate_invoice(seeded.subscription_id).await.unwrap();

    assert!(generated.line_items.iter().all(|l| l.kind != LineItemKind::Usage));
    // 3 × 99.00 base + 2 additional seats × 10.00
    assert_eq!(generated.invoice.subtotal, dec!(317.00));
}

// ============================================================================
// Preview
// ============================================================================

#[tokio::test]
async fn test_preview_matches_generation_and_persists_nothing() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(99.00)), 1).await;
    h.record_usage(seeded.organization_id, MetricType::ApiCalls, dec!(1200000)).await;
    let credit = h
        .add_credit(seeded.organization_id, dec!(25.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let preview = h
        .billing
        .invoices
        .get_upcoming_invoice(seeded.subscription_id)
        .await
        .unwrap();

    assert_eq!(h.store.invoice_count().await, 0);
    assert_eq!(h.store.credit(credit).await.unwrap().remaining_amount, dec!(25.00));
    assert!(h.store.audit_entries().await.is_empty());

    let generated = h.billing.invoices.generate_invoice(seeded.subscription_id).await.unwrap();
    assert_eq!(preview.breakdown.subtotal, generated.invoice.subtotal);
    assert_eq!(preview.breakdown.credits_applied, generated.invoice.credits_applied);
    assert_eq!(preview.breakdown.tax_amount, generated.invoice.tax_amount);
    assert_eq!(preview.breakdown.total, generated.invoice.total);
    assert_eq!(preview.breakdown.line_items.len(), generated.line_items.len());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_finalize_opens_invoice_and_notifies_once() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;

    let invoice = h.open_invoice(seeded).await;

    assert_eq!(invoice.status, InvoiceStatus::Open);
    assert!(invoice.finalized_at.is_some());
    assert_eq!(h.notifier.count(NotificationTemplate::InvoiceCreated), 1);

    let err = h.billing.invoices.finalize_invoice(invoice.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
    assert_eq!(h.notifier.count(NotificationTemplate::InvoiceCreated), 1);
}

#[tokio::test]
async fn test_zero_amount_invoice_settles_at_finalization() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    h.add_credit(seeded.organization_id, dec!(500.00), datetime!(2025-01-01 00:00 UTC))
        .await;

    let invoice = h.open_invoice(seeded).await;

    assert_eq!(invoice.total, dec!(0));
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(invoice.paid_at.is_some());
    assert_eq!(h.notifier.count(NotificationTemplate::InvoiceCreated), 0);
}

#[tokio::test]
async fn test_manual_payment_must_cover_amount_due() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let admin = Uuid::new_v4();

    let err = h
        .billing
        .invoices
        .mark_paid(invoice.id, dec!(50.00), admin)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount(_)));

    let paid = h
        .billing
        .invoices
        .mark_paid(invoice.id, dec!(110.00), admin)
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.amount_paid, dec!(110.00));
    assert_eq!(paid.amount_due, dec!(0));

    let err = h
        .billing
        .invoices
        .mark_paid(invoice.id, dec!(110.00), admin)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid(_)));
}

#[tokio::test]
async fn test_void_rules() {
    let h = Harness::new();
    let draft_seed = h.seed(plan(dec!(100.00)), 1).await;
    let draft = h
        .billing
        .invoices
        .generate_invoice(draft_seed.subscription_id)
        .await
        .unwrap()
        .invoice;

    let voided = h.billing.invoices.void_invoice(draft.id).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
    assert!(voided.voided_at.is_some());
    // Voiding again is a no-op
    let again = h.billing.invoices.void_invoice(draft.id).await.unwrap();
    assert_eq!(again.voided_at, voided.voided_at);

    let paid_seed = h.seed(plan(dec!(100.00)), 1).await;
    let open = h.open_invoice(paid_seed).await;
    h.billing
        .invoices
        .mark_paid(open.id, open.amount_due, Uuid::new_v4())
        .await
        .unwrap();
    let err = h.billing.invoices.void_invoice(open.id).await.unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid(_)));
}

#[tokio::test]
async fn test_uncollectible_can_still_be_paid() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;

    let uncollectible = h.billing.invoices.mark_uncollectible(invoice.id).await.unwrap();
    assert_eq!(uncollectible.status, InvoiceStatus::Uncollectible);

    let paid = h
        .billing
        .invoices
        .mark_paid(invoice.id, invoice.amount_due, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_list_invoices_filters_by_status() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;

    let open = h
        .billing
        .invoices
        .list_invoices(
            seeded.organization_id,
            &InvoiceQuery {
                status: Some(InvoiceStatus::Open),
                ..InvoiceQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, invoice.id);

    let drafts = h
        .billing
        .invoices
        .list_invoices(
            seeded.organization_id,
            &InvoiceQuery {
                status: Some(InvoiceStatus::Draft),
                ..InvoiceQuery::default()
            },
        )
        .await
        .unwrap();
    assert!(drafts.is_empty());
}

#[tokio::test]
async fn test_invoice_creation_is_audited() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;

    let trail = h.store.audit_trail(invoice.id).await.unwrap();
    let events: Vec<&str> = trail.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(events, vec!["INVOICE_CREATED", "INVOICE_FINALIZED"]);
    assert_eq!(trail[1].diff["status"]["from"], "draft");
    assert_eq!(trail[1].diff["status"]["to"], "open");
}

#[tokio::test]
async fn test_proration_for_mid_period_upgrade() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;

    // 2025-03-01..2025-04-01 is 31 days; 15.5 days remain at noon on the 16th
    let adjustment = h
        .billing
        .invoices
        .calculate_proration(
            seeded.subscription_id,
            dec!(200.00),
            1,
            datetime!(2025-03-16 12:00 UTC),
        )
        .await
        .unwrap();
    assert_eq!(adjustment, dec!(50.00));

    let disabled = Harness::with_config(BillingConfig {
        features: meterline_billing::FeatureFlags {
            proration: false,
            ..meterline_billing::FeatureFlags::default()
        },
        ..test_config()
    });
    let seeded = disabled.seed(plan(dec!(100.00)), 1).await;
    let adjustment = disabled
        .billing
        .invoices
        .calculate_proration(seeded.subscription_id, dec!(200.00), 1, datetime!(2025-03-16 12:00 UTC))
        .await
        .unwrap();
    assert_eq!(adjustment, dec!(0));
}

// ============================================================================
// Test doubles
// ============================================================================

/// Usage backend that never answers
struct StalledUsage;

#[async_trait]
impl UsageAggregator for StalledUsage {
    async fn usage_for_period(
        &self,
        _organization_id: Uuid,
        _start: OffsetDateTime,
        _end: OffsetDateTime,
    ) -> BillingResult<UsageSummary> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(UsageSummary::new())
    }
}

/// Store whose first `collisions` invoice inserts lose the number race
struct CollidingStore {
    inner: InMemoryStore,
    collisions: Arc<AtomicU32>,
}

#[async_trait]
impl BillingStore for CollidingStore {
    async fn organization(&self, organization_id: Uuid) -> BillingResult<Option<Organization>> {
        self.inner.organization(organization_id).await
    }

    async fn subscription_with_plan(&self, subscription_id: Uuid) -> BillingResult<Option<SubscriptionWithPlan>> {
        self.inner.subscription_with_plan(subscription_id).await
    }

    async fn active_credits(&self, organization_id: Uuid, as_of: OffsetDateTime) -> BillingResult<Vec<Credit>> {
        self.inner.active_credits(organization_id, as_of).await
    }

    async fn invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<Invoice>> {
        self.inner
            .invoice_for_period(subscription_id, period_start, period_end)
            .await
    }

    async fn insert_invoice_bundle(
        &self,
        invoice: NewInvoice,
        number_prefix: &str,
        audit: AuditEntry,
    ) -> BillingResult<InvoiceWithLines> {
        let collided = self
            .collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if collided {
            return Err(BillingError::InvoiceNumberConflict(format!("{}-collision", number_prefix)));
        }
        self.inner.insert_invoice_bundle(invoice, number_prefix, audit).await
    }

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<InvoiceWithLines>> {
        self.inner.invoice(invoice_id).await
    }

    async fn list_invoices(&self, organization_id: Uuid, query: &InvoiceQuery) -> BillingResult<Vec<Invoice>> {
        self.inner.list_invoices(organization_id, query).await
    }

    async fn transition_invoice(
        &self,
        transition: InvoiceTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<Invoice>> {
        self.inner.transition_invoice(transition, audit).await
    }

    async fn insert_payment(&self, payment: Payment, audit: AuditEntry) -> BillingResult<Payment> {
        self.inner.insert_payment(payment, audit).await
    }

    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        self.inner.payment(payment_id).await
    }

    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        self.inner.payment_by_transaction(transaction_id).await
    }

    async fn pending_payment_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Payment>> {
        self.inner.pending_payment_for_invoice(invoice_id).await
    }

    async fn attach_transaction_id(&self, payment_id: Uuid, transaction_id: &str) -> BillingResult<bool> {
        self.inner.attach_transaction_id(payment_id, transaction_id).await
    }

    async fn transition_payment(
        &self,
        transition: PaymentTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<AppliedPayment>> {
        self.inner.transition_payment(transition, audit).await
    }

    async fn record_audit(&self, entry: AuditEntry) -> BillingResult<()> {
        self.inner.record_audit(entry).await
    }

    async fn audit_trail(&self, entity_id: Uuid) -> BillingResult<Vec<AuditEntry>> {
        self.inner.audit_trail(entity_id).await
    }

    async fn claim_refund(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        at: OffsetDateTime,
    ) -> BillingResult<RefundClaim> {
        self.inner.claim_refund(payment_id, amount, at).await
    }

    async fn release_refund(&self, payment_id: Uuid, amount: Decimal) -> BillingResult<()> {
        self.inner.release_refund(payment_id, amount).await
    }

    async fn record_payment_conflict(
        &self,
        conflict: PaymentConflict,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        self.inner.record_payment_conflict(conflict, audit).await
    }

    async fn open_payment_conflict(&self, invoice_id: Uuid) -> BillingResult<Option<PaymentConflict>> {
        self.inner.open_payment_conflict(invoice_id).await
    }

    async fn resolve_payment_conflict(
        &self,
        payment_id: Uuid,
        resolved_by: Uuid,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<Option<PaymentConflict>> {
        self.inner.resolve_payment_conflict(payment_id, resolved_by, at, audit).await
    }

    async fn subscriptions_due(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        self.inner.subscriptions_due(cutoff, now, limit).await
    }

    async fn record_billing_failure(
        &self,
        subscription_id: Uuid,
        error: &str,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<BillingFailure> {
        self.inner.record_billing_failure(subscription_id, error, at, audit).await
    }

    async fn advance_subscription_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: OffsetDateTime,
        next_period_end: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        self.inner
            .advance_subscription_period(subscription_id, expected_period_end, next_period_end, audit)
            .await
    }
}
