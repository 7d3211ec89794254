//! Postgres-backed billing store

use async_trait::async_trait;
use meterline_shared::{InvoiceStatus, PaymentStatus};
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    billing_retry_delay, credit_applied_audit, format_invoice_number, invoice_number_year_prefix,
    BillingStore, InvoiceQuery,
};
use crate::error::{BillingError, BillingResult, PENDING_PAYMENT_CONSTRAINT};
use crate::events::AuditEntry;
use crate::models::{
    AppliedPayment, BillingFailure, Credit, Invoice, InvoiceLineItem, InvoiceTransition,
    InvoiceWithLines, NewInvoice, Organization, Payment, PaymentConflict, PaymentTransition,
    PricingTier, RefundClaim, Subscription, SubscriptionPlan, SubscriptionWithPlan,
};

/// Billing store over a Postgres pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn line_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceLineItem>> {
        let items = sqlx::query_as::<_, InvoiceLineItem>(
            r#"
            SELECT * FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}

async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO billing_audit_log (
            id, organization_id, entity_type, entity_id, event_type,
            actor_type, actor_id, processor_reference, diff, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.id)
    .bind(entry.organization_id)
    .bind(&entry.entity_type)
    .bind(entry.entity_id)
    .bind(&entry.event_type)
    .bind(&entry.actor_type)
    .bind(entry.actor_id)
    .bind(&entry.processor_reference)
    .bind(&entry.diff)
    .bind(entry.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn organization(&self, organization_id: Uuid) -> BillingResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(org)
    }

    async fn subscription_with_plan(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<SubscriptionWithPlan>> {
        let Some(subscription) =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let plan = sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "plan {} of subscription {}",
                    subscription.plan_id, subscription.id
                ))
            })?;

        let organization = self
            .organization(subscription.organization_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound(subscription.organization_id))?;

        let tiers = sqlx::query_as::<_, PricingTier>(
            r#"
            SELECT * FROM pricing_tiers
            WHERE plan_id = $1
            ORDER BY metric_type, tier_start
            "#,
        )
        .bind(plan.id)
        .fetch_all(&self.pool)
        .await?;

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
        let credits = sqlx::query_as::<_, Credit>(
            r#"
            SELECT * FROM credits
            WHERE organization_id = $1
              AND status = 'active'
              AND remaining_amount > 0
              AND valid_from <= $2
              AND (valid_until IS NULL OR valid_until > $2)
            ORDER BY valid_from ASC, created_at ASC, id ASC
            "#,
        )
        .bind(organization_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(credits)
    }

    async fn invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE subscription_id = $1 AND period_start = $2 AND period_end = $3
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(invoice)
    }

    async fn insert_invoice_bundle(
        &self,
        new: NewInvoice,
        number_prefix: &str,
        audit: AuditEntry,
    ) -> BillingResult<InvoiceWithLines> {
        let mut tx = self.pool.begin().await?;

        // Count-then-insert; the unique constraint on invoice_number turns a
        // concurrent allocation of the same sequence into InvoiceNumberConflict.
        let year = new.created_at.year();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM invoices WHERE starts_with(invoice_number, $1)",
        )
        .bind(invoice_number_year_prefix(number_prefix, year))
        .fetch_one(&mut *tx)
        .await?;
        let invoice_number = format_invoice_number(number_prefix, year, count + 1);

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                id, organization_id, subscription_id, invoice_number,
                period_start, period_end, subtotal, credits_applied, tax_amount,
                total, amount_due, amount_paid, currency, status, due_date,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, 0, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.organization_id)
        .bind(new.subscription_id)
        .bind(&invoice_number)
        .bind(new.period_start)
        .bind(new.period_end)
        .bind(new.subtotal)
        .bind(new.credits_applied)
        .bind(new.tax_amount)
        .bind(new.total)
        .bind(&new.currency)
        .bind(InvoiceStatus::Draft)
        .bind(new.due_date)
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut line_items = Vec::with_capacity(new.line_items.len());
        for (position, line) in new.line_items.iter().enumerate() {
            let item = InvoiceLineItem::from_line(invoice.id, position as i32, line);
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (
                    id, invoice_id, position, kind, description, metric_type,
                    quantity, unit_price, amount, included_quantity,
                    actual_quantity, overage_quantity
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(item.id)
            .bind(item.invoice_id)
            .bind(item.position)
            .bind(item.kind)
            .bind(&item.description)
            .bind(item.metric_type)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.amount)
            .bind(item.included_quantity)
            .bind(item.actual_quantity)
            .bind(item.overage_quantity)
            .execute(&mut *tx)
            .await?;
            line_items.push(item);
        }

        for application in &new.credit_applications {
            // Guarded decrement: never below zero, never on a credit that
            // stopped being active since it was read.
            let remaining: Option<(Decimal,)> = sqlx::query_as(
                r#"
                UPDATE credits
                SET remaining_amount = remaining_amount - $2,
                    status = CASE WHEN remaining_amount - $2 = 0 THEN 'exhausted' ELSE status END
                WHERE id = $1
                  AND status = 'active'
                  AND remaining_amount >= $2
                RETURNING remaining_amount
                "#,
            )
            .bind(application.credit_id)
            .bind(application.amount)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((remaining,)) = remaining else {
                return Err(BillingError::ConcurrentModification(format!(
                    "credit {} no longer covers {}",
                    application.credit_id, application.amount
                )));
            };

            sqlx::query(
                r#"
                INSERT INTO invoice_credit_applications (id, invoice_id, credit_id, amount, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice.id)
            .bind(application.credit_id)
            .bind(application.amount)
            .bind(new.created_at)
            .execute(&mut *tx)
            .await?;

            let credit_audit = credit_applied_audit(&new, application, remaining + application.amount);
            insert_audit(&mut *tx, &credit_audit).await?;
        }

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;

        Ok(InvoiceWithLines { invoice, line_items })
    }

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<InvoiceWithLines>> {
        let Some(invoice) = sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let line_items = self.line_items(invoice.id).await?;
        Ok(Some(InvoiceWithLines { invoice, line_items }))
    }

    async fn list_invoices(
        &self,
        organization_id: Uuid,
        query: &InvoiceQuery,
    ) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE organization_id = $1
              AND ($2::VARCHAR IS NULL OR status = $2)
              AND ($3::UUID IS NULL OR subscription_id = $3)
            ORDER BY created_at DESC, invoice_number DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(organization_id)
        .bind(query.status)
        .bind(query.subscription_id)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }

    async fn transition_invoice(
        &self,
        transition: InvoiceTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<Invoice>> {
        let mut tx = self.pool.begin().await?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $3,
                updated_at = $4,
                finalized_at = CASE WHEN $3 = 'open' THEN $4 ELSE finalized_at END,
                voided_at = CASE WHEN $3 = 'void' THEN $4 ELSE voided_at END,
                paid_at = CASE WHEN $3 = 'paid' THEN $4 ELSE paid_at END,
                amount_paid = CASE WHEN $3 = 'paid' THEN amount_paid + COALESCE($5, amount_due) ELSE amount_paid END,
                amount_due = CASE WHEN $3 = 'paid' THEN 0 ELSE amount_due END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(transition.invoice_id)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.at)
        .bind(transition.amount_paid)
        .fetch_optional(&mut *tx)
        .await?;

        if invoice.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;

        Ok(invoice)
    }

    async fn insert_payment(&self, payment: Payment, audit: AuditEntry) -> BillingResult<Payment> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                id, invoice_id, organization_id, amount, currency, status,
                payment_method, processor_transaction_id, idempotency_key,
                attempted_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.invoice_id)
        .bind(payment.organization_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.payment_method)
        .bind(&payment.processor_transaction_id)
        .bind(&payment.idempotency_key)
        .bind(payment.attempted_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.constraint() == Some(PENDING_PAYMENT_CONSTRAINT) {
                    return BillingError::PaymentPending(payment.invoice_id);
                }
            }
            BillingError::from(e)
        })?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;

        Ok(inserted)
    }

    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE processor_transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn pending_payment_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE invoice_id = $1 AND status = 'pending'",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn attach_transaction_id(&self, payment_id: Uuid, transaction_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET processor_transaction_id = $2, updated_at = NOW()
            WHERE id = $1
              AND (processor_transaction_id IS NULL OR processor_transaction_id = $2)
            "#,
        )
        .bind(payment_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_payment(
        &self,
        transition: PaymentTransition,
        audit: AuditEntry,
    ) -> BillingResult<Option<AppliedPayment>> {
        let mut tx = self.pool.begin().await?;

        let Some(payment) = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $3,
                updated_at = $4,
                processor_transaction_id = COALESCE(processor_transaction_id, $5),
                failure_code = COALESCE($6, failure_code),
                failure_message = COALESCE($7, failure_message),
                refunded_amount = COALESCE($8, refunded_amount),
                succeeded_at = CASE WHEN $3 = 'succeeded' THEN $4 ELSE succeeded_at END,
                failed_at = CASE WHEN $3 = 'failed' THEN $4 ELSE failed_at END,
                refunded_at = CASE WHEN $3 = 'refunded' THEN $4 ELSE refunded_at END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(transition.payment_id)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.at)
        .bind(&transition.processor_transaction_id)
        .bind(&transition.failure_code)
        .bind(&transition.failure_message)
        .bind(transition.refunded_amount)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let invoice = if transition.to == PaymentStatus::Succeeded {
            let settled = sqlx::query_as::<_, Invoice>(
                r#"
                UPDATE invoices
                SET status = 'paid',
                    paid_at = $2,
                    updated_at = $2,
                    amount_paid = amount_paid + $3,
                    amount_due = 0
                WHERE id = $1 AND status IN ('open', 'uncollectible')
                RETURNING *
                "#,
            )
            .bind(payment.invoice_id)
            .bind(transition.at)
            .bind(payment.amount)
            .fetch_optional(&mut *tx)
            .await?;

            if settled.is_none() {
                tracing::warn!(
                    payment_id = %payment.id,
                    invoice_id = %payment.invoice_id,
                    "Payment succeeded but invoice was not collectible"
                );
            }
            settled
        } else {
            None
        };

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;

        Ok(Some(AppliedPayment { payment, invoice }))
    }

    async fn record_audit(&self, entry: AuditEntry) -> BillingResult<()> {
        insert_audit(&self.pool, &entry).await?;
        Ok(())
    }

    async fn audit_trail(&self, entity_id: Uuid) -> BillingResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT * FROM billing_audit_log
            WHERE entity_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn claim_refund(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        at: OffsetDateTime,
    ) -> BillingResult<RefundClaim> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the payment serializes claims against each other and
        // against the refund transition
        let (status,): (PaymentStatus,) =
            sqlx::query_as("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
                .bind(payment_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(BillingError::PaymentNotFound(payment_id))?;
        if status != PaymentStatus::Succeeded {
            tx.rollback().await?;
            return Ok(RefundClaim::NotRefundable(status));
        }

        let held: Option<(Decimal,)> =
            sqlx::query_as("SELECT amount FROM refund_claims WHERE payment_id = $1")
                .bind(payment_id)
                .fetch_optional(&mut *tx)
                .await?;
        let claim = match held {
            Some((held,)) if held == amount => RefundClaim::Claimed,
            Some((held,)) => RefundClaim::Held { amount: held },
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO refund_claims (payment_id, amount, claimed_at)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(payment_id)
                .bind(amount)
                .bind(at)
                .execute(&mut *tx)
                .await?;
                RefundClaim::Claimed
            }
        };

        tx.commit().await?;
        Ok(claim)
    }

    async fn release_refund(&self, payment_id: Uuid, amount: Decimal) -> BillingResult<()> {
        sqlx::query(
            r#"
            DELETE FROM refund_claims
            WHERE payment_id = $1 AND amount = $2
              AND EXISTS (SELECT 1 FROM payments WHERE id = $1 AND status = 'succeeded')
            "#,
        )
        .bind(payment_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_payment_conflict(
        &self,
        conflict: PaymentConflict,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO payment_conflicts (
                payment_id, invoice_id, organization_id, processor_transaction_id, detected_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(conflict.payment_id)
        .bind(conflict.invoice_id)
        .bind(conflict.organization_id)
        .bind(&conflict.processor_transaction_id)
        .bind(conflict.detected_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn open_payment_conflict(&self, invoice_id: Uuid) -> BillingResult<Option<PaymentConflict>> {
        let conflict = sqlx::query_as::<_, PaymentConflict>(
            r#"
            SELECT * FROM payment_conflicts
            WHERE invoice_id = $1 AND resolved_at IS NULL
            ORDER BY detected_at ASC
            LIMIT 1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conflict)
    }

    async fn resolve_payment_conflict(
        &self,
        payment_id: Uuid,
        resolved_by: Uuid,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<Option<PaymentConflict>> {
        let mut tx = self.pool.begin().await?;

        let Some(conflict) = sqlx::query_as::<_, PaymentConflict>(
            r#"
            UPDATE payment_conflicts
            SET resolved_at = $3, resolved_by = $2
            WHERE payment_id = $1 AND resolved_at IS NULL
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(resolved_by)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(Some(conflict))
    }

    async fn subscriptions_due(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.* FROM subscriptions s
            LEFT JOIN subscription_billing_failures f ON f.subscription_id = s.id
            WHERE s.status IN ('active', 'trialing', 'past_due')
              AND s.current_period_end <= $1
              AND (f.retry_at IS NULL OR f.retry_at <= $2)
            ORDER BY s.current_period_end ASC, s.id ASC
            LIMIT $3
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn record_billing_failure(
        &self,
        subscription_id: Uuid,
        error: &str,
        at: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<BillingFailure> {
        let mut tx = self.pool.begin().await?;

        let (failures,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO subscription_billing_failures (
                subscription_id, failures, last_error, retry_at, updated_at
            )
            VALUES ($1, 1, $2, $3, $3)
            ON CONFLICT (subscription_id) DO UPDATE
            SET failures = subscription_billing_failures.failures + 1,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            RETURNING failures
            "#,
        )
        .bind(subscription_id)
        .bind(error)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        let failure = sqlx::query_as::<_, BillingFailure>(
            r#"
            UPDATE subscription_billing_failures
            SET retry_at = $2
            WHERE subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(at + billing_retry_delay(failures))
        .fetch_one(&mut *tx)
        .await?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(failure)
    }

    async fn advance_subscription_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: OffsetDateTime,
        next_period_end: OffsetDateTime,
        audit: AuditEntry,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_start = current_period_end,
                current_period_end = $3
            WHERE id = $1 AND current_period_end = $2
            "#,
        )
        .bind(subscription_id)
        .bind(expected_period_end)
        .bind(next_period_end)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM subscription_billing_failures WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(true)
    }
}
