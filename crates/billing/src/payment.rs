//! Payment service
//!
//! Collects invoices off-session through the payment processor and reconciles
//! the processor's asynchronous notifications.
//!
//! The synchronous charge response and the notification for the same payment
//! race each other. Both funnel into a compare-and-set on the payment status,
//! so whichever arrives first performs the transition and the other observes
//! the result. Only the winner notifies the customer and publishes events.

use std::sync::Arc;

use meterline_shared::{from_minor_units, InvoiceStatus, PaymentStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, AuditEntryBuilder, AuditEventType, EntityType};
use crate::models::{AppliedPayment, Payment, PaymentConflict, PaymentTransition, RefundClaim};
use crate::notify::{self, topics, EventPublisher, NotificationTemplate, Notifier};
use crate::processor::{ChargeOutcome, ChargeRequest, PaymentProcessor, RefundRequest};
use crate::store::BillingStore;
use crate::webhooks::{NotificationKind, ProviderNotification};

/// What a processor notification did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotificationOutcome {
    /// The notification moved the payment to `status`
    Applied { payment_id: Uuid, status: PaymentStatus },
    /// The payment had already reached the reported state
    Duplicate { payment_id: Uuid },
    /// Acknowledged without effect
    Ignored { reason: String },
}

pub struct PaymentService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn EventPublisher>,
    config: BillingConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn EventPublisher>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
            publisher,
            config,
        }
    }

    /// Charge an open invoice against the organization's stored payment method.
    ///
    /// Returns the payment as it stands after the synchronous response:
    /// `succeeded`, or `pending` when the outcome arrives by notification.
    /// A decline is recorded as `failed` and returned as `PaymentDeclined`.
    pub async fn charge_invoice(&self, invoice_id: Uuid) -> BillingResult<Payment> {
        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?
            .invoice;

        match invoice.status {
            InvoiceStatus::Paid => return Err(BillingError::AlreadyPaid(invoice.id)),
            InvoiceStatus::Draft => {
                return Err(BillingError::InvalidInput(format!(
                    "invoice {} must be finalized before it can be charged",
                    invoice.id
                )))
            }
            InvoiceStatus::Void => {
                return Err(BillingError::InvalidTransition(format!(
                    "invoice {} is void and can not be charged",
                    invoice.id
                )))
            }
            InvoiceStatus::Open | InvoiceStatus::Uncollectible => {}
        }
        if invoice.amount_due <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "invoice {} has nothing due",
                invoice.id
            )));
        }
        if let Some(conflict) = self.store.open_payment_conflict(invoice.id).await? {
            tracing::warn!(
                invoice_id = %invoice.id,
                payment_id = %conflict.payment_id,
                "Refusing to charge invoice with unreconciled captured funds"
            );
            return Err(BillingError::PaymentConflict {
                invoice_id: invoice.id,
                payment_id: conflict.payment_id,
            });
        }

        let organization = self
            .store
            .organization(invoice.organization_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound(invoice.organization_id))?;
        let customer_ref = organization.processor_customer_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "organization {} has no processor customer",
                organization.id
            ))
        })?;
        let payment_method_ref = organization.default_payment_method.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "organization {} has no stored payment method",
                organization.id
            ))
        })?;

        let payment = match self.store.pending_payment_for_invoice(invoice.id).await? {
            // A previous attempt never got an answer; retry with its idempotency key
            Some(pending) if pending.processor_transaction_id.is_none() => {
                tracing::info!(
                    payment_id = %pending.id,
                    invoice_id = %invoice.id,
                    "Retrying unanswered charge attempt"
                );
                pending
            }
            Some(pending) => {
                tracing::warn!(
                    payment_id = %pending.id,
                    invoice_id = %invoice.id,
                    "Charge already awaiting processor outcome"
                );
                return Err(BillingError::PaymentPending(invoice.id));
            }
            None => {
                let now = OffsetDateTime::now_utc();
                let payment = Payment::pending(&invoice, Some(payment_method_ref.clone()), now);
                let audit = AuditEntryBuilder::new(
                    payment.organization_id,
                    EntityType::Payment,
                    payment.id,
                    AuditEventType::PaymentCreated,
                )
                .field("invoice_id", invoice.id)
                .field("amount", payment.amount)
                .field("currency", &payment.currency)
                .build(now);
                self.store.insert_payment(payment, audit).await?
            }
        };

        let request = ChargeRequest {
            payment_id: payment.id,
            invoice_id: invoice.id,
            customer_ref,
            payment_method_ref,
            amount: payment.amount,
            currency: payment.currency.clone(),
            idempotency_key: payment.idempotency_key.clone(),
        };

        let outcome = match self.processor.charge_off_session(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Payment stays pending without a transaction; the next attempt reuses it
                tracing::error!(
                    payment_id = %payment.id,
                    invoice_id = %invoice.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Charge request failed"
                );
                return Err(e);
            }
        };

        if let Some(transaction_id) = outcome.transaction_id() {
            if !self.store.attach_transaction_id(payment.id, transaction_id).await? {
                tracing::warn!(
                    payment_id = %payment.id,
                    transaction_id = %transaction_id,
                    "Payment already carries a different processor transaction"
                );
            }
        }

        match outcome {
            ChargeOutcome::Succeeded { transaction_id } => {
                let transition = PaymentTransition::new(
                    payment.id,
                    PaymentStatus::Pending,
                    PaymentStatus::Succeeded,
                    OffsetDateTime::now_utc(),
                )
                .transaction(Some(transaction_id.clone()));
                match self.apply(&payment, transition, ActorType::System, Some(&transaction_id)).await? {
                    Some(applied) => Ok(applied.payment),
                    None => self.reload(payment.id).await,
                }
            }
            ChargeOutcome::RequiresAction { transaction_id } | ChargeOutcome::Processing { transaction_id } => {
                tracing::info!(
                    payment_id = %payment.id,
                    transaction_id = %transaction_id,
                    "Charge awaiting asynchronous outcome"
                );
                self.reload(payment.id).await
            }
            ChargeOutcome::Declined {
                transaction_id,
                code,
                message,
            } => {
                let transition = PaymentTransition::new(
                    payment.id,
                    PaymentStatus::Pending,
                    PaymentStatus::Failed,
                    OffsetDateTime::now_utc(),
                )
                .transaction(transaction_id.clone())
                .failure(code.clone(), message.clone());
                let applied = self
                    .apply(&payment, transition, ActorType::System, transaction_id.as_deref())
                    .await?;

                if applied.is_none() {
                    let current = self.reload(payment.id).await?;
                    if current.status.has_reached(PaymentStatus::Succeeded) {
                        return Ok(current);
                    }
                }

                tracing::warn!(
                    payment_id = %payment.id,
                    invoice_id = %invoice.id,
                    code = %code,
                    "Charge declined"
                );
                Err(BillingError::PaymentDeclined {
                    payment_id: Some(payment.id),
                    code,
                    message,
                })
            }
        }
    }

    /// Reconcile a processor notification. Safe to call any number of times
    /// with the same notification.
    pub async fn handle_provider_notification(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<NotificationOutcome> {
        let notification = ProviderNotification::parse(event_type, payload)?;

        let target = match &notification.kind {
            NotificationKind::PaymentSucceeded => PaymentStatus::Succeeded,
            NotificationKind::PaymentFailed | NotificationKind::PaymentCanceled => PaymentStatus::Failed,
            NotificationKind::Refunded => PaymentStatus::Refunded,
            NotificationKind::Unsupported(kind) => {
                tracing::debug!(event_type = %kind, "Unhandled processor notification");
                return Ok(NotificationOutcome::Ignored {
                    reason: format!("unsupported event type {}", kind),
                });
            }
        };

        let Some(payment) = self.locate_payment(&notification).await? else {
            tracing::warn!(
                event_type = %event_type,
                transaction_id = ?notification.transaction_id,
                payment_id = ?notification.payment_id,
                "Notification for unknown payment, acknowledging without effect"
            );
            return Ok(NotificationOutcome::Ignored {
                reason: "unknown transaction".to_string(),
            });
        };

        if payment.status.has_reached(target) {
            tracing::debug!(
                payment_id = %payment.id,
                status = %payment.status,
                "Duplicate processor notification"
            );
            return Ok(NotificationOutcome::Duplicate { payment_id: payment.id });
        }

        if payment.status == PaymentStatus::Failed && target == PaymentStatus::Succeeded {
            return self
                .flag_capture_conflict(&payment, event_type, notification.transaction_id.clone())
                .await;
        }

        if !payment.status.can_transition_to(target) {
            tracing::warn!(
                payment_id = %payment.id,
                from = %payment.status,
                to = %target,
                event_type = %event_type,
                "Notification contradicts recorded payment outcome, ignoring"
            );
            let now = OffsetDateTime::now_utc();
            let mut audit = AuditEntryBuilder::new(
                payment.organization_id,
                EntityType::Payment,
                payment.id,
                AuditEventType::PaymentNotificationIgnored,
            )
            .field("event_type", event_type)
            .field("status", payment.status)
            .field("reported", target)
            .actor_type(ActorType::Processor);
            if let Some(transaction_id) = &notification.transaction_id {
                audit = audit.processor_reference(transaction_id.clone());
            }
            self.store.record_audit(audit.build(now)).await?;
            return Ok(NotificationOutcome::Ignored {
                reason: format!("payment is {}, notification reports {}", payment.status, target),
            });
        }

        let mut transition = PaymentTransition::new(payment.id, payment.status, target, OffsetDateTime::now_utc())
            .transaction(notification.transaction_id.clone());
        if target == PaymentStatus::Failed {
            transition = transition.failure(
                notification.failure_code.clone().unwrap_or_else(|| "payment_failed".to_string()),
                notification
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| "The payment could not be completed".to_string()),
            );
        }
        if target == PaymentStatus::Refunded {
            let refunded = notification
                .amount_refunded
                .map(|minor| from_minor_units(minor, &payment.currency))
                .unwrap_or(payment.amount);
            transition = transition.refunded(refunded.min(payment.amount));
        }

        match self
            .apply(&payment, transition, ActorType::Processor, notification.transaction_id.as_deref())
            .await?
        {
            Some(applied) => Ok(NotificationOutcome::Applied {
                payment_id: applied.payment.id,
                status: applied.payment.status,
            }),
            None => {
                // Lost the race to the synchronous path or a parallel delivery
                let current = self.reload(payment.id).await?;
                if current.status.has_reached(target) {
                    Ok(NotificationOutcome::Duplicate { payment_id: current.id })
                } else {
                    Ok(NotificationOutcome::Ignored {
                        reason: format!("payment moved to {} concurrently", current.status),
                    })
                }
            }
        }
    }

    /// Refund a succeeded payment, in full when `amount` is `None`.
    ///
    /// A payment is refunded at most once. The refund is claimed in the store
    /// before the processor is called, so a concurrent refund of a different
    /// amount fails with `RefundInProgress` instead of reaching the processor.
    pub async fn refund_payment(&self, payment_id: Uuid, amount: Option<Decimal>) -> BillingResult<Payment> {
        let payment = self.reload(payment_id).await?;
        payment.status.transition(PaymentStatus::Refunded)?;

        let amount = amount.unwrap_or(payment.amount);
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }
        if amount > payment.amount {
            return Err(BillingError::InvalidAmount(format!(
                "refund {} {} exceeds payment amount {} {}",
                amount, payment.currency, payment.amount, payment.currency
            )));
        }
        let transaction_id = payment.processor_transaction_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!("payment {} has no processor transaction", payment.id))
        })?;

        match self
            .store
            .claim_refund(payment.id, amount, OffsetDateTime::now_utc())
            .await?
        {
            RefundClaim::Claimed => {}
            RefundClaim::Held { amount: held } => {
                tracing::warn!(
                    payment_id = %payment.id,
                    requested = %amount,
                    held = %held,
                    "Refund already in progress"
                );
                return Err(BillingError::RefundInProgress(payment.id));
            }
            RefundClaim::NotRefundable(status) => {
                // Moved since it was loaded
                status.transition(PaymentStatus::Refunded)?;
                return Err(BillingError::ConcurrentModification(format!(
                    "payment {} changed while claiming its refund",
                    payment.id
                )));
            }
        }

        let request = RefundRequest {
            payment_id: payment.id,
            transaction_id,
            amount,
            currency: payment.currency.clone(),
            idempotency_key: format!("refund-{}", payment.id),
        };
        let receipt = match self.processor.refund(request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // An unanswered call keeps the claim; a retry reuses the idempotency key
                if !e.is_retryable() {
                    if let Err(release) = self.store.release_refund(payment.id, amount).await {
                        tracing::warn!(
                            payment_id = %payment.id,
                            error = %release,
                            "Could not release refund claim"
                        );
                    }
                }
                tracing::error!(
                    payment_id = %payment.id,
                    amount = %amount,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Refund request failed"
                );
                return Err(e);
            }
        };

        let transition = PaymentTransition::new(
            payment.id,
            PaymentStatus::Succeeded,
            PaymentStatus::Refunded,
            OffsetDateTime::now_utc(),
        )
        .refunded(amount);

        match self
            .apply(&payment, transition, ActorType::Admin, Some(&receipt.refund_id))
            .await?
        {
            Some(applied) => Ok(applied.payment),
            // The refund notification for this same claim got there first
            None => self.reload(payment.id).await,
        }
    }

    /// Close a capture conflict once the captured funds were reconciled by
    /// hand, allowing the invoice to be charged again
    pub async fn resolve_payment_conflict(
        &self,
        payment_id: Uuid,
        resolved_by: Uuid,
    ) -> BillingResult<PaymentConflict> {
        let payment = self.reload(payment_id).await?;
        let now = OffsetDateTime::now_utc();
        let audit = AuditEntryBuilder::new(
            payment.organization_id,
            EntityType::Payment,
            payment.id,
            AuditEventType::PaymentConflictResolved,
        )
        .field("invoice_id", payment.invoice_id)
        .actor(resolved_by, ActorType::Admin)
        .build(now);

        let conflict = self
            .store
            .resolve_payment_conflict(payment.id, resolved_by, now, audit)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("open payment conflict for payment {}", payment.id))
            })?;

        tracing::info!(
            payment_id = %conflict.payment_id,
            invoice_id = %conflict.invoice_id,
            resolved_by = %resolved_by,
            "Payment conflict resolved"
        );
        Ok(conflict)
    }

    /// The processor captured funds on a payment recorded as failed. The
    /// invoice is blocked from further charges and an alert is published once.
    async fn flag_capture_conflict(
        &self,
        payment: &Payment,
        event_type: &str,
        transaction_id: Option<String>,
    ) -> BillingResult<NotificationOutcome> {
        let now = OffsetDateTime::now_utc();
        let conflict = PaymentConflict::detected(payment, transaction_id, now);

        let mut audit = AuditEntryBuilder::new(
            payment.organization_id,
            EntityType::Payment,
            payment.id,
            AuditEventType::PaymentConflictDetected,
        )
        .field("event_type", event_type)
        .field("invoice_id", payment.invoice_id)
        .field("status", payment.status)
        .field("reported", PaymentStatus::Succeeded)
        .actor_type(ActorType::Processor);
        if let Some(reference) = &conflict.processor_transaction_id {
            audit = audit.processor_reference(reference.clone());
        }

        let data = serde_json::json!({
            "payment_id": payment.id,
            "invoice_id": payment.invoice_id,
            "organization_id": payment.organization_id,
            "processor_transaction_id": conflict.processor_transaction_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "failure_code": payment.failure_code,
        });

        if self.store.record_payment_conflict(conflict, audit.build(now)).await? {
            tracing::error!(
                payment_id = %payment.id,
                invoice_id = %payment.invoice_id,
                "Processor captured funds on a payment recorded as failed"
            );
            notify::publish_quietly(
                self.publisher.as_ref(),
                topics::PAYMENT_CONFLICT,
                &payment.id.to_string(),
                data,
            )
            .await;
        } else {
            tracing::debug!(payment_id = %payment.id, "Payment conflict already recorded");
        }

        Ok(NotificationOutcome::Ignored {
            reason: "captured after recorded failure, held for reconciliation".to_string(),
        })
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.reload(payment_id).await
    }

    async fn reload(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.store
            .payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))
    }

    /// By processor transaction id, falling back to the payment id echoed in
    /// metadata when the notification overtook the synchronous response
    async fn locate_payment(&self, notification: &ProviderNotification) -> BillingResult<Option<Payment>> {
        if let Some(transaction_id) = &notification.transaction_id {
            if let Some(payment) = self.store.payment_by_transaction(transaction_id).await? {
                return Ok(Some(payment));
            }
        }

        let Some(payment_id) = notification.payment_id else {
            return Ok(None);
        };
        let Some(payment) = self.store.payment(payment_id).await? else {
            return Ok(None);
        };
        if let Some(transaction_id) = &notification.transaction_id {
            if !self.store.attach_transaction_id(payment.id, transaction_id).await? {
                tracing::warn!(
                    payment_id = %payment.id,
                    transaction_id = %transaction_id,
                    "Notification transaction does not match payment"
                );
                return Ok(None);
            }
        }
        Ok(Some(payment))
    }

    /// Compare-and-set the payment, then notify when this call won.
    /// `None` means another writer moved the payment first.
    async fn apply(
        &self,
        payment: &Payment,
        transition: PaymentTransition,
        actor: ActorType,
        reference: Option<&str>,
    ) -> BillingResult<Option<AppliedPayment>> {
        transition.from.transition(transition.to)?;

        let event = match transition.to {
            PaymentStatus::Succeeded => AuditEventType::PaymentSucceeded,
            PaymentStatus::Failed => AuditEventType::PaymentFailed,
            PaymentStatus::Refunded => AuditEventType::PaymentRefunded,
            PaymentStatus::Pending | PaymentStatus::Canceled => {
                return Err(BillingError::InvalidTransition(format!(
                    "payment {} can not move to {}",
                    payment.id, transition.to
                )))
            }
        };

        let mut audit = AuditEntryBuilder::new(payment.organization_id, EntityType::Payment, payment.id, event)
            .change("status", transition.from, transition.to)
            .actor_type(actor);
        if let Some(code) = &transition.failure_code {
            audit = audit.field("failure_code", code);
        }
        if let Some(refunded) = transition.refunded_amount {
            audit = audit.field("refunded_amount", refunded);
        }
        if let Some(reference) = reference {
            audit = audit.processor_reference(reference);
        }
        let audit = audit.build(transition.at);

        let Some(applied) = self.store.transition_payment(transition, audit).await? else {
            tracing::info!(payment_id = %payment.id, "Payment already transitioned elsewhere");
            return Ok(None);
        };

        tracing::info!(
            payment_id = %applied.payment.id,
            invoice_id = %applied.payment.invoice_id,
            status = %applied.payment.status,
            invoice_settled = applied.invoice.is_some(),
            "Payment status changed"
        );

        self.after_transition(&applied).await;
        Ok(Some(applied))
    }

    async fn after_transition(&self, applied: &AppliedPayment) {
        let payment = &applied.payment;
        let (template, topic) = match payment.status {
            PaymentStatus::Succeeded => (NotificationTemplate::PaymentSucceeded, topics::PAYMENT_SUCCEEDED),
            PaymentStatus::Failed => (NotificationTemplate::PaymentFailed, topics::PAYMENT_FAILED),
            PaymentStatus::Refunded => (NotificationTemplate::PaymentRefunded, topics::PAYMENT_REFUNDED),
            PaymentStatus::Pending | PaymentStatus::Canceled => return,
        };

        let invoice_number = match &applied.invoice {
            Some(invoice) => Some(invoice.invoice_number.clone()),
            None => match self.store.invoice(payment.invoice_id).await {
                Ok(found) => found.map(|i| i.invoice.invoice_number),
                Err(e) => {
                    tracing::warn!(payment_id = %payment.id, error = %e, "Could not load invoice for notification");
                    None
                }
            },
        };

        let amount = match payment.status {
            PaymentStatus::Refunded => payment.refunded_amount.unwrap_or(payment.amount),
            _ => payment.amount,
        };
        let data = serde_json::json!({
            "payment_id": payment.id,
            "invoice_id": payment.invoice_id,
            "invoice_number": invoice_number,
            "organization_id": payment.organization_id,
            "status": payment.status,
            "amount": amount,
            "currency": payment.currency,
            "failure_code": payment.failure_code,
            "failure_message": payment.failure_message,
        });

        match self.store.organization(payment.organization_id).await {
            Ok(Some(organization)) => {
                notify::notify_quietly(
                    self.notifier.as_ref(),
                    template,
                    &organization.billing_email,
                    data.clone(),
                )
                .await;
            }
            Ok(None) => {
                tracing::warn!(organization_id = %payment.organization_id, "No organization to notify");
            }
            Err(e) => {
                tracing::warn!(
                    organization_id = %payment.organization_id,
                    error = %e,
                    "Could not load organization to notify"
                );
            }
        }

        notify::publish_quietly(self.publisher.as_ref(), topic, &payment.id.to_string(), data).await;
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }
}
