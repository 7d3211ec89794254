//! Charging, processor notification reconciliation and refunds

use meterline_billing::{
    BillingError, BillingStore, ChargeOutcome, ErrorKind, NotificationOutcome, NotificationTemplate,
};
use meterline_shared::{InvoiceStatus, PaymentStatus};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use crate::common::{event, failed, plan, succeeded, Harness, Scripted};

// ============================================================================
// Synchronous charges
// ============================================================================

#[tokio::test]
async fn test_synchronous_success_settles_invoice() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::Succeeded {
        transaction_id: "pi_sync".to_string(),
    }));

    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.amount, dec!(110.00));
    assert_eq!(payment.processor_transaction_id.as_deref(), Some("pi_sync"));

    let settled = h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice;
    assert_eq!(settled.status, InvoiceStatus::Paid);
    assert_eq!(settled.amount_paid, dec!(110.00));
    assert_eq!(settled.amount_due, dec!(0));

    assert_eq!(h.notifier.count(NotificationTemplate::PaymentSucceeded), 1);
    assert_eq!(h.publisher.count("billing.payment.succeeded"), 1);

    let charges = h.processor.charges();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].customer_ref, "cus_test_acme");
    assert_eq!(charges[0].payment_method_ref, "pm_card_visa");
    assert_eq!(charges[0].idempotency_key, payment.idempotency_key);
}

#[tokio::test]
async fn test_charging_paid_invoice_is_rejected() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let err = h.billing.payments.charge_invoice(invoice.id).await.unwrap_err();

    assert!(matches!(err, BillingError::AlreadyPaid(id) if id == invoice.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.processor.charges().len(), 1);
}

#[tokio::test]
async fn test_draft_invoice_can_not_be_charged() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let draft = h
        .billing
        .invoices
        .generate_invoice(seeded.subscription_id)
        .await
        .unwrap()
        .invoice;

    let err = h.billing.payments.charge_invoice(draft.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.processor.charges().is_empty());
}

#[tokio::test]
async fn test_decline_records_failure_and_notifies_reason() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::Declined {
        transaction_id: Some("pi_declined".to_string()),
        code: "insufficient_funds".to_string(),
        message: "Your card has insufficient funds.".to_string(),
    }));

    let err = h.billing.payments.charge_invoice(invoice.id).await.unwrap_err();

    let payment_id = match err {
        BillingError::PaymentDeclined {
            payment_id: Some(payment_id),
            ref code,
            ref message,
        } => {
            assert_eq!(code, "insufficient_funds");
            assert_eq!(message, "Your card has insufficient funds.");
            payment_id
        }
        other => panic!("expected decline, got {:?}", other),
    };

    let payment = h.billing.payments.get_payment(payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("insufficient_funds"));
    assert!(payment.failed_at.is_some());

    let invoice = h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Open);

    assert_eq!(h.notifier.count(NotificationTemplate::PaymentSucceeded), 0);
    let failures: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|(t, _, _)| *t == NotificationTemplate::PaymentFailed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].2["failure_message"], "Your card has insufficient funds.");
}

#[tokio::test]
async fn test_invoice_can_be_charged_again_after_decline() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::Declined {
        transaction_id: None,
        code: "card_declined".to_string(),
        message: "Your card was declined.".to_string(),
    }));

    assert!(h.billing.payments.charge_invoice(invoice.id).await.is_err());
    let retry = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    assert_eq!(retry.status, PaymentStatus::Succeeded);
    let payments = h.store.payments_for_invoice(invoice.id).await;
    assert_eq!(payments.len(), 2);
    assert_ne!(payments[0].idempotency_key, payments[1].idempotency_key);
}

#[tokio::test]
async fn test_timeout_retry_reuses_pending_payment() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Timeout);

    let err = h.billing.payments.charge_invoice(invoice.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnavailable);

    let pending = h.store.payments_for_invoice(invoice.id).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PaymentStatus::Pending);

    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    assert_eq!(payment.id, pending[0].id);
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    let charges = h.processor.charges();
    assert_eq!(charges.len(), 2);
    assert_eq!(charges[0].idempotency_key, charges[1].idempotency_key);
    assert_eq!(h.store.payments_for_invoice(invoice.id).await.len(), 1);
}

#[tokio::test]
async fn test_second_charge_while_awaiting_outcome_is_rejected() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::RequiresAction {
        transaction_id: "pi_3ds".to_string(),
    }));
    h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let err = h.billing.payments.charge_invoice(invoice.id).await.unwrap_err();

    assert!(matches!(err, BillingError::PaymentPending(id) if id == invoice.id));
    assert_eq!(h.processor.charges().len(), 1);
}

// ============================================================================
// Notification reconciliation
// ============================================================================

#[tokio::test]
async fn test_requires_action_then_redelivered_success() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::RequiresAction {
        transaction_id: "pi_async".to_string(),
    }));

    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.processor_transaction_id.as_deref(), Some("pi_async"));
    assert_eq!(
        h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice.status,
        InvoiceStatus::Open
    );

    let notification = succeeded("pi_async", None);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(
            h.billing
                .payments
                .handle_provider_notification("payment_intent.succeeded", &notification)
                .await
                .unwrap(),
        );
    }

    assert_eq!(
        outcomes[0],
        NotificationOutcome::Applied {
            payment_id: payment.id,
            status: PaymentStatus::Succeeded
        }
    );
    assert_eq!(outcomes[1], NotificationOutcome::Duplicate { payment_id: payment.id });
    assert_eq!(outcomes[2], NotificationOutcome::Duplicate { payment_id: payment.id });

    let payment = h.billing.payments.get_payment(payment.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    let invoice = h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.amount_paid, dec!(110.00));

    assert_eq!(h.notifier.count(NotificationTemplate::PaymentSucceeded), 1);
    assert_eq!(h.publisher.count("billing.payment.succeeded"), 1);

    let transitions = h
        .store
        .audit_trail(payment.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "PAYMENT_SUCCEEDED")
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn test_notification_after_synchronous_success_is_duplicate() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::Succeeded {
        transaction_id: "pi_both".to_string(),
    }));

    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    let outcome = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_both", Some(payment.id)))
        .await
        .unwrap();

    assert_eq!(outcome, NotificationOutcome::Duplicate { payment_id: payment.id });
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentSucceeded), 1);
}

#[tokio::test]
async fn test_concurrent_redeliveries_apply_once() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::Processing {
        transaction_id: "pi_race".to_string(),
    }));
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let billing = h.billing.clone();
            tokio::spawn(async move {
                billing
                    .payments
                    .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_race", None))
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            NotificationOutcome::Applied { .. } => applied += 1,
            NotificationOutcome::Duplicate { payment_id } => assert_eq!(payment_id, payment.id),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentSucceeded), 1);
}

#[tokio::test]
async fn test_notification_before_transaction_attached_uses_metadata() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Timeout);
    assert!(h.billing.payments.charge_invoice(invoice.id).await.is_err());
    let pending = h.store.payments_for_invoice(invoice.id).await.remove(0);
    assert!(pending.processor_transaction_id.is_none());

    let outcome = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_late", Some(pending.id)))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        NotificationOutcome::Applied {
            payment_id: pending.id,
            status: PaymentStatus::Succeeded
        }
    );
    let payment = h.billing.payments.get_payment(pending.id).await.unwrap();
    assert_eq!(payment.processor_transaction_id.as_deref(), Some("pi_late"));
    assert_eq!(
        h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice.status,
        InvoiceStatus::Paid
    );
}

#[tokio::test]
async fn test_failure_notification_records_reason() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::RequiresAction {
        transaction_id: "pi_fail".to_string(),
    }));
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let notification = failed("pi_fail", "expired_card", "Your card has expired.");
    let first = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.payment_failed", &notification)
        .await
        .unwrap();
    let second = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.payment_failed", &notification)
        .await
        .unwrap();

    assert!(matches!(first, NotificationOutcome::Applied { status: PaymentStatus::Failed, .. }));
    assert_eq!(second, NotificationOutcome::Duplicate { payment_id: payment.id });

    let payment = h.billing.payments.get_payment(payment.id).await.unwrap();
    assert_eq!(payment.failure_code.as_deref(), Some("expired_card"));
    assert_eq!(payment.failure_message.as_deref(), Some("Your card has expired."));
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentFailed), 1);
}

/// Declined synchronously as `pi_flip`; returns the failed payment id
async fn declined_charge(h: &Harness, invoice_id: Uuid) -> Uuid {
    h.processor.push(Scripted::Outcome(ChargeOutcome::Declined {
        transaction_id: Some("pi_flip".to_string()),
        code: "do_not_honor".to_string(),
        message: "Your card was declined.".to_string(),
    }));
    let err = h.billing.payments.charge_invoice(invoice_id).await.unwrap_err();
    let BillingError::PaymentDeclined { payment_id: Some(payment_id), .. } = err else {
        panic!("expected decline");
    };
    payment_id
}

#[tokio::test]
async fn test_success_after_recorded_failure_flags_conflict_once() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment_id = declined_charge(&h, invoice.id).await;

    for _ in 0..2 {
        let outcome = h
            .billing
            .payments
            .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_flip", None))
            .await
            .unwrap();
        assert!(matches!(outcome, NotificationOutcome::Ignored { .. }));
    }

    let payment = h.billing.payments.get_payment(payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        h.billing.invoices.get_invoice(invoice.id).await.unwrap().invoice.status,
        InvoiceStatus::Open
    );

    // Redelivery neither alerts nor audits twice
    assert_eq!(h.publisher.count("billing.payment.conflict"), 1);
    let detected = h
        .store
        .audit_trail(payment_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "PAYMENT_CONFLICT_DETECTED")
        .collect::<Vec<_>>();
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].processor_reference.as_deref(), Some("pi_flip"));
    assert_eq!(detected[0].actor_type, "processor");
}

#[tokio::test]
async fn test_invoice_with_captured_funds_is_not_charged_again() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment_id = declined_charge(&h, invoice.id).await;
    h.billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_flip", None))
        .await
        .unwrap();

    let err = h.billing.payments.charge_invoice(invoice.id).await.unwrap_err();

    assert!(matches!(
        err,
        BillingError::PaymentConflict { invoice_id, payment_id: flagged }
            if invoice_id == invoice.id && flagged == payment_id
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(!err.is_retryable());
    assert_eq!(h.processor.charges().len(), 1);
    assert_eq!(h.store.payments_for_invoice(invoice.id).await.len(), 1);
}

#[tokio::test]
async fn test_resolved_conflict_allows_charging_again() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment_id = declined_charge(&h, invoice.id).await;
    h.billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_flip", None))
        .await
        .unwrap();
    let admin = Uuid::new_v4();

    let conflict = h.billing.payments.resolve_payment_conflict(payment_id, admin).await.unwrap();
    assert_eq!(conflict.invoice_id, invoice.id);
    assert_eq!(conflict.resolved_by, Some(admin));
    assert!(conflict.resolved_at.is_some());

    let err = h
        .billing
        .payments
        .resolve_payment_conflict(payment_id, admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(h.processor.charges().len(), 2);

    let resolved = h
        .store
        .audit_trail(payment_id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "PAYMENT_CONFLICT_RESOLVED")
        .unwrap();
    assert_eq!(resolved.actor_id, Some(admin));
}

#[tokio::test]
async fn test_refund_after_failure_is_still_ignored() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment_id = declined_charge(&h, invoice.id).await;

    let outcome = h
        .billing
        .payments
        .handle_provider_notification(
            "charge.refunded",
            &event(
                "charge.refunded",
                json!({"id": "ch_flip", "payment_intent": "pi_flip", "amount_refunded": 11000}),
            ),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, NotificationOutcome::Ignored { .. }));
    assert_eq!(h.publisher.count("billing.payment.conflict"), 0);
    let ignored = h
        .store
        .audit_trail(payment_id)
        .await
        .unwrap()
        .into_iter()
        .any(|e| e.event_type == "PAYMENT_NOTIFICATION_IGNORED");
    assert!(ignored);
    h.billing.payments.charge_invoice(invoice.id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_transaction_is_acknowledged() {
    let h = Harness::new();

    let outcome = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_nobody", Some(Uuid::new_v4())))
        .await
        .unwrap();

    assert!(matches!(outcome, NotificationOutcome::Ignored { .. }));
    assert!(h.store.audit_entries().await.is_empty());
}

#[tokio::test]
async fn test_unsupported_event_type_is_ignored() {
    let h = Harness::new();
    let outcome = h
        .billing
        .payments
        .handle_provider_notification("customer.updated", &event("customer.updated", json!({"id": "cus_1"})))
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Ignored { .. }));
}

// ============================================================================
// Refunds
// ============================================================================

#[tokio::test]
async fn test_refund_validates_amount_and_state() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let err = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(110.01)))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount(_)));

    let err = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(0)))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount(_)));
    assert!(h.processor.refunds().is_empty());

    let refunded = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(40.00)))
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(refunded.refunded_amount, Some(dec!(40.00)));
    assert!(refunded.refunded_at.is_some());
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentRefunded), 1);

    let refunds = h.processor.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].transaction_id, "pi_auto_1");
    assert_eq!(refunds[0].amount, dec!(40.00));

    let err = h.billing.payments.refund_payment(payment.id, None).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_refund_requires_succeeded_payment() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    h.processor.push(Scripted::Outcome(ChargeOutcome::RequiresAction {
        transaction_id: "pi_pending".to_string(),
    }));
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let err = h.billing.payments.refund_payment(payment.id, None).await.unwrap_err();

    assert_eq!(err.to_string(), "Invalid payment status transition: pending -> refunded");
    assert!(h.processor.refunds().is_empty());
}

#[tokio::test]
async fn test_refund_notification_after_refund_is_duplicate() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    h.billing.payments.refund_payment(payment.id, None).await.unwrap();

    let outcome = h
        .billing
        .payments
        .handle_provider_notification(
            "charge.refunded",
            &event(
                "charge.refunded",
                json!({"id": "ch_1", "payment_intent": "pi_auto_1", "amount_refunded": 11000}),
            ),
        )
        .await
        .unwrap();

    assert_eq!(outcome, NotificationOutcome::Duplicate { payment_id: payment.id });
    // A late success for a refunded payment is a duplicate too
    let outcome = h
        .billing
        .payments
        .handle_provider_notification("payment_intent.succeeded", &succeeded("pi_auto_1", None))
        .await
        .unwrap();
    assert_eq!(outcome, NotificationOutcome::Duplicate { payment_id: payment.id });
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentRefunded), 1);
}

#[tokio::test]
async fn test_overlapping_refunds_reach_processor_once() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();

    let (full, partial) = tokio::join!(
        h.billing.payments.refund_payment(payment.id, Some(dec!(100.00))),
        h.billing.payments.refund_payment(payment.id, Some(dec!(90.00))),
    );

    let (refunded, rejected) = match (full, partial) {
        (Ok(refunded), Err(rejected)) | (Err(rejected), Ok(refunded)) => (refunded, rejected),
        other => panic!("expected exactly one refund to succeed, got {:?}", other),
    };
    assert_eq!(rejected.kind(), ErrorKind::Conflict);

    let refunds = h.processor.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].idempotency_key, format!("refund-{}", payment.id));
    assert_eq!(refunded.refunded_amount, Some(refunds[0].amount));

    let stored = h.billing.payments.get_payment(payment.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Refunded);
    assert_eq!(stored.refunded_amount, Some(refunds[0].amount));
    assert_eq!(h.notifier.count(NotificationTemplate::PaymentRefunded), 1);
}

#[tokio::test]
async fn test_unanswered_refund_keeps_claim_for_retry() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    h.processor
        .fail_next_refund(BillingError::dependency("payment_processor", "refund timed out"));

    let err = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(40.00)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // The processor may have applied the first call; a different amount must wait
    let err = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(50.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::RefundInProgress(id) if id == payment.id));

    let refunded = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(40.00)))
        .await
        .unwrap();
    assert_eq!(refunded.refunded_amount, Some(dec!(40.00)));

    let refunds = h.processor.refunds();
    assert_eq!(refunds.len(), 2);
    assert_eq!(refunds[0].idempotency_key, refunds[1].idempotency_key);
    assert!(refunds.iter().all(|r| r.amount == dec!(40.00)));
}

#[tokio::test]
async fn test_rejected_refund_releases_claim() {
    let h = Harness::new();
    let seeded = h.seed(plan(dec!(100.00)), 1).await;
    let invoice = h.open_invoice(seeded).await;
    let payment = h.billing.payments.charge_invoice(invoice.id).await.unwrap();
    h.processor
        .fail_next_refund(BillingError::StripeApi("HTTP 400: charge already disputed".to_string()));

    let err = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(40.00)))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let refunded = h
        .billing
        .payments
        .refund_payment(payment.id, Some(dec!(30.00)))
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(refunded.refunded_amount, Some(dec!(30.00)));
}
