//! Provider notification queue
//!
//! Verified processor events are persisted before they are acknowledged and
//! applied later by the worker, so a crash between receipt and reconciliation
//! never loses a payment outcome. Rows are claimed with `FOR UPDATE SKIP
//! LOCKED`, which lets several workers drain the queue side by side.

use std::time::Duration;

use meterline_billing::{
    verify_signature, BillingError, BillingService, ErrorKind, NotificationOutcome, ProcessorEvent,
    StripeConfig,
};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::WorkerResult;

/// Time a claimed row stays invisible to other workers
const CLAIM_LEASE: Duration = Duration::from_secs(300);
const BASE_RETRY_DELAY_SECS: u64 = 30;
const MAX_RETRY_DELAY_SECS: u64 = 3600;

/// Verify a raw webhook delivery and queue it for processing.
/// Returns false when the event was already queued.
pub async fn receive_webhook(
    pool: &PgPool,
    raw_body: &str,
    signature_header: &str,
    stripe: &StripeConfig,
) -> WorkerResult<bool> {
    verify_signature(
        raw_body,
        signature_header,
        &stripe.webhook_secret,
        stripe.webhook_tolerance_secs,
        OffsetDateTime::now_utc(),
    )?;

    let event = ProcessorEvent::parse(raw_body)?;
    let payload: Value =
        serde_json::from_str(raw_body).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

    enqueue_notification(pool, &event, &payload).await
}

/// Persist an event. Redeliveries of the same processor event id are dropped.
pub async fn enqueue_notification(pool: &PgPool, event: &ProcessorEvent, payload: &Value) -> WorkerResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO provider_notification_queue (id, processor_event_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT ON CONSTRAINT provider_notification_queue_event_key DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&event.id)
    .bind(&event.event_type)
    .bind(payload)
    .execute(pool)
    .await?;

    let queued = result.rows_affected() > 0;
    if queued {
        info!(event_id = %event.id, event_type = %event.event_type, "Processor event queued");
    } else {
        debug!(event_id = %event.id, "Processor event already queued");
    }
    Ok(queued)
}

/// Claimed queue row
#[derive(Debug, sqlx::FromRow)]
struct QueuedNotification {
    id: Uuid,
    processor_event_id: String,
    event_type: String,
    payload: Value,
    attempts: i32,
    max_attempts: i32,
}

/// Counts of one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// What to do with a row after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Completed,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

fn disposition(result: Result<NotificationOutcome, BillingError>, attempts: i32, max_attempts: i32) -> Disposition {
    match result {
        Ok(_) => Disposition::Completed,
        // Malformed events never become valid
        Err(e) if e.kind() == ErrorKind::Validation => Disposition::Failed { error: e.to_string() },
        Err(e) if attempts >= max_attempts => Disposition::Failed { error: e.to_string() },
        Err(e) => Disposition::Retry {
            delay: retry_delay(attempts),
            error: e.to_string(),
        },
    }
}

/// Exponential backoff after `attempts` failed tries, capped at one hour
fn retry_delay(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = BASE_RETRY_DELAY_SECS.saturating_mul(2u64.pow(exponent));
    Duration::from_secs(secs.min(MAX_RETRY_DELAY_SECS))
}

/// Claim up to `batch_size` due rows and reconcile them
pub async fn process_notification_queue(pool: &PgPool, billing: &BillingService, batch_size: i64) -> DrainReport {
    let claimed: Vec<QueuedNotification> = match sqlx::query_as(
        r#"
        UPDATE provider_notification_queue
        SET status = 'processing',
            attempts = attempts + 1,
            next_attempt_at = NOW() + make_interval(secs => $2)
        WHERE id IN (
            SELECT id FROM provider_notification_queue
            WHERE status IN ('pending', 'processing')
              AND next_attempt_at <= NOW()
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, processor_event_id, event_type, payload, attempts, max_attempts
        "#,
    )
    .bind(batch_size)
    .bind(CLAIM_LEASE.as_secs() as f64)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to claim processor notifications");
            return DrainReport::default();
        }
    };

    if claimed.is_empty() {
        return DrainReport::default();
    }

    info!(count = claimed.len(), "Processing processor notifications");

    let mut report = DrainReport::default();
    for row in claimed {
        let result = billing
            .payments
            .handle_provider_notification(&row.event_type, &row.payload)
            .await;

        if let Ok(outcome) = &result {
            debug!(event_id = %row.processor_event_id, outcome = ?outcome, "Notification reconciled");
        }

        let settled = match disposition(result, row.attempts, row.max_attempts) {
            Disposition::Completed => {
                report.completed += 1;
                sqlx::query(
                    r#"
                    UPDATE provider_notification_queue
                    SET status = 'completed', processed_at = NOW(), last_error = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .execute(pool)
                .await
            }
            Disposition::Retry { delay, error } => {
                report.retrying += 1;
                warn!(
                    event_id = %row.processor_event_id,
                    event_type = %row.event_type,
                    attempts = row.attempts,
                    max_attempts = row.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Notification processing failed, will retry"
                );
                sqlx::query(
                    r#"
                    UPDATE provider_notification_queue
                    SET status = 'pending', last_error = $2,
                        next_attempt_at = NOW() + make_interval(secs => $3)
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .bind(&error)
                .bind(delay.as_secs() as f64)
                .execute(pool)
                .await
            }
            Disposition::Failed { error } => {
                report.failed += 1;
                error!(
                    event_id = %row.processor_event_id,
                    event_type = %row.event_type,
                    attempts = row.attempts,
                    error = %error,
                    "Notification permanently failed"
                );
                sqlx::query(
                    r#"
                    UPDATE provider_notification_queue
                    SET status = 'failed', last_error = $2, processed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .bind(&error)
                .execute(pool)
                .await
            }
        };

        if let Err(e) = settled {
            // The lease expires and the row is picked up again
            error!(queue_id = %row.id, error = %e, "Failed to update notification queue row");
        }
    }

    report
}

/// Delete settled rows older than `retention_days`
pub async fn cleanup_old_notifications(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM provider_notification_queue
        WHERE processed_at < NOW() - make_interval(days => $1)
          AND status IN ('completed', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old notification queue entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up notification queue");
        }
    }
}
