//! Billing audit trail
//!
//! Append-only record of every state-changing billing operation. Entries are
//! written through the store, inside the same transaction as the change when
//! the change is transactional (invoice creation, payment transitions).
//!
//! Each entry carries:
//! - the entity it concerns (invoice, payment, subscription, credit)
//! - the event type and the actor that triggered it
//! - a structured diff (`{"status": {"from": "open", "to": "paid"}}` and similar)

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Types of audited billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Invoices
    InvoiceCreated,
    InvoiceFinalized,
    InvoicePaid,
    InvoiceVoided,
    InvoiceUncollectible,

    // Credits
    CreditApplied,

    // Payments
    PaymentCreated,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    PaymentNotificationIgnored,
    PaymentConflictDetected,
    PaymentConflictResolved,

    // Subscriptions
    SubscriptionRenewed,
    SubscriptionBillingFailed,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::InvoiceCreated => "INVOICE_CREATED",
            AuditEventType::InvoiceFinalized => "INVOICE_FINALIZED",
            AuditEventType::InvoicePaid => "INVOICE_PAID",
            AuditEventType::InvoiceVoided => "INVOICE_VOIDED",
            AuditEventType::InvoiceUncollectible => "INVOICE_UNCOLLECTIBLE",
            AuditEventType::CreditApplied => "CREDIT_APPLIED",
            AuditEventType::PaymentCreated => "PAYMENT_CREATED",
            AuditEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            AuditEventType::PaymentFailed => "PAYMENT_FAILED",
            AuditEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            AuditEventType::PaymentNotificationIgnored => "PAYMENT_NOTIFICATION_IGNORED",
            AuditEventType::PaymentConflictDetected => "PAYMENT_CONFLICT_DETECTED",
            AuditEventType::PaymentConflictResolved => "PAYMENT_CONFLICT_RESOLVED",
            AuditEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            AuditEventType::SubscriptionBillingFailed => "SUBSCRIPTION_BILLING_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Kind of record an audit entry concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Invoice,
    Payment,
    Subscription,
    Credit,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Invoice => write!(f, "invoice"),
            EntityType::Payment => write!(f, "payment"),
            EntityType::Subscription => write!(f, "subscription"),
            EntityType::Credit => write!(f, "credit"),
        }
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through UI
    User,
    /// Admin user
    Admin,
    /// Scheduled jobs and internal automation
    System,
    /// Payment processor callback
    Processor,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Processor => write!(f, "processor"),
        }
    }
}

/// A persisted audit entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<Uuid>,
    /// Processor event or transaction the change originated from
    pub processor_reference: Option<String>,
    pub diff: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    organization_id: Uuid,
    entity_type: EntityType,
    entity_id: Uuid,
    event_type: AuditEventType,
    actor_type: ActorType,
    actor_id: Option<Uuid>,
    processor_reference: Option<String>,
    diff: serde_json::Map<String, serde_json::Value>,
}

impl AuditEntryBuilder {
    pub fn new(
        organization_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
        event_type: AuditEventType,
    ) -> Self {
        Self {
            organization_id,
            entity_type,
            entity_id,
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            processor_reference: None,
            diff: serde_json::Map::new(),
        }
    }

    /// Record a field change as `{"from": .., "to": ..}`
    pub fn change(mut self, field: &str, from: impl Serialize, to: impl Serialize) -> Self {
        self.diff.insert(
            field.to_string(),
            serde_json::json!({
                "from": serde_json::to_value(from).unwrap_or(serde_json::Value::Null),
                "to": serde_json::to_value(to).unwrap_or(serde_json::Value::Null),
            }),
        );
        self
    }

    /// Record a field value without a previous state
    pub fn field(mut self, field: &str, value: impl Serialize) -> Self {
        self.diff.insert(
            field.to_string(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn processor_reference(mut self, reference: impl Into<String>) -> Self {
        self.processor_reference = Some(reference.into());
        self
    }

    pub fn build(self, at: OffsetDateTime) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            entity_type: self.entity_type.to_string(),
            entity_id: self.entity_id,
            event_type: self.event_type.to_string(),
            actor_type: self.actor_type.to_string(),
            actor_id: self.actor_id,
            processor_reference: self.processor_reference,
            diff: serde_json::Value::Object(self.diff),
            created_at: at,
        }
    }
}
