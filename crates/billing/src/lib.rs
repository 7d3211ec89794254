// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::PaymentDeclined carries processor messages
#![allow(clippy::too_many_arguments)] // Pricing and proration take the full period context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Meterline Billing Engine
//!
//! Usage-based subscription billing: prices subscription periods, issues
//! invoices and collects payments through the payment processor.
//!
//! ## Components
//!
//! - **Pricing**: pure computation of base, overage, tiered, seat, credit and tax lines
//! - **Invoices**: transactional generation with collision-free numbering, preview, lifecycle
//! - **Payments**: off-session charges, idempotent notification reconciliation, refunds
//! - **Usage / Credits**: replaceable data-access boundaries
//! - **Notifications**: customer emails and domain events, never fatal
//! - **Audit**: append-only trail of every state change

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod invoice;
pub mod models;
pub mod notify;
pub mod payment;
pub mod pricing;
pub mod processor;
pub mod store;
pub mod usage;
pub mod webhooks;

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{BillingConfig, FeatureFlags};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{ActorType, AuditEntry, AuditEntryBuilder, AuditEventType, EntityType};

// Invoices
pub use invoice::{InvoiceService, UpcomingInvoice};

// Models
pub use models::{
    BillingFailure, Credit, Invoice, InvoiceLineItem, InvoiceWithLines, LineItem, Organization,
    Payment, PaymentConflict, PricingTier, RefundClaim, Subscription, SubscriptionPlan,
    UsageSummary,
};

// Notifications
pub use notify::{
    EmailConfig, EventPublisher, HttpEventPublisher, NotificationTemplate, Notifier,
    ResendNotifier, TracingPublisher,
};

// Payments
pub use payment::{NotificationOutcome, PaymentService};

// Pricing
pub use pricing::{calculate_charge, prorate, ChargeBreakdown, PricingContext};

// Processor
pub use processor::{ChargeOutcome, ChargeRequest, PaymentProcessor, StripeProcessor};

// Store
pub use store::{BillingStore, InMemoryStore, InvoiceQuery, PgBillingStore};

// Usage
pub use usage::{InMemoryUsage, PgUsageAggregator, UsageAggregator};

// Webhooks
pub use webhooks::{verify_signature, ProcessorEvent};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub invoices: InvoiceService,
    pub payments: PaymentService,
    pub store: Arc<dyn BillingStore>,
    pub config: BillingConfig,
}

impl BillingService {
    /// Wire the engine from explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageAggregator>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let invoices = InvoiceService::new(
            store.clone(),
            usage,
            notifier.clone(),
            publisher.clone(),
            config.clone(),
        );
        let payments = PaymentService::new(store.clone(), processor, notifier, publisher, config.clone());

        Self {
            invoices,
            payments,
            store,
            config,
        }
    }

    /// Production wiring: Postgres, Stripe, Resend and the event gateway when configured
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let stripe = StripeClient::from_env()?;

        if stripe.config().is_test_mode() {
            tracing::info!("Stripe is in test mode");
        }

        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        let usage: Arc<dyn UsageAggregator> = Arc::new(PgUsageAggregator::new(pool, config.usage_query_timeout));
        let processor: Arc<dyn PaymentProcessor> = Arc::new(StripeProcessor::new(stripe, config.processor_timeout));
        let notifier: Arc<dyn Notifier> = Arc::new(ResendNotifier::new(
            EmailConfig::from_env(),
            config.notification_retry_attempts,
            config.notification_retry_backoff,
        ));
        let publisher: Arc<dyn EventPublisher> = match HttpEventPublisher::from_env(Duration::from_secs(10))? {
            Some(http) => Arc::new(http),
            None => {
                tracing::info!("EVENT_GATEWAY_URL not set, billing events are logged only");
                Arc::new(TracingPublisher)
            }
        };

        Ok(Self::new(config, store, usage, processor, notifier, publisher))
    }
}
