//! Common types used across Meterline

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::error::DomainError;

// =============================================================================
// Organization / Subscription
// =============================================================================

/// Soft lifecycle status of a billing account. Organizations are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    Suspended,
    Closed,
}

impl Default for OrganizationStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Incomplete
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
        }
    }

    /// Whether a period of this subscription produces an invoice
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "incomplete" => Ok(Self::Incomplete),
            _ => Err(DomainError::Parse {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}

/// Recurring billing interval of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Quarterly,
    Annual,
}

impl BillingInterval {
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Annual => 12,
        }
    }

    /// End of the period starting at `from`.
    /// Day-of-month is clamped, so Jan 31 + 1 month lands on the last day of February.
    pub fn advance(&self, from: OffsetDateTime) -> Result<OffsetDateTime, DomainError> {
        add_months(from, self.months())
    }
}

fn add_months(from: OffsetDateTime, months: u32) -> Result<OffsetDateTime, DomainError> {
    let date = from.date();
    let zero_based = i32::from(u8::from(date.month())) - 1 + months as i32;
    let year = date.year() + zero_based.div_euclid(12);
    let month_number = (zero_based.rem_euclid(12) + 1) as u8;
    let month = Month::try_from(month_number).map_err(|e| DomainError::Date(e.to_string()))?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let next = Date::from_calendar_date(year, month, day).map_err(|e| DomainError::Date(e.to_string()))?;
    Ok(from.replace_date(next))
}

// =============================================================================
// Metering
// =============================================================================

/// Metered pricing dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ApiCalls,
    StorageGb,
    TransferGb,
}

impl MetricType {
    /// All metered dimensions, in line-item order
    pub const ALL: [MetricType; 3] = [Self::ApiCalls, Self::StorageGb, Self::TransferGb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiCalls => "api_calls",
            Self::StorageGb => "storage_gb",
            Self::TransferGb => "transfer_gb",
        }
    }

    /// Human readable label used in line item descriptions
    pub fn label(&self) -> &'static str {
        match self {
            Self::ApiCalls => "API calls",
            Self::StorageGb => "Storage (GB)",
            Self::TransferGb => "Data transfer (GB)",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api_calls" => Ok(Self::ApiCalls),
            "storage_gb" | "storage" => Ok(Self::StorageGb),
            "transfer_gb" | "transfer" => Ok(Self::TransferGb),
            _ => Err(DomainError::Parse {
                kind: "metric type",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Credits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Active,
    Exhausted,
    Expired,
    Voided,
}

impl std::fmt::Display for CreditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Expired => write!(f, "expired"),
            Self::Voided => write!(f, "voided"),
        }
    }
}

// =============================================================================
// Invoices
// =============================================================================

/// Invoice status
/// Lattice: draft → {open, void}; open → {paid, void, uncollectible};
/// uncollectible → {paid, void}. Paid and void are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl Default for InvoiceStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
        }
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Open)
                | (Draft, Void)
                | (Open, Paid)
                | (Open, Void)
                | (Open, Uncollectible)
                | (Uncollectible, Paid)
                | (Uncollectible, Void)
        )
    }

    /// Validate a transition against the lattice
    pub fn transition(self, next: InvoiceStatus) -> Result<InvoiceStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "invoice",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Whether a payment may still be collected against the invoice
    pub fn is_collectible(&self) -> bool {
        matches!(self, Self::Open | Self::Uncollectible)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "open" => Ok(Self::Open),
            "paid" => Ok(Self::Paid),
            "void" => Ok(Self::Void),
            "uncollectible" => Ok(Self::Uncollectible),
            _ => Err(DomainError::Parse {
                kind: "invoice status",
                value: s.to_string(),
            }),
        }
    }
}

/// Kind of priced component on an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Base,
    Usage,
    Seats,
    Proration,
    Credit,
    Tax,
}

// =============================================================================
// Payments
// =============================================================================

/// Payment status
///
/// The only valid transitions are pending → succeeded, pending → failed and
/// succeeded → refunded. `Canceled` is accepted from storage but never entered
/// by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    Canceled,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Canceled => "canceled",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Succeeded) | (Pending, Failed) | (Succeeded, Refunded)
        )
    }

    pub fn transition(self, next: PaymentStatus) -> Result<PaymentStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "payment",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Whether this status has already been reached by way of `target`,
    /// i.e. an outcome notification for `target` is a duplicate.
    /// A refunded payment has necessarily succeeded before.
    pub fn has_reached(&self, target: PaymentStatus) -> bool {
        *self == target || (target == Self::Succeeded && *self == Self::Refunded)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(DomainError::Parse {
                kind: "payment status",
                value: s.to_string(),
            }),
        }
    }
}
