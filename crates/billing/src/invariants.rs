//! Billing invariants
//!
//! Consistency checks run on a priced charge before it is persisted and on a
//! stored invoice after it is read back. Checks only read; a violation means
//! the pricing path produced something it must never produce.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Credit, InvoiceWithLines};
use crate::pricing::ChargeBreakdown;

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Amounts would be charged incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
    pub severity: ViolationSeverity,
}

impl InvariantViolation {
    fn critical(invariant: &'static str, description: String) -> Self {
        Self {
            invariant,
            description,
            severity: ViolationSeverity::Critical,
        }
    }
}

/// Check a charge against the credits it was priced with
pub fn check_breakdown(breakdown: &ChargeBreakdown, credits: &[Credit]) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let expected_total = breakdown.subtotal - breakdown.credits_applied + breakdown.tax_amount;
    if breakdown.total != expected_total {
        violations.push(InvariantViolation::critical(
            "total_identity",
            format!(
                "total {} != subtotal {} - credits {} + tax {}",
                breakdown.total, breakdown.subtotal, breakdown.credits_applied, breakdown.tax_amount
            ),
        ));
    }

    if breakdown.line_item_sum() != breakdown.total {
        violations.push(InvariantViolation::critical(
            "line_item_sum",
            format!(
                "line items sum to {} but total is {}",
                breakdown.line_item_sum(),
                breakdown.total
            ),
        ));
    }

    if breakdown.credits_applied < Decimal::ZERO || breakdown.credits_applied > breakdown.subtotal.max(Decimal::ZERO) {
        violations.push(InvariantViolation::critical(
            "credits_within_subtotal",
            format!(
                "credits applied {} outside [0, {}]",
                breakdown.credits_applied, breakdown.subtotal
            ),
        ));
    }

    let applied: Decimal = breakdown.credit_applications.iter().map(|a| a.amount).sum();
    if applied != breakdown.credits_applied {
        violations.push(InvariantViolation::critical(
            "credit_applications_sum",
            format!(
                "per-credit applications sum to {} but {} was applied",
                applied, breakdown.credits_applied
            ),
        ));
    }

    for application in &breakdown.credit_applications {
        match credits.iter().find(|c| c.id == application.credit_id) {
            Some(credit) if application.amount <= credit.remaining_amount && application.amount > Decimal::ZERO => {}
            Some(credit) => violations.push(InvariantViolation::critical(
                "credit_not_overdrawn",
                format!(
                    "credit {} has {} remaining but {} was drawn",
                    credit.id, credit.remaining_amount, application.amount
                ),
            )),
            None => violations.push(InvariantViolation::critical(
                "credit_known",
                format!("credit {} was not offered to pricing", application.credit_id),
            )),
        }
    }

    if breakdown.tax_amount < Decimal::ZERO || breakdown.total < Decimal::ZERO {
        violations.push(InvariantViolation::critical(
            "non_negative",
            format!(
                "tax {} and total {} must not be negative",
                breakdown.tax_amount, breakdown.total
            ),
        ));
    }

    violations
}

/// Check a stored invoice against its own line items
pub fn check_invoice(stored: &InvoiceWithLines) -> Vec<InvariantViolation> {
    let invoice = &stored.invoice;
    let mut violations = Vec::new();

    if invoice.total != invoice.subtotal - invoice.credits_applied + invoice.tax_amount {
        violations.push(InvariantViolation::critical(
            "total_identity",
            format!("invoice {} total {} does not match its components", invoice.id, invoice.total),
        ));
    }

    let line_sum: Decimal = stored.line_items.iter().map(|l| l.amount).sum();
    if line_sum != invoice.total {
        violations.push(InvariantViolation::critical(
            "line_item_sum",
            format!("invoice {} lines sum to {} but total is {}", invoice.id, line_sum, invoice.total),
        ));
    }

    if invoice.amount_paid + invoice.amount_due < invoice.total {
        violations.push(InvariantViolation {
            invariant: "settlement",
            description: format!(
                "invoice {} paid {} + due {} < total {}",
                invoice.id, invoice.amount_paid, invoice.amount_due, invoice.total
            ),
            severity: ViolationSeverity::High,
        });
    }

    violations
}

/// Fail with `Internal` when any violation was found
pub fn ensure(entity_id: Uuid, violations: Vec<InvariantViolation>) -> BillingResult<()> {
    if violations.is_empty() {
        return Ok(());
    }
    for violation in &violations {
        tracing::error!(
            entity_id = %entity_id,
            invariant = violation.invariant,
            severity = %violation.severity,
            description = %violation.description,
            "Billing invariant violated"
        );
    }
    Err(BillingError::Internal(format!(
        "{} billing invariant(s) violated for {}",
        violations.len(),
        entity_id
    )))
}
