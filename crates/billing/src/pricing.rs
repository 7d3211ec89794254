//! Pricing engine
//!
//! Pure computation from (subscription, plan, usage, credits) to an itemized
//! charge. Nothing in this module performs I/O; the invoice service feeds it
//! data loaded inside its transaction and persists the result.
//!
//! Order of components on the breakdown:
//! 1. Base charge (always present)
//! 2. One usage line per metric with a positive overage
//! 3. Add-on seats
//! 4. A single negative credit line for the total applied
//! 5. Tax
//!
//! Every component is rounded to the currency's minor unit exactly once.

use std::cmp::Ordering;

use meterline_shared::{round_money, LineItemKind, MetricType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::FeatureFlags;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Credit, CreditApplication, LineItem, PricingTier, Subscription, SubscriptionPlan, UsageSummary,
};

/// Inputs that are not part of the priced records
#[derive(Debug, Clone)]
pub struct PricingContext {
    /// Instant credits are evaluated against
    pub as_of: OffsetDateTime,
    pub currency: String,
    pub tax_rate: Decimal,
    pub features: FeatureFlags,
}

/// Itemized charge for one subscription period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeBreakdown {
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub credits_applied: Decimal,
    /// Per-credit amounts, in the order they were drawn
    pub credit_applications: Vec<CreditApplication>,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl ChargeBreakdown {
    /// Sum of all line items, credit and tax lines included
    pub fn line_item_sum(&self) -> Decimal {
        self.line_items.iter().map(|l| l.amount).sum()
    }
}

/// Compute the itemized charge for a subscription period.
///
/// Fails only with `InvalidInput` for inconsistent input such as a negative
/// seat quantity, negative usage or overlapping tiers.
pub fn calculate_charge(
    subscription: &Subscription,
    plan: &SubscriptionPlan,
    tiers: &[PricingTier],
    usage: &UsageSummary,
    credits: &[Credit],
    ctx: &PricingContext,
) -> BillingResult<ChargeBreakdown> {
    validate_inputs(subscription, plan, usage, ctx)?;

    let currency = ctx.currency.as_str();
    let quantity = Decimal::from(subscription.quantity);
    let mut line_items = Vec::new();

    let unit_price = subscription.custom_price.unwrap_or(plan.base_price);
    let base_amount = round_money(unit_price * quantity, currency);
    line_items.push(LineItem {
        kind: LineItemKind::Base,
        description: format!("{} (v{})", plan.name, plan.version),
        metric_type: None,
        quantity,
        unit_price,
        amount: base_amount,
        included_quantity: None,
        actual_quantity: None,
        overage_quantity: None,
    });

    if ctx.features.usage_metering {
        for metric in MetricType::ALL {
            if let Some(line) = usage_line(metric, plan, tiers, usage, ctx)? {
                line_items.push(line);
            }
        }
    }

    let extra_seats = subscription.quantity - plan.included_seats;
    if extra_seats > 0 {
        let seats = Decimal::from(extra_seats);
        line_items.push(LineItem {
            kind: LineItemKind::Seats,
            description: format!("Additional seats ({})", extra_seats),
            metric_type: None,
            quantity: seats,
            unit_price: plan.price_per_additional_seat,
            amount: round_money(seats * plan.price_per_additional_seat, currency),
            included_quantity: Some(Decimal::from(plan.included_seats)),
            actual_quantity: Some(quantity),
            overage_quantity: Some(seats),
        });
    }

    let subtotal: Decimal = line_items.iter().map(|l| l.amount).sum();

    let credit_applications = if ctx.features.credits {
        apply_credits(credits, subtotal, ctx.as_of, currency)
    } else {
        Vec::new()
    };
    let credits_applied: Decimal = credit_applications.iter().map(|a| a.amount).sum();
    if credits_applied > Decimal::ZERO {
        let mut line = LineItem::flat(
            LineItemKind::Credit,
            format!("Credits applied ({})", credit_applications.len()),
            -credits_applied,
        );
        line.quantity = Decimal::from(credit_applications.len() as u64);
        line.unit_price = Decimal::ZERO;
        line_items.push(line);
    }

    let taxable = (subtotal - credits_applied).max(Decimal::ZERO);
    let tax_amount = round_money(taxable * ctx.tax_rate, currency);
    if !tax_amount.is_zero() {
        let mut line = LineItem::flat(
            LineItemKind::Tax,
            format!("Tax ({}%)", (ctx.tax_rate * Decimal::ONE_HUNDRED).normalize()),
            tax_amount,
        );
        line.quantity = taxable;
        line.unit_price = ctx.tax_rate;
        line_items.push(line);
    }

    let total = subtotal - credits_applied + tax_amount;

    Ok(ChargeBreakdown {
        currency: currency.to_string(),
        line_items,
        subtotal,
        credits_applied,
        credit_applications,
        tax_amount,
        total,
    })
}

fn validate_inputs(
    subscription: &Subscription,
    plan: &SubscriptionPlan,
    usage: &UsageSummary,
    ctx: &PricingContext,
) -> BillingResult<()> {
    if subscription.quantity < 0 {
        return Err(BillingError::InvalidInput(format!(
            "subscription {} has negative quantity {}",
            subscription.id, subscription.quantity
        )));
    }
    if plan.base_price < Decimal::ZERO || subscription.custom_price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(BillingError::InvalidInput("base price must not be negative".to_string()));
    }
    if plan.included_seats < 0 || plan.price_per_additional_seat < Decimal::ZERO {
        return Err(BillingError::InvalidInput(format!(
            "plan {} has an invalid seat configuration",
            plan.id
        )));
    }
    for metric in MetricType::ALL {
        if plan.included(metric) < Decimal::ZERO || plan.unit_price(metric) < Decimal::ZERO {
            return Err(BillingError::InvalidInput(format!(
                "plan {} has a negative allowance or price for {}",
                plan.id, metric
            )));
        }
    }
    if let Some((metric, quantity)) = usage.totals.iter().find(|(_, q)| **q < Decimal::ZERO) {
        return Err(BillingError::InvalidInput(format!(
            "negative usage {} for {}",
            quantity, metric
        )));
    }
    if ctx.tax_rate < Decimal::ZERO {
        return Err(BillingError::InvalidInput(format!("negative tax rate {}", ctx.tax_rate)));
    }
    Ok(())
}

fn usage_line(
    metric: MetricType,
    plan: &SubscriptionPlan,
    tiers: &[PricingTier],
    usage: &UsageSummary,
    ctx: &PricingContext,
) -> BillingResult<Option<LineItem>> {
    let actual = usage.get(metric);
    let included = plan.included(metric);
    let overage = actual - included;
    if overage <= Decimal::ZERO {
        return Ok(None);
    }

    let metric_tiers: Vec<&PricingTier> = tiers.iter().filter(|t| t.metric_type == metric).collect();

    let (amount, unit_price, description) = if ctx.features.tiered_pricing && !metric_tiers.is_empty() {
        let raw = tiered_charge(overage, metric_tiers)?;
        let amount = round_money(raw, &ctx.currency);
        // Effective per-unit rate across the bands used
        let effective = (raw / overage).round_dp(8).normalize();
        (amount, effective, format!("{} overage (tiered)", metric.label()))
    } else {
        let unit_price = plan.unit_price(metric);
        let amount = round_money(overage * unit_price, &ctx.currency);
        (amount, unit_price, format!("{} overage", metric.label()))
    };

    Ok(Some(LineItem {
        kind: LineItemKind::Usage,
        description,
        metric_type: Some(metric),
        quantity: overage,
        unit_price,
        amount,
        included_quantity: Some(included),
        actual_quantity: Some(actual),
        overage_quantity: Some(overage),
    }))
}

/// Unrounded charge for `quantity` units across the tiers of one metric.
///
/// Tiers are sorted by `tier_start` here, so the result does not depend on the
/// order they were loaded in. A tier's flat fee is only charged when the tier
/// is reached.
pub fn tiered_charge(quantity: Decimal, mut tiers: Vec<&PricingTier>) -> BillingResult<Decimal> {
    if quantity < Decimal::ZERO {
        return Err(BillingError::InvalidInput(format!("negative quantity {}", quantity)));
    }

    tiers.sort_by(|a, b| {
        a.tier_start
            .cmp(&b.tier_start)
            .then_with(|| match (a.tier_end, b.tier_end) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
    validate_tiers(&tiers)?;

    let mut remaining = quantity;
    let mut charge = Decimal::ZERO;
    for tier in tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let tier_usage = match tier.tier_end {
            Some(end) => remaining.min(end - tier.tier_start),
            None => remaining,
        };
        charge += tier_usage * tier.unit_price + tier.flat_fee;
        remaining -= tier_usage;
    }

    Ok(charge)
}

fn validate_tiers(sorted: &[&PricingTier]) -> BillingResult<()> {
    let mut previous_end: Option<Decimal> = None;
    for (i, tier) in sorted.iter().enumerate() {
        if tier.tier_start < Decimal::ZERO || tier.unit_price < Decimal::ZERO || tier.flat_fee < Decimal::ZERO {
            return Err(BillingError::InvalidInput(format!(
                "pricing tier {} has negative bounds or prices",
                tier.id
            )));
        }
        if let Some(end) = tier.tier_end {
            if end <= tier.tier_start {
                return Err(BillingError::InvalidInput(format!(
                    "pricing tier {} ends before it starts",
                    tier.id
                )));
            }
        } else if i + 1 != sorted.len() {
            return Err(BillingError::InvalidInput(format!(
                "unbounded pricing tier {} must be the last tier for {}",
                tier.id, tier.metric_type
            )));
        }
        if let Some(prev) = previous_end {
            if tier.tier_start < prev {
                return Err(BillingError::InvalidInput(format!(
                    "pricing tier {} overlaps the previous tier for {}",
                    tier.id, tier.metric_type
                )));
            }
        }
        previous_end = tier.tier_end;
    }
    Ok(())
}

/// Draw down credits oldest-valid-first against `chargeable`.
///
/// Unusable credits (inactive, not yet valid, expired, empty, other currency)
/// are skipped. The result never exceeds `chargeable` in total and never
/// exceeds any single credit's remaining amount.
pub fn apply_credits(
    credits: &[Credit],
    chargeable: Decimal,
    as_of: OffsetDateTime,
    currency: &str,
) -> Vec<CreditApplication> {
    let mut usable: Vec<&Credit> = credits
        .iter()
        .filter(|c| c.is_usable_at(as_of) && c.currency.eq_ignore_ascii_case(currency))
        .collect();
    usable.sort_by(|a, b| {
        a.valid_from
            .cmp(&b.valid_from)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    usable
        .into_iter()
        .scan(chargeable.max(Decimal::ZERO), |left, credit| {
            if *left <= Decimal::ZERO {
                return None;
            }
            let applied = round_money(credit.remaining_amount.min(*left), currency)
                .min(credit.remaining_amount)
                .min(*left);
            *left -= applied;
            Some(CreditApplication {
                credit_id: credit.id,
                amount: applied,
            })
        })
        .filter(|a| a.amount > Decimal::ZERO)
        .collect()
}

/// Adjustment for changing price mid-period:
/// `(new − old) × seconds_remaining / seconds_in_period`, rounded once.
///
/// Zero when proration is disabled or the period has no duration. `at` outside
/// the period is clamped to it.
pub fn prorate(
    old_price: Decimal,
    new_price: Decimal,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    at: OffsetDateTime,
    currency: &str,
    enabled: bool,
) -> Decimal {
    let period_seconds = (period_end - period_start).whole_seconds();
    if !enabled || period_seconds <= 0 {
        return Decimal::ZERO;
    }
    let remaining_seconds = (period_end - at).whole_seconds().clamp(0, period_seconds);

    let raw = (new_price - old_price) * Decimal::from(remaining_seconds) / Decimal::from(period_seconds);
    round_money(raw, currency)
}
