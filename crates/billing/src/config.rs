//! Billing engine configuration
//!
//! Read from environment variables. Unset or unparsable values fall back to
//! the defaults below so a bare environment yields a working engine.

use std::str::FromStr;
use std::time::Duration;

use meterline_shared::normalize_currency;
use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

/// Feature toggles for optional billing behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Charge finalized invoices automatically for organizations with auto-pay
    pub auto_payment: bool,
    /// Include metered usage on invoices
    pub usage_metering: bool,
    /// Price metrics with pricing tiers; otherwise flat overage only
    pub tiered_pricing: bool,
    /// Bill in the organization's currency instead of the default currency
    pub multi_currency: bool,
    /// Apply credits to invoices
    pub credits: bool,
    pub proration: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_payment: true,
            usage_metering: true,
            tiered_pricing: true,
            multi_currency: false,
            credits: true,
            proration: true,
        }
    }
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            auto_payment: env_flag("FEATURE_AUTO_PAYMENT", defaults.auto_payment),
            usage_metering: env_flag("FEATURE_USAGE_METERING", defaults.usage_metering),
            tiered_pricing: env_flag("FEATURE_TIERED_PRICING", defaults.tiered_pricing),
            multi_currency: env_flag("FEATURE_MULTI_CURRENCY", defaults.multi_currency),
            credits: env_flag("FEATURE_CREDITS", defaults.credits),
            proration: env_flag("FEATURE_PRORATION", defaults.proration),
        }
    }
}

/// Configuration for invoice generation and payment collection
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Days between invoice issue and due date
    pub due_days: i64,
    /// Prefix for invoice numbers (`{prefix}-{year}-{sequence}`)
    pub invoice_number_prefix: String,
    /// Tax rate applied to the post-credit amount, e.g. 0.10
    pub default_tax_rate: Decimal,
    /// ISO 4217 code used when multi-currency billing is disabled
    pub default_currency: String,
    /// Grace period after a period ends during which late usage may still arrive.
    /// Periods are only billed by the scheduler once this has elapsed.
    pub usage_settlement_grace: Duration,
    pub features: FeatureFlags,
    pub notification_retry_attempts: usize,
    pub notification_retry_backoff: Duration,
    /// Bound on full retries of invoice generation after a number collision
    pub invoice_generation_max_attempts: u32,
    pub processor_timeout: Duration,
    pub usage_query_timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            due_days: 30,
            invoice_number_prefix: "INV".to_string(),
            default_tax_rate: Decimal::ZERO,
            default_currency: "USD".to_string(),
            usage_settlement_grace: Duration::from_secs(3600),
            features: FeatureFlags::default(),
            notification_retry_attempts: 3,
            notification_retry_backoff: Duration::from_millis(500),
            invoice_generation_max_attempts: 3,
            processor_timeout: Duration::from_secs(30),
            usage_query_timeout: Duration::from_millis(10_000),
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let default_tax_rate = match std::env::var("DEFAULT_TAX_RATE") {
            Ok(raw) => Decimal::from_str(raw.trim()).map_err(|e| {
                BillingError::Config(format!("DEFAULT_TAX_RATE is not a decimal: {}", e))
            })?,
            Err(_) => defaults.default_tax_rate,
        };

        let default_currency = match std::env::var("DEFAULT_CURRENCY") {
            Ok(raw) => currency_setting(&raw)?,
            Err(_) => defaults.default_currency,
        };

        let config = Self {
            due_days: env_parse("BILLING_DUE_DAYS", defaults.due_days),
            invoice_number_prefix: std::env::var("INVOICE_NUMBER_PREFIX")
                .unwrap_or(defaults.invoice_number_prefix),
            default_tax_rate,
            default_currency,
            usage_settlement_grace: Duration::from_secs(env_parse(
                "USAGE_SETTLEMENT_GRACE_SECS",
                defaults.usage_settlement_grace.as_secs(),
            )),
            features: FeatureFlags::from_env(),
            notification_retry_attempts: env_parse(
                "NOTIFICATION_RETRY_ATTEMPTS",
                defaults.notification_retry_attempts,
            ),
            notification_retry_backoff: Duration::from_millis(env_parse(
                "NOTIFICATION_RETRY_BACKOFF_MS",
                defaults.notification_retry_backoff.as_millis() as u64,
            )),
            invoice_generation_max_attempts: env_parse(
                "INVOICE_GENERATION_MAX_ATTEMPTS",
                defaults.invoice_generation_max_attempts,
            ),
            processor_timeout: Duration::from_secs(env_parse(
                "PROCESSOR_TIMEOUT_SECS",
                defaults.processor_timeout.as_secs(),
            )),
            usage_query_timeout: Duration::from_millis(env_parse(
                "USAGE_QUERY_TIMEOUT_MS",
                defaults.usage_query_timeout.as_millis() as u64,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> BillingResult<()> {
        if self.default_tax_rate < Decimal::ZERO || self.default_tax_rate > Decimal::ONE {
            return Err(BillingError::Config(format!(
                "DEFAULT_TAX_RATE must be between 0 and 1, got {}",
                self.default_tax_rate
            )));
        }
        if self.due_days < 0 {
            return Err(BillingError::Config("BILLING_DUE_DAYS must not be negative".to_string()));
        }
        if self.invoice_number_prefix.trim().is_empty() {
            return Err(BillingError::Config("INVOICE_NUMBER_PREFIX must not be empty".to_string()));
        }
        if currency_setting(&self.default_currency)? != self.default_currency {
            return Err(BillingError::Config(format!(
                "DEFAULT_CURRENCY must be upper-case, got {}",
                self.default_currency
            )));
        }
        if self.invoice_generation_max_attempts == 0 {
            return Err(BillingError::Config(
                "INVOICE_GENERATION_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Currency an organization is billed in under the current feature set
    pub fn billing_currency<'a>(&'a self, organization_currency: &'a str) -> &'a str {
        if self.features.multi_currency {
            organization_currency
        } else {
            &self.default_currency
        }
    }
}

fn currency_setting(raw: &str) -> BillingResult<String> {
    normalize_currency(raw).map_err(|e| BillingError::Config(format!("DEFAULT_CURRENCY: {}", e)))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
