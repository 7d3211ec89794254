//! Usage aggregation
//!
//! One question: how much of each metric did an organization use in
//! `[start, end)`. The invoice service consumes the answer as a
//! [`UsageSummary`] and never touches raw usage records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meterline_shared::MetricType;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::UsageSummary;

#[async_trait]
pub trait UsageAggregator: Send + Sync {
    /// Summed usage per metric for `organization_id` over `[start, end)`
    async fn usage_for_period(
        &self,
        organization_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<UsageSummary>;
}

/// Aggregates the `usage_records` table
#[derive(Clone)]
pub struct PgUsageAggregator {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgUsageAggregator {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }
}

#[async_trait]
impl UsageAggregator for PgUsageAggregator {
    async fn usage_for_period(
        &self,
        organization_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<UsageSummary> {
        if end < start {
            return Err(BillingError::InvalidInput(format!(
                "usage window ends before it starts: {} - {}",
                start, end
            )));
        }

        let mut tx = self.pool.begin().await?;

        // Bound the aggregation; a cancelled statement maps to DependencyUnavailable
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.query_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let rows: Vec<(MetricType, Decimal)> = sqlx::query_as(
            r#"
            SELECT metric_type, COALESCE(SUM(quantity), 0)
            FROM usage_records
            WHERE organization_id = $1
              AND recorded_at >= $2
              AND recorded_at < $3
            GROUP BY metric_type
            "#,
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UsageSummary {
            totals: rows.into_iter().collect(),
        })
    }
}

/// A single usage observation
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub organization_id: Uuid,
    pub metric_type: MetricType,
    pub quantity: Decimal,
    pub recorded_at: OffsetDateTime,
}

/// Usage kept in memory, for tests and local runs
#[derive(Clone, Default)]
pub struct InMemoryUsage {
    records: Arc<RwLock<Vec<UsageRecord>>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(
        &self,
        organization_id: Uuid,
        metric_type: MetricType,
        quantity: Decimal,
        recorded_at: OffsetDateTime,
    ) {
        self.records.write().await.push(UsageRecord {
            organization_id,
            metric_type,
            quantity,
            recorded_at,
        });
    }
}

#[async_trait]
impl UsageAggregator for InMemoryUsage {
    async fn usage_for_period(
        &self,
        organization_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<UsageSummary> {
        let records = self.records.read().await;
        let mut totals: BTreeMap<MetricType, Decimal> = BTreeMap::new();
        for record in records.iter().filter(|r| {
            r.organization_id == organization_id && r.recorded_at >= start && r.recorded_at < end
        }) {
            *totals.entry(record.metric_type).or_insert(Decimal::ZERO) += record.quantity;
        }
        Ok(UsageSummary { totals })
    }
}
