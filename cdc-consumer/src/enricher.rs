use async_trait::async_trait;
use clap::ValueEnum;
use diesel::sql_types::BigInt;
use diesel::OptionalExtension;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::models::enriched_transaction_query;
use shared::{EnrichedRecord, TransactionFields};
use thiserror::Error;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("transaction {0} not found in system of record")]
    NotFound(i64),
    #[error("system-of-record connection failure: {0}")]
    ConnectionFailure(String),
    #[error("enrichment query failed: {0}")]
    QueryFailure(String),
}

impl EnrichError {
    pub fn kind(&self) -> &'static str {
        match self {
            EnrichError::NotFound(_) => "enrichment_miss",
            EnrichError::ConnectionFailure(_) => "connection_failure",
            EnrichError::QueryFailure(_) => "query_failure",
        }
    }
}

/// Resolves a changed transaction id into its denormalized projection.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, id: i64) -> Result<EnrichedRecord, EnrichError>;
}

/// Which side wins when the event and the join disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum EnrichmentMode {
    /// The join is authoritative except for the decimal columns carried by the event.
    #[default]
    Joined,
    /// Every column present in the event wins; the join only contributes reference names.
    ReferenceOnly,
}

pub fn apply_event_fields(record: &mut EnrichedRecord, fields: &TransactionFields, mode: EnrichmentMode) {
    if let Some(unit_price) = &fields.unit_price {
        record.unit_price = Some(unit_price.clone());
    }
    if let Some(total_amount) = &fields.total_amount {
        record.total_amount = total_amount.clone();
    }

    if mode == EnrichmentMode::Joined {
        return;
    }

    if fields.customer_id.is_some() {
        record.customer_id = fields.customer_id;
    }
    if fields.product_id.is_some() {
        record.product_id = fields.product_id;
    }
    if fields.store_id.is_some() {
        record.store_id = fields.store_id;
    }
    if let Some(transaction_type) = &fields.transaction_type {
        record.transaction_type = transaction_type.clone();
    }
    if let Some(quantity) = fields.quantity {
        record.quantity = quantity;
    }
    if let Some(transaction_date) = fields.transaction_date {
        record.transaction_date = transaction_date;
    }
    if let Some(status) = &fields.status {
        record.status = status.clone();
    }
    if fields.notes.is_some() {
        record.notes = fields.notes.clone();
    }
    if fields.original_transaction_id.is_some() {
        record.original_transaction_id = fields.original_transaction_id;
    }
}

pub struct PgEnricher {
    pool: DbPool,
    query: String,
}

impl PgEnricher {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            query: enriched_transaction_query("WHERE t.id = $1"),
        }
    }

    /// Checks out a connection and runs a trivial query.
    pub async fn ping(&self) -> Result<(), EnrichError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EnrichError::ConnectionFailure(e.to_string()))?;
        diesel::sql_query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| EnrichError::ConnectionFailure(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Enricher for PgEnricher {
    async fn enrich(&self, id: i64) -> Result<EnrichedRecord, EnrichError> {
        // Returned to the pool when dropped, on every path out of this function.
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EnrichError::ConnectionFailure(e.to_string()))?;

        diesel::sql_query(self.query.as_str())
            .bind::<BigInt, _>(id)
            .get_result::<EnrichedRecord>(&mut conn)
            .await
            .optional()
            .map_err(|e| EnrichError::QueryFailure(e.to_string()))?
            .ok_or(EnrichError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn joined_row() -> EnrichedRecord {
        EnrichedRecord {
            customer_id: Some(1),
            product_id: Some(2),
            store_id: Some(3),
            unit_price: Some(BigDecimal::from_str("10.00").unwrap()),
            status: "pending".to_string(),
            customer_name: Some("Alice".to_string()),
            product_name: Some("Case".to_string()),
            ..EnrichedRecord::new(
                7,
                "sale",
                BigDecimal::from_str("10.00").unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            )
        }
    }

    fn event_fields() -> TransactionFields {
        TransactionFields {
            unit_price: Some(BigDecimal::from_str("12.50").unwrap()),
            total_amount: Some(BigDecimal::from_str("25.00").unwrap()),
            quantity: Some(2),
            status: Some("completed".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn joined_mode_only_overrides_decimals() {
        let mut record = joined_row();
        apply_event_fields(&mut record, &event_fields(), EnrichmentMode::Joined);

        assert_eq!(record.unit_price, Some(BigDecimal::from_str("12.50").unwrap()));
        assert_eq!(record.total_amount, BigDecimal::from_str("25.00").unwrap());
        assert_eq!(record.quantity, 1);
        assert_eq!(record.status, "pending");
    }

    #[test]
    fn reference_only_mode_prefers_every_event_column() {
        let mut record = joined_row();
        apply_event_fields(&mut record, &event_fields(), EnrichmentMode::ReferenceOnly);

        assert_eq!(record.quantity, 2);
        assert_eq!(record.status, "completed");
        assert_eq!(record.customer_id, Some(1));
        assert_eq!(record.customer_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn absent_event_decimals_keep_joined_values() {
        let mut record = joined_row();
        apply_event_fields(&mut record, &TransactionFields::default(), EnrichmentMode::Joined);
        assert_eq!(record, joined_row());
    }

    #[test]
    fn error_kinds_are_distinct() {
        assert_eq!(EnrichError::NotFound(1).kind(), "enrichment_miss");
        assert_eq!(EnrichError::ConnectionFailure("x".into()).kind(), "connection_failure");
        assert_eq!(EnrichError::QueryFailure("x".into()).kind(), "query_failure");
    }
}
