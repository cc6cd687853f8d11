use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Numeric, Text, Timestamptz};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::categories)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::subcategories)]
pub struct Subcategory {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::customers)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stores)]
pub struct Store {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub county: Option<String>,
    pub region: Option<String>,
}

/// Product joined with its category and subcategory names.
#[derive(Debug, Clone, QueryableByName, Serialize, Deserialize)]
pub struct ProductListing {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Numeric)]
    pub price: BigDecimal,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub category_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub subcategory_id: Option<i64>,
    #[diesel(sql_type = Nullable<Text>)]
    pub category_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub subcategory_name: Option<String>,
}

pub const PRODUCT_LISTING_SQL: &str = "SELECT p.id, p.name, p.price, p.category_id, p.subcategory_id, \
     c.name AS category_name, s.name AS subcategory_name \
     FROM products p \
     LEFT JOIN categories c ON p.category_id = c.id \
     LEFT JOIN subcategories s ON p.subcategory_id = s.id \
     ORDER BY p.name";

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::transactions)]
pub struct NewTransaction {
    pub customer_id: Option<i64>,
    pub product_id: Option<i64>,
    pub store_id: Option<i64>,
    pub transaction_type: String,
    pub quantity: i32,
    pub unit_price: Option<BigDecimal>,
    pub total_amount: BigDecimal,
    pub status: String,
    pub notes: Option<String>,
    pub original_transaction_id: Option<i64>,
}

/// Denormalized projection of a transaction joined with its reference data.
///
/// This is both the row shape of the enrichment join and the document shape
/// written to the downstream store.
#[derive(Debug, Clone, PartialEq, QueryableByName, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub customer_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub product_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub store_id: Option<i64>,
    #[diesel(sql_type = Text)]
    pub transaction_type: String,
    #[diesel(sql_type = Integer)]
    pub quantity: i32,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub unit_price: Option<BigDecimal>,
    #[diesel(sql_type = Numeric)]
    pub total_amount: BigDecimal,
    #[diesel(sql_type = Timestamptz)]
    pub transaction_date: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub notes: Option<String>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub original_transaction_id: Option<i64>,
    #[diesel(sql_type = Nullable<Text>)]
    pub customer_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub product_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub category_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub subcategory_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_location: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_city: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_state: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_zip_code: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_county: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub store_region: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub original_transaction_type: Option<String>,
}

impl EnrichedRecord {
    /// A record with only the mandatory columns set; reference columns are empty.
    pub fn new(
        id: i64,
        transaction_type: impl Into<String>,
        total_amount: BigDecimal,
        transaction_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            customer_id: None,
            product_id: None,
            store_id: None,
            transaction_type: transaction_type.into(),
            quantity: 1,
            unit_price: None,
            total_amount,
            transaction_date,
            status: "completed".to_string(),
            notes: None,
            original_transaction_id: None,
            customer_name: None,
            product_name: None,
            category_name: None,
            subcategory_name: None,
            store_name: None,
            store_location: None,
            store_city: None,
            store_state: None,
            store_zip_code: None,
            store_county: None,
            store_region: None,
            original_transaction_type: None,
        }
    }
}

const ENRICHED_TRANSACTION_SELECT: &str = "SELECT \
     t.id, t.customer_id, t.product_id, t.store_id, t.transaction_type, t.quantity, \
     t.unit_price, t.total_amount, t.transaction_date, t.status, t.notes, t.original_transaction_id, \
     c.name AS customer_name, \
     p.name AS product_name, \
     cat.name AS category_name, \
     sub.name AS subcategory_name, \
     s.name AS store_name, \
     s.location AS store_location, \
     s.city AS store_city, \
     s.state AS store_state, \
     s.zip_code AS store_zip_code, \
     s.county AS store_county, \
     s.region AS store_region, \
     ot.transaction_type AS original_transaction_type \
     FROM transactions t \
     LEFT JOIN customers c ON t.customer_id = c.id \
     LEFT JOIN products p ON t.product_id = p.id \
     LEFT JOIN categories cat ON p.category_id = cat.id \
     LEFT JOIN subcategories sub ON p.subcategory_id = sub.id \
     LEFT JOIN stores s ON t.store_id = s.id \
     LEFT JOIN transactions ot ON t.original_transaction_id = ot.id";

/// Builds the enrichment join followed by `tail` (a WHERE and/or ORDER BY clause).
pub fn enriched_transaction_query(tail: &str) -> String {
    format!("{ENRICHED_TRANSACTION_SELECT} {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enriched_query_appends_filter() {
        let sql = enriched_transaction_query("WHERE t.id = $1");
        assert!(sql.starts_with("SELECT t.id"));
        assert!(sql.ends_with("WHERE t.id = $1"));
        assert!(sql.contains("LEFT JOIN transactions ot ON t.original_transaction_id = ot.id"));
    }
}
