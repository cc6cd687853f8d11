//! Downstream document store holding one document per transaction id.

use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::options::{IndexOptions, ReplaceOptions};
use mongodb::{Client, Collection, IndexModel};
use num_traits::ToPrimitive;
use shared::EnrichedRecord;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("document write failed: {0}")]
    WriteFailure(String),
}

impl From<mongodb::error::Error> for MaterializeError {
    fn from(err: mongodb::error::Error) -> Self {
        MaterializeError::WriteFailure(err.to_string())
    }
}

/// Keyed, idempotent writes. Both operations may be repeated any number of times.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replaces the whole document for `record.id`, inserting it if absent.
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), MaterializeError>;

    /// Removes the document for `id`. A missing document is not an error.
    async fn delete(&self, id: i64) -> Result<(), MaterializeError>;
}

pub struct MongoDocumentStore {
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    pub async fn connect(uri: &str, database_name: &str, collection_name: &str) -> mongodb::error::Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Self::new(&client, database_name, collection_name).await
    }

    pub async fn new(client: &Client, database_name: &str, collection_name: &str) -> mongodb::error::Result<Self> {
        let database = client.database(database_name);
        // The driver connects lazily; ping so an unreachable server fails startup.
        database.run_command(doc! { "ping": 1 }).await?;

        let store = Self {
            collection: database.collection(collection_name),
        };
        store.init().await?;

        Ok(store)
    }

    async fn init(&self) -> mongodb::error::Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        self.collection.create_index(index).await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), MaterializeError> {
        let options = ReplaceOptions::builder().upsert(true).build();

        let result = self
            .collection
            .replace_one(doc! { "id": record.id }, to_document(record))
            .with_options(options)
            .await?;

        debug!(
            id = record.id,
            matched = result.matched_count,
            modified = result.modified_count,
            upserted = result.upserted_id.is_some(),
            "Replaced transaction document"
        );
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), MaterializeError> {
        let result = self.collection.delete_one(doc! { "id": id }).await?;
        debug!(id, deleted = result.deleted_count, "Deleted transaction document");
        Ok(())
    }
}

/// Document shape read by the dashboard: decimals as doubles, dates as BSON dates.
/// Amounts with more than 15 significant digits lose precision here.
pub fn to_document(record: &EnrichedRecord) -> Document {
    doc! {
        "id": record.id,
        "customer_id": record.customer_id,
        "product_id": record.product_id,
        "store_id": record.store_id,
        "transaction_type": record.transaction_type.as_str(),
        "quantity": record.quantity,
        "unit_price": record.unit_price.as_ref().and_then(|price| price.to_f64()),
        "total_amount": record.total_amount.to_f64(),
        "transaction_date": BsonDateTime::from_millis(record.transaction_date.timestamp_millis()),
        "status": record.status.as_str(),
        "notes": record.notes.clone(),
        "original_transaction_id": record.original_transaction_id,
        "customer_name": record.customer_name.clone(),
        "product_name": record.product_name.clone(),
        "category_name": record.category_name.clone(),
        "subcategory_name": record.subcategory_name.clone(),
        "store_name": record.store_name.clone(),
        "store_location": record.store_location.clone(),
        "store_city": record.store_city.clone(),
        "store_state": record.store_state.clone(),
        "store_zip_code": record.store_zip_code.clone(),
        "store_county": record.store_county.clone(),
        "store_region": record.store_region.clone(),
        "original_transaction_type": record.original_transaction_type.clone(),
    }
}

/// In-process store with the same semantics as the MongoDB one.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<i64, EnrichedRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<EnrichedRecord> {
        self.documents.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), MaterializeError> {
        self.documents.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), MaterializeError> {
        self.documents.write().await.remove(&id);
        Ok(())
    }
}
