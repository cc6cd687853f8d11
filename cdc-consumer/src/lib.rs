pub mod config;
pub mod consumer;
pub mod enricher;
pub mod failure;
pub mod pipeline;
pub mod store;

pub use consumer::{CdcConsumer, KafkaSettings};
pub use enricher::{EnrichError, Enricher, EnrichmentMode, PgEnricher};
pub use failure::{DeadLetter, DeadLetterError, DeadLetterSink, FailurePolicy, KafkaDeadLetterSink, ProcessError};
pub use pipeline::{Outcome, Pipeline, ProcessStats, SourceRecord};
pub use store::{DocumentStore, MaterializeError, MemoryDocumentStore, MongoDocumentStore};
