//! What happens to a record whose processing fails.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaResult;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use shared::{ChangeEvent, DecodeError};
use thiserror::Error;
use uuid::Uuid;

use crate::enricher::EnrichError;
use crate::pipeline::SourceRecord;
use crate::store::MaterializeError;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Enrich(#[from] EnrichError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

impl ProcessError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Decode(e) => e.kind(),
            ProcessError::Enrich(e) => e.kind(),
            ProcessError::Materialize(_) => "write_failure",
        }
    }

    /// Decode failures are deterministic and a missing row will stay missing,
    /// so only I/O failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessError::Decode(_) => false,
            ProcessError::Enrich(EnrichError::NotFound(_)) => false,
            ProcessError::Enrich(_) => true,
            ProcessError::Materialize(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure and move on.
    #[default]
    Drop,
    /// Retry transient failures, then drop.
    Retry { retries: u32, backoff: Duration },
    /// Retry transient failures, then publish the record to a dead-letter sink.
    DeadLetter { retries: u32, backoff: Duration },
}

impl FailurePolicy {
    pub fn retries(&self) -> u32 {
        match self {
            FailurePolicy::Drop => 0,
            FailurePolicy::Retry { retries, .. } | FailurePolicy::DeadLetter { retries, .. } => *retries,
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            FailurePolicy::Drop => Duration::ZERO,
            FailurePolicy::Retry { backoff, .. } | FailurePolicy::DeadLetter { backoff, .. } => *backoff,
        }
    }

    pub fn dead_letters(&self) -> bool {
        matches!(self, FailurePolicy::DeadLetter { .. })
    }
}

/// A failed record together with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub error_kind: String,
    pub error: String,
    pub attempts: u32,
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(record: &SourceRecord, event: Option<&ChangeEvent>, error: &ProcessError, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_topic: record.topic.clone(),
            source_partition: record.partition,
            source_offset: record.offset,
            record_key: record
                .key
                .as_deref()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            transaction_id: event.map(|e| e.id),
            operation: event.map(|e| e.op.marker().to_string()),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            attempts,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to publish dead letter: {0}")]
    Publish(String),
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(brokers: &str, topic: impl Into<String>) -> KafkaResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let json = serde_json::to_string(letter)?;
        // Keyed like the source so letters for one transaction stay ordered.
        let key = match letter.transaction_id {
            Some(id) => id.to_string(),
            None => format!("{}-{}-{}", letter.source_topic, letter.source_partition, letter.source_offset),
        };
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| DeadLetterError::Publish(e.to_string()))?;

        Ok(())
    }
}
