//! Per-record processing: decode, enrich, materialize.

use std::sync::Arc;

use futures::{pin_mut, Stream, StreamExt};
use shared::{ChangeEvent, DecodeError, Decoder};
use tracing::{debug, error, info, warn};

use crate::enricher::{apply_event_fields, EnrichError, Enricher, EnrichmentMode};
use crate::failure::{DeadLetter, DeadLetterSink, FailurePolicy, ProcessError};
use crate::store::DocumentStore;

const PAYLOAD_PREVIEW_CHARS: usize = 2048;

/// One record as delivered by the stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl SourceRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }

    fn payload_preview(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .chars()
            .take(PAYLOAD_PREVIEW_CHARS)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Upserted(i64),
    Deleted(i64),
    /// The row was gone from the system of record by the time it was enriched.
    Skipped(i64),
    /// A null-valued record following a delete; nothing to apply.
    Tombstone,
    Failed { id: Option<i64>, kind: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub upserted: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub tombstones: u64,
    pub failed: u64,
}

impl ProcessStats {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Upserted(_) => self.upserted += 1,
            Outcome::Deleted(_) => self.deleted += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Tombstone => self.tombstones += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &ProcessStats) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.tombstones += other.tombstones;
        self.failed += other.failed;
    }

    pub fn total(&self) -> u64 {
        self.upserted + self.deleted + self.skipped + self.tombstones + self.failed
    }
}

pub struct Pipeline {
    decoder: Decoder,
    enricher: Arc<dyn Enricher>,
    store: Arc<dyn DocumentStore>,
    mode: EnrichmentMode,
    policy: FailurePolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl Pipeline {
    pub fn new(decoder: Decoder, enricher: Arc<dyn Enricher>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            decoder,
            enricher,
            store,
            mode: EnrichmentMode::default(),
            policy: FailurePolicy::default(),
            dead_letters: None,
        }
    }

    pub fn with_mode(mut self, mode: EnrichmentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Processes one record to completion. Never fails: every error is
    /// logged, handled according to the failure policy and reported as
    /// [`Outcome::Failed`].
    pub async fn process(&self, record: &SourceRecord) -> Outcome {
        let event = match self.decoder.decode(&record.payload) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Ignoring tombstone"
                );
                return Outcome::Tombstone;
            }
            Err(err) => {
                match &err {
                    DecodeError::UnknownOperation(marker) => warn!(
                        kind = err.kind(),
                        marker = %marker,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Discarding change record with unknown operation"
                    ),
                    DecodeError::MalformedPayload(_) => error!(
                        kind = err.kind(),
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        payload = %record.payload_preview(),
                        error = %err,
                        "Failed to decode change record"
                    ),
                }
                let err = ProcessError::from(err);
                self.dead_letter(record, None, &err, 1).await;
                return Outcome::Failed { id: None, kind: err.kind() };
            }
        };

        debug!(id = event.id, op = %event.op, offset = record.offset, "Decoded change event");

        let mut attempt = 1;
        loop {
            match self.apply(&event).await {
                Ok(outcome) => return outcome,
                Err(err) if err.is_transient() && attempt <= self.policy.retries() => {
                    warn!(
                        kind = err.kind(),
                        id = event.id,
                        op = %event.op,
                        attempt,
                        error = %err,
                        "Transient failure applying change event, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff()).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        kind = err.kind(),
                        id = event.id,
                        op = %event.op,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempts = attempt,
                        error = %err,
                        "Failed to apply change event"
                    );
                    self.dead_letter(record, Some(&event), &err, attempt).await;
                    return Outcome::Failed {
                        id: Some(event.id),
                        kind: err.kind(),
                    };
                }
            }
        }
    }

    /// Drains `records` strictly in order, one record at a time.
    pub async fn run_stream<S>(&self, records: S) -> ProcessStats
    where
        S: Stream<Item = SourceRecord>,
    {
        pin_mut!(records);
        let mut stats = ProcessStats::default();
        while let Some(record) = records.next().await {
            let outcome = self.process(&record).await;
            stats.record(&outcome);
        }
        stats
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<Outcome, ProcessError> {
        if event.op.is_delete() {
            self.store.delete(event.id).await?;
            info!(id = event.id, "Deleted transaction");
            return Ok(Outcome::Deleted(event.id));
        }

        let mut record = match self.enricher.enrich(event.id).await {
            Ok(record) => record,
            Err(EnrichError::NotFound(id)) => {
                warn!(
                    kind = "enrichment_miss",
                    id,
                    op = %event.op,
                    "Transaction no longer in system of record, skipping"
                );
                return Ok(Outcome::Skipped(id));
            }
            Err(err) => return Err(err.into()),
        };

        apply_event_fields(&mut record, &event.fields, self.mode);
        self.store.upsert(&record).await?;

        info!(
            id = record.id,
            op = %event.op,
            transaction_type = %record.transaction_type,
            "Synced transaction"
        );
        Ok(Outcome::Upserted(record.id))
    }

    async fn dead_letter(&self, record: &SourceRecord, event: Option<&ChangeEvent>, err: &ProcessError, attempts: u32) {
        if !self.policy.dead_letters() {
            return;
        }
        let Some(sink) = &self.dead_letters else {
            error!(offset = record.offset, "Dead-letter policy is set but no sink is configured");
            return;
        };

        let letter = DeadLetter::new(record, event, err, attempts);
        match sink.publish(&letter).await {
            Ok(()) => info!(
                kind = err.kind(),
                id = ?letter.transaction_id,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Dead-lettered change record"
            ),
            Err(e) => error!(
                kind = err.kind(),
                id = ?letter.transaction_id,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to dead-letter change record"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_count_each_outcome() {
        let mut stats = ProcessStats::default();
        stats.record(&Outcome::Upserted(1));
        stats.record(&Outcome::Deleted(1));
        stats.record(&Outcome::Skipped(2));
        stats.record(&Outcome::Tombstone);
        stats.record(&Outcome::Failed { id: None, kind: "malformed_payload" });

        let mut totals = ProcessStats::default();
        totals.merge(&stats);
        totals.merge(&stats);
        assert_eq!(totals.upserted, 2);
        assert_eq!(totals.failed, 2);
        assert_eq!(totals.tombstones, 2);
        assert_eq!(totals.total(), 10);
    }

    #[test]
    fn payload_preview_is_bounded() {
        let record = SourceRecord::new("t", 0, 0, vec![b'a'; PAYLOAD_PREVIEW_CHARS * 2]);
        assert_eq!(record.payload_preview().len(), PAYLOAD_PREVIEW_CHARS);
    }
}
