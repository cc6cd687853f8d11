use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pipeline::{Pipeline, ProcessStats, SourceRecord};

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
    pub metadata_timeout: Duration,
}

impl KafkaSettings {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            // Offsets are committed by hand once a record has been fully handled.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset);
        config
    }
}

impl SourceRecord {
    pub fn from_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// One sequential worker. Workers sharing a group id split the topic's
/// partitions between them; each worker handles its records one at a time.
pub struct CdcConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<Pipeline>,
    worker: usize,
}

impl CdcConsumer {
    pub fn connect(settings: &KafkaSettings, pipeline: Arc<Pipeline>, worker: usize) -> KafkaResult<Self> {
        info!(worker, brokers = %settings.brokers, "Connecting to change stream");
        let consumer: StreamConsumer = settings.client_config().create()?;

        // Client creation does not touch the network; fetch metadata so an
        // unreachable cluster aborts startup instead of retrying forever.
        let metadata = tokio::task::block_in_place(|| {
            consumer.fetch_metadata(Some(settings.topic.as_str()), settings.metadata_timeout)
        })?;
        match metadata.topics().iter().find(|t| t.name() == settings.topic) {
            Some(topic) if topic.error().is_none() => {
                debug!(worker, topic = %settings.topic, partitions = topic.partitions().len(), "Fetched topic metadata")
            }
            _ => warn!(worker, topic = %settings.topic, "Topic is not available yet, waiting for it to appear"),
        }

        consumer.subscribe(&[settings.topic.as_str()])?;
        info!(worker, topic = %settings.topic, group_id = %settings.group_id, "Subscribed to change stream");

        Ok(Self {
            consumer,
            pipeline,
            worker,
        })
    }

    /// Consumes until `shutdown` flips to true (or its sender goes away).
    ///
    /// The shutdown signal is only observed between records: a record that
    /// has been received is always processed and committed first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ProcessStats {
        let worker = self.worker;
        let mut stats = ProcessStats::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(message) => {
                    let record = SourceRecord::from_message(&message);
                    let outcome = self.pipeline.process(&record).await;
                    stats.record(&outcome);

                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        error!(
                            worker,
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            "Error committing offset: {}", e
                        );
                    }
                }
                Err(e) => {
                    error!(worker, "Error receiving message: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if stats.total() > 0 {
            if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
                warn!(worker, "Final offset commit failed: {}", e);
            }
        }

        info!(
            worker,
            upserted = stats.upserted,
            deleted = stats.deleted,
            skipped = stats.skipped,
            tombstones = stats.tombstones,
            failed = stats.failed,
            "Consumer worker stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_disables_auto_commit() {
        let settings = KafkaSettings {
            brokers: "kafka:29092".to_string(),
            group_id: "cdc-group".to_string(),
            topic: "dbserver1.orders.transactions".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 6000,
            metadata_timeout: Duration::from_secs(10),
        };
        let config = settings.client_config();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("bootstrap.servers"), Some("kafka:29092"));
        assert_eq!(config.get("session.timeout.ms"), Some("6000"));
    }
}
