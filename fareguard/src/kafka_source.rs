// fareguard/src/kafka_source.rs
//
// Kafka consumer adapter (cargo feature "kafka").
//
// Consumes raw trip JSON from the ingest topic inside a consumer group with
// auto-commit disabled. Offsets are committed only through `ack`, which the
// pipeline calls after the batch landed in the store; `rewind` seeks each
// partition back to the first unacked offset so a failed batch is fetched
// again. Both block on the broker round trip and run on the blocking pool.
//
// Source id is `kafka:{topic}/{group_id}`.
//
// Message format: UTF-8 JSON TripEvent, no schema registry dependency.
//
// Dependencies:
//   rdkafka = { version = "0.36", features = ["cmake-build"] }

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::source::{Delivery, EventSource};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker list (e.g. "kafka1:9092,kafka2:9092")
    pub brokers:            String,
    pub topic:              String,
    pub group_id:           String,
    /// Where a group without committed offsets starts: "earliest" | "latest"
    pub auto_offset_reset:  String,
    pub session_timeout_ms: u64,
    pub seek_timeout_ms:    u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers:            "localhost:9092".to_string(),
            topic:              "nyc.taxi.trips.raw".to_string(),
            group_id:           "fareguard".to_string(),
            auto_offset_reset:  "latest".to_string(),
            session_timeout_ms: 10_000,
            seek_timeout_ms:    5_000,
        }
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

pub struct KafkaSource {
    config:   KafkaConfig,
    consumer: Arc<StreamConsumer>,
    acked:    BTreeMap<i32, i64>,
    /// First offset handed out per partition since its last ack.
    pending:  BTreeMap<i32, i64>,
}

fn transport(e: rdkafka::error::KafkaError) -> SourceError {
    SourceError::Transport(e.to_string())
}

/// Runs a blocking consumer call off the async workers.
async fn blocking<T, F>(consumer: &Arc<StreamConsumer>, f: F) -> Result<T, SourceError>
where
    T: Send + 'static,
    F: FnOnce(&StreamConsumer) -> Result<T, rdkafka::error::KafkaError> + Send + 'static,
{
    let consumer = Arc::clone(consumer);
    tokio::task::spawn_blocking(move || f(&consumer))
        .await
        .map_err(|e| SourceError::Transport(format!("kafka worker task failed: {}", e)))?
        .map_err(transport)
}

impl KafkaSource {
    pub fn connect(config: KafkaConfig) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(transport)?;
        consumer.subscribe(&[config.topic.as_str()]).map_err(transport)?;

        info!(
            "Kafka consumer subscribed, brokers={} topic={} group={}",
            config.brokers, config.topic, config.group_id
        );
        Ok(Self { config, consumer: Arc::new(consumer), acked: BTreeMap::new(), pending: BTreeMap::new() })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    fn id(&self) -> String {
        format!("kafka:{}/{}", self.config.topic, self.config.group_id)
    }

    async fn fetch(&mut self, max: usize, window: Duration) -> Result<Vec<Delivery>, SourceError> {
        let deadline = Instant::now() + window;
        let mut out  = Vec::new();

        while out.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(msg)) => {
                    let d = Delivery::decode(msg.partition(), msg.offset(), msg.payload().unwrap_or_default());
                    self.pending.entry(d.partition).or_insert(d.offset);
                    out.push(d);
                }
                // Surface the error only when there is nothing to hand back.
                Ok(Err(e)) if out.is_empty() => return Err(transport(e)),
                Ok(Err(e)) => {
                    warn!(error = %e, "kafka receive failed mid-batch");
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, positions: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (p, o) in positions {
            // Kafka commits the next offset to read
            tpl.add_partition_offset(&self.config.topic, *p, Offset::Offset(o + 1))
                .map_err(transport)?;
        }
        blocking(&self.consumer, move |c| c.commit(&tpl, CommitMode::Sync)).await?;

        for (p, o) in positions {
            self.acked.insert(*p, *o);
            self.pending.remove(p);
        }
        debug!(?positions, "kafka offsets committed");
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        let timeout = Duration::from_millis(self.config.seek_timeout_ms);
        for (p, first) in std::mem::take(&mut self.pending) {
            let target = self.acked.get(&p).map(|a| a + 1).unwrap_or(first);
            let topic = self.config.topic.clone();
            blocking(&self.consumer, move |c| c.seek(&topic, p, Offset::Offset(target), timeout)).await?;
            debug!(partition = p, offset = target, "kafka partition rewound");
        }
        Ok(())
    }
}
