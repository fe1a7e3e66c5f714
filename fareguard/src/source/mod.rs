// fareguard/src/source/mod.rs
//
// Upstream transports.
//
//   tail    — follow a JSONL file, acked position kept in a sidecar file
//   replay  — read a JSONL file once from the start, then end
//   kafka   — consumer group, manual commits (feature "kafka")
//   memory  — scripted deliveries for tests
//
// Every source hands out Deliveries in (partition, offset) order and can
// rewind to the last acked position, so an unacked batch is redelivered.
// Offsets only mean something within one source id:
//   jsonl:{canonical path}   kafka:{topic}/{group}   memory

pub mod jsonl;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::events::TripEvent;

/// One upstream record. `event` is None when the payload was not a JSON
/// object; the delivery still carries a position that must be acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub partition: i32,
    pub offset:    i64,
    pub event:     Option<TripEvent>,
}

impl Delivery {
    /// Decode a raw payload; logs and keeps the position on failure.
    pub fn decode(partition: i32, offset: i64, payload: &[u8]) -> Self {
        let event = match TripEvent::from_json(payload) {
            Ok(ev) => Some(ev),
            Err(e) => {
                tracing::warn!(partition, offset, error = %e, "undecodable trip payload");
                None
            }
        };
        Self { partition, offset, event }
    }
}

#[async_trait]
pub trait EventSource: Send {
    /// Stable identity of the upstream stream. Committed offsets are kept
    /// per id, so two sources with the same id share one offset space.
    fn id(&self) -> String;

    /// Up to `max` deliveries, waiting at most `window` for the batch to
    /// fill. An empty Vec means nothing arrived in time.
    async fn fetch(&mut self, max: usize, window: Duration) -> Result<Vec<Delivery>, SourceError>;

    /// Mark everything up to and including `positions[partition]` consumed.
    async fn ack(&mut self, positions: &BTreeMap<i32, i64>) -> Result<(), SourceError>;

    /// Go back to the last acked position; the next fetch redelivers.
    async fn rewind(&mut self) -> Result<(), SourceError>;

    /// True once a finite source has nothing left to deliver.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Highest offset per partition.
pub fn high_water(deliveries: &[Delivery]) -> BTreeMap<i32, i64> {
    let mut out = BTreeMap::new();
    for d in deliveries {
        let e = out.entry(d.partition).or_insert(d.offset);
        if d.offset > *e {
            *e = d.offset;
        }
    }
    out
}
