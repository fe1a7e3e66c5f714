// fareguard/src/source/memory.rs
//
// Scripted in-process source. Clones share one log, so a test can keep a
// handle to push more deliveries, inject fetch failures and inspect acks
// while the pipeline owns the source.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Delivery, EventSource};
use crate::error::SourceError;
use crate::events::TripEvent;

#[derive(Default)]
struct Feed {
    log:       Vec<Delivery>,
    cursor:    usize,
    acked:     BTreeMap<i32, i64>,
    rewinds:   usize,
    fetches:   usize,
    fail_next: usize,
    finite:    bool,
}

#[derive(Clone, Default)]
pub struct MemorySource {
    feed: Arc<Mutex<Feed>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that reports exhaustion once every delivery was acked.
    pub fn finite(trips: Vec<TripEvent>) -> Self {
        let src = Self::new();
        src.push_trips(trips);
        src.feed.lock().finite = true;
        src
    }

    pub fn push(&self, delivery: Delivery) {
        self.feed.lock().log.push(delivery);
    }

    /// Append trips on partition 0 with consecutive offsets.
    pub fn push_trips(&self, trips: Vec<TripEvent>) {
        let mut feed = self.feed.lock();
        let mut next = feed.log.iter().filter(|d| d.partition == 0).map(|d| d.offset + 1).max().unwrap_or(0);
        for ev in trips {
            feed.log.push(Delivery { partition: 0, offset: next, event: Some(ev) });
            next += 1;
        }
    }

    /// The next `n` fetches fail with a transport error.
    pub fn fail_fetches(&self, n: usize) {
        self.feed.lock().fail_next = n;
    }

    pub fn acked(&self) -> BTreeMap<i32, i64> {
        self.feed.lock().acked.clone()
    }

    pub fn rewinds(&self) -> usize {
        self.feed.lock().rewinds
    }

    pub fn fetches(&self) -> usize {
        self.feed.lock().fetches
    }

    fn is_acked(acked: &BTreeMap<i32, i64>, d: &Delivery) -> bool {
        acked.get(&d.partition).is_some_and(|a| d.offset <= *a)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn id(&self) -> String {
        "memory".to_string()
    }

    async fn fetch(&mut self, max: usize, window: Duration) -> Result<Vec<Delivery>, SourceError> {
        let batch = {
            let mut feed = self.feed.lock();
            feed.fetches += 1;
            if feed.fail_next > 0 {
                feed.fail_next -= 1;
                return Err(SourceError::Transport("injected fetch failure".into()));
            }
            let end   = (feed.cursor + max).min(feed.log.len());
            let batch = feed.log[feed.cursor..end].to_vec();
            feed.cursor = end;
            batch
        };
        if batch.is_empty() {
            // Nothing buffered: behave like a broker poll that times out.
            tokio::time::sleep(window).await;
        }
        Ok(batch)
    }

    async fn ack(&mut self, positions: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        let mut feed = self.feed.lock();
        for (p, o) in positions {
            let e = feed.acked.entry(*p).or_insert(*o);
            if *o > *e {
                *e = *o;
            }
        }
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        let mut feed = self.feed.lock();
        feed.rewinds += 1;
        let first_unacked = feed.log.iter()
            .position(|d| !Self::is_acked(&feed.acked, d))
            .unwrap_or(feed.log.len());
        feed.cursor = first_unacked;
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        let feed = self.feed.lock();
        feed.finite && feed.log.iter().all(|d| Self::is_acked(&feed.acked, d))
    }
}
