// fareguard/src/pipeline.rs
//
// Stream consumer loop.
//
//   IDLE ──► FETCHING ──► PROCESSING ──► COMMITTING ──► IDLE
//     │          │ empty / error                 │ write failed
//     │          └──────────► IDLE ◄──── hold ───┘
//     └─ batch held ──────────────────► COMMITTING
//
// FETCHING    pull up to max_batch deliveries within batch_interval
// PROCESSING  dedup against committed offsets → enrich + score → fold
// COMMITTING  write plan + offset commit; ack upstream only on success,
//             otherwise alert, hold the batch and back off
//
// A held batch is retried as it is (same id, same summary, same offsets)
// before anything new is fetched, so its membership cannot change between
// attempts. Only unreadable offsets, which fail before a batch exists,
// rewind the source.
//
// Batches are strictly sequential. Shutdown is honoured while idle or
// fetching, never in the middle of PROCESSING/COMMITTING.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::engine::aggregate::{dedup, Aggregator, BatchSummary, DedupStats, DEFAULT_FRAUD_THRESHOLD};
use crate::engine::dispatcher::Dispatcher;
use crate::engine::score_parallel;
use crate::error::{PipelineError, WriteError};
use crate::events::TripEvent;
use crate::source::{high_water, EventSource};
use crate::state::writer::{StoreWriter, WriteReport, WriterConfig};
use crate::state::SharedStore;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Overrides the source's own id as the scope of committed offsets.
    pub source_id:             Option<String>,
    pub batch_interval_ms:     u64,
    pub max_batch:             usize,
    pub fraud_threshold:       u8,
    /// Trips per blocking scoring task; smaller batches score inline.
    pub score_chunk:           usize,
    pub fetch_backoff_base_ms: u64,
    pub fetch_backoff_max_ms:  u64,
    /// Pause after a batch failed to commit, before it is retried.
    pub commit_backoff_ms:     u64,
    pub stats_interval_secs:   u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_id:             None,
            batch_interval_ms:     5_000,
            max_batch:             1_000,
            fraud_threshold:       DEFAULT_FRAUD_THRESHOLD,
            score_chunk:           256,
            fetch_backoff_base_ms: 100,
            fetch_backoff_max_ms:  30_000,
            commit_backoff_ms:     1_000,
            stats_interval_secs:   30,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_backoff(&self, failures: u32) -> Duration {
        let exp  = failures.saturating_sub(1).min(20);
        let wait = self.fetch_backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(wait.min(self.fetch_backoff_max_ms))
    }
}

// ── Phase / reports ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Processing,
    Committing,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle       => write!(f, "IDLE"),
            Phase::Fetching   => write!(f, "FETCHING"),
            Phase::Processing => write!(f, "PROCESSING"),
            Phase::Committing => write!(f, "COMMITTING"),
            Phase::Stopped    => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing arrived within the batch window.
    #[default]
    Idle,
    Shutdown,
    FetchFailed,
    Committed,
    WriteFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome:   Outcome,
    pub batch_id:  Option<String>,
    pub fetched:   usize,
    pub trips:     usize,
    pub malformed: usize,
    pub fraud:     u64,
    pub dedup:     DedupStats,
    pub write:     Option<WriteReport>,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub batches:        AtomicU64,
    pub trips:          AtomicU64,
    pub fraud_alerts:   AtomicU64,
    pub duplicates:     AtomicU64,
    pub malformed:      AtomicU64,
    pub failed_commits: AtomicU64,
    pub fetch_errors:   AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub batches:        u64,
    pub trips:          u64,
    pub fraud_alerts:   u64,
    pub duplicates:     u64,
    pub malformed:      u64,
    pub failed_commits: u64,
    pub fetch_errors:   u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let r = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StatsSnapshot {
            batches:        r(&self.batches),
            trips:          r(&self.trips),
            fraud_alerts:   r(&self.fraud_alerts),
            duplicates:     r(&self.duplicates),
            malformed:      r(&self.malformed),
            failed_commits: r(&self.failed_commits),
            fetch_errors:   r(&self.fetch_errors),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Logs a stats line every `every` until the process exits.
pub async fn stats_loop(stats: Arc<PipelineStats>, every: Duration, start: Instant) {
    loop {
        tokio::time::sleep(every).await;
        let s       = stats.snapshot();
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            uptime_s       = elapsed as u64,
            batches        = s.batches,
            trips          = s.trips,
            tps            = format!("{:.1}", s.trips as f64 / elapsed.max(1.0)).as_str(),
            fraud_alerts   = s.fraud_alerts,
            duplicates     = s.duplicates,
            failed_commits = s.failed_commits,
            "stats"
        );
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// A processed batch whose write has not landed yet.
struct HeldBatch {
    id:        String,
    summary:   BatchSummary,
    positions: BTreeMap<i32, i64>,
    report:    CycleReport,
    attempts:  u32,
}

pub struct Pipeline {
    source:         Box<dyn EventSource>,
    writer:         StoreWriter,
    aggregator:     Aggregator,
    dispatcher:     Dispatcher,
    cfg:            PipelineConfig,
    stats:          Arc<PipelineStats>,
    phase:          Phase,
    fetch_failures: u32,
    held:           Option<HeldBatch>,
    shutdown:       Option<watch::Receiver<bool>>,
}

impl Pipeline {
    pub fn new(
        source:     Box<dyn EventSource>,
        store:      SharedStore,
        writer_cfg: WriterConfig,
        cfg:        PipelineConfig,
        dispatcher: Dispatcher,
    ) -> Self {
        let source_id = cfg.source_id.clone().unwrap_or_else(|| source.id());
        Self {
            writer:         StoreWriter::new(store, writer_cfg, source_id),
            source,
            aggregator:     Aggregator::new(cfg.fraud_threshold),
            dispatcher,
            cfg,
            stats:          Arc::new(PipelineStats::default()),
            phase:          Phase::Idle,
            fetch_failures: 0,
            held:           None,
            shutdown:       None,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Id of the batch waiting to be retried, if the last write failed.
    pub fn held_batch(&self) -> Option<&str> {
        self.held.as_ref().map(|h| h.id.as_str())
    }

    fn enter(&mut self, next: Phase) {
        trace!(from = %self.phase, to = %next, "phase");
        self.phase = next;
    }

    /// One IDLE → … → IDLE pass. A held batch is retried instead of
    /// fetching. Errors only when the source cannot be rewound after the
    /// committed offsets were unreadable.
    pub async fn cycle(&mut self) -> Result<CycleReport, PipelineError> {
        if let Some(held) = self.held.take() {
            self.enter(Phase::Committing);
            debug!(batch_id = %held.id, attempt = held.attempts + 1, "retrying held batch");
            return Ok(self.commit(held).await);
        }

        let mut report = CycleReport::default();
        let max    = self.cfg.max_batch.max(1);
        let window = Duration::from_millis(self.cfg.batch_interval_ms);

        // ── FETCHING ──────────────────────────────────────────────────────────
        self.enter(Phase::Fetching);
        let fetched = match self.shutdown.as_mut() {
            Some(rx) => tokio::select! {
                biased;
                _ = stopped(rx) => None,
                r = self.source.fetch(max, window) => Some(r),
            },
            None => Some(self.source.fetch(max, window).await),
        };

        let deliveries = match fetched {
            None => {
                self.enter(Phase::Idle);
                report.outcome = Outcome::Shutdown;
                return Ok(report);
            }
            Some(Err(e)) => {
                self.fetch_failures += 1;
                PipelineStats::add(&self.stats.fetch_errors, 1);
                warn!(error = %e, failures = self.fetch_failures, "fetch failed");
                self.enter(Phase::Idle);
                report.outcome = Outcome::FetchFailed;
                return Ok(report);
            }
            Some(Ok(d)) => d,
        };
        self.fetch_failures = 0;
        report.fetched = deliveries.len();
        if deliveries.is_empty() {
            self.enter(Phase::Idle);
            return Ok(report);
        }

        // ── PROCESSING ────────────────────────────────────────────────────────
        self.enter(Phase::Processing);
        let positions = high_water(&deliveries);
        let committed = match self.writer.load_offsets().await {
            Ok(c) => c,
            Err(e) => {
                self.alert(&e).await;
                self.source.rewind().await?;
                report.outcome = Outcome::WriteFailed;
                self.enter(Phase::Idle);
                return Ok(report);
            }
        };

        let (kept, dedup_stats) = dedup(deliveries, &committed);
        report.dedup = dedup_stats;
        if dedup_stats.dropped() > 0 {
            debug!(
                already_committed = dedup_stats.already_committed,
                repeated_trip_ids = dedup_stats.repeated_trip_ids,
                "duplicates dropped"
            );
        }

        let id = self.writer.batch_id(kept.iter().map(|d| (d.partition, d.offset)));
        let trips: Vec<TripEvent> = kept.into_iter().filter_map(|d| d.event).collect();
        report.malformed = report.fetched - dedup_stats.dropped() - trips.len();
        report.trips     = trips.len();

        let scored  = score_parallel(trips, self.cfg.score_chunk).await;
        let summary = self.aggregator.fold(&scored, Utc::now().date_naive());
        report.fraud    = summary.fraud_count;
        report.batch_id = Some(id.clone());

        // ── COMMITTING ────────────────────────────────────────────────────────
        self.enter(Phase::Committing);
        let held = HeldBatch { id, summary, positions, report, attempts: 0 };
        Ok(self.commit(held).await)
    }

    async fn commit(&mut self, mut held: HeldBatch) -> CycleReport {
        let written = match self.writer.write(&held.id, &held.summary, &held.positions).await {
            Ok(w) => w,
            Err(e) => {
                self.alert(&e).await;
                held.attempts += 1;
                let mut report = held.report.clone();
                report.outcome = Outcome::WriteFailed;
                warn!(batch_id = %held.id, attempts = held.attempts, "batch held for retry");
                self.held = Some(held);
                self.enter(Phase::Idle);
                return report;
            }
        };
        let HeldBatch { id, summary, positions, mut report, .. } = held;

        if let Err(e) = self.source.ack(&positions).await {
            // Offsets are already committed in the store; redelivery is deduped.
            warn!(batch_id = %id, error = %e, "upstream ack failed");
        }
        if let Err(e) = self.dispatcher.fraud_alerts(&summary).await {
            warn!(batch_id = %id, error = %e, "cannot append fraud audit trail");
        }

        PipelineStats::add(&self.stats.batches, 1);
        PipelineStats::add(&self.stats.trips, report.trips as u64);
        PipelineStats::add(&self.stats.fraud_alerts, summary.fraud_count);
        PipelineStats::add(&self.stats.duplicates, report.dedup.dropped() as u64);
        PipelineStats::add(&self.stats.malformed, report.malformed as u64);

        info!(
            batch_id  = %id,
            trips     = report.trips,
            fraud     = summary.fraud_count,
            revenue   = summary.total_revenue(),
            ops       = written.total,
            skipped   = written.skipped,
            dropped   = report.dedup.dropped(),
            malformed = report.malformed,
            "batch committed"
        );

        report.outcome = Outcome::Committed;
        report.write   = Some(written);
        self.enter(Phase::Idle);
        report
    }

    async fn alert(&self, err: &WriteError) {
        PipelineStats::add(&self.stats.failed_commits, 1);
        if let Err(e) = self.dispatcher.ops_alert(err).await {
            warn!(error = %e, "cannot append ops alert");
        }
    }

    /// Run until shutdown is signalled or a finite source is drained.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<StatsSnapshot, PipelineError> {
        let mut signal = shutdown.clone();
        self.shutdown  = Some(shutdown);
        info!(
            source      = %self.writer.source_id(),
            interval_ms = self.cfg.batch_interval_ms,
            max_batch   = self.cfg.max_batch,
            threshold   = self.cfg.fraud_threshold,
            "consumer loop started"
        );

        loop {
            if *signal.borrow() || (self.source.is_exhausted() && self.held.is_none()) {
                break;
            }
            let report = self.cycle().await?;
            let pause = match report.outcome {
                Outcome::Shutdown => break,
                Outcome::FetchFailed => self.cfg.fetch_backoff(self.fetch_failures),
                Outcome::WriteFailed => Duration::from_millis(self.cfg.commit_backoff_ms),
                Outcome::Idle | Outcome::Committed => continue,
            };
            debug!(pause_ms = pause.as_millis() as u64, "backing off");
            tokio::select! {
                biased;
                _ = stopped(&mut signal) => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Some(held) = &self.held {
            warn!(batch_id = %held.id, attempts = held.attempts, "stopping with an uncommitted batch; it is redelivered on restart");
        }
        self.enter(Phase::Stopped);
        let totals = self.stats.snapshot();
        info!(
            batches = totals.batches,
            trips   = totals.trips,
            fraud   = totals.fraud_alerts,
            "consumer loop stopped"
        );
        Ok(totals)
    }
}

/// Resolves once `true` is published. A dropped sender never resolves.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_backoff_is_capped() {
        let c = PipelineConfig::default();
        assert_eq!(c.fetch_backoff(1), Duration::from_millis(100));
        assert_eq!(c.fetch_backoff(2), Duration::from_millis(200));
        assert_eq!(c.fetch_backoff(9), Duration::from_millis(25_600));
        assert_eq!(c.fetch_backoff(10), Duration::from_secs(30));
        assert_eq!(c.fetch_backoff(500), Duration::from_secs(30));
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Committing.to_string(), "COMMITTING");
        assert_eq!(Outcome::default(), Outcome::Idle);
    }
}
