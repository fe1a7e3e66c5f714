// fareguard/src/state/writer.rs
//
// BatchSummary → store mutations.
//
//   plan()   — compile a summary into an ordered Vec<StoreOp>. Deterministic:
//              dates ascending, then hours / zones / codes ascending. Split
//              into single-field ops when the store cannot apply atomically.
//   write()  — run every op with its own retry and timeout. Failures are
//              collected, never short-circuit the rest of the plan.
//   commit   — only when every op landed: HSET ingest:offsets:{source_id}, last.
//
// Redelivery journal: after a partial failure the indices of ops that did
// land are recorded under the batch id (in-process and in
// ingest:journal:{batch_id}). A redelivered batch with the same id and the
// same plan fingerprint skips those ops, so increments are never applied
// twice. A batch with different membership has a different id and is
// applied in full.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::retry::{with_retry, RetryPolicy};
use super::{route_member, Keys, SharedStore, StoreOp};
use crate::engine::aggregate::{from_cents, BatchSummary, DaySummary};
use crate::error::{StoreError, WriteError};

const DAY_SECS: u64 = 86_400;
const PLAN_FIELD: &str = "plan";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Prepended to every key.
    pub key_prefix:       String,
    pub retention_days:   u64,
    /// Per-date alert log keeps the newest N entries.
    pub alert_log_cap:    usize,
    pub journal_ttl_secs: u64,
    pub retry:            RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            key_prefix:       String::new(),
            retention_days:   7,
            alert_log_cap:    100,
            journal_ttl_secs: DAY_SECS,
            retry:            RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub batch_id: String,
    pub total:    usize,
    pub applied:  usize,
    /// Ops already applied by an earlier delivery of the same batch.
    pub skipped:  usize,
}

#[derive(Debug, Clone, Default)]
struct JournalEntry {
    plan:    String,
    applied: BTreeSet<usize>,
}

pub struct StoreWriter {
    store:   SharedStore,
    keys:    Keys,
    source:  String,
    cfg:     WriterConfig,
    journal: Mutex<HashMap<String, JournalEntry>>,
}

impl StoreWriter {
    /// `source_id` scopes committed offsets and batch ids to one upstream.
    pub fn new(store: SharedStore, cfg: WriterConfig, source_id: impl Into<String>) -> Self {
        Self {
            store,
            keys: Keys::new(cfg.key_prefix.clone()),
            source: source_id.into(),
            cfg,
            journal: Mutex::new(HashMap::new()),
        }
    }

    fn ttl(&self) -> Option<u64> {
        Some(self.cfg.retention_days * DAY_SECS)
    }

    // ── Plan ──────────────────────────────────────────────────────────────────

    pub fn plan(&self, summary: &BatchSummary) -> Vec<StoreOp> {
        let mut ops = Vec::new();
        if summary.is_empty() {
            return ops;
        }

        for (date, day) in &summary.days {
            self.plan_day(&mut ops, *date, day, summary);
        }

        let k = &self.keys;
        zincr(&mut ops, k.pickup_zones(),
              summary.zones.iter().filter(|(_, z)| z.pickups > 0)
                  .map(|(zone, z)| (zone.to_string(), z.pickups as f64)));
        zincr(&mut ops, k.dropoff_zones(),
              summary.zones.iter().filter(|(_, z)| z.dropoffs > 0)
                  .map(|(zone, z)| (zone.to_string(), z.dropoffs as f64)));
        zincr(&mut ops, k.revenue_by_zone(),
              summary.zones.iter().filter(|(_, z)| z.revenue_cents != 0)
                  .map(|(zone, z)| (zone.to_string(), from_cents(z.revenue_cents))));
        zincr(&mut ops, k.fraud_by_zone(),
              summary.fraud_zones.iter().map(|(zone, n)| (zone.to_string(), *n as f64)));
        zincr(&mut ops, k.fraud_by_route(),
              summary.fraud_routes.iter().map(|((pu, dz), n)| (route_member(*pu, *dz), *n as f64)));

        if !self.store.atomic_apply() {
            ops = ops.into_iter().flat_map(StoreOp::split).collect();
        }
        ops
    }

    fn plan_day(&self, ops: &mut Vec<StoreOp>, date: chrono::NaiveDate, day: &DaySummary, summary: &BatchSummary) {
        let k   = &self.keys;
        let ttl = self.ttl();

        for (metric, delta) in [
            ("trips",        day.trips),
            ("fraud_alerts", day.fraud_alerts),
            ("day_trips",    day.day_trips),
            ("night_trips",  day.night_trips),
        ] {
            if delta > 0 {
                ops.push(StoreOp::IncrBy { key: k.daily(date, metric), delta: delta as i64, ttl });
            }
        }
        if day.revenue_cents != 0 {
            ops.push(StoreOp::IncrByFloat {
                key:   k.daily(date, "revenue"),
                delta: from_cents(day.revenue_cents),
                ttl,
            });
        }

        if !day.hourly.is_empty() {
            ops.push(StoreOp::HSet {
                key:    k.hourly(date, "trips"),
                fields: day.hourly.iter().map(|(h, b)| (h.to_string(), b.trips.to_string())).collect(),
                ttl,
            });
            ops.push(StoreOp::HSet {
                key:    k.hourly(date, "revenue"),
                fields: day.hourly.iter()
                    .map(|(h, b)| (h.to_string(), format!("{:.2}", from_cents(b.revenue_cents))))
                    .collect(),
                ttl,
            });
        }

        let alerts: Vec<String> = summary.alerts.iter()
            .filter(|a| a.date == date)
            .map(|a| a.to_json())
            .collect();
        if !alerts.is_empty() {
            ops.push(StoreOp::PushCapped {
                key:    k.alerts(date),
                values: alerts,
                cap:    self.cfg.alert_log_cap.max(1),
                ttl,
            });
        }

        for (name, counts) in [
            ("payment_types", &day.payment_types),
            ("vendors",       &day.vendors),
            ("passengers",    &day.passengers),
        ] {
            ops.push(StoreOp::HIncrBy {
                key:    k.day_stat(date, name),
                fields: counts.iter().map(|(code, n)| (code.to_string(), *n as i64)).collect(),
                ttl,
            });
        }
        if day.distance_hundredths != 0 {
            ops.push(StoreOp::IncrByFloat {
                key:   k.day_stat(date, "total_distance"),
                delta: from_cents(day.distance_hundredths),
                ttl,
            });
        }
    }

    // ── Offsets ───────────────────────────────────────────────────────────────

    pub fn source_id(&self) -> &str {
        &self.source
    }

    /// Id of the batch made of these deliveries from this writer's source.
    pub fn batch_id(&self, positions: impl IntoIterator<Item = (i32, i64)>) -> String {
        batch_id(&self.source, positions)
    }

    /// Last committed offset per partition.
    pub async fn load_offsets(&self) -> Result<BTreeMap<i32, i64>, WriteError> {
        let key = self.keys.offsets(&self.source);
        let raw = with_retry(&self.cfg.retry, "HGETALL ingest:offsets", || self.store.hgetall(&key))
            .await
            .map_err(WriteError::Offsets)?;

        raw.iter()
            .map(|(p, o)| {
                let partition = p.parse::<i32>();
                let offset    = o.parse::<i64>();
                match (partition, offset) {
                    (Ok(p), Ok(o)) => Ok((p, o)),
                    _ => Err(WriteError::Offsets(StoreError::Decode {
                        key:    key.clone(),
                        reason: format!("bad entry {}={}", p, o),
                    })),
                }
            })
            .collect()
    }

    // ── Execute ───────────────────────────────────────────────────────────────

    /// Apply `summary` and, if every op lands, commit `positions` (highest
    /// offset per partition covered by the batch). An empty summary touches
    /// nothing.
    pub async fn write(
        &self,
        batch_id:  &str,
        summary:   &BatchSummary,
        positions: &BTreeMap<i32, i64>,
    ) -> Result<WriteReport, WriteError> {
        let plan = self.plan(summary);
        let mut report = WriteReport { batch_id: batch_id.to_string(), total: plan.len(), ..Default::default() };
        if plan.is_empty() {
            return Ok(report);
        }

        let fingerprint = plan_fingerprint(&plan);
        let done        = self.journaled(batch_id, &fingerprint).await;
        let mut applied = BTreeSet::new();
        let mut failed  = Vec::new();

        for (i, op) in plan.iter().enumerate() {
            if done.contains(&i) {
                report.skipped += 1;
                continue;
            }
            let what = op.to_string();
            match with_retry(&self.cfg.retry, &what, || self.store.apply(op)).await {
                Ok(()) => {
                    debug!(batch_id, op = %what, "applied");
                    applied.insert(i);
                }
                Err(e) => {
                    warn!(batch_id, op = %what, error = %e, "store op failed");
                    failed.push((i, what, e));
                }
            }
        }
        report.applied = applied.len();

        let landed: BTreeSet<usize> = done.union(&applied).copied().collect();
        if !failed.is_empty() {
            self.record(batch_id, &fingerprint, &landed).await;
            return Err(WriteError::Partial { batch_id: batch_id.to_string(), total: plan.len(), failed });
        }

        if !positions.is_empty() {
            let key    = self.keys.offsets(&self.source);
            let fields: Vec<(String, String)> = positions.iter()
                .map(|(p, o)| (p.to_string(), o.to_string()))
                .collect();
            if let Err(source) = with_retry(&self.cfg.retry, "HSET ingest:offsets", || {
                self.store.hset(&key, &fields)
            })
            .await
            {
                self.record(batch_id, &fingerprint, &landed).await;
                return Err(WriteError::Commit { batch_id: batch_id.to_string(), source });
            }
        }

        self.journal.lock().remove(batch_id);
        Ok(report)
    }

    /// Op indices already applied for this batch. The in-process journal wins;
    /// after a restart the store copy is consulted. Unreadable journal = empty.
    async fn journaled(&self, batch_id: &str, fingerprint: &str) -> BTreeSet<usize> {
        if let Some(entry) = self.journal.lock().get(batch_id) {
            if entry.plan == fingerprint {
                return entry.applied.clone();
            }
        }

        let key = self.keys.journal(batch_id);
        match self.store.hgetall(&key).await {
            Ok(fields) if fields.get(PLAN_FIELD).map(String::as_str) == Some(fingerprint) => fields
                .keys()
                .filter_map(|f| f.parse::<usize>().ok())
                .collect(),
            Ok(_) => BTreeSet::new(),
            Err(e) => {
                warn!(batch_id, error = %e, "cannot read redelivery journal");
                BTreeSet::new()
            }
        }
    }

    async fn record(&self, batch_id: &str, fingerprint: &str, applied: &BTreeSet<usize>) {
        {
            let mut journal = self.journal.lock();
            let entry = journal.entry(batch_id.to_string()).or_default();
            if entry.plan != fingerprint {
                *entry = JournalEntry { plan: fingerprint.to_string(), applied: BTreeSet::new() };
            }
            entry.applied.extend(applied.iter().copied());
        }
        if applied.is_empty() {
            return;
        }

        let key = self.keys.journal(batch_id);
        let mut fields = vec![(PLAN_FIELD.to_string(), fingerprint.to_string())];
        fields.extend(applied.iter().map(|i| (i.to_string(), "1".to_string())));

        let stored = async {
            self.store.hset(&key, &fields).await?;
            self.store.expire(&key, self.cfg.journal_ttl_secs).await
        };
        if let Err(e) = stored.await {
            warn!(batch_id, error = %e, "cannot persist redelivery journal; in-process copy only");
        }
    }
}

fn zincr(ops: &mut Vec<StoreOp>, key: String, members: impl Iterator<Item = (String, f64)>) {
    let members: Vec<(String, f64)> = members.collect();
    if !members.is_empty() {
        ops.push(StoreOp::ZIncrBy { key, members });
    }
}

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Hex SHA-256 prefix over the source id and the sorted (partition, offset)
/// pairs of a batch.
pub fn batch_id(source_id: &str, positions: impl IntoIterator<Item = (i32, i64)>) -> String {
    let mut pairs: Vec<(i32, i64)> = positions.into_iter().collect();
    pairs.sort_unstable();
    let mut h = Sha256::new();
    h.update(source_id.as_bytes());
    h.update([0u8]);
    for (p, o) in pairs {
        h.update(p.to_be_bytes());
        h.update(o.to_be_bytes());
    }
    hex::encode(&h.finalize()[..8])
}

fn plan_fingerprint(plan: &[StoreOp]) -> String {
    let mut h = Sha256::new();
    for op in plan {
        h.update(format!("{:?}", op).as_bytes());
        h.update(b"\n");
    }
    hex::encode(&h.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;

    use crate::engine::aggregate::Aggregator;
    use crate::engine::score_trip;
    use crate::events::{parse_timestamp, TripEvent};
    use crate::state::memory::MemoryStore;
    use crate::state::StateStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 3).unwrap()
    }

    fn trip(id: &str, hour: u32, pu: u32, dz: u32, fare: f64) -> TripEvent {
        TripEvent {
            trip_id: id.into(),
            vendor_id: 1,
            pickup_at: parse_timestamp(&format!("2024-09-03T{:02}:00:00", hour)),
            dropoff_at: parse_timestamp(&format!("2024-09-03T{:02}:10:00", hour)),
            passenger_count: 1,
            trip_distance: 2.0,
            pickup_zone: pu,
            dropoff_zone: dz,
            payment_type: 1,
            fare_amount: fare,
            total_amount: fare + 2.0,
            ..TripEvent::default()
        }
    }

    fn summary(trips: Vec<TripEvent>) -> BatchSummary {
        let scored: Vec<_> = trips.into_iter().map(score_trip).collect();
        Aggregator::default().fold(&scored, date())
    }

    fn writer() -> (Arc<MemoryStore>, StoreWriter) {
        let store = Arc::new(MemoryStore::new());
        let w = StoreWriter::new(store.clone(), WriterConfig::default(), "memory");
        (store, w)
    }

    #[test]
    fn plan_is_deterministic_and_ordered() {
        let (_, w) = writer();
        let s = summary(vec![trip("a", 9, 10, 20, 10.0), trip("b", 8, 30, 30, 12.0)]);
        let plan = w.plan(&s);
        assert_eq!(plan, w.plan(&s));

        let keys: Vec<&str> = plan.iter().map(|op| op.key()).collect();
        assert_eq!(keys.first(), Some(&"metrics:2024-09-03:trips"));
        assert_eq!(keys.last(), Some(&"stats:revenue_by_zone"));
        assert!(!keys.contains(&"fraud:alerts:2024-09-03"));
    }

    #[test]
    fn empty_summary_has_empty_plan() {
        let (_, w) = writer();
        assert!(w.plan(&BatchSummary::default()).is_empty());
    }

    #[tokio::test]
    async fn empty_summary_makes_no_store_calls() {
        let (store, w) = writer();
        let r = w.write("x", &BatchSummary::default(), &BTreeMap::from([(0, 4)])).await.unwrap();
        assert_eq!(r.total, 0);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn write_applies_counters_hourly_and_commits() {
        let (store, w) = writer();
        let s = summary(vec![trip("a", 8, 10, 20, 10.0), trip("b", 8, 10, 21, 12.5)]);
        let r = w.write("b1", &s, &BTreeMap::from([(0, 1)])).await.unwrap();
        assert_eq!(r.applied, r.total);

        assert_eq!(store.get("metrics:2024-09-03:trips").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("metrics:2024-09-03:revenue").await.unwrap().as_deref(), Some("26.5"));
        let hourly = store.hgetall("metrics:2024-09-03:hourly:trips").await.unwrap();
        assert_eq!(hourly["8"], "2");
        let rev = store.hgetall("metrics:2024-09-03:hourly:revenue").await.unwrap();
        assert_eq!(rev["8"], "26.50");
        let top = store.zrevrange_withscores("stats:pickup_zones", 0, 0).await.unwrap();
        assert_eq!(top, vec![("10".to_string(), 2.0)]);
        assert!(store.ttl("metrics:2024-09-03:trips").is_some());
        assert!(store.ttl("stats:pickup_zones").is_none());

        assert_eq!(w.load_offsets().await.unwrap(), BTreeMap::from([(0, 1)]));
    }

    #[tokio::test]
    async fn hourly_cells_are_overwritten_not_added() {
        let (store, w) = writer();
        w.write("b1", &summary(vec![trip("a", 8, 1, 2, 10.0)]), &BTreeMap::new()).await.unwrap();
        w.write("b2", &summary(vec![trip("b", 8, 1, 2, 10.0)]), &BTreeMap::new()).await.unwrap();
        let hourly = store.hgetall("metrics:2024-09-03:hourly:trips").await.unwrap();
        assert_eq!(hourly["8"], "1");
        assert_eq!(store.get("metrics:2024-09-03:trips").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn journaled_ops_are_skipped_on_redelivery() {
        let (store, w) = writer();
        let s    = summary(vec![trip("a", 8, 10, 20, 10.0)]);
        let plan = w.plan(&s);
        let fp   = plan_fingerprint(&plan);
        w.record("b1", &fp, &BTreeSet::from([0])).await;

        let r = w.write("b1", &s, &BTreeMap::new()).await.unwrap();
        assert_eq!(r.skipped, 1);
        assert_eq!(r.applied, plan.len() - 1);
        // op 0 is the trips counter
        assert_eq!(store.get("metrics:2024-09-03:trips").await.unwrap(), None);
    }

    #[tokio::test]
    async fn store_journal_survives_restart() {
        let (store, w) = writer();
        let s  = summary(vec![trip("a", 8, 10, 20, 10.0)]);
        let fp = plan_fingerprint(&w.plan(&s));
        w.record("b1", &fp, &BTreeSet::from([0, 1])).await;

        let restarted = StoreWriter::new(store.clone(), WriterConfig::default(), "memory");
        assert_eq!(restarted.journaled("b1", &fp).await, BTreeSet::from([0, 1]));
        assert!(restarted.journaled("b1", "other-plan").await.is_empty());
    }

    #[tokio::test]
    async fn bad_offset_entries_are_decode_errors() {
        let (store, w) = writer();
        store.hset("ingest:offsets:memory", &[("zero".into(), "1".into())]).await.unwrap();
        assert!(matches!(
            w.load_offsets().await,
            Err(WriteError::Offsets(StoreError::Decode { .. }))
        ));
    }

    #[test]
    fn batch_id_ignores_order() {
        let a = batch_id("memory", [(0, 3), (1, 7), (0, 1)]);
        let b = batch_id("memory", [(1, 7), (0, 1), (0, 3)]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, batch_id("memory", [(0, 1), (0, 3)]));
    }

    #[test]
    fn batch_id_depends_on_source() {
        let positions = [(0, 0), (0, 1), (0, 2)];
        assert_ne!(batch_id("jsonl:/data/a.jsonl", positions), batch_id("jsonl:/data/b.jsonl", positions));
    }

    #[tokio::test]
    async fn offsets_are_kept_per_source() {
        let store = Arc::new(MemoryStore::new());
        let a = StoreWriter::new(store.clone(), WriterConfig::default(), "jsonl:/data/a.jsonl");
        let b = StoreWriter::new(store.clone(), WriterConfig::default(), "jsonl:/data/b.jsonl");
        a.write("b1", &summary(vec![trip("a", 8, 1, 2, 10.0)]), &BTreeMap::from([(0, 2)])).await.unwrap();

        assert_eq!(a.load_offsets().await.unwrap(), BTreeMap::from([(0, 2)]));
        assert!(b.load_offsets().await.unwrap().is_empty());
        assert!(store.hgetall("ingest:offsets:jsonl:/data/a.jsonl").await.unwrap().contains_key("0"));
    }

    #[test]
    fn plans_for_non_atomic_stores_hold_single_field_ops() {
        let (_, w) = writer();
        let mut cash = trip("b", 9, 10, 20, 12.0);
        cash.payment_type = 2;
        let plan = w.plan(&summary(vec![trip("a", 8, 10, 20, 10.0), cash]));

        assert!(plan.iter().all(|op| match op {
            StoreOp::HIncrBy { fields, .. } => fields.len() == 1,
            StoreOp::ZIncrBy { members, .. } => members.len() == 1,
            _ => true,
        }));
        let payments = plan.iter().filter(|op| op.key() == "stats:2024-09-03:payment_types").count();
        assert_eq!(payments, 2);
    }
}
