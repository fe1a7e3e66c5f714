// fareguard/src/state/mod.rs
//
// Shared aggregate store.
//
//   StateStore — the Redis-shaped primitive surface (strings, hashes, sorted
//                sets, lists). RedisStore and MemoryStore implement it.
//   StoreOp    — one per-key mutation of a write plan. `apply` executes it;
//                RedisStore runs it as one MULTI/EXEC. Stores without
//                atomic apply get plans split into single-field ops.
//   Keys       — key layout, shared by writer and reader.
//
// Key layout (optional prefix in front of every key):
//   metrics:{date}:trips|revenue|fraud_alerts|day_trips|night_trips  counters, TTL
//   metrics:{date}:hourly:trips|revenue                              hash hour → value, TTL
//   fraud:alerts:{date}                                              list of alert JSON, TTL
//   fraud:by_zone, fraud:by_route                                    sorted sets
//   stats:pickup_zones|dropoff_zones|revenue_by_zone                 sorted sets
//   stats:{date}:payment_types|vendors|passengers                    hash counters, TTL
//   stats:{date}:total_distance                                      float counter, TTL
//   ingest:offsets:{source_id}                                       hash partition → offset
//   ingest:journal:{batch_id}                                        hash op index → "1", TTL

pub mod memory;
pub mod reader;
pub mod retry;
pub mod writer;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use tracing::warn;

use crate::error::StoreError;

pub type SharedStore = Arc<dyn StateStore>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError>;
    /// Highest score first; ties by member, descending. Inclusive bounds,
    /// negative indexes count from the end.
    async fn zrevrange_withscores(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<(String, f64)>, StoreError>;
    /// Pushes each value to the head in turn; returns the new length.
    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    /// Execute one plan op. The writer retries a failed op as a whole, so
    /// an implementation either lands the op all-or-nothing and says so via
    /// `atomic_apply`, or receives single-field ops only.
    async fn apply(&self, op: &StoreOp) -> Result<(), StoreError> {
        apply_primitives(self, op).await
    }

    /// True when `apply` lands a multi-field op all-or-nothing.
    fn atomic_apply(&self) -> bool {
        false
    }
}

/// Runs `op` as its mutation followed by housekeeping (LTRIM, EXPIRE).
/// Once the mutation landed, a housekeeping failure is logged and the op
/// still succeeds: retrying it would repeat the mutation. The next write to
/// the key trims and refreshes it again.
pub async fn apply_primitives<S: StateStore + ?Sized>(store: &S, op: &StoreOp) -> Result<(), StoreError> {
    match op {
        StoreOp::IncrBy { key, delta, .. } => {
            store.incr_by(key, *delta).await?;
        }
        StoreOp::IncrByFloat { key, delta, .. } => {
            store.incr_by_float(key, *delta).await?;
        }
        StoreOp::HSet { key, fields, .. } => {
            store.hset(key, fields).await?;
        }
        StoreOp::HIncrBy { key, fields, .. } => {
            for (field, delta) in fields {
                store.hincr_by(key, field, *delta).await?;
            }
        }
        StoreOp::PushCapped { key, values, cap, .. } => {
            store.lpush(key, values).await?;
            if let Err(e) = store.ltrim(key, 0, *cap as isize - 1).await {
                warn!(key = %key, error = %e, "LTRIM after push failed");
            }
        }
        StoreOp::ZIncrBy { key, members } => {
            for (member, delta) in members {
                store.zincr_by(key, member, *delta).await?;
            }
        }
    }
    if let Some(secs) = op.ttl() {
        if let Err(e) = store.expire(op.key(), secs).await {
            warn!(key = %op.key(), error = %e, "TTL refresh failed");
        }
    }
    Ok(())
}

// ── Write plan operations ─────────────────────────────────────────────────────

/// One mutation of a single key. Ops never span keys, so each one can be
/// retried and journaled on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    IncrBy      { key: String, delta: i64, ttl: Option<u64> },
    IncrByFloat { key: String, delta: f64, ttl: Option<u64> },
    /// Overwrites the given fields; other fields are untouched.
    HSet        { key: String, fields: Vec<(String, String)>, ttl: Option<u64> },
    HIncrBy     { key: String, fields: Vec<(String, i64)>, ttl: Option<u64> },
    /// LPUSH values in order, then keep only the newest `cap`.
    PushCapped  { key: String, values: Vec<String>, cap: usize, ttl: Option<u64> },
    ZIncrBy     { key: String, members: Vec<(String, f64)> },
}

impl StoreOp {
    pub fn key(&self) -> &str {
        match self {
            Self::IncrBy { key, .. }
            | Self::IncrByFloat { key, .. }
            | Self::HSet { key, .. }
            | Self::HIncrBy { key, .. }
            | Self::PushCapped { key, .. }
            | Self::ZIncrBy { key, .. } => key,
        }
    }

    pub fn ttl(&self) -> Option<u64> {
        match self {
            Self::IncrBy { ttl, .. }
            | Self::IncrByFloat { ttl, .. }
            | Self::HSet { ttl, .. }
            | Self::HIncrBy { ttl, .. }
            | Self::PushCapped { ttl, .. } => *ttl,
            Self::ZIncrBy { .. } => None,
        }
    }

    /// One op per HINCRBY field / ZINCRBY member; other ops unchanged.
    /// Each result carries at most one non-idempotent mutation.
    pub fn split(self) -> Vec<StoreOp> {
        match self {
            Self::HIncrBy { key, fields, ttl } if fields.len() > 1 => fields
                .into_iter()
                .map(|f| Self::HIncrBy { key: key.clone(), fields: vec![f], ttl })
                .collect(),
            Self::ZIncrBy { key, members } if members.len() > 1 => members
                .into_iter()
                .map(|m| Self::ZIncrBy { key: key.clone(), members: vec![m] })
                .collect(),
            op => vec![op],
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::IncrBy { .. } => "INCRBY",
            Self::IncrByFloat { .. } => "INCRBYFLOAT",
            Self::HSet { .. } => "HSET",
            Self::HIncrBy { .. } => "HINCRBY",
            Self::PushCapped { .. } => "LPUSH",
            Self::ZIncrBy { .. } => "ZINCRBY",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command(), self.key())
    }
}

// ── Key layout ────────────────────────────────────────────────────────────────

pub const DAILY_METRICS: &[&str] = &["trips", "revenue", "fraud_alerts", "day_trips", "night_trips"];

#[derive(Debug, Clone, Default)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn key(&self, rest: fmt::Arguments<'_>) -> String {
        format!("{}{}", self.prefix, rest)
    }

    pub fn daily(&self, date: NaiveDate, metric: &str) -> String {
        self.key(format_args!("metrics:{}:{}", date, metric))
    }

    pub fn hourly(&self, date: NaiveDate, metric: &str) -> String {
        self.key(format_args!("metrics:{}:hourly:{}", date, metric))
    }

    pub fn alerts(&self, date: NaiveDate) -> String {
        self.key(format_args!("fraud:alerts:{}", date))
    }

    pub fn fraud_by_zone(&self) -> String {
        self.key(format_args!("fraud:by_zone"))
    }

    pub fn fraud_by_route(&self) -> String {
        self.key(format_args!("fraud:by_route"))
    }

    pub fn pickup_zones(&self) -> String {
        self.key(format_args!("stats:pickup_zones"))
    }

    pub fn dropoff_zones(&self) -> String {
        self.key(format_args!("stats:dropoff_zones"))
    }

    pub fn revenue_by_zone(&self) -> String {
        self.key(format_args!("stats:revenue_by_zone"))
    }

    /// `stats:{date}:payment_types|vendors|passengers|total_distance`
    pub fn day_stat(&self, date: NaiveDate, name: &str) -> String {
        self.key(format_args!("stats:{}:{}", date, name))
    }

    /// Committed positions are scoped to the source they were read from.
    pub fn offsets(&self, source_id: &str) -> String {
        self.key(format_args!("ingest:offsets:{}", source_id))
    }

    pub fn journal(&self, batch_id: &str) -> String {
        self.key(format_args!("ingest:journal:{}", batch_id))
    }
}

pub fn route_member(pickup_zone: u32, dropoff_zone: u32) -> String {
    format!("{}->{}", pickup_zone, dropoff_zone)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 3).unwrap()
    }

    #[test]
    fn key_layout() {
        let k = Keys::default();
        assert_eq!(k.daily(d(), "trips"), "metrics:2024-09-03:trips");
        assert_eq!(k.hourly(d(), "revenue"), "metrics:2024-09-03:hourly:revenue");
        assert_eq!(k.alerts(d()), "fraud:alerts:2024-09-03");
        assert_eq!(k.day_stat(d(), "vendors"), "stats:2024-09-03:vendors");
        assert_eq!(k.journal("ab12"), "ingest:journal:ab12");
        assert_eq!(route_member(132, 48), "132->48");
    }

    #[test]
    fn prefix_applies_to_every_key() {
        let k = Keys::new("staging:");
        assert_eq!(k.fraud_by_zone(), "staging:fraud:by_zone");
        assert_eq!(k.offsets("kafka:trips/g1"), "staging:ingest:offsets:kafka:trips/g1");
    }

    #[test]
    fn op_description() {
        let op = StoreOp::ZIncrBy { key: "fraud:by_route".into(), members: vec![] };
        assert_eq!(op.to_string(), "ZINCRBY fraud:by_route");
        assert_eq!(op.key(), "fraud:by_route");
    }

    #[test]
    fn split_leaves_one_increment_per_op() {
        let op = StoreOp::HIncrBy {
            key:    "stats:2024-09-03:payment_types".into(),
            fields: vec![("1".into(), 2), ("2".into(), 1)],
            ttl:    Some(60),
        };
        assert_eq!(op.split(), vec![
            StoreOp::HIncrBy { key: "stats:2024-09-03:payment_types".into(), fields: vec![("1".into(), 2)], ttl: Some(60) },
            StoreOp::HIncrBy { key: "stats:2024-09-03:payment_types".into(), fields: vec![("2".into(), 1)], ttl: Some(60) },
        ]);

        let z = StoreOp::ZIncrBy { key: "fraud:by_zone".into(), members: vec![("48".into(), 1.0), ("79".into(), 2.0)] };
        assert_eq!(z.split().len(), 2);

        let push = StoreOp::PushCapped { key: "fraud:alerts:2024-09-03".into(), values: vec!["a".into(), "b".into()], cap: 100, ttl: None };
        assert_eq!(push.clone().split(), vec![push]);
    }
}
