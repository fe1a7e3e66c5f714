// fareguard/src/state/memory.rs
//
// In-process StateStore. DashMap = sharded concurrent HashMap, one slot per
// key, with Redis semantics for the subset of commands we use: string
// counters, hashes, sorted sets, capped lists and lazy TTL expiry.
//
// Used by `--store memory` and by every test that drives the writer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::StateStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::ZSet(_) => "zset",
            Value::List(_) => "list",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value:      Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of primitive commands served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let slot = self.slots.get(key)?;
        slot.expires_at.map(|t| t.saturating_duration_since(Instant::now()))
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.iter()
            .filter(|e| !e.value().expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stable rendering of every live key, for whole-store comparisons.
    pub fn dump(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for e in self.slots.iter().filter(|e| !e.value().expired()) {
            let rendered = match &e.value().value {
                Value::Str(s) => s.clone(),
                Value::Hash(h) => format!("{:?}", h),
                Value::ZSet(z) => {
                    let sorted: BTreeMap<_, _> = z.iter().map(|(m, s)| (m.clone(), fmt_float(*s))).collect();
                    format!("{:?}", sorted)
                }
                Value::List(l) => format!("{:?}", l),
            };
            out.insert(e.key().clone(), rendered);
        }
        out
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` against the live value at `key`, creating it with `init` when
    /// absent or expired. Emptied containers are removed, like Redis does.
    fn mutate<R>(
        &self,
        key:  &str,
        init: fn() -> Value,
        f:    impl FnOnce(&mut Value) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.touch();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value:      init(),
            expires_at: None,
        });
        if slot.expired() {
            *slot = Slot { value: init(), expires_at: None };
        }
        let out = f(&mut slot.value);
        let empty = slot.value.is_empty();
        drop(slot);
        if empty {
            self.slots.remove(key);
        }
        out
    }

    fn read<R>(&self, key: &str, f: impl FnOnce(Option<&Value>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        self.touch();
        match self.slots.get(key) {
            Some(slot) if !slot.expired() => f(Some(&slot.value)),
            _ => f(None),
        }
    }
}

fn wrong_type(key: &str, found: &Value) -> StoreError {
    StoreError::Command(format!("WRONGTYPE {} holds a {}", key, found.kind()))
}

fn fmt_float(x: f64) -> String {
    format!("{}", x)
}

/// Redis inclusive range → half-open slice bounds, or None when empty.
fn bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop  = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize + 1))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(key, |v| match v {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.mutate(key, || Value::Str("0".into()), |v| match v {
            Value::Str(s) => {
                let cur: i64 = s.parse()
                    .map_err(|_| StoreError::Command("ERR value is not an integer".into()))?;
                let next = cur.checked_add(delta)
                    .ok_or_else(|| StoreError::Command("ERR increment would overflow".into()))?;
                *s = next.to_string();
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        self.mutate(key, || Value::Str("0".into()), |v| match v {
            Value::Str(s) => {
                let cur: f64 = s.parse()
                    .map_err(|_| StoreError::Command("ERR value is not a valid float".into()))?;
                let next = cur + delta;
                if !next.is_finite() {
                    return Err(StoreError::Command("ERR increment would produce NaN or Infinity".into()));
                }
                *s = fmt_float(next);
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.touch();
        if let Some(mut slot) = self.slots.get_mut(key) {
            if !slot.expired() {
                slot.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
        }
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.mutate(key, || Value::Hash(BTreeMap::new()), |v| match v {
            Value::Hash(h) => {
                for (f, val) in fields {
                    h.insert(f.clone(), val.clone());
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.mutate(key, || Value::Hash(BTreeMap::new()), |v| match v {
            Value::Hash(h) => {
                let cur: i64 = match h.get(field) {
                    Some(s) => s.parse()
                        .map_err(|_| StoreError::Command("ERR hash value is not an integer".into()))?,
                    None => 0,
                };
                let next = cur + delta;
                h.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.read(key, |v| match v {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
        self.mutate(key, || Value::ZSet(HashMap::new()), |v| match v {
            Value::ZSet(z) => {
                let score = z.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn zrevrange_withscores(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<(String, f64)>, StoreError>
    {
        self.read(key, |v| match v {
            None => Ok(Vec::new()),
            Some(Value::ZSet(z)) => {
                let mut ranked: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                Ok(match bounds(ranked.len(), start, stop) {
                    Some((lo, hi)) => ranked[lo..hi].to_vec(),
                    None => Vec::new(),
                })
            }
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        self.mutate(key, || Value::List(VecDeque::new()), |v| match v {
            Value::List(l) => {
                for val in values {
                    l.push_front(val.clone());
                }
                Ok(l.len())
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        self.mutate(key, || Value::List(VecDeque::new()), |v| match v {
            Value::List(l) => {
                match bounds(l.len(), start, stop) {
                    Some((lo, hi)) => {
                        l.truncate(hi);
                        l.drain(..lo);
                    }
                    None => l.clear(),
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.read(key, |v| match v {
            None => Ok(Vec::new()),
            Some(Value::List(l)) => Ok(match bounds(l.len(), start, stop) {
                Some((lo, hi)) => l.range(lo..hi).cloned().collect(),
                None => Vec::new(),
            }),
            Some(other) => Err(wrong_type(key, other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StoreOp;

    #[tokio::test]
    async fn counters_and_type_errors() {
        let s = MemoryStore::new();
        assert_eq!(s.incr_by("c", 3).await.unwrap(), 3);
        assert_eq!(s.incr_by("c", -1).await.unwrap(), 2);
        assert_eq!(s.get("c").await.unwrap().as_deref(), Some("2"));
        assert_eq!(s.incr_by_float("f", 1.25).await.unwrap(), 1.25);
        assert_eq!(s.get("f").await.unwrap().as_deref(), Some("1.25"));

        s.lpush("l", &["x".into()]).await.unwrap();
        assert!(matches!(s.incr_by("l", 1).await, Err(StoreError::Command(_))));
        assert_eq!(s.calls(), 7);
    }

    #[tokio::test]
    async fn zrevrange_orders_by_score_then_member() {
        let s = MemoryStore::new();
        s.zincr_by("z", "a", 2.0).await.unwrap();
        s.zincr_by("z", "b", 5.0).await.unwrap();
        s.zincr_by("z", "c", 2.0).await.unwrap();
        let top = s.zrevrange_withscores("z", 0, -1).await.unwrap();
        assert_eq!(top, vec![("b".into(), 5.0), ("c".into(), 2.0), ("a".into(), 2.0)]);
        assert_eq!(s.zrevrange_withscores("z", 0, 0).await.unwrap().len(), 1);
        assert!(s.zrevrange_withscores("missing", 0, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capped_push_keeps_newest() {
        let s = MemoryStore::new();
        for batch in 0..3 {
            let values: Vec<String> = (0..50).map(|i| format!("{}-{}", batch, i)).collect();
            s.apply(&StoreOp::PushCapped { key: "log".into(), values, cap: 100, ttl: Some(60) })
                .await
                .unwrap();
        }
        let all = s.lrange("log", 0, -1).await.unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(all[0], "2-49");
        assert_eq!(all[99], "1-0");
        assert!(s.ttl("log").is_some());
    }

    #[tokio::test]
    async fn hash_set_and_increment() {
        let s = MemoryStore::new();
        s.hset("h", &[("8".into(), "3".into())]).await.unwrap();
        s.hset("h", &[("8".into(), "1".into()), ("9".into(), "2".into())]).await.unwrap();
        s.hincr_by("h", "9", 5).await.unwrap();
        let h = s.hgetall("h").await.unwrap();
        assert_eq!(h["8"], "1");
        assert_eq!(h["9"], "7");
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let s = MemoryStore::new();
        s.incr_by("gone", 1).await.unwrap();
        s.expire("gone", 0).await.unwrap();
        assert_eq!(s.get("gone").await.unwrap(), None);
        assert!(s.keys().is_empty());
        assert_eq!(s.incr_by("gone", 4).await.unwrap(), 4);
    }

    #[test]
    fn range_bounds() {
        assert_eq!(bounds(5, 0, -1), Some((0, 5)));
        assert_eq!(bounds(5, 0, 99), Some((0, 5)));
        assert_eq!(bounds(5, -2, -1), Some((3, 5)));
        assert_eq!(bounds(5, 3, 1), None);
        assert_eq!(bounds(0, 0, -1), None);
    }
}
