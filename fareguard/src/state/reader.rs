// fareguard/src/state/reader.rs
//
// Read-only view of the persisted aggregates for one date: the same queries
// a dashboard issues. Backs `fareguard snapshot`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;

use super::{Keys, SharedStore, DAILY_METRICS};
use crate::error::StoreError;
use crate::events::FraudAlert;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyMetrics {
    pub trips:        i64,
    pub revenue:      f64,
    pub fraud_alerts: i64,
    pub day_trips:    i64,
    pub night_trips:  i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub date:              NaiveDate,
    pub metrics:           DailyMetrics,
    pub hourly_trips:      BTreeMap<u32, i64>,
    pub hourly_revenue:    BTreeMap<u32, f64>,
    pub payment_types:     BTreeMap<String, i64>,
    pub vendors:           BTreeMap<String, i64>,
    pub passengers:        BTreeMap<String, i64>,
    pub total_distance:    f64,
    /// total_distance / trips of the date; 0 without trips.
    pub avg_distance:      f64,
    pub top_pickup_zones:  Vec<(String, f64)>,
    pub top_dropoff_zones: Vec<(String, f64)>,
    pub top_revenue_zones: Vec<(String, f64)>,
    pub top_fraud_zones:   Vec<(String, f64)>,
    pub top_fraud_routes:  Vec<(String, f64)>,
    /// Newest first.
    pub recent_alerts:     Vec<FraudAlert>,
}

pub struct StoreReader {
    store: SharedStore,
    keys:  Keys,
}

impl StoreReader {
    pub fn new(store: SharedStore, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub async fn snapshot(&self, date: NaiveDate, top: usize) -> Result<Snapshot, StoreError> {
        let k    = &self.keys;
        let stop = top.max(1) as isize - 1;

        let mut counters = Vec::with_capacity(DAILY_METRICS.len());
        for metric in DAILY_METRICS {
            counters.push(self.scalar::<f64>(&k.daily(date, metric)).await?);
        }
        let metrics = DailyMetrics {
            trips:        counters[0] as i64,
            revenue:      counters[1],
            fraud_alerts: counters[2] as i64,
            day_trips:    counters[3] as i64,
            night_trips:  counters[4] as i64,
        };

        let total_distance: f64 = self.scalar(&k.day_stat(date, "total_distance")).await?;
        let avg_distance = if metrics.trips > 0 { total_distance / metrics.trips as f64 } else { 0.0 };

        let alert_key = k.alerts(date);
        let recent_alerts = self.store.lrange(&alert_key, 0, -1).await?
            .iter()
            .map(|raw| serde_json::from_str::<FraudAlert>(raw).map_err(|e| StoreError::Decode {
                key:    alert_key.clone(),
                reason: e.to_string(),
            }))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Snapshot {
            date,
            metrics,
            hourly_trips:      self.hash(&k.hourly(date, "trips")).await?,
            hourly_revenue:    self.hash(&k.hourly(date, "revenue")).await?,
            payment_types:     self.hash(&k.day_stat(date, "payment_types")).await?,
            vendors:           self.hash(&k.day_stat(date, "vendors")).await?,
            passengers:        self.hash(&k.day_stat(date, "passengers")).await?,
            total_distance,
            avg_distance,
            top_pickup_zones:  self.store.zrevrange_withscores(&k.pickup_zones(), 0, stop).await?,
            top_dropoff_zones: self.store.zrevrange_withscores(&k.dropoff_zones(), 0, stop).await?,
            top_revenue_zones: self.store.zrevrange_withscores(&k.revenue_by_zone(), 0, stop).await?,
            top_fraud_zones:   self.store.zrevrange_withscores(&k.fraud_by_zone(), 0, stop).await?,
            top_fraud_routes:  self.store.zrevrange_withscores(&k.fraud_by_route(), 0, stop).await?,
            recent_alerts,
        })
    }

    /// Missing key reads as zero.
    async fn scalar<T: FromStr + Default>(&self, key: &str) -> Result<T, StoreError> {
        match self.store.get(key).await? {
            None => Ok(T::default()),
            Some(raw) => raw.parse().map_err(|_| decode(key, &raw)),
        }
    }

    async fn hash<F: FromStr + Ord, V: FromStr>(&self, key: &str) -> Result<BTreeMap<F, V>, StoreError> {
        self.store.hgetall(key).await?
            .into_iter()
            .map(|(f, v)| match (f.parse::<F>(), v.parse::<V>()) {
                (Ok(f), Ok(v)) => Ok((f, v)),
                _ => Err(decode(key, &format!("{}={}", f, v))),
            })
            .collect()
    }
}

fn decode(key: &str, raw: &str) -> StoreError {
    StoreError::Decode { key: key.to_string(), reason: format!("unexpected value {:?}", raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::state::memory::MemoryStore;
    use crate::state::StateStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 3).unwrap()
    }

    #[tokio::test]
    async fn empty_store_reads_as_zero() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let snap = StoreReader::new(store, Keys::default()).snapshot(date(), 5).await.unwrap();
        assert_eq!(snap.metrics, DailyMetrics::default());
        assert!(snap.hourly_trips.is_empty());
        assert_eq!(snap.avg_distance, 0.0);
        assert!(snap.recent_alerts.is_empty());
    }

    #[tokio::test]
    async fn reads_counters_and_rankings() {
        let mem = Arc::new(MemoryStore::new());
        mem.incr_by("metrics:2024-09-03:trips", 3).await.unwrap();
        mem.incr_by_float("metrics:2024-09-03:revenue", 42.5).await.unwrap();
        mem.incr_by_float("stats:2024-09-03:total_distance", 7.5).await.unwrap();
        mem.hset("metrics:2024-09-03:hourly:trips", &[("8".into(), "3".into())]).await.unwrap();
        for (zone, n) in [("161", 4.0), ("237", 9.0), ("48", 1.0)] {
            mem.zincr_by("stats:pickup_zones", zone, n).await.unwrap();
        }

        let snap = StoreReader::new(mem, Keys::default()).snapshot(date(), 2).await.unwrap();
        assert_eq!(snap.metrics.trips, 3);
        assert_eq!(snap.metrics.revenue, 42.5);
        assert_eq!(snap.total_distance, 7.5);
        assert_eq!(snap.avg_distance, 2.5);
        assert_eq!(snap.hourly_trips[&8], 3);
        assert_eq!(snap.top_pickup_zones, vec![("237".into(), 9.0), ("161".into(), 4.0)]);
    }

    #[tokio::test]
    async fn garbage_counter_is_a_decode_error() {
        let mem = Arc::new(MemoryStore::new());
        mem.hset("metrics:2024-09-03:hourly:trips", &[("eight".into(), "3".into())]).await.unwrap();
        let err = StoreReader::new(mem, Keys::default()).snapshot(date(), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
