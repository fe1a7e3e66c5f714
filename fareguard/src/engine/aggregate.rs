// fareguard/src/engine/aggregate.rs
//
// Micro-batch aggregation.
//
// Two steps, both single-threaded and deterministic:
//   1. dedup()  — the at-least-once boundary. Drops deliveries at or below the
//                 committed offset of their partition, and repeated trip ids
//                 inside one batch.
//   2. fold()   — ScoredTrip slice → BatchSummary, partitioned by pickup date
//                 so late trips land on the day they happened.
//
// Money and distance are summed as integers (cents / hundredths of a mile):
// integer addition is associative, so any event order yields identical totals
// and therefore identical zone rankings.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::events::{FraudAlert, ScoredTrip};
use crate::source::Delivery;

pub const DEFAULT_FRAUD_THRESHOLD: u8 = 50;

pub fn to_cents(amount: f64) -> i64 {
    if amount.is_finite() { (amount * 100.0).round() as i64 } else { 0 }
}

pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

// ── Summary types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourBucket {
    pub trips:         u64,
    pub revenue_cents: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneDelta {
    pub pickups:       u64,
    pub dropoffs:      u64,
    pub revenue_cents: i64,
}

/// Everything attributed to one pickup date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaySummary {
    pub trips:               u64,
    pub revenue_cents:       i64,
    pub fraud_alerts:        u64,
    pub day_trips:           u64,
    pub night_trips:         u64,
    pub hourly:              BTreeMap<u32, HourBucket>,
    pub payment_types:       BTreeMap<u32, u64>,
    pub vendors:             BTreeMap<u32, u64>,
    pub passengers:          BTreeMap<u32, u64>,
    pub distance_hundredths: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub trip_count:    u64,
    pub revenue_cents: i64,
    pub fraud_count:   u64,
    pub day_trips:     u64,
    pub night_trips:   u64,
    pub zones:         BTreeMap<u32, ZoneDelta>,
    pub fraud_zones:   BTreeMap<u32, u64>,
    pub fraud_routes:  BTreeMap<(u32, u32), u64>,
    /// One per trip at or above the threshold, in batch arrival order.
    pub alerts:        Vec<FraudAlert>,
    pub days:          BTreeMap<NaiveDate, DaySummary>,
}

impl BatchSummary {
    pub fn is_empty(&self) -> bool {
        self.trip_count == 0
    }

    pub fn total_revenue(&self) -> f64 {
        from_cents(self.revenue_cents)
    }

    /// Per-hour totals across every date in the batch.
    pub fn hourly(&self) -> BTreeMap<u32, HourBucket> {
        let mut out: BTreeMap<u32, HourBucket> = BTreeMap::new();
        for day in self.days.values() {
            for (hour, b) in &day.hourly {
                let e = out.entry(*hour).or_default();
                e.trips += b.trips;
                e.revenue_cents += b.revenue_cents;
            }
        }
        out
    }
}

// ── Dedup boundary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub already_committed: usize,
    pub repeated_trip_ids: usize,
}

impl DedupStats {
    pub fn dropped(&self) -> usize {
        self.already_committed + self.repeated_trip_ids
    }
}

pub fn dedup(
    deliveries: Vec<Delivery>,
    committed:  &BTreeMap<i32, i64>,
) -> (Vec<Delivery>, DedupStats) {
    let mut stats    = DedupStats::default();
    let mut seen_ids = HashSet::new();
    let mut kept     = Vec::with_capacity(deliveries.len());

    for d in deliveries {
        if committed.get(&d.partition).is_some_and(|c| d.offset <= *c) {
            stats.already_committed += 1;
            continue;
        }
        if let Some(ev) = &d.event {
            // Trips without an id cannot be matched; keep them.
            if !ev.trip_id.is_empty() && !seen_ids.insert(ev.trip_id.clone()) {
                stats.repeated_trip_ids += 1;
                continue;
            }
        }
        kept.push(d);
    }
    (kept, stats)
}

// ── Fold ──────────────────────────────────────────────────────────────────────

pub struct Aggregator {
    threshold: u8,
}

impl Aggregator {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn is_fraud(&self, trip: &ScoredTrip) -> bool {
        trip.assessment.score >= self.threshold
    }

    /// `fallback_date` attributes trips that carry neither a valid pickup
    /// timestamp nor a receipt stamp.
    pub fn fold(&self, trips: &[ScoredTrip], fallback_date: NaiveDate) -> BatchSummary {
        let mut s = BatchSummary::default();

        for t in trips {
            let e       = &t.enriched;
            let raw     = &e.trip;
            let revenue = to_cents(raw.total_amount);
            let date    = e.pickup_date
                .or_else(|| raw.received_at.map(|r| r.date()))
                .unwrap_or(fallback_date);
            let fraud   = self.is_fraud(t);

            s.trip_count    += 1;
            s.revenue_cents += revenue;
            if e.is_night { s.night_trips += 1; } else { s.day_trips += 1; }

            let day = s.days.entry(date).or_default();
            day.trips         += 1;
            day.revenue_cents += revenue;
            if e.is_night { day.night_trips += 1; } else { day.day_trips += 1; }
            *day.payment_types.entry(raw.payment_type).or_default() += 1;
            *day.vendors.entry(raw.vendor_id).or_default() += 1;
            *day.passengers.entry(raw.passenger_count).or_default() += 1;
            day.distance_hundredths += to_cents(raw.trip_distance);

            // No valid pickup → no meaningful hour
            if e.pickup_date.is_some() {
                let b = day.hourly.entry(e.pickup_hour).or_default();
                b.trips         += 1;
                b.revenue_cents += revenue;
            }

            let pu = s.zones.entry(raw.pickup_zone).or_default();
            pu.pickups       += 1;
            pu.revenue_cents += revenue;
            s.zones.entry(raw.dropoff_zone).or_default().dropoffs += 1;

            if fraud {
                s.fraud_count    += 1;
                day.fraud_alerts += 1;
                *s.fraud_zones.entry(raw.pickup_zone).or_default() += 1;
                *s.fraud_routes.entry((raw.pickup_zone, raw.dropoff_zone)).or_default() += 1;
                s.alerts.push(FraudAlert {
                    trip_id:      raw.trip_id.clone(),
                    fraud_score:  t.assessment.score,
                    fraud_flags:  t.assessment.flags.clone(),
                    pickup_zone:  raw.pickup_zone,
                    dropoff_zone: raw.dropoff_zone,
                    fare_amount:  raw.fare_amount,
                    is_night:     e.is_night,
                    date,
                    timestamp:    raw.pickup_at.or(raw.received_at),
                });
            }
        }
        s
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_FRAUD_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::score_trip;
    use crate::events::{parse_timestamp, TripEvent};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn trip(id: &str, pickup: &str, dropoff: &str, pu: u32, dz: u32, total: f64) -> TripEvent {
        TripEvent {
            trip_id: id.into(),
            vendor_id: 2,
            pickup_at: parse_timestamp(pickup),
            dropoff_at: parse_timestamp(dropoff),
            passenger_count: 1,
            trip_distance: 2.0,
            pickup_zone: pu,
            dropoff_zone: dz,
            payment_type: 1,
            fare_amount: 10.0,
            tip_amount: 1.0,
            total_amount: total,
            ..TripEvent::default()
        }
    }

    // 5 mi in 2.9 min (30) + same zone (25) + night (5) = 60
    fn fraud_trip(id: &str) -> TripEvent {
        TripEvent {
            trip_distance: 5.0,
            ..trip(id, "2024-09-03T23:00:00", "2024-09-03T23:02:54", 48, 48, 15.5)
        }
    }

    fn three_trip_batch() -> Vec<ScoredTrip> {
        vec![
            score_trip(trip("a", "2024-09-03T08:00:00", "2024-09-03T08:10:00", 161, 237, 14.0)),
            score_trip(fraud_trip("b")),
            score_trip(trip("c", "2024-09-03T08:30:00", "2024-09-03T08:40:00", 237, 161, 20.25)),
        ]
    }

    fn delivery(offset: i64, id: &str) -> Delivery {
        Delivery {
            partition: 0,
            offset,
            event: Some(TripEvent { trip_id: id.into(), ..TripEvent::default() }),
        }
    }

    #[test]
    fn empty_batch_is_all_zero() {
        let s = Aggregator::default().fold(&[], date("2024-09-03"));
        assert!(s.is_empty());
        assert_eq!(s, BatchSummary::default());
    }

    #[test]
    fn one_fraud_trip_in_three() {
        let trips = three_trip_batch();
        assert_eq!(trips[1].assessment.score, 60);

        let s = Aggregator::default().fold(&trips, date("2024-09-03"));
        assert_eq!(s.trip_count, 3);
        assert_eq!(s.fraud_count, 1);
        assert_eq!(s.alerts.len(), 1);
        assert_eq!(s.alerts[0].trip_id, "b");
        assert_eq!(s.fraud_zones.get(&48), Some(&1));
        assert_eq!(s.fraud_routes.get(&(48, 48)), Some(&1));
        assert_eq!(s.revenue_cents, 1400 + 1550 + 2025);
        assert_eq!(s.total_revenue(), 49.75);
        assert_eq!((s.day_trips, s.night_trips), (2, 1));
    }

    #[test]
    fn threshold_is_inclusive() {
        let trips = three_trip_batch();
        assert_eq!(Aggregator::new(60).fold(&trips, date("2024-09-03")).fraud_count, 1);
        assert_eq!(Aggregator::new(61).fold(&trips, date("2024-09-03")).fraud_count, 0);
    }

    #[test]
    fn hourly_groups_by_pickup_hour() {
        let s = Aggregator::default().fold(&three_trip_batch(), date("2030-01-01"));
        let hourly = s.hourly();
        assert_eq!(hourly[&8], HourBucket { trips: 2, revenue_cents: 3425 });
        assert_eq!(hourly[&23], HourBucket { trips: 1, revenue_cents: 1550 });
        assert_eq!(hourly.len(), 2);
    }

    #[test]
    fn late_trips_land_on_their_pickup_date() {
        let trips = vec![
            score_trip(trip("x", "2024-09-02T21:00:00", "2024-09-02T21:10:00", 1, 2, 10.0)),
            score_trip(trip("y", "2024-09-03T09:00:00", "2024-09-03T09:10:00", 1, 2, 12.0)),
        ];
        let s = Aggregator::default().fold(&trips, date("2024-09-10"));
        assert_eq!(s.days.len(), 2);
        assert_eq!(s.days[&date("2024-09-02")].trips, 1);
        assert_eq!(s.days[&date("2024-09-03")].trips, 1);
        assert!(!s.days.contains_key(&date("2024-09-10")));
    }

    #[test]
    fn invalid_pickup_falls_back_to_receipt_then_processing_date() {
        let mut received = trip("r", "bad", "bad", 1, 2, 5.0);
        received.received_at = parse_timestamp("2024-09-05T00:00:01");
        let unknown = trip("u", "bad", "bad", 1, 2, 5.0);

        let s = Aggregator::default().fold(
            &[score_trip(received), score_trip(unknown)],
            date("2024-09-07"),
        );
        assert_eq!(s.days[&date("2024-09-05")].trips, 1);
        assert_eq!(s.days[&date("2024-09-07")].trips, 1);
        assert!(s.hourly().is_empty());
    }

    #[test]
    fn aggregation_is_order_independent() {
        let mut trips = three_trip_batch();
        trips.push(score_trip(trip("d", "2024-09-03T10:00:00", "2024-09-03T10:09:00", 161, 48, 0.1)));
        trips.push(score_trip(trip("e", "2024-09-03T10:00:00", "2024-09-03T10:09:00", 237, 48, 0.2)));
        let agg     = Aggregator::default();
        let forward = agg.fold(&trips, date("2024-09-03"));
        trips.reverse();
        let reverse = agg.fold(&trips, date("2024-09-03"));

        assert_eq!(forward.zones, reverse.zones);
        assert_eq!(forward.fraud_zones, reverse.fraud_zones);
        assert_eq!(forward.days, reverse.days);
        assert_eq!(forward.revenue_cents, reverse.revenue_cents);
    }

    #[test]
    fn distributions_are_counted_per_day() {
        let s = Aggregator::default().fold(&three_trip_batch(), date("2024-09-03"));
        let day = &s.days[&date("2024-09-03")];
        assert_eq!(day.payment_types[&1], 3);
        assert_eq!(day.vendors[&2], 3);
        assert_eq!(day.passengers[&1], 3);
        assert_eq!(day.distance_hundredths, 200 + 500 + 200);
    }

    #[test]
    fn dedup_drops_committed_offsets() {
        let committed = BTreeMap::from([(0, 1)]);
        let (kept, stats) = dedup(vec![delivery(0, "a"), delivery(1, "b"), delivery(2, "c")], &committed);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].offset, 2);
        assert_eq!(stats.already_committed, 2);
    }

    #[test]
    fn dedup_drops_repeated_trip_ids_but_not_anonymous_trips() {
        let (kept, stats) = dedup(
            vec![delivery(0, "a"), delivery(1, "a"), delivery(2, ""), delivery(3, "")],
            &BTreeMap::new(),
        );
        assert_eq!(kept.iter().map(|d| d.offset).collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(stats.repeated_trip_ids, 1);
        assert_eq!(stats.dropped(), 1);
    }

    #[test]
    fn cents_conversion() {
        assert_eq!(to_cents(20.25), 2025);
        assert_eq!(to_cents(-3.5), -350);
        assert_eq!(to_cents(f64::NAN), 0);
        assert_eq!(from_cents(2025), 20.25);
    }
}
