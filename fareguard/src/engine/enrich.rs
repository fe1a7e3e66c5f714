// fareguard/src/engine/enrich.rs
//
// Feature enricher — TripEvent → EnrichedTrip.
// Pure and total: malformed input degrades to zeros, never to an error.

use chrono::Timelike;

use crate::events::{EnrichedTrip, TripEvent};

// Night window in pickup-local hours: [22:00, 06:00)
const NIGHT_START: u32 = 22;
const NIGHT_END:   u32 = 6;

pub fn enrich(trip: TripEvent) -> EnrichedTrip {
    let duration_min = match (trip.pickup_at, trip.dropoff_at) {
        (Some(p), Some(d)) => finite((d - p).num_milliseconds() as f64 / 60_000.0),
        _ => 0.0,
    };

    // distance * 60 / minutes keeps whole-minute trips exact (5mi in 3min = 100.0)
    let speed_mph = if duration_min > 0.0 {
        finite(trip.trip_distance * 60.0 / duration_min)
    } else {
        0.0
    };

    let fare_per_mile = if trip.trip_distance > 0.0 {
        finite(trip.fare_amount / trip.trip_distance)
    } else {
        0.0
    };

    let tip_pct = if trip.fare_amount > 0.0 {
        finite(trip.tip_amount / trip.fare_amount * 100.0)
    } else {
        0.0
    };

    let (pickup_hour, pickup_date, is_night) = match trip.pickup_at {
        Some(p) => {
            let h = p.hour();
            (h, Some(p.date()), is_night_hour(h))
        }
        None => (0, None, false),
    };

    EnrichedTrip {
        trip,
        duration_min,
        speed_mph,
        pickup_hour,
        pickup_date,
        is_night,
        fare_per_mile,
        tip_pct,
    }
}

pub fn is_night_hour(hour: u32) -> bool {
    hour >= NIGHT_START || hour < NIGHT_END
}

fn finite(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_timestamp;

    fn trip(pickup: &str, dropoff: &str, distance: f64, fare: f64, tip: f64) -> TripEvent {
        TripEvent {
            pickup_at: parse_timestamp(pickup),
            dropoff_at: parse_timestamp(dropoff),
            trip_distance: distance,
            fare_amount: fare,
            tip_amount: tip,
            ..TripEvent::default()
        }
    }

    #[test]
    fn derives_basic_features() {
        let e = enrich(trip("2024-09-03T12:00:00", "2024-09-03T12:10:00", 2.0, 10.0, 2.5));
        assert_eq!(e.duration_min, 10.0);
        assert_eq!(e.speed_mph, 12.0);
        assert_eq!(e.fare_per_mile, 5.0);
        assert_eq!(e.tip_pct, 25.0);
        assert_eq!(e.pickup_hour, 12);
        assert!(!e.is_night);
        assert_eq!(e.pickup_date, chrono::NaiveDate::from_ymd_opt(2024, 9, 3));
    }

    #[test]
    fn zero_distance_yields_zero_speed_and_rate() {
        let e = enrich(trip("2024-09-03T12:00:00", "2024-09-03T12:10:00", 0.0, 10.0, 0.0));
        assert_eq!(e.speed_mph, 0.0);
        assert_eq!(e.fare_per_mile, 0.0);
    }

    #[test]
    fn non_positive_duration_yields_zero_speed() {
        let zero = enrich(trip("2024-09-03T12:00:00", "2024-09-03T12:00:00", 3.0, 10.0, 0.0));
        assert_eq!(zero.duration_min, 0.0);
        assert_eq!(zero.speed_mph, 0.0);

        let negative = enrich(trip("2024-09-03T12:10:00", "2024-09-03T12:00:00", 3.0, 10.0, 0.0));
        assert_eq!(negative.duration_min, -10.0);
        assert_eq!(negative.speed_mph, 0.0);
    }

    #[test]
    fn invalid_timestamps_default() {
        let e = enrich(trip("garbage", "2024-09-03T12:00:00", 3.0, 10.0, 0.0));
        assert_eq!(e.duration_min, 0.0);
        assert_eq!(e.speed_mph, 0.0);
        assert_eq!(e.pickup_hour, 0);
        assert_eq!(e.pickup_date, None);
        assert!(!e.is_night);
    }

    #[test]
    fn tip_pct_zero_without_positive_fare() {
        assert_eq!(enrich(trip("", "", 1.0, 0.0, 5.0)).tip_pct, 0.0);
        assert_eq!(enrich(trip("", "", 1.0, -4.0, 5.0)).tip_pct, 0.0);
    }

    #[test]
    fn night_window_boundaries() {
        assert!(is_night_hour(22));
        assert!(is_night_hour(23));
        assert!(is_night_hour(0));
        assert!(is_night_hour(5));
        assert!(!is_night_hour(6));
        assert!(!is_night_hour(21));
    }

    #[test]
    fn speed_at_threshold_is_exact() {
        let at = enrich(trip("2024-09-03T12:00:00", "2024-09-03T12:03:00", 5.0, 10.0, 0.0));
        assert_eq!(at.speed_mph, 100.0);

        let over = enrich(trip("2024-09-03T12:00:00", "2024-09-03T12:02:54", 5.0, 10.0, 0.0));
        assert!(over.speed_mph > 103.0 && over.speed_mph < 104.0);
    }
}
