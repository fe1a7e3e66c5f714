// fareguard/src/engine/scorer.rs
//
// Deterministic rule-based fraud scoring.
//
// Every rule is independent: a predicate over one EnrichedTrip, a fixed point
// value and at most one flag. Score = min(sum of triggered points, 100).
// Table order decides flag order only.
//
//   impossible_speed          30   speed > 100 mph
//   stationary_trip           25   speed < 2 mph for more than 10 minutes
//   zero_distance_with_fare   20   0 miles but a positive fare
//   fare_too_high             20   more than $10.50 per mile
//   negative_fare             15   fare < 0
//   tip_exceeds_fare          25   card tip larger than the fare
//   excessive_tip             15   card tip above 50%
//   same_location_high_fare   25   PU == DO zone with fare > $5
//   fake_airport_fee          20   airport fee outside the airport zones
//   too_many_passengers       15   more than 6 riders
//   zero_passengers           10   0 riders but a positive fare
//   (night)                    5   pickup in [22:00, 06:00)
//   night_cash_trip           10   night + cash
//   night_high_tip            10   night + tip above 30%
//   fake_jfk_rate             20   JFK flat rate with neither end at JFK
//   voided_trip               20   payment type voided
//   disputed_trip             10   payment type disputed

use crate::events::{EnrichedTrip, FraudAssessment, FraudFlag, PaymentType};

pub const MAX_SCORE: u32 = 100;

/// TLC zones that legitimately charge the airport fee (JFK, LaGuardia).
pub const AIRPORT_ZONES: &[u32] = &[132, 138];
pub const JFK_ZONE: u32 = 132;
/// RatecodeID 2: negotiated flat fare to/from JFK.
pub const JFK_FLAT_RATE: u32 = 2;

#[derive(Clone, Copy)]
pub struct Rule {
    pub name:    &'static str,
    pub points:  u32,
    pub flag:    Option<FraudFlag>,
    pub applies: fn(&EnrichedTrip) -> bool,
}

pub static RULES: &[Rule] = &[
    Rule { name: "impossible_speed",        points: 30, flag: Some(FraudFlag::ImpossibleSpeed),      applies: impossible_speed },
    Rule { name: "stationary_trip",         points: 25, flag: Some(FraudFlag::StationaryTrip),       applies: stationary_trip },
    Rule { name: "zero_distance_with_fare", points: 20, flag: Some(FraudFlag::ZeroDistanceWithFare), applies: zero_distance_with_fare },
    Rule { name: "fare_too_high",           points: 20, flag: Some(FraudFlag::FareTooHigh),          applies: fare_too_high },
    Rule { name: "negative_fare",           points: 15, flag: Some(FraudFlag::NegativeFare),         applies: negative_fare },
    Rule { name: "tip_exceeds_fare",        points: 25, flag: Some(FraudFlag::TipExceedsFare),       applies: tip_exceeds_fare },
    Rule { name: "excessive_tip",           points: 15, flag: Some(FraudFlag::ExcessiveTip),         applies: excessive_tip },
    Rule { name: "same_location_high_fare", points: 25, flag: Some(FraudFlag::SameLocationHighFare), applies: same_location_high_fare },
    Rule { name: "fake_airport_fee",        points: 20, flag: Some(FraudFlag::FakeAirportFee),       applies: fake_airport_fee },
    Rule { name: "too_many_passengers",     points: 15, flag: Some(FraudFlag::TooManyPassengers),    applies: too_many_passengers },
    Rule { name: "zero_passengers",         points: 10, flag: Some(FraudFlag::ZeroPassengers),       applies: zero_passengers },
    Rule { name: "night",                   points: 5,  flag: None,                                  applies: night },
    Rule { name: "night_cash_trip",         points: 10, flag: Some(FraudFlag::NightCashTrip),        applies: night_cash_trip },
    Rule { name: "night_high_tip",          points: 10, flag: Some(FraudFlag::NightHighTip),         applies: night_high_tip },
    Rule { name: "fake_jfk_rate",           points: 20, flag: Some(FraudFlag::FakeJfkRate),          applies: fake_jfk_rate },
    Rule { name: "voided_trip",             points: 20, flag: Some(FraudFlag::VoidedTrip),           applies: voided_trip },
    Rule { name: "disputed_trip",           points: 10, flag: Some(FraudFlag::DisputedTrip),         applies: disputed_trip },
];

pub fn assess(trip: &EnrichedTrip) -> FraudAssessment {
    let mut points = 0u32;
    let mut flags  = Vec::new();

    for rule in RULES.iter().filter(|r| (r.applies)(trip)) {
        points += rule.points;
        if let Some(flag) = rule.flag {
            flags.push(flag);
        }
    }

    FraudAssessment {
        score: points.min(MAX_SCORE) as u8,
        flags,
    }
}

/// Rules that fired for a trip, in table order. Used by `score --explain`.
pub fn explain(trip: &EnrichedTrip) -> Vec<&'static Rule> {
    RULES.iter().filter(|r| (r.applies)(trip)).collect()
}

// ── Predicates ────────────────────────────────────────────────────────────────

fn impossible_speed(t: &EnrichedTrip) -> bool {
    t.speed_mph > 100.0
}

fn stationary_trip(t: &EnrichedTrip) -> bool {
    t.speed_mph < 2.0 && t.duration_min > 10.0
}

fn zero_distance_with_fare(t: &EnrichedTrip) -> bool {
    t.trip.trip_distance == 0.0 && t.trip.fare_amount > 0.0
}

fn fare_too_high(t: &EnrichedTrip) -> bool {
    t.fare_per_mile > 10.5
}

fn negative_fare(t: &EnrichedTrip) -> bool {
    t.trip.fare_amount < 0.0
}

fn tip_exceeds_fare(t: &EnrichedTrip) -> bool {
    t.payment() == PaymentType::Card && t.trip.tip_amount > t.trip.fare_amount
}

fn excessive_tip(t: &EnrichedTrip) -> bool {
    t.payment() == PaymentType::Card && t.tip_pct > 50.0
}

fn same_location_high_fare(t: &EnrichedTrip) -> bool {
    t.trip.pickup_zone == t.trip.dropoff_zone && t.trip.fare_amount > 5.0
}

fn fake_airport_fee(t: &EnrichedTrip) -> bool {
    t.trip.airport_fee > 0.0 && !AIRPORT_ZONES.contains(&t.trip.pickup_zone)
}

fn too_many_passengers(t: &EnrichedTrip) -> bool {
    t.trip.passenger_count > 6
}

fn zero_passengers(t: &EnrichedTrip) -> bool {
    t.trip.passenger_count == 0 && t.trip.fare_amount > 0.0
}

fn night(t: &EnrichedTrip) -> bool {
    t.is_night
}

fn night_cash_trip(t: &EnrichedTrip) -> bool {
    t.is_night && t.payment() == PaymentType::Cash
}

fn night_high_tip(t: &EnrichedTrip) -> bool {
    t.is_night && t.tip_pct > 30.0
}

fn fake_jfk_rate(t: &EnrichedTrip) -> bool {
    t.trip.rate_code == JFK_FLAT_RATE
        && t.trip.pickup_zone != JFK_ZONE
        && t.trip.dropoff_zone != JFK_ZONE
}

fn voided_trip(t: &EnrichedTrip) -> bool {
    t.payment() == PaymentType::Voided
}

fn disputed_trip(t: &EnrichedTrip) -> bool {
    t.payment() == PaymentType::Dispute
}
