// fareguard/src/events.rs
//
// Shared domain types flowing through fareguard.
//
//   TripEvent      — raw trip as published by the ingress API (wire JSON)
//   EnrichedTrip   — TripEvent + derived features (engine::enrich)
//   FraudAssessment — rule score + flags (engine::scorer)
//   ScoredTrip     — EnrichedTrip + FraudAssessment
//   FraudAlert     — one entry of the per-date alert log
//
// Field names on the wire follow the NYC TLC yellow-taxi schema, so the
// upstream producer can forward records untouched.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ── Payment types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentType {
    Card,
    Cash,
    NoCharge,
    Dispute,
    Unknown,
    Voided,
    Other(u32),
}

impl PaymentType {
    pub fn code(self) -> u32 {
        match self {
            Self::Card => 1,
            Self::Cash => 2,
            Self::NoCharge => 3,
            Self::Dispute => 4,
            Self::Unknown => 5,
            Self::Voided => 6,
            Self::Other(c) => c,
        }
    }
}

impl From<u32> for PaymentType {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::Card,
            2 => Self::Cash,
            3 => Self::NoCharge,
            4 => Self::Dispute,
            5 => Self::Unknown,
            6 => Self::Voided,
            c => Self::Other(c),
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card => write!(f, "card"),
            Self::Cash => write!(f, "cash"),
            Self::NoCharge => write!(f, "no_charge"),
            Self::Dispute => write!(f, "dispute"),
            Self::Unknown => write!(f, "unknown"),
            Self::Voided => write!(f, "voided"),
            Self::Other(c) => write!(f, "other_{}", c),
        }
    }
}

// ── Raw trip event ────────────────────────────────────────────────────────────

/// One trip as received from the upstream transport. Never mutated.
///
/// Decoding is lenient: numeric fields accept numbers, numeric strings,
/// `null` or absence, and fall back to 0. Timestamps that fail to parse
/// decode as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    #[serde(default, deserialize_with = "lenient::string")]
    pub trip_id: String,
    #[serde(rename = "VendorID", default, deserialize_with = "lenient::u32_or_zero")]
    pub vendor_id: u32,
    #[serde(rename = "tpep_pickup_datetime", default, deserialize_with = "lenient::timestamp")]
    pub pickup_at: Option<NaiveDateTime>,
    #[serde(rename = "tpep_dropoff_datetime", default, deserialize_with = "lenient::timestamp")]
    pub dropoff_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient::u32_or_zero")]
    pub passenger_count: u32,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub trip_distance: f64,
    #[serde(rename = "RatecodeID", default = "standard_rate", deserialize_with = "lenient::rate_code")]
    pub rate_code: u32,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub store_and_fwd_flag: Option<String>,
    #[serde(rename = "PULocationID", default, deserialize_with = "lenient::u32_or_zero")]
    pub pickup_zone: u32,
    #[serde(rename = "DOLocationID", default, deserialize_with = "lenient::u32_or_zero")]
    pub dropoff_zone: u32,
    #[serde(default, deserialize_with = "lenient::u32_or_zero")]
    pub payment_type: u32,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub fare_amount: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub extra: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub mta_tax: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub tip_amount: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub tolls_amount: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub improvement_surcharge: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub total_amount: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub congestion_surcharge: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub airport_fee: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub cbd_congestion_fee: f64,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub received_at: Option<NaiveDateTime>,
}

fn standard_rate() -> u32 {
    1
}

impl TripEvent {
    pub fn payment(&self) -> PaymentType {
        PaymentType::from(self.payment_type)
    }

    /// Decode one wire payload. Only non-object JSON is rejected.
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

impl Default for TripEvent {
    fn default() -> Self {
        Self {
            trip_id: String::new(),
            vendor_id: 0,
            pickup_at: None,
            dropoff_at: None,
            passenger_count: 0,
            trip_distance: 0.0,
            rate_code: standard_rate(),
            store_and_fwd_flag: None,
            pickup_zone: 0,
            dropoff_zone: 0,
            payment_type: 0,
            fare_amount: 0.0,
            extra: 0.0,
            mta_tax: 0.0,
            tip_amount: 0.0,
            tolls_amount: 0.0,
            improvement_surcharge: 0.0,
            total_amount: 0.0,
            congestion_surcharge: 0.0,
            airport_fee: 0.0,
            cbd_congestion_fee: 0.0,
            received_at: None,
        }
    }
}

// ── Enriched / scored trips ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedTrip {
    #[serde(flatten)]
    pub trip: TripEvent,
    pub duration_min: f64,
    pub speed_mph: f64,
    pub pickup_hour: u32,
    pub pickup_date: Option<NaiveDate>,
    pub is_night: bool,
    pub fare_per_mile: f64,
    pub tip_pct: f64,
}

impl EnrichedTrip {
    pub fn payment(&self) -> PaymentType {
        self.trip.payment()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlag {
    ImpossibleSpeed,
    StationaryTrip,
    ZeroDistanceWithFare,
    FareTooHigh,
    NegativeFare,
    TipExceedsFare,
    ExcessiveTip,
    SameLocationHighFare,
    FakeAirportFee,
    TooManyPassengers,
    ZeroPassengers,
    NightCashTrip,
    NightHighTip,
    FakeJfkRate,
    VoidedTrip,
    DisputedTrip,
}

impl FraudFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImpossibleSpeed => "impossible_speed",
            Self::StationaryTrip => "stationary_trip",
            Self::ZeroDistanceWithFare => "zero_distance_with_fare",
            Self::FareTooHigh => "fare_too_high",
            Self::NegativeFare => "negative_fare",
            Self::TipExceedsFare => "tip_exceeds_fare",
            Self::ExcessiveTip => "excessive_tip",
            Self::SameLocationHighFare => "same_location_high_fare",
            Self::FakeAirportFee => "fake_airport_fee",
            Self::TooManyPassengers => "too_many_passengers",
            Self::ZeroPassengers => "zero_passengers",
            Self::NightCashTrip => "night_cash_trip",
            Self::NightHighTip => "night_high_tip",
            Self::FakeJfkRate => "fake_jfk_rate",
            Self::VoidedTrip => "voided_trip",
            Self::DisputedTrip => "disputed_trip",
        }
    }
}

impl std::fmt::Display for FraudFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn from_score(score: u8) -> Self {
        match score {
            75..=u8::MAX => Self::Critical,
            50..=74 => Self::High,
            25..=49 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Score in [0, 100] plus flags in rule-table order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FraudAssessment {
    #[serde(rename = "fraud_score")]
    pub score: u8,
    #[serde(rename = "fraud_flags")]
    pub flags: Vec<FraudFlag>,
}

impl FraudAssessment {
    pub fn tier(&self) -> RiskTier {
        RiskTier::from_score(self.score)
    }

    pub fn has(&self, flag: FraudFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTrip {
    #[serde(flatten)]
    pub enriched: EnrichedTrip,
    #[serde(flatten)]
    pub assessment: FraudAssessment,
}

// ── Fraud alert ───────────────────────────────────────────────────────────────

/// Entry of the per-date alert log. Built only from trip data so a
/// redelivered trip produces a byte-identical alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub trip_id: String,
    pub fraud_score: u8,
    pub fraud_flags: Vec<FraudFlag>,
    #[serde(rename = "PULocationID")]
    pub pickup_zone: u32,
    #[serde(rename = "DOLocationID")]
    pub dropoff_zone: u32,
    pub fare_amount: f64,
    pub is_night: bool,
    pub date: NaiveDate,
    pub timestamp: Option<NaiveDateTime>,
}

impl FraudAlert {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Lenient field decoding ────────────────────────────────────────────────────

mod lenient {
    use super::*;

    const TIMESTAMP_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];

    fn number(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|x| x.is_finite())
    }

    fn unsigned(v: &Value) -> Option<u32> {
        number(v)
            .filter(|x| *x >= 0.0 && *x <= u32::MAX as f64)
            .map(|x| x as u32)
    }

    pub fn f64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(number).unwrap_or(0.0))
    }

    pub fn u32_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(unsigned).unwrap_or(0))
    }

    // 0 is not an issued rate code; treat it like a missing one.
    pub fn rate_code<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(unsigned).filter(|c| *c != 0).unwrap_or(1))
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(opt_string(d)?.unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::String(s)) => parse_timestamp(&s),
            _ => None,
        })
    }

    pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_local());
        }
        TIMESTAMP_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    }
}

pub use lenient::parse_timestamp;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn decodes_wire_shape() {
        let raw = br#"{
            "trip_id": "t-1", "VendorID": 2,
            "tpep_pickup_datetime": "2024-09-01T08:15:00",
            "tpep_dropoff_datetime": "2024-09-01 08:40:30",
            "passenger_count": 1, "trip_distance": 4.2, "RatecodeID": 1,
            "store_and_fwd_flag": "N", "PULocationID": 161, "DOLocationID": 237,
            "payment_type": 1, "fare_amount": 21.9, "tip_amount": 4.0,
            "total_amount": 30.4, "airport_fee": 0.0,
            "received_at": "2024-09-01T08:41:02.123456"
        }"#;
        let trip = TripEvent::from_json(raw).unwrap();
        assert_eq!(trip.trip_id, "t-1");
        assert_eq!(trip.vendor_id, 2);
        assert_eq!(trip.pickup_zone, 161);
        assert_eq!(trip.payment(), PaymentType::Card);
        assert_eq!(trip.pickup_at.unwrap().hour(), 8);
        assert_eq!(trip.dropoff_at.unwrap().second(), 30);
        assert!(trip.received_at.is_some());
    }

    #[test]
    fn malformed_fields_default_instead_of_failing() {
        let raw = br#"{
            "VendorID": "abc", "trip_distance": null, "fare_amount": "12.5",
            "passenger_count": -3, "PULocationID": 1e12,
            "tpep_pickup_datetime": "yesterday", "RatecodeID": 0
        }"#;
        let trip = TripEvent::from_json(raw).unwrap();
        assert_eq!(trip.vendor_id, 0);
        assert_eq!(trip.trip_distance, 0.0);
        assert_eq!(trip.fare_amount, 12.5);
        assert_eq!(trip.passenger_count, 0);
        assert_eq!(trip.pickup_zone, 0);
        assert_eq!(trip.pickup_at, None);
        assert_eq!(trip.rate_code, 1);
        assert!(trip.trip_id.is_empty());
    }

    #[test]
    fn missing_rate_code_is_standard() {
        let trip = TripEvent::from_json(b"{}").unwrap();
        assert_eq!(trip.rate_code, 1);
        assert_eq!(trip, TripEvent::default());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(TripEvent::from_json(b"[1,2,3]").is_err());
        assert!(TripEvent::from_json(b"not json").is_err());
    }

    #[test]
    fn rfc3339_keeps_wall_clock() {
        let ts = parse_timestamp("2024-09-01T23:10:00-04:00").unwrap();
        assert_eq!(ts.hour(), 23);
    }

    #[test]
    fn payment_codes_round_trip() {
        for code in 0..9 {
            assert_eq!(PaymentType::from(code).code(), code);
        }
        assert_eq!(PaymentType::from(6), PaymentType::Voided);
        assert_eq!(PaymentType::from(9).to_string(), "other_9");
    }

    #[test]
    fn risk_tiers() {
        assert_eq!(RiskTier::from_score(0), RiskTier::Low);
        assert_eq!(RiskTier::from_score(25), RiskTier::Medium);
        assert_eq!(RiskTier::from_score(50), RiskTier::High);
        assert_eq!(RiskTier::from_score(100), RiskTier::Critical);
    }

    #[test]
    fn flags_serialize_snake_case() {
        let json = serde_json::to_string(&FraudFlag::ZeroDistanceWithFare).unwrap();
        assert_eq!(json, "\"zero_distance_with_fare\"");
        assert_eq!(FraudFlag::FakeJfkRate.to_string(), "fake_jfk_rate");
    }
}
