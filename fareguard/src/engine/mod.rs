// fareguard/src/engine/mod.rs
//
// Pure processing stages: enrich → score → aggregate.
// The dispatcher is the only stage with I/O (JSONL files in the output dir).

pub mod aggregate;
pub mod dispatcher;
pub mod enrich;
pub mod scorer;

use crate::events::{ScoredTrip, TripEvent};

pub fn score_trip(trip: TripEvent) -> ScoredTrip {
    let enriched   = enrich::enrich(trip);
    let assessment = scorer::assess(&enriched);
    ScoredTrip { enriched, assessment }
}

/// Enrich and score on the blocking pool, `chunk` trips per task.
/// Result order matches input order.
pub async fn score_parallel(trips: Vec<TripEvent>, chunk: usize) -> Vec<ScoredTrip> {
    let chunk = chunk.max(1);
    if trips.len() <= chunk {
        return trips.into_iter().map(score_trip).collect();
    }

    let mut handles = Vec::with_capacity(trips.len() / chunk + 1);
    let mut rest    = trips;
    while !rest.is_empty() {
        let tail = rest.split_off(rest.len().min(chunk));
        let part = std::mem::replace(&mut rest, tail);
        handles.push(tokio::task::spawn_blocking(move || {
            part.into_iter().map(score_trip).collect::<Vec<_>>()
        }));
    }

    let mut out = Vec::new();
    for h in handles {
        match h.await {
            Ok(scored) => out.extend(scored),
            // Scoring is total; a join error means the task panicked.
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trips(n: usize) -> Vec<TripEvent> {
        (0..n)
            .map(|i| TripEvent {
                trip_id: format!("t{}", i),
                passenger_count: (i % 9) as u32,
                fare_amount: 10.0,
                ..TripEvent::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn parallel_scoring_preserves_order_and_results() {
        let input    = trips(103);
        let serial: Vec<_> = input.clone().into_iter().map(score_trip).collect();
        let parallel = score_parallel(input, 10).await;
        assert_eq!(parallel, serial);
    }

    #[tokio::test]
    async fn small_batches_stay_inline() {
        let out = score_parallel(trips(3), 100).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].enriched.trip.trip_id, "t2");
    }
}
