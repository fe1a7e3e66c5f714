// fareguard/src/lib.rs
//
// fareguard — real-time taxi trip fraud scoring and aggregation.
//
//   events      wire and domain types
//   engine      enrich → score → aggregate, plus the JSONL dispatcher
//   state       StateStore trait, write plan + writer, reader, memory store
//   source      upstream transports (JSONL tail/replay, memory, kafka)
//   pipeline    the consumer loop tying them together

pub mod engine;
pub mod error;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka_source;
pub mod pipeline;
pub mod redis_state;
pub mod source;
pub mod state;

pub use engine::score_trip;
pub use error::{PipelineError, SourceError, StoreError, WriteError};
pub use pipeline::{Pipeline, PipelineConfig};
