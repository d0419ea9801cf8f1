//! Click-event enrichment job. Events are read from a Kafka topic, ordered by event time behind a
//! per-partition watermark, enriched with the geolocation of their ip address and written to a
//! Postgres table and a Kafka topic. Periodic aligned checkpoints let a failed run restart from
//! the last consistent point.
//!
//! ```text
//! Kafka -> watermark -> geolocation -> Postgres, Kafka
//! ```

pub use self::error::{Error, Result};

/// Errors and the crate wide [Result] alias.
mod error;

/// Settings built once from the environment at startup.
pub mod config;
pub use crate::config::Settings;

/// Records, events and barriers flowing between the stages.
pub mod message;

/// Prometheus counters for the job.
pub mod metrics;

/// Partitioned, replayable inputs.
pub mod source;

/// Event-time ordering and late event filtering.
pub mod watermark;

/// Geolocation lookups with timeout and failure policy.
pub mod enricher;

/// Outputs and the batching writer in front of them.
pub mod sink;

/// Checkpoint model, store and coordinator.
pub mod checkpoint;

mod pipeline;

/// Restartable pipeline instances.
pub mod job;
pub use crate::job::{Job, KafkaComponents};
