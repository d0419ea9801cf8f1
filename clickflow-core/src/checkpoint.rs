//! Checkpoints tie the source position, the events still held back by the watermark and the sink
//! writes together. The coordinator injects a barrier at the source every interval; each stage
//! reports the barrier to the coordinator when it reaches it and forwards it downstream. Once the
//! source, watermark, enricher and every sink reported the same barrier, the checkpoint is stored
//! and becomes the point a restart resumes from.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::PartitionOffsets;
use crate::{Error, Result};

pub(crate) mod coordinator;
pub mod store;

/// A committed recovery point of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: u64,
    /// Next offset to read, per partition.
    pub offsets: PartitionOffsets,
    pub sinks: BTreeMap<String, SinkMarker>,
    pub created_at: DateTime<Utc>,
}

/// What a sink had durably written when it acknowledged a barrier. Counts include rows replayed
/// after restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkMarker {
    pub rows: u64,
    pub batches: u64,
}

/// Offsets to store for a barrier: the source position, pulled back to the lowest event the
/// watermark still buffers so that nothing which has not reached the sinks is skipped on resume.
pub(crate) fn committed_offsets(
    source: &PartitionOffsets,
    buffered: &PartitionOffsets,
) -> PartitionOffsets {
    let mut offsets = source.clone();
    for (partition, lowest) in buffered {
        offsets
            .entry(*partition)
            .and_modify(|next| *next = (*next).min(*lowest))
            .or_insert(*lowest);
    }
    offsets
}

/// The stages taking part in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StageId {
    Source,
    Watermark,
    Enricher,
    Sink(String),
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageId::Source => write!(f, "source"),
            StageId::Watermark => write!(f, "watermark"),
            StageId::Enricher => write!(f, "enricher"),
            StageId::Sink(name) => write!(f, "sink/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AckPayload {
    /// Source position at the barrier.
    SourceOffsets(PartitionOffsets),
    /// Lowest offset per partition the watermark still holds back.
    Buffered(PartitionOffsets),
    Sink(SinkMarker),
    Forwarded,
}

#[derive(Debug)]
pub(crate) enum StageReport {
    Ack {
        barrier_id: u64,
        stage: StageId,
        payload: AckPayload,
    },
    /// The source has nothing more to read (finite sources only).
    EndOfInput,
    Failed {
        stage: StageId,
        error: Error,
    },
}

/// A stage's handle for talking to the coordinator.
#[derive(Debug, Clone)]
pub(crate) struct Reporter {
    stage: StageId,
    tx: mpsc::Sender<StageReport>,
}

impl Reporter {
    pub(crate) fn new(stage: StageId, tx: mpsc::Sender<StageReport>) -> Self {
        Self { stage, tx }
    }

    pub(crate) fn stage(&self) -> &StageId {
        &self.stage
    }

    pub(crate) async fn ack(&self, barrier_id: u64, payload: AckPayload) -> Result<()> {
        self.send(StageReport::Ack {
            barrier_id,
            stage: self.stage.clone(),
            payload,
        })
        .await
    }

    pub(crate) async fn end_of_input(&self) -> Result<()> {
        self.send(StageReport::EndOfInput).await
    }

    /// Best effort, the coordinator may already be gone.
    pub(crate) async fn failed(&self, error: Error) {
        let _ = self
            .send(StageReport::Failed {
                stage: self.stage.clone(),
                error,
            })
            .await;
    }

    async fn send(&self, report: StageReport) -> Result<()> {
        self.tx
            .send(report)
            .await
            .map_err(|_| Error::Forwarder(format!("coordinator is gone, {} stops", self.stage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_offsets_never_pass_buffered_events() {
        let source = PartitionOffsets::from([(0, 120), (1, 40), (2, 7)]);
        let buffered = PartitionOffsets::from([(0, 97), (1, 55)]);
        assert_eq!(
            committed_offsets(&source, &buffered),
            PartitionOffsets::from([(0, 97), (1, 40), (2, 7)])
        );
        assert_eq!(committed_offsets(&source, &PartitionOffsets::new()), source);
    }

    #[test]
    fn checkpoint_json_shape() {
        let checkpoint = Checkpoint {
            checkpoint_id: 4,
            offsets: PartitionOffsets::from([(0, 10), (3, 2)]),
            sinks: BTreeMap::from([("postgres".to_string(), SinkMarker { rows: 9, batches: 2 })]),
            created_at: DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["offsets"]["3"], 2);
        assert_eq!(json["sinks"]["postgres"]["rows"], 9);
        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
