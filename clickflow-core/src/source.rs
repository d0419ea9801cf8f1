//! Event source: reads records from the queue, decodes them into [RawEvent]s and tracks the next
//! offset to read per partition. Barriers are injected here on the coordinator's request, stamped
//! with the current offsets.

use backoff::retry::Retry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{AckPayload, Reporter};
use crate::config::RetryConfig;
use crate::message::{
    Barrier, BarrierKind, PartitionOffsets, RawEvent, SourceRecord, SourcedEvent, StreamMessage,
};
use crate::metrics::{job_metrics, partition_labels};
use crate::{Error, Result};

/// [Kafka] source built on the `clickflow-kafka` consumer actor.
///
/// [Kafka]: https://kafka.apache.org/
pub mod kafka;

/// In-process source over a fixed set of records.
pub mod memory;

/// A partitioned, replayable input.
#[trait_variant::make(SourceReader: Send)]
pub trait LocalSourceReader: Clone + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reads the next batch. `Ok(None)` means the input is exhausted and will never grow again;
    /// an empty batch just means nothing arrived within the read timeout.
    async fn read(&self) -> Result<Option<Vec<SourceRecord>>>;

    /// Next offset to read for every owned partition when nothing else is known. Resolved once
    /// for the lifetime of the reader, so it never moves between runs.
    async fn start_offsets(&self) -> Result<PartitionOffsets>;

    /// Repositions the owned partitions at `offsets` (next offset to read). Partitions not in the
    /// map fall back to the reader's start position.
    async fn seek(&self, offsets: &PartitionOffsets) -> Result<()>;

    /// Informs the upstream of a committed checkpoint. Best effort.
    async fn commit(&self, offsets: &PartitionOffsets) -> Result<()>;
}

/// Requests from the coordinator.
#[derive(Debug)]
pub(crate) enum SourceControl {
    InjectBarrier { id: u64, kind: BarrierKind },
    /// A checkpoint with these offsets has been stored.
    Committed(PartitionOffsets),
}

pub(crate) struct SourceStage<R> {
    reader: R,
    instance: u16,
    next_offsets: PartitionOffsets,
    read_retry: RetryConfig,
    control: mpsc::Receiver<SourceControl>,
    output: mpsc::Sender<StreamMessage<SourcedEvent>>,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl<R: SourceReader> SourceStage<R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reader: R,
        instance: u16,
        resume_from: PartitionOffsets,
        read_retry: RetryConfig,
        control: mpsc::Receiver<SourceControl>,
        output: mpsc::Sender<StreamMessage<SourcedEvent>>,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            instance,
            next_offsets: resume_from,
            read_retry,
            control,
            output,
            reporter,
            cancel,
        }
    }

    /// Runs until a drain barrier has been forwarded or the coordinator goes away.
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(source = self.reader.name(), offsets = ?self.next_offsets, "Source started");
        let mut exhausted = false;
        loop {
            // control first, barriers should not wait behind a full read
            loop {
                match self.control.try_recv() {
                    Ok(control) => {
                        if self.handle_control(control).await? {
                            return Ok(());
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if exhausted || self.cancel.is_cancelled() {
                // intake is over, only the coordinator's drain barrier is left to handle
                match self.control.recv().await {
                    Some(control) => {
                        if self.handle_control(control).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
                continue;
            }

            match self.read_with_retry().await {
                Ok(Some(records)) => self.forward(records).await?,
                Err(e) if self.cancel.is_cancelled() => {
                    warn!(error = %e, "Read failed while stopping, waiting for the final barrier");
                }
                Err(e) => return Err(e),
                Ok(None) => {
                    info!(offsets = ?self.next_offsets, "Source exhausted");
                    exhausted = true;
                    self.reporter.end_of_input().await?;
                }
            }
        }
    }

    /// Next offset to read per partition, covering everything forwarded so far.
    pub(crate) fn current_offsets(&self) -> &PartitionOffsets {
        &self.next_offsets
    }

    async fn read_with_retry(&self) -> Result<Option<Vec<SourceRecord>>> {
        let reader = &self.reader;
        Retry::new(
            self.read_retry.strategy(),
            move || reader.read(),
            |e: &Error| {
                warn!(?e, "Reading from source failed, retrying");
                true
            },
        )
        .with_cancellation(self.cancel.clone())
        .await
        .map_err(|e| Error::Source(format!("giving up reading: {e}")))
    }

    async fn forward(&mut self, records: Vec<SourceRecord>) -> Result<()> {
        for record in records {
            job_metrics()
                .read_total
                .get_or_create(&partition_labels(self.instance, record.partition))
                .inc();
            self.next_offsets.insert(record.partition, record.offset + 1);

            let event = match RawEvent::decode(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    debug!(
                        partition = record.partition,
                        offset = record.offset,
                        ?e,
                        "Dropping malformed record"
                    );
                    job_metrics()
                        .malformed_total
                        .get_or_create(&partition_labels(self.instance, record.partition))
                        .inc();
                    continue;
                }
            };
            self.send(StreamMessage::Event(SourcedEvent {
                event,
                partition: record.partition,
                offset: record.offset,
                key: record.key,
            }))
            .await?;
        }
        Ok(())
    }

    /// Returns true once a drain barrier went out.
    async fn handle_control(&mut self, control: SourceControl) -> Result<bool> {
        match control {
            SourceControl::InjectBarrier { id, kind } => {
                let barrier = Barrier {
                    id,
                    kind,
                    source_offsets: self.current_offsets().clone(),
                };
                debug!(barrier = id, ?kind, offsets = ?barrier.source_offsets, "Injecting barrier");
                self.reporter
                    .ack(id, AckPayload::SourceOffsets(barrier.source_offsets.clone()))
                    .await?;
                let drain = barrier.is_drain();
                self.send(StreamMessage::Barrier(barrier)).await?;
                Ok(drain)
            }
            SourceControl::Committed(offsets) => {
                if let Err(e) = self.reader.commit(&offsets).await {
                    warn!(?e, "Committing offsets upstream failed, the checkpoint is unaffected");
                }
                Ok(false)
            }
        }
    }

    async fn send(&self, message: StreamMessage<SourcedEvent>) -> Result<()> {
        self.output
            .send(message)
            .await
            .map_err(|_| Error::Source("downstream closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::checkpoint::{StageId, StageReport};
    use crate::source::memory::MemorySource;

    fn record(partition: i32, offset: i64, payload: &str) -> SourceRecord {
        SourceRecord {
            partition,
            offset,
            key: None,
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[tokio::test]
    async fn decodes_tracks_offsets_and_stamps_barriers() {
        let reader = MemorySource::new(
            vec![
                record(0, 0, r#"{"ip":"1.1.1.1","event_time":"2024-01-01T00:00:00.000Z"}"#),
                record(0, 1, "garbage"),
                record(1, 5, r#"{"ip":"2.2.2.2","event_time":"2024-01-01T00:00:01.000Z"}"#),
            ],
            10,
        );
        let (control_tx, control_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (report_tx, mut report_rx) = mpsc::channel(16);
        let stage = SourceStage::new(
            reader,
            0,
            PartitionOffsets::new(),
            RetryConfig {
                attempts: 1,
                base: Duration::from_millis(1),
                max: Duration::from_millis(1),
            },
            control_rx,
            out_tx,
            Reporter::new(StageId::Source, report_tx),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(stage.run());

        let mut ips = vec![];
        for _ in 0..2 {
            match out_rx.recv().await.unwrap() {
                StreamMessage::Event(e) => ips.push(e.event.ip),
                StreamMessage::Barrier(_) => panic!("no barrier requested yet"),
            }
        }
        assert_eq!(ips, vec!["1.1.1.1", "2.2.2.2"]);
        assert!(matches!(report_rx.recv().await.unwrap(), StageReport::EndOfInput));

        control_tx
            .send(SourceControl::InjectBarrier {
                id: 1,
                kind: BarrierKind::Drain,
            })
            .await
            .unwrap();
        let StreamMessage::Barrier(barrier) = out_rx.recv().await.unwrap() else {
            panic!("expected barrier");
        };
        // the malformed record still moves the offset forward
        assert_eq!(barrier.source_offsets, PartitionOffsets::from([(0, 2), (1, 6)]));
        assert!(matches!(
            report_rx.recv().await.unwrap(),
            StageReport::Ack {
                barrier_id: 1,
                stage: StageId::Source,
                payload: AckPayload::SourceOffsets(_),
            }
        ));
        handle.await.unwrap().unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
