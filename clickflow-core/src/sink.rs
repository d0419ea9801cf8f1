//! Sink writers. Each configured sink gets its own writer task that buffers enriched events,
//! writes them in batches and flushes whatever is buffered when a barrier arrives, so that a
//! checkpoint only completes once its events are durable in every sink.

use backoff::retry::Retry;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::{AckPayload, Reporter, SinkMarker};
use crate::config::{RetryConfig, SinkConfig, SinkType};
use crate::message::{EnrichedEvent, StreamMessage};
use crate::metrics::{job_metrics, sink_labels};
use crate::{Error, Result};

/// Re-publishes rows as JSON to a [Kafka] topic.
///
/// [Kafka]: https://kafka.apache.org/
pub mod kafka;
/// Logs every row, for dry runs.
pub mod log;
/// In-process sink keeping rows in memory.
pub mod memory;
/// Batched inserts into a [PostgreSQL] table.
///
/// [PostgreSQL]: https://www.postgresql.org/
pub mod postgres;

/// A destination for processed rows.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink: Sync {
    /// Writes the batch durably. On error any part of the batch may have been written, the
    /// whole batch is retried.
    async fn sink(&self, events: &[EnrichedEvent]) -> Result<()>;
}

/// The sink implementations a job can write to.
#[derive(Clone)]
pub enum SinkClientType {
    Postgres(postgres::PostgresSink),
    Kafka(clickflow_kafka::sink::KafkaSink),
    Log(log::LogSink),
    Memory(memory::MemorySink),
}

impl Sink for SinkClientType {
    async fn sink(&self, events: &[EnrichedEvent]) -> Result<()> {
        match self {
            SinkClientType::Postgres(sink) => Sink::sink(sink, events).await,
            SinkClientType::Kafka(sink) => Sink::sink(sink, events).await,
            SinkClientType::Log(sink) => Sink::sink(sink, events).await,
            SinkClientType::Memory(sink) => Sink::sink(sink, events).await,
        }
    }
}

/// A sink client together with the settings its writer runs with.
#[derive(Clone)]
pub struct NamedSink {
    pub name: String,
    pub client: SinkClientType,
    pub batch_size: usize,
    pub flush_retry: RetryConfig,
}

impl NamedSink {
    /// Connects the sink described by `config`. Sinks without a batch size of their own use
    /// `default_batch_size`.
    pub async fn from_config(config: &SinkConfig, default_batch_size: usize) -> Result<Self> {
        let (client, batch_size) = match &config.sink_type {
            SinkType::Postgres(pg) => (
                SinkClientType::Postgres(postgres::PostgresSink::connect(pg).await?),
                pg.batch_size,
            ),
            SinkType::Kafka(kafka) => (
                SinkClientType::Kafka(kafka::new_kafka_sink(kafka.clone())?),
                default_batch_size,
            ),
            SinkType::Log => (
                SinkClientType::Log(log::LogSink::new(config.name.clone())),
                default_batch_size,
            ),
        };
        Ok(Self {
            name: config.name.clone(),
            client,
            batch_size: batch_size.max(1),
            flush_retry: config.flush_retry,
        })
    }
}

/// Buffers events for one sink and tracks what it durably wrote.
pub(crate) struct SinkWriter {
    sink: NamedSink,
    buffer: Vec<EnrichedEvent>,
    marker: SinkMarker,
    instance: u16,
}

impl SinkWriter {
    /// `marker` carries on the counts of the checkpoint the run resumes from.
    pub(crate) fn new(sink: NamedSink, marker: SinkMarker, instance: u16) -> Self {
        Self {
            buffer: Vec::with_capacity(sink.batch_size),
            sink,
            marker,
            instance,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.sink.name
    }

    pub(crate) async fn write(&mut self, event: EnrichedEvent) -> Result<()> {
        self.buffer.push(event);
        if self.buffer.len() >= self.sink.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes out the buffer, retrying with backoff. Exhausted retries fail the run.
    pub(crate) async fn flush(&mut self) -> Result<SinkMarker> {
        if self.buffer.is_empty() {
            return Ok(self.marker);
        }
        let rows = self.buffer.len();
        let client = &self.sink.client;
        let batch = self.buffer.as_slice();
        let name = self.sink.name.as_str();
        Retry::new(
            self.sink.flush_retry.strategy(),
            move || Sink::sink(client, batch),
            |e: &Error| {
                warn!(sink = %name, rows, error = %e, "Flushing sink failed, retrying");
                true
            },
        )
        .await
        .map_err(|e| Error::Sink(format!("giving up flushing {name}: {e}")))?;

        self.buffer.clear();
        self.marker.rows += rows as u64;
        self.marker.batches += 1;
        job_metrics()
            .sink_write_total
            .get_or_create(&sink_labels(self.instance, &self.sink.name))
            .inc_by(rows as u64);
        debug!(sink = %self.sink.name, rows, "Flushed sink");
        Ok(self.marker)
    }
}

/// Sink writer task. Acknowledges each barrier once everything before it has been flushed.
pub(crate) async fn run(
    mut writer: SinkWriter,
    mut input: mpsc::Receiver<StreamMessage<EnrichedEvent>>,
    reporter: Reporter,
) -> Result<()> {
    while let Some(message) = input.recv().await {
        match message {
            StreamMessage::Event(event) => writer.write(event).await?,
            StreamMessage::Barrier(barrier) => {
                let marker = writer.flush().await?;
                reporter.ack(barrier.id, AckPayload::Sink(marker)).await?;
            }
        }
    }
    if !writer.buffer.is_empty() {
        // no barrier will cover these rows, they are replayed on restart
        warn!(
            sink = %writer.name(),
            rows = writer.buffer.len(),
            "Input closed with unflushed rows"
        );
    }
    info!(sink = %writer.name(), rows = writer.marker.rows, "Sink writer stopped");
    Ok(())
}

/// Copies every message to each sink writer's channel.
pub(crate) async fn fan_out(
    mut input: mpsc::Receiver<StreamMessage<EnrichedEvent>>,
    outputs: Vec<mpsc::Sender<StreamMessage<EnrichedEvent>>>,
) -> Result<()> {
    while let Some(message) = input.recv().await {
        for output in &outputs {
            output
                .send(message.clone())
                .await
                .map_err(|_| Error::Sink("sink writer closed".to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::checkpoint::{StageId, StageReport};
    use crate::message::{Barrier, BarrierKind, GeoData, PartitionOffsets, RawEvent, TimedEvent};
    use crate::sink::memory::MemorySink;

    fn enriched(ip: &str, offset: i64) -> EnrichedEvent {
        EnrichedEvent {
            event: TimedEvent {
                event: RawEvent {
                    url: "/a".into(),
                    ip: ip.into(),
                    event_time: "2024-01-01T00:00:00.000Z".into(),
                    ..Default::default()
                },
                event_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                partition: 0,
                offset,
                key: None,
            },
            geodata: GeoData::empty(),
        }
    }

    fn named(sink: MemorySink, batch_size: usize, attempts: u16) -> NamedSink {
        NamedSink {
            name: "memory".to_string(),
            client: SinkClientType::Memory(sink),
            batch_size,
            flush_retry: RetryConfig {
                attempts,
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
        }
    }

    #[tokio::test]
    async fn writes_full_batches_and_flushes_on_barrier() {
        let sink = MemorySink::default();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (report_tx, mut report_rx) = mpsc::channel(16);
        let writer = SinkWriter::new(
            named(sink.clone(), 2, 1),
            SinkMarker { rows: 10, batches: 3 },
            0,
        );
        let handle = tokio::spawn(run(
            writer,
            in_rx,
            Reporter::new(StageId::Sink("memory".to_string()), report_tx),
        ));

        for offset in 0..3 {
            in_tx
                .send(StreamMessage::Event(enriched("1.1.1.1", offset)))
                .await
                .unwrap();
        }
        in_tx
            .send(StreamMessage::Barrier(Barrier {
                id: 1,
                kind: BarrierKind::Checkpoint,
                source_offsets: PartitionOffsets::from([(0, 3)]),
            }))
            .await
            .unwrap();

        match report_rx.recv().await.unwrap() {
            StageReport::Ack { payload, .. } => {
                assert_eq!(payload, AckPayload::Sink(SinkMarker { rows: 13, batches: 5 }))
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(sink.rows().len(), 3);
        assert_eq!(sink.batches(), 2);

        drop(in_tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_retries_then_fails_the_run() {
        let sink = MemorySink::default();
        sink.fail_next(2);
        let mut writer = SinkWriter::new(named(sink.clone(), 10, 3), SinkMarker::default(), 0);
        writer.write(enriched("1.1.1.1", 0)).await.unwrap();
        let marker = writer.flush().await.unwrap();
        assert_eq!(marker, SinkMarker { rows: 1, batches: 1 });
        assert_eq!(sink.rows().len(), 1);

        sink.fail_next(5);
        writer.write(enriched("1.1.1.1", 1)).await.unwrap();
        assert!(matches!(writer.flush().await, Err(Error::Sink(_))));
        assert_eq!(sink.rows().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_copies_to_every_writer() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let handle = tokio::spawn(fan_out(in_rx, vec![a_tx, b_tx]));
        in_tx
            .send(StreamMessage::Event(enriched("1.1.1.1", 0)))
            .await
            .unwrap();
        drop(in_tx);
        handle.await.unwrap().unwrap();
        assert!(matches!(a_rx.recv().await, Some(StreamMessage::Event(_))));
        assert!(matches!(b_rx.recv().await, Some(StreamMessage::Event(_))));
        assert!(a_rx.recv().await.is_none());
    }
}
