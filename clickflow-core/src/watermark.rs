//! Event-time tracking. Parses each event's `event_time`, drops events that are malformed or
//! behind their partition's watermark, and releases the rest in event-time order once the
//! watermark has passed them.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::{AckPayload, Reporter};
use crate::config::WatermarkConfig;
use crate::message::{
    Barrier, PartitionOffsets, SourcedEvent, StreamMessage, TimedEvent, parse_event_time,
};
use crate::metrics::{job_metrics, partition_labels};
use crate::watermark::timeline::{Admission, PartitionTimeline};
use crate::{Error, Result};

mod timeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatermarkStats {
    pub accepted: u64,
    pub late: u64,
    pub malformed: u64,
}

/// Per-partition watermarks of one pipeline instance.
pub struct WatermarkGenerator {
    instance: u16,
    lateness: TimeDelta,
    capacity: usize,
    partitions: BTreeMap<i32, PartitionTimeline>,
    stats: WatermarkStats,
}

impl WatermarkGenerator {
    pub fn new(instance: u16, config: WatermarkConfig) -> Self {
        Self {
            instance,
            lateness: TimeDelta::from_std(config.lateness).unwrap_or(TimeDelta::MAX),
            capacity: config.buffer_capacity,
            partitions: BTreeMap::new(),
            stats: WatermarkStats::default(),
        }
    }

    /// Offers one event, appending whatever became releasable to `released`.
    pub fn process(&mut self, sourced: SourcedEvent, released: &mut Vec<TimedEvent>) {
        let SourcedEvent {
            event,
            partition,
            offset,
            key,
        } = sourced;

        let Some(event_timestamp) = parse_event_time(&event.event_time) else {
            debug!(partition, offset, event_time = %event.event_time, "Dropping event with malformed event_time");
            self.stats.malformed += 1;
            job_metrics()
                .malformed_total
                .get_or_create(&partition_labels(self.instance, partition))
                .inc();
            return;
        };

        let (lateness, capacity) = (self.lateness, self.capacity);
        let timeline = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionTimeline::new(lateness, capacity));
        let timed = TimedEvent {
            event,
            event_timestamp,
            partition,
            offset,
            key,
        };
        match timeline.observe(timed, released) {
            Admission::Accepted => self.stats.accepted += 1,
            Admission::Late => {
                debug!(partition, offset, %event_timestamp, "Dropping late event");
                self.stats.late += 1;
                job_metrics()
                    .late_total
                    .get_or_create(&partition_labels(self.instance, partition))
                    .inc();
            }
        }
    }

    /// Lowest offset per partition still held back.
    pub fn lowest_buffered_offsets(&self) -> PartitionOffsets {
        self.partitions
            .iter()
            .filter_map(|(partition, timeline)| {
                timeline
                    .lowest_buffered_offset()
                    .map(|offset| (*partition, offset))
            })
            .collect()
    }

    /// Releases every buffered event, partition by partition, each in event-time order.
    pub fn drain(&mut self, released: &mut Vec<TimedEvent>) {
        for timeline in self.partitions.values_mut() {
            timeline.drain(released);
        }
    }

    pub fn watermark(&self, partition: i32) -> Option<DateTime<Utc>> {
        self.partitions.get(&partition).and_then(|t| t.watermark())
    }

    pub fn buffered(&self) -> usize {
        self.partitions.values().map(|t| t.buffered()).sum()
    }

    pub fn stats(&self) -> WatermarkStats {
        self.stats
    }
}

/// Watermark stage task: reads sourced events, writes timed events in order.
pub(crate) async fn run(
    mut generator: WatermarkGenerator,
    mut input: mpsc::Receiver<StreamMessage<SourcedEvent>>,
    output: mpsc::Sender<StreamMessage<TimedEvent>>,
    reporter: Reporter,
) -> Result<()> {
    let mut released = Vec::new();
    while let Some(message) = input.recv().await {
        match message {
            StreamMessage::Event(sourced) => generator.process(sourced, &mut released),
            StreamMessage::Barrier(barrier) => {
                on_barrier(&mut generator, barrier, &output, &reporter, &mut released).await?;
                continue;
            }
        }
        forward(&output, &mut released).await?;
    }

    // end of input without a drain barrier, the run is being torn down
    if generator.buffered() > 0 {
        warn!(
            buffered = generator.buffered(),
            "Input closed with events still buffered, they are replayed on restart"
        );
    }
    let stats = generator.stats();
    info!(
        accepted = stats.accepted,
        late = stats.late,
        malformed = stats.malformed,
        "Watermark stage stopped"
    );
    Ok(())
}

async fn on_barrier(
    generator: &mut WatermarkGenerator,
    barrier: Barrier,
    output: &mpsc::Sender<StreamMessage<TimedEvent>>,
    reporter: &Reporter,
    released: &mut Vec<TimedEvent>,
) -> Result<()> {
    if barrier.is_drain() {
        generator.drain(released);
        forward(output, released).await?;
    }
    let buffered = generator.lowest_buffered_offsets();
    debug!(barrier = barrier.id, ?buffered, "Watermark reached barrier");
    reporter
        .ack(barrier.id, AckPayload::Buffered(buffered))
        .await?;
    output
        .send(StreamMessage::Barrier(barrier))
        .await
        .map_err(|_| Error::Watermark("downstream closed".to_string()))
}

async fn forward(
    output: &mpsc::Sender<StreamMessage<TimedEvent>>,
    released: &mut Vec<TimedEvent>,
) -> Result<()> {
    for event in released.drain(..) {
        output
            .send(StreamMessage::Event(event))
            .await
            .map_err(|_| Error::Watermark("downstream closed".to_string()))?;
    }
    Ok(())
}
