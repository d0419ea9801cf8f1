use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::message::TimedEvent;

/// Outcome of offering an event to a [PartitionTimeline].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accepted,
    /// Behind the watermark, the event was dropped.
    Late,
}

/// Event-time progress of a single partition.
///
/// Accepted events wait in a reorder buffer keyed by `(event time, offset)` until the watermark
/// passes them. The watermark trails the highest event time seen by `lateness` and never moves
/// backwards.
pub(crate) struct PartitionTimeline {
    lateness: TimeDelta,
    capacity: usize,
    max_seen: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
    buffer: BTreeMap<(DateTime<Utc>, i64), TimedEvent>,
}

impl PartitionTimeline {
    pub(crate) fn new(lateness: TimeDelta, capacity: usize) -> Self {
        Self {
            lateness,
            capacity: capacity.max(1),
            max_seen: None,
            watermark: None,
            buffer: BTreeMap::new(),
        }
    }

    pub(crate) fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Offers an event. Events that became releasable, including one forced out by a full
    /// buffer, are appended to `released` in `(event time, offset)` order.
    pub(crate) fn observe(&mut self, event: TimedEvent, released: &mut Vec<TimedEvent>) -> Admission {
        let ts = event.event_timestamp;
        if self.watermark.is_some_and(|wm| ts < wm) {
            return Admission::Late;
        }

        self.buffer.insert((ts, event.offset), event);
        let max_seen = self.max_seen.map_or(ts, |seen| seen.max(ts));
        self.max_seen = Some(max_seen);
        // near the start of the calendar the bound saturates at the earliest instant
        let candidate = max_seen
            .checked_sub_signed(self.lateness)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.advance(candidate);

        if self.buffer.len() > self.capacity {
            if let Some(((oldest, _), _)) = self.buffer.first_key_value() {
                // raising the watermark to the forced event keeps the output ordered
                let oldest = *oldest;
                self.advance(oldest);
            }
        }
        self.release(released);
        // the forced release above may still leave the buffer over capacity when many events
        // share the oldest timestamp, pop those directly
        while self.buffer.len() > self.capacity {
            match self.buffer.pop_first() {
                Some((_, event)) => released.push(event),
                None => break,
            }
        }
        Admission::Accepted
    }

    /// Lowest offset still held back, if any.
    pub(crate) fn lowest_buffered_offset(&self) -> Option<i64> {
        self.buffer.keys().map(|(_, offset)| *offset).min()
    }

    /// Releases everything, in order. Used at end of input.
    pub(crate) fn drain(&mut self, released: &mut Vec<TimedEvent>) {
        if let Some(((last, _), _)) = self.buffer.last_key_value() {
            let last = *last;
            self.advance(last);
        }
        released.extend(std::mem::take(&mut self.buffer).into_values());
    }

    fn advance(&mut self, candidate: DateTime<Utc>) {
        self.watermark = Some(self.watermark.map_or(candidate, |wm| wm.max(candidate)));
    }

    fn release(&mut self, released: &mut Vec<TimedEvent>) {
        let Some(watermark) = self.watermark else {
            return;
        };
        while let Some(entry) = self.buffer.first_entry() {
            if entry.key().0 > watermark {
                break;
            }
            released.push(entry.remove());
        }
    }
}
