use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::message::{PartitionOffsets, SourceRecord};
use crate::source::SourceReader;

#[derive(Default)]
struct State {
    /// Records per partition, ordered by offset.
    partitions: BTreeMap<i32, Vec<SourceRecord>>,
    /// Next offset to read per partition.
    cursors: PartitionOffsets,
    /// Resolved once, like a queue consumer resolving its start position when connecting.
    start: PartitionOffsets,
    /// Unlisted partitions seek to their current end instead of their first record.
    seek_to_end: bool,
    committed: Vec<PartitionOffsets>,
    reads: usize,
}

/// Replays a fixed set of records, round-robin over partitions, and reports end of input once
/// every partition has been read. Clones share the position.
#[derive(Clone)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
    batch_size: usize,
    read_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>, batch_size: usize) -> Self {
        let mut state = State::default();
        for record in records {
            state.partitions.entry(record.partition).or_default().push(record);
        }
        for (partition, records) in state.partitions.iter_mut() {
            records.sort_by_key(|r| r.offset);
            if let Some(first) = records.first() {
                state.start.insert(*partition, first.offset);
            }
        }
        state.cursors = state.start.clone();
        Self {
            state: Arc::new(Mutex::new(state)),
            batch_size: batch_size.max(1),
            read_delay: None,
        }
    }

    /// Skips the records present so far, the way a consumer starting at the latest offset does.
    pub fn starting_at_end(self) -> Self {
        {
            let mut state = self.state.lock();
            let ends = end_offsets(&state.partitions);
            state.start = ends.clone();
            state.cursors = ends;
            state.seek_to_end = true;
        }
        self
    }

    /// Appends a record that arrived after the source was created.
    pub fn push(&self, record: SourceRecord) {
        let mut state = self.state.lock();
        let records = state.partitions.entry(record.partition).or_default();
        let at = records.partition_point(|r| r.offset < record.offset);
        records.insert(at, record);
    }

    /// Sleeps before every read, so that checkpoints can happen mid-stream.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Every offset map passed to [SourceReader::commit], in order.
    pub fn committed(&self) -> Vec<PartitionOffsets> {
        self.state.lock().committed.clone()
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }
}

impl SourceReader for MemorySource {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn read(&self) -> crate::Result<Option<Vec<SourceRecord>>> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.reads += 1;

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut progressed = true;
        while batch.len() < self.batch_size && progressed {
            progressed = false;
            for (partition, records) in &state.partitions {
                if batch.len() >= self.batch_size {
                    break;
                }
                let cursor = state.cursors.get(partition).copied().unwrap_or(0);
                if let Some(record) = records.iter().find(|r| r.offset >= cursor) {
                    state.cursors.insert(*partition, record.offset + 1);
                    batch.push(record.clone());
                    progressed = true;
                }
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn start_offsets(&self) -> crate::Result<PartitionOffsets> {
        Ok(self.state.lock().start.clone())
    }

    async fn seek(&self, offsets: &PartitionOffsets) -> crate::Result<()> {
        let mut state = self.state.lock();
        let fallback: PartitionOffsets = if state.seek_to_end {
            end_offsets(&state.partitions)
        } else {
            state
                .partitions
                .iter()
                .filter_map(|(partition, records)| records.first().map(|r| (*partition, r.offset)))
                .collect()
        };
        state.cursors = fallback;
        for (partition, offset) in offsets {
            state.cursors.insert(*partition, *offset);
        }
        Ok(())
    }

    async fn commit(&self, offsets: &PartitionOffsets) -> crate::Result<()> {
        self.state.lock().committed.push(offsets.clone());
        Ok(())
    }
}

fn end_offsets(partitions: &BTreeMap<i32, Vec<SourceRecord>>) -> PartitionOffsets {
    partitions
        .iter()
        .filter_map(|(partition, records)| records.last().map(|r| (*partition, r.offset + 1)))
        .collect()
}
