use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::{EnrichedEvent, ProcessedEvent};
use crate::sink::Sink;
use crate::{Error, Result};

#[derive(Default)]
struct State {
    rows: Vec<(String, ProcessedEvent)>,
    batches: usize,
    failures_left: usize,
    fail_after: Option<usize>,
    failed: usize,
}

/// Keeps every written row. Clones share the rows, so a test can hand one clone to the job and
/// inspect another.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<State>>,
}

impl MemorySink {
    /// Fails the next `batches` writes.
    pub fn fail_next(&self, batches: usize) {
        self.state.lock().failures_left = batches;
    }

    /// Fails the first write attempted once `batches` writes have succeeded.
    pub fn fail_after(&self, batches: usize) {
        self.state.lock().fail_after = Some(batches);
    }

    pub fn rows(&self) -> Vec<ProcessedEvent> {
        self.state.lock().rows.iter().map(|(_, row)| row.clone()).collect()
    }

    /// Rows with the key a keyed sink would have used.
    pub fn keyed_rows(&self) -> Vec<(String, ProcessedEvent)> {
        self.state.lock().rows.clone()
    }

    /// Number of injected failures so far.
    pub fn failed_writes(&self) -> usize {
        self.state.lock().failed
    }

    /// Number of successful writes.
    pub fn batches(&self) -> usize {
        self.state.lock().batches
    }
}

impl Sink for MemorySink {
    async fn sink(&self, events: &[EnrichedEvent]) -> Result<()> {
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            state.failed += 1;
            return Err(Error::Sink("injected write failure".to_string()));
        }
        if state.fail_after.is_some_and(|after| state.batches >= after) {
            state.fail_after = None;
            state.failed += 1;
            return Err(Error::Sink("injected write failure".to_string()));
        }
        state.rows.extend(
            events
                .iter()
                .map(|event| (event.routing_key().to_string(), ProcessedEvent::from(event))),
        );
        state.batches += 1;
        Ok(())
    }
}
