use tracing::info;

use crate::Result;
use crate::message::{EnrichedEvent, ProcessedEvent};
use crate::sink::Sink;

#[derive(Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

impl Sink for LogSink {
    async fn sink(&self, events: &[EnrichedEvent]) -> Result<()> {
        for event in events {
            info!(
                sink = %self.name,
                partition = event.event.partition,
                offset = event.event.offset,
                "{}",
                ProcessedEvent::from(event)
            );
        }
        Ok(())
    }
}
