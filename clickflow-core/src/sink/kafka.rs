use std::collections::HashMap;

use bytes::Bytes;
use clickflow_kafka::sink::{KafkaSink, KafkaSinkConfig, KafkaSinkMessage};
use tracing::info;

use crate::message::{EnrichedEvent, ProcessedEvent};
use crate::sink::Sink;
use crate::{Error, Result};

pub(crate) fn new_kafka_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let topic = config.topic.clone();
    let sink = clickflow_kafka::sink::new_sink(config)
        .map_err(|e| Error::Connection(format!("kafka sink {topic}: {e}")))?;
    info!(topic = %topic, "Created kafka sink");
    Ok(sink)
}

impl TryFrom<&EnrichedEvent> for KafkaSinkMessage {
    type Error = Error;

    fn try_from(event: &EnrichedEvent) -> Result<Self> {
        let payload = serde_json::to_vec(&ProcessedEvent::from(event))
            .map_err(|e| Error::Sink(format!("encoding row: {e}")))?;
        Ok(Self {
            id: format!("{}-{}", event.event.partition, event.event.offset),
            key: Some(event.routing_key().to_string()),
            headers: HashMap::new(),
            payload: Bytes::from(payload),
        })
    }
}

impl Sink for KafkaSink {
    async fn sink(&self, events: &[EnrichedEvent]) -> Result<()> {
        let messages = events
            .iter()
            .map(KafkaSinkMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        let total = messages.len();
        let failed: Vec<String> = self
            .sink_messages(messages)
            .await
            .into_iter()
            .filter_map(|response| response.status.err().map(|e| format!("{}: {e}", response.id)))
            .collect();
        if let Some(first) = failed.first() {
            return Err(Error::Sink(format!(
                "{} of {total} messages not delivered to {}, first failure {first}",
                failed.len(),
                self.topic()
            )));
        }
        self.flush()
            .await
            .map_err(|e| Error::Sink(format!("flushing {}: {e}", self.topic())))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::message::{GeoData, RawEvent, TimedEvent};

    fn event(key: Option<&str>) -> EnrichedEvent {
        EnrichedEvent {
            event: TimedEvent {
                event: RawEvent {
                    url: "/a".into(),
                    referrer: "-".into(),
                    host: "x.com".into(),
                    ip: "8.8.8.8".into(),
                    event_time: "2024-01-01T00:00:00.000Z".into(),
                    ..Default::default()
                },
                event_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                partition: 2,
                offset: 41,
                key: key.map(str::to_string),
            },
            geodata: GeoData::empty(),
        }
    }

    #[test]
    fn message_carries_row_json_and_routing_key() {
        let message = KafkaSinkMessage::try_from(&event(None)).unwrap();
        assert_eq!(message.id, "2-41");
        assert_eq!(message.key.as_deref(), Some("8.8.8.8"));
        let row: ProcessedEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(row, ProcessedEvent::from(&event(None)));
        let json: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json["event_timestamp"], "2024-01-01 00:00:00.000");
        assert_eq!(json["geodata"], "{}");

        let keyed = KafkaSinkMessage::try_from(&event(Some("session-7"))).unwrap();
        assert_eq!(keyed.key.as_deref(), Some("session-7"));
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn publishes_rows() {
        use std::time::Duration;

        let sink = new_kafka_sink(KafkaSinkConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: "clickflow.process_events_kafka".to_string(),
            auth: None,
            tls: None,
            send_timeout: Duration::from_secs(5),
        })
        .unwrap();
        sink.sink(&[event(None), event(Some("k"))]).await.unwrap();
    }
}
