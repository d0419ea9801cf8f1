use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Format of `event_time` on the wire, e.g. `2024-01-01T00:00:00.000Z`.
const EVENT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const EVENT_TIME_LEN: usize = "2024-01-01T00:00:00.000Z".len();
/// Format of `event_timestamp` in sink rows, e.g. `2024-01-01 00:00:00.000`.
const SINK_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Next offset to read (source side) or an offset position (watermark side), per partition.
pub type PartitionOffsets = BTreeMap<i32, i64>;

/// A click as published by the web servers. Every field is text; missing or null fields decode as
/// empty strings and nested JSON (typically `headers`) is kept as its JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEvent {
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(deserialize_with = "lenient_string")]
    pub referrer: String,
    #[serde(deserialize_with = "lenient_string")]
    pub user_agent: String,
    #[serde(deserialize_with = "lenient_string")]
    pub host: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ip: String,
    #[serde(deserialize_with = "lenient_string")]
    pub headers: String,
    #[serde(deserialize_with = "lenient_string")]
    pub event_time: String,
}

impl RawEvent {
    /// Decodes a queue payload. Anything but a JSON object is malformed.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(serde::de::Error::custom("payload is not a JSON object"));
        }
        serde_json::from_value(value)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Parses `event_time`. A four digit year, exactly three fractional digits and a literal `Z` are
/// required.
pub fn parse_event_time(event_time: &str) -> Option<DateTime<Utc>> {
    // `%Y` alone takes signed years of any width
    let bytes = event_time.as_bytes();
    if bytes.len() != EVENT_TIME_LEN || !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    NaiveDateTime::parse_from_str(event_time, EVENT_TIME_FORMAT)
        .ok()
        .map(|ts| ts.and_utc())
}

/// An undecoded record as handed over by the queue client.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl From<clickflow_kafka::KafkaMessage> for SourceRecord {
    fn from(message: clickflow_kafka::KafkaMessage) -> Self {
        Self {
            partition: message.partition,
            offset: message.offset,
            key: message.key,
            payload: message.value,
        }
    }
}

/// A decoded event read from `partition` at `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedEvent {
    pub event: RawEvent,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// A [SourcedEvent] whose event time parsed and which the watermark accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub event: RawEvent,
    pub event_timestamp: DateTime<Utc>,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub state: String,
    pub city: String,
}

/// Geolocation attached to an event: `{"country":..,"state":..,"city":..}` or `{}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeoData {
    Located(Location),
    Empty {},
}

impl GeoData {
    pub fn empty() -> Self {
        GeoData::Empty {}
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, GeoData::Empty {})
    }
}

impl From<Location> for GeoData {
    fn from(location: Location) -> Self {
        GeoData::Located(location)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEvent {
    pub event: TimedEvent,
    pub geodata: GeoData,
}

impl EnrichedEvent {
    /// Key for keyed sinks: the upstream record key when present, else the client ip.
    pub fn routing_key(&self) -> &str {
        self.event
            .key
            .as_deref()
            .unwrap_or(self.event.event.ip.as_str())
    }
}

/// The row written to every sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub ip: String,
    #[serde(with = "sink_timestamp")]
    pub event_timestamp: NaiveDateTime,
    pub referrer: String,
    pub host: String,
    pub url: String,
    #[serde(with = "geodata_text")]
    pub geodata: GeoData,
}

impl ProcessedEvent {
    pub fn event_timestamp_text(&self) -> String {
        self.event_timestamp
            .format(SINK_TIMESTAMP_FORMAT)
            .to_string()
    }

    pub fn geodata_text(&self) -> String {
        geodata_text::render(&self.geodata)
    }
}

impl From<&EnrichedEvent> for ProcessedEvent {
    fn from(enriched: &EnrichedEvent) -> Self {
        let event = &enriched.event.event;
        Self {
            ip: event.ip.clone(),
            event_timestamp: enriched.event.event_timestamp.naive_utc(),
            referrer: event.referrer.clone(),
            host: event.host.clone(),
            url: event.url.clone(),
            geodata: enriched.geodata.clone(),
        }
    }
}

impl fmt::Display for ProcessedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip={} event_timestamp={} referrer={} host={} url={} geodata={}",
            self.ip,
            self.event_timestamp_text(),
            self.referrer,
            self.host,
            self.url,
            self.geodata_text()
        )
    }
}

mod sink_timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SINK_TIMESTAMP_FORMAT;

    pub(super) fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(SINK_TIMESTAMP_FORMAT))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&text, SINK_TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// GeoData travels as a JSON string inside the row, not as a nested object.
mod geodata_text {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::GeoData;

    /// Same text as `serde_json::to_string`, field order included, without the fallible API.
    pub(super) fn render(geodata: &GeoData) -> String {
        let quote = |s: &str| serde_json::Value::from(s).to_string();
        match geodata {
            GeoData::Located(location) => format!(
                r#"{{"country":{},"state":{},"city":{}}}"#,
                quote(&location.country),
                quote(&location.state),
                quote(&location.city)
            ),
            GeoData::Empty {} => "{}".to_string(),
        }
    }

    pub(super) fn serialize<S: Serializer>(geodata: &GeoData, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&render(geodata))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<GeoData, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Why a barrier was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Periodic checkpoint.
    Checkpoint,
    /// Final checkpoint on shutdown or end of input; stages release everything they hold first.
    Drain,
}

/// Checkpoint marker flowing through the stages in line with the events.
#[derive(Debug, Clone, PartialEq)]
pub struct Barrier {
    pub id: u64,
    pub kind: BarrierKind,
    /// Source position (next offset to read) at the moment the barrier was injected.
    pub source_offsets: PartitionOffsets,
}

impl Barrier {
    pub fn is_drain(&self) -> bool {
        self.kind == BarrierKind::Drain
    }
}

/// What travels on the channels between stages.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage<T> {
    Event(T),
    Barrier(Barrier),
}
