//! Job configuration, built once at startup from the process environment.
//!
//! Two layers, the second wins:
//! - `CLICKFLOW_CONFIG`, a base64 encoded JSON document covering every tunable.
//! - the individual variables the job has always been deployed with (`KAFKA_URL`,
//!   `POSTGRES_URL`, `IP_CODING_KEY`, ...).
//!
//! Validation happens here so that a bad deployment fails before the first record is read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use clickflow_kafka::sink::KafkaSinkConfig;
use clickflow_kafka::{
    KafkaSaslAuth, KafkaSourceConfig, StartOffset, TlsClientAuthCerts, TlsConfig,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

pub const ENV_CLICKFLOW_CONFIG: &str = "CLICKFLOW_CONFIG";
const ENV_KAFKA_URL: &str = "KAFKA_URL";
const ENV_KAFKA_TOPIC: &str = "KAFKA_TOPIC";
const ENV_KAFKA_GROUP: &str = "KAFKA_GROUP";
const ENV_KAFKA_KEY: &str = "KAFKA_WEB_TRAFFIC_KEY";
const ENV_KAFKA_SECRET: &str = "KAFKA_WEB_TRAFFIC_SECRET";
const ENV_KAFKA_START_OFFSET: &str = "KAFKA_START_OFFSET";
const ENV_KAFKA_SINK_TOPIC: &str = "KAFKA_SINK_TOPIC";
const ENV_POSTGRES_URL: &str = "POSTGRES_URL";
const ENV_POSTGRES_USER: &str = "POSTGRES_USER";
const ENV_POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
const ENV_POSTGRES_TABLE: &str = "POSTGRES_TABLE";
const ENV_IP_CODING_KEY: &str = "IP_CODING_KEY";
const ENV_IP_CODING_URL: &str = "IP_CODING_URL";
const ENV_CHECKPOINT_DIR: &str = "CHECKPOINT_DIR";
const ENV_PARALLELISM: &str = "PARALLELISM";
const ENV_SINKS: &str = "CLICKFLOW_SINKS";

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_LATENESS_MS: u64 = 15_000;
const DEFAULT_REORDER_CAPACITY: usize = 10_000;
const DEFAULT_GEO_ENDPOINT: &str = "https://api.ip2location.io";
const DEFAULT_GEO_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_GEO_CONCURRENCY: usize = 16;
const DEFAULT_TABLE: &str = "processed_events";
const DEFAULT_POSTGRES_CREDENTIAL: &str = "postgres";
const DEFAULT_POOL_SIZE: usize = 4;
const SINK_TOPIC_SUFFIX: &str = "process_events_kafka";
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_RESTARTS: u32 = 10;
const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Bounded exponential retry settings, shared by reads, lookups, flushes and restarts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub attempts: u16,
    pub base: Duration,
    pub max: Duration,
}

impl RetryConfig {
    const fn new(attempts: u16, base_ms: u64, max_ms: u64) -> Self {
        Self {
            attempts,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    pub fn strategy(&self) -> Exponential {
        Exponential::new(self.base, self.max)
            .jitter(0.1)
            .max_attempts(self.attempts)
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kafka: KafkaSourceConfig,
    pub batch_size: usize,
    pub read_timeout: Duration,
    pub read_retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatermarkConfig {
    /// How far behind the highest observed event time the watermark trails.
    pub lateness: Duration,
    /// Events held per partition before the oldest is released early.
    pub buffer_capacity: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            lateness: Duration::from_millis(DEFAULT_LATENESS_MS),
            buffer_capacity: DEFAULT_REORDER_CAPACITY,
        }
    }
}

/// What to do when a geolocation lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OnFailure {
    /// Emit the event with empty geodata straight away.
    #[default]
    FailOpen,
    /// Retry with backoff, then fall back to empty geodata.
    Retry(RetryConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnricherConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Upper bound for a single lookup, including any retries.
    pub timeout: Duration,
    pub concurrency: usize,
    pub on_failure: OnFailure,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GEO_ENDPOINT.to_string(),
            api_key: None,
            timeout: Duration::from_millis(DEFAULT_GEO_TIMEOUT_MS),
            concurrency: DEFAULT_GEO_CONCURRENCY,
            on_failure: OnFailure::FailOpen,
        }
    }
}

/// How the relational sink reacts to rows replayed after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Plain inserts, replayed rows show up twice.
    #[default]
    Append,
    /// `ON CONFLICT (ip, event_timestamp, url) DO NOTHING`; needs a matching unique index.
    IgnoreDuplicates,
}

impl FromStr for WriteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "append" => Ok(WriteMode::Append),
            "ignore_duplicates" => Ok(WriteMode::IgnoreDuplicates),
            other => Err(Error::Config(format!("unknown postgres write mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSinkConfig {
    pub pg: tokio_postgres::Config,
    pub table: String,
    pub mode: WriteMode,
    /// Rows per INSERT statement.
    pub batch_size: usize,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub enum SinkType {
    Postgres(PostgresSinkConfig),
    Kafka(KafkaSinkConfig),
    Log,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Unique per job, used for checkpoint markers and metric labels.
    pub name: String,
    pub sink_type: SinkType,
    pub flush_retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    pub interval: Duration,
    pub barrier_timeout: Duration,
    /// `None` keeps checkpoints in memory; restarts inside the process still resume, a new
    /// process starts from the configured start offset.
    pub dir: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
            barrier_timeout: Duration::from_millis(DEFAULT_BARRIER_TIMEOUT_MS),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub source: SourceConfig,
    pub watermark: WatermarkConfig,
    pub enricher: EnricherConfig,
    pub sinks: Vec<SinkConfig>,
    pub checkpoint: CheckpointConfig,
    pub restart: RestartConfig,
    /// Number of independent pipeline instances; each owns a slice of the topic's partitions.
    pub parallelism: u16,
    pub channel_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Settings {
    /// Builds the settings from environment variables, e.g. `std::env::vars()`.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .collect();
        Self::try_from(env_vars)
    }
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut doc = match env_vars.get(ENV_CLICKFLOW_CONFIG) {
            Some(encoded) => {
                let decoded = BASE64_STANDARD
                    .decode(encoded.trim().as_bytes())
                    .map_err(|e| Error::Config(format!("Failed to decode {ENV_CLICKFLOW_CONFIG}: {e:?}")))?;
                serde_json::from_slice::<SettingsDoc>(&decoded)
                    .map_err(|e| Error::Config(format!("Failed to parse {ENV_CLICKFLOW_CONFIG}: {e}")))?
            }
            None => SettingsDoc::default(),
        };
        doc.apply_env(&env_vars)?;
        let settings = doc.build()?;
        info!(
            topic = %settings.source.kafka.topic,
            parallelism = settings.parallelism,
            sinks = ?settings.sinks.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "Loaded settings"
        );
        Ok(settings)
    }
}

/// Returns an error unless `table` is a plain or schema qualified SQL identifier. The name is
/// spliced into statements, so nothing else is accepted.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name {table:?}")))
    }
}

fn parse_start_offset(value: &str) -> Result<StartOffset> {
    match value {
        "earliest" => Ok(StartOffset::Earliest),
        "latest" => Ok(StartOffset::Latest),
        "committed" => Ok(StartOffset::Committed),
        other => Err(Error::Config(format!(
            "unknown start offset {other:?}, expected earliest, latest or committed"
        ))),
    }
}

/// Accepts both libpq style URLs and the `jdbc:postgresql://` form.
fn parse_postgres_url(url: &str) -> Result<tokio_postgres::Config> {
    let url = url.strip_prefix("jdbc:").unwrap_or(url);
    tokio_postgres::Config::from_str(url)
        .map_err(|e| Error::Config(format!("invalid postgres url: {e}")))
}

/// `<first segment of the consumer group>.process_events_kafka`
fn default_sink_topic(consumer_group: &str) -> String {
    let prefix = consumer_group.split('.').next().unwrap_or(consumer_group);
    format!("{prefix}.{SINK_TOPIC_SUFFIX}")
}

fn non_zero(value: u64, what: &str) -> Result<Duration> {
    if value == 0 {
        return Err(Error::Config(format!("{what} must be greater than zero")));
    }
    Ok(Duration::from_millis(value))
}

// The JSON document. Every field is optional; defaults are applied in `build`.

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsDoc {
    source: SourceDoc,
    watermark: WatermarkDoc,
    enricher: EnricherDoc,
    sinks: Option<Vec<SinkDoc>>,
    checkpoint: CheckpointDoc,
    restart: RestartDoc,
    parallelism: Option<u16>,
    channel_capacity: Option<usize>,
    shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SourceDoc {
    brokers: Option<Vec<String>>,
    topic: Option<String>,
    consumer_group: Option<String>,
    sasl: Option<SaslDoc>,
    tls: Option<TlsDoc>,
    start_offset: Option<String>,
    batch_size: Option<usize>,
    read_timeout_ms: Option<u64>,
    read_retry: Option<RetryDoc>,
    kafka_raw_config: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mechanism", rename_all = "kebab-case")]
enum SaslDoc {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

impl From<SaslDoc> for KafkaSaslAuth {
    fn from(value: SaslDoc) -> Self {
        match value {
            SaslDoc::Plain { username, password } => KafkaSaslAuth::Plain { username, password },
            SaslDoc::ScramSha256 { username, password } => {
                KafkaSaslAuth::ScramSha256 { username, password }
            }
            SaslDoc::ScramSha512 { username, password } => {
                KafkaSaslAuth::ScramSha512 { username, password }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TlsDoc {
    insecure_skip_verify: bool,
    ca_cert: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
}

impl TlsDoc {
    fn build(self, what: &str) -> Result<TlsConfig> {
        let client_auth = match (self.client_cert, self.client_key) {
            (Some(client_cert), Some(client_cert_private_key)) => Some(TlsClientAuthCerts {
                client_cert,
                client_cert_private_key,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{what} tls needs both client_cert and client_key"
                )));
            }
        };
        Ok(TlsConfig {
            insecure_skip_verify: self.insecure_skip_verify,
            ca_cert: self.ca_cert,
            client_auth,
        })
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryDoc {
    attempts: u16,
    base_ms: u64,
    max_ms: u64,
}

impl RetryDoc {
    fn build(self, what: &str) -> Result<RetryConfig> {
        let base = non_zero(self.base_ms, &format!("{what} base_ms"))?;
        if self.max_ms < self.base_ms {
            return Err(Error::Config(format!("{what} max_ms is smaller than base_ms")));
        }
        Ok(RetryConfig {
            attempts: self.attempts,
            base,
            max: Duration::from_millis(self.max_ms),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WatermarkDoc {
    lateness_ms: Option<u64>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EnricherDoc {
    endpoint: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    concurrency: Option<usize>,
    on_failure: Option<OnFailureDoc>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
enum OnFailureDoc {
    FailOpen,
    Retry {
        attempts: u16,
        base_ms: u64,
        max_ms: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SinkDoc {
    Postgres {
        name: Option<String>,
        url: String,
        user: Option<String>,
        password: Option<String>,
        table: Option<String>,
        mode: Option<String>,
        batch_size: Option<usize>,
        pool_size: Option<usize>,
        flush_retry: Option<RetryDoc>,
    },
    Kafka {
        name: Option<String>,
        topic: Option<String>,
        brokers: Option<Vec<String>>,
        /// Defaults to the source's TLS settings.
        tls: Option<TlsDoc>,
        send_timeout_ms: Option<u64>,
        flush_retry: Option<RetryDoc>,
    },
    Log {
        name: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CheckpointDoc {
    interval_ms: Option<u64>,
    barrier_timeout_ms: Option<u64>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RestartDoc {
    max_restarts: Option<u32>,
    base_ms: Option<u64>,
    max_ms: Option<u64>,
}

const DEFAULT_READ_RETRY: RetryConfig = RetryConfig::new(5, 100, 5_000);
const DEFAULT_FLUSH_RETRY: RetryConfig = RetryConfig::new(5, 200, 10_000);

impl SettingsDoc {
    /// Overlays the individual environment variables on top of the document.
    fn apply_env(&mut self, env_vars: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| env_vars.get(key).filter(|v| !v.trim().is_empty()).cloned();

        if let Some(brokers) = get(ENV_KAFKA_URL) {
            self.source.brokers = Some(brokers.split(',').map(|b| b.trim().to_string()).collect());
        }
        if let Some(topic) = get(ENV_KAFKA_TOPIC) {
            self.source.topic = Some(topic);
        }
        if let Some(group) = get(ENV_KAFKA_GROUP) {
            self.source.consumer_group = Some(group);
        }
        if let Some(username) = get(ENV_KAFKA_KEY) {
            self.source.sasl = Some(SaslDoc::Plain {
                username,
                password: get(ENV_KAFKA_SECRET).unwrap_or_default(),
            });
        }
        if let Some(start) = get(ENV_KAFKA_START_OFFSET) {
            self.source.start_offset = Some(start);
        }
        if let Some(key) = get(ENV_IP_CODING_KEY) {
            self.enricher.api_key = Some(key);
        }
        if let Some(url) = get(ENV_IP_CODING_URL) {
            self.enricher.endpoint = Some(url);
        }
        if let Some(dir) = get(ENV_CHECKPOINT_DIR) {
            self.checkpoint.dir = Some(PathBuf::from(dir));
        }
        if let Some(parallelism) = get(ENV_PARALLELISM) {
            self.parallelism = Some(parallelism.trim().parse().map_err(|e| {
                Error::Config(format!("{ENV_PARALLELISM} is not a number: {e}"))
            })?);
        }

        let user = get(ENV_POSTGRES_USER);
        let password = get(ENV_POSTGRES_PASSWORD);
        let table = get(ENV_POSTGRES_TABLE);
        let sink_topic = get(ENV_KAFKA_SINK_TOPIC);

        if self.sinks.is_none() {
            // without an explicit list, a sink is enabled by configuring its destination
            let names: Vec<String> = match get(ENV_SINKS) {
                Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
                None => {
                    let mut names = vec![];
                    if get(ENV_POSTGRES_URL).is_some() {
                        names.push("postgres".to_string());
                    }
                    if sink_topic.is_some() {
                        names.push("kafka".to_string());
                    }
                    names
                }
            };
            let mut sinks = Vec::with_capacity(names.len());
            for name in names {
                let sink = match name.as_str() {
                    "postgres" => SinkDoc::Postgres {
                        name: None,
                        url: get(ENV_POSTGRES_URL).ok_or_else(|| {
                            Error::Config(format!("postgres sink needs {ENV_POSTGRES_URL}"))
                        })?,
                        user: None,
                        password: None,
                        table: None,
                        mode: None,
                        batch_size: None,
                        pool_size: None,
                        flush_retry: None,
                    },
                    "kafka" => SinkDoc::Kafka {
                        name: None,
                        topic: None,
                        brokers: None,
                        tls: None,
                        send_timeout_ms: None,
                        flush_retry: None,
                    },
                    "log" => SinkDoc::Log { name: None },
                    other => {
                        return Err(Error::Config(format!(
                            "unknown sink {other:?} in {ENV_SINKS}"
                        )));
                    }
                };
                sinks.push(sink);
            }
            self.sinks = Some(sinks);
        }

        for sink in self.sinks.iter_mut().flatten() {
            match sink {
                SinkDoc::Postgres {
                    user: doc_user,
                    password: doc_password,
                    table: doc_table,
                    ..
                } => {
                    if user.is_some() {
                        doc_user.clone_from(&user);
                    }
                    if password.is_some() {
                        doc_password.clone_from(&password);
                    }
                    if table.is_some() {
                        doc_table.clone_from(&table);
                    }
                }
                SinkDoc::Kafka { topic, .. } => {
                    if sink_topic.is_some() {
                        topic.clone_from(&sink_topic);
                    }
                }
                SinkDoc::Log { .. } => {}
            }
        }
        Ok(())
    }

    fn build(self) -> Result<Settings> {
        let source = self.source;
        let brokers = source
            .brokers
            .filter(|b| b.iter().any(|b| !b.is_empty()))
            .ok_or_else(|| Error::Config(format!("no Kafka brokers configured ({ENV_KAFKA_URL})")))?;
        let topic = source
            .topic
            .ok_or_else(|| Error::Config(format!("no source topic configured ({ENV_KAFKA_TOPIC})")))?;
        let consumer_group = source.consumer_group.ok_or_else(|| {
            Error::Config(format!("no consumer group configured ({ENV_KAFKA_GROUP})"))
        })?;
        let auth: Option<KafkaSaslAuth> = source.sasl.map(Into::into);
        let tls = source.tls.map(|t| t.build("source")).transpose()?;
        let start_offset = source
            .start_offset
            .as_deref()
            .map(parse_start_offset)
            .transpose()?
            .unwrap_or_default();
        let batch_size = source.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(Error::Config("source batch_size must be greater than zero".into()));
        }

        let source_config = SourceConfig {
            kafka: KafkaSourceConfig {
                brokers: brokers.clone(),
                topic,
                consumer_group: consumer_group.clone(),
                auth: auth.clone(),
                tls: tls.clone(),
                start_offset,
                kafka_raw_config: source.kafka_raw_config,
            },
            batch_size,
            read_timeout: non_zero(
                source.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                "source read_timeout_ms",
            )?,
            read_retry: source
                .read_retry
                .map(|r| r.build("source read_retry"))
                .transpose()?
                .unwrap_or(DEFAULT_READ_RETRY),
        };

        let buffer_capacity = self
            .watermark
            .buffer_capacity
            .unwrap_or(DEFAULT_REORDER_CAPACITY);
        if buffer_capacity == 0 {
            return Err(Error::Config("watermark buffer_capacity must be greater than zero".into()));
        }
        let watermark = WatermarkConfig {
            lateness: Duration::from_millis(self.watermark.lateness_ms.unwrap_or(DEFAULT_LATENESS_MS)),
            buffer_capacity,
        };

        let enricher_doc = self.enricher;
        let concurrency = enricher_doc.concurrency.unwrap_or(DEFAULT_GEO_CONCURRENCY);
        if concurrency == 0 {
            return Err(Error::Config("enricher concurrency must be greater than zero".into()));
        }
        let endpoint = enricher_doc
            .endpoint
            .unwrap_or_else(|| DEFAULT_GEO_ENDPOINT.to_string());
        reqwest::Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid geolocation endpoint {endpoint:?}: {e}")))?;
        if enricher_doc.api_key.is_none() {
            warn!("{ENV_IP_CODING_KEY} is not set, geolocation lookups are sent without a key");
        }
        let on_failure = match enricher_doc.on_failure {
            None | Some(OnFailureDoc::FailOpen) => OnFailure::FailOpen,
            Some(OnFailureDoc::Retry {
                attempts,
                base_ms,
                max_ms,
            }) => OnFailure::Retry(
                RetryDoc {
                    attempts,
                    base_ms,
                    max_ms,
                }
                .build("enricher retry")?,
            ),
        };
        let enricher = EnricherConfig {
            endpoint,
            api_key: enricher_doc.api_key,
            timeout: non_zero(
                enricher_doc.timeout_ms.unwrap_or(DEFAULT_GEO_TIMEOUT_MS),
                "enricher timeout_ms",
            )?,
            concurrency,
            on_failure,
        };

        let sink_docs = self.sinks.unwrap_or_default();
        if sink_docs.is_empty() {
            return Err(Error::Config(format!(
                "no sink configured, set {ENV_POSTGRES_URL}, {ENV_KAFKA_SINK_TOPIC} or {ENV_SINKS}"
            )));
        }
        let mut sinks: Vec<SinkConfig> = Vec::with_capacity(sink_docs.len());
        for sink_doc in sink_docs {
            let sink = match sink_doc {
                SinkDoc::Postgres {
                    name,
                    url,
                    user,
                    password,
                    table,
                    mode,
                    batch_size,
                    pool_size,
                    flush_retry,
                } => {
                    let mut pg = parse_postgres_url(&url)?;
                    if pg.get_user().is_none() || user.is_some() {
                        pg.user(user.as_deref().unwrap_or(DEFAULT_POSTGRES_CREDENTIAL));
                    }
                    if pg.get_password().is_none() || password.is_some() {
                        pg.password(password.as_deref().unwrap_or(DEFAULT_POSTGRES_CREDENTIAL));
                    }
                    let table = table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
                    validate_table_name(&table)?;
                    let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
                    if batch_size == 0 {
                        return Err(Error::Config(
                            "postgres batch_size must be greater than zero".into(),
                        ));
                    }
                    SinkConfig {
                        name: name.unwrap_or_else(|| "postgres".to_string()),
                        sink_type: SinkType::Postgres(PostgresSinkConfig {
                            pg,
                            table,
                            mode: mode.as_deref().map(WriteMode::from_str).transpose()?.unwrap_or_default(),
                            batch_size,
                            pool_size: pool_size.unwrap_or(DEFAULT_POOL_SIZE).max(1),
                        }),
                        flush_retry: flush_retry
                            .map(|r| r.build("postgres flush_retry"))
                            .transpose()?
                            .unwrap_or(DEFAULT_FLUSH_RETRY),
                    }
                }
                SinkDoc::Kafka {
                    name,
                    topic,
                    brokers: sink_brokers,
                    tls: sink_tls,
                    send_timeout_ms,
                    flush_retry,
                } => SinkConfig {
                    name: name.unwrap_or_else(|| "kafka".to_string()),
                    sink_type: SinkType::Kafka(KafkaSinkConfig {
                        brokers: sink_brokers.unwrap_or_else(|| brokers.clone()),
                        topic: topic.unwrap_or_else(|| default_sink_topic(&consumer_group)),
                        auth: auth.clone(),
                        tls: match sink_tls {
                            Some(t) => Some(t.build("kafka sink")?),
                            None => tls.clone(),
                        },
                        send_timeout: non_zero(
                            send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
                            "kafka sink send_timeout_ms",
                        )?,
                    }),
                    flush_retry: flush_retry
                        .map(|r| r.build("kafka flush_retry"))
                        .transpose()?
                        .unwrap_or(DEFAULT_FLUSH_RETRY),
                },
                SinkDoc::Log { name } => SinkConfig {
                    name: name.unwrap_or_else(|| "log".to_string()),
                    sink_type: SinkType::Log,
                    flush_retry: DEFAULT_FLUSH_RETRY,
                },
            };
            if sinks.iter().any(|s| s.name == sink.name) {
                return Err(Error::Config(format!("duplicate sink name {:?}", sink.name)));
            }
            sinks.push(sink);
        }

        let checkpoint = CheckpointConfig {
            interval: non_zero(
                self.checkpoint
                    .interval_ms
                    .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_MS),
                "checkpoint interval_ms",
            )?,
            barrier_timeout: non_zero(
                self.checkpoint
                    .barrier_timeout_ms
                    .unwrap_or(DEFAULT_BARRIER_TIMEOUT_MS),
                "checkpoint barrier_timeout_ms",
            )?,
            dir: self.checkpoint.dir,
        };
        if checkpoint.dir.is_none() {
            warn!("{ENV_CHECKPOINT_DIR} is not set, checkpoints do not survive a process restart");
        }

        let restart_defaults = RestartConfig::default();
        let restart = RestartConfig {
            max_restarts: self.restart.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            base: self
                .restart
                .base_ms
                .map(|ms| non_zero(ms, "restart base_ms"))
                .transpose()?
                .unwrap_or(restart_defaults.base),
            max: self
                .restart
                .max_ms
                .map(Duration::from_millis)
                .unwrap_or(restart_defaults.max),
        };

        let parallelism = self.parallelism.unwrap_or(1);
        if parallelism == 0 {
            return Err(Error::Config(format!("{ENV_PARALLELISM} must be at least 1")));
        }
        let channel_capacity = self.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        if channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be greater than zero".into()));
        }

        Ok(Settings {
            source: source_config,
            watermark,
            enricher,
            sinks,
            checkpoint,
            restart,
            parallelism,
            channel_capacity,
            shutdown_timeout: non_zero(
                self.shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
                "shutdown_timeout_ms",
            )?,
        })
    }
}
