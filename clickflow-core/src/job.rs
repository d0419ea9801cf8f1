//! The job: one restartable pipeline per parallelism unit, each resuming from its own last
//! committed checkpoint.

use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use clickflow_kafka::{KafkaSource, PartitionAssignment};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::coordinator::Outcome;
use crate::checkpoint::store::{CheckpointStore, CheckpointStoreType};
use crate::config::Settings;
use crate::enricher::ip2location::Ip2LocationClient;
use crate::enricher::{Enricher, GeoLookup};
use crate::message::PartitionOffsets;
use crate::metrics::{instance_labels, job_metrics};
use crate::pipeline::{self, RunContext};
use crate::sink::NamedSink;
use crate::source::SourceReader;
use crate::source::kafka::new_kafka_source;
use crate::{Error, Result};

/// Builds the external clients of a pipeline instance.
#[trait_variant::make(Components: Send)]
pub trait LocalComponents: Sync + 'static {
    type Reader: SourceReader;
    type Lookup: GeoLookup;

    /// Called once per instance, the reader is repositioned on every restart.
    async fn reader(
        &self,
        instance: u16,
        resume_from: PartitionOffsets,
        cancel: CancellationToken,
    ) -> Result<Self::Reader>;

    /// Called once per instance.
    fn lookup(&self, instance: u16) -> Result<Self::Lookup>;

    /// Called on every (re)start, so that no buffered state survives a failure.
    async fn sinks(&self, instance: u16) -> Result<Vec<NamedSink>>;
}

/// Kafka in, ip2location for geodata, and the configured sinks out.
pub struct KafkaComponents {
    settings: Settings,
}

impl KafkaComponents {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Components for KafkaComponents {
    type Reader = KafkaSource;
    type Lookup = Ip2LocationClient;

    async fn reader(
        &self,
        instance: u16,
        resume_from: PartitionOffsets,
        cancel: CancellationToken,
    ) -> Result<KafkaSource> {
        let source = &self.settings.source;
        new_kafka_source(
            source.kafka.clone(),
            PartitionAssignment {
                parallelism: self.settings.parallelism,
                instance,
            },
            resume_from,
            source.batch_size,
            source.read_timeout,
            cancel,
        )
        .await
    }

    fn lookup(&self, _instance: u16) -> Result<Ip2LocationClient> {
        let enricher = &self.settings.enricher;
        Ip2LocationClient::new(
            &enricher.endpoint,
            enricher.api_key.clone(),
            enricher.timeout,
        )
    }

    async fn sinks(&self, _instance: u16) -> Result<Vec<NamedSink>> {
        let mut sinks = Vec::with_capacity(self.settings.sinks.len());
        for config in &self.settings.sinks {
            sinks.push(NamedSink::from_config(config, self.settings.source.batch_size).await?);
        }
        Ok(sinks)
    }
}

pub struct Job<C> {
    settings: Settings,
    components: C,
}

impl Job<KafkaComponents> {
    pub fn from_settings(settings: Settings) -> Self {
        Job::new(settings.clone(), KafkaComponents::new(settings))
    }
}

impl<C: Components> Job<C> {
    pub fn new(settings: Settings, components: C) -> Self {
        Self {
            settings,
            components,
        }
    }

    /// Runs every pipeline instance until the input is exhausted, `cancel` fires, or an instance
    /// runs out of restarts. A failing instance stops its siblings.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let job_cancel = cancel.child_token();
        let instances = (0..self.settings.parallelism).map(|instance| {
            let job_cancel = job_cancel.clone();
            async move {
                let result = self.run_instance(instance, job_cancel.clone()).await;
                if let Err(e) = &result {
                    error!(instance, error = %e, "Pipeline instance stopped, stopping the job");
                    job_cancel.cancel();
                }
                result
            }
        });
        let results = join_all(instances).await;
        info!("Job stopped");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn run_instance(&self, instance: u16, cancel: CancellationToken) -> Result<()> {
        let restart = self.settings.restart;
        let store =
            CheckpointStoreType::new(self.settings.checkpoint.dir.as_deref(), instance).await?;
        let initial = store
            .load_latest()
            .await?
            .map(|c| c.offsets)
            .unwrap_or_default();
        let reader = self
            .components
            .reader(instance, initial, cancel.clone())
            .await?;
        let enricher = Enricher::new(
            self.components.lookup(instance)?,
            self.settings.enricher.clone(),
            instance,
        );

        let mut backoff = Exponential::new(restart.base, restart.max).jitter(0.1);
        let mut failures: u32 = 0;
        loop {
            let resume = store.load_latest().await?;
            let resumed_id = resume.as_ref().map(|c| c.checkpoint_id);
            let result = match self.components.sinks(instance).await {
                Ok(sinks) => {
                    let ctx = RunContext {
                        instance,
                        settings: &self.settings,
                        reader: reader.clone(),
                        enricher: enricher.clone(),
                        sinks,
                        store: store.clone(),
                        resume,
                    };
                    pipeline::run_once(ctx, cancel.clone()).await
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(Outcome::Finished) => {
                    info!(instance, "Input exhausted, pipeline finished");
                    return Ok(());
                }
                Ok(Outcome::Stopped) => {
                    info!(instance, "Pipeline stopped");
                    return Ok(());
                }
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                warn!(instance, error = %error, "Pipeline failed while shutting down");
                return Err(error);
            }

            // a run that committed a checkpoint made progress, only back to back failures count
            let progressed = store
                .load_latest()
                .await?
                .is_some_and(|c| Some(c.checkpoint_id) != resumed_id);
            if progressed {
                failures = 0;
                backoff.reset();
            }
            failures += 1;
            job_metrics()
                .restart_total
                .get_or_create(&instance_labels(instance))
                .inc();
            if failures > restart.max_restarts {
                error!(instance, error = %error, max_restarts = restart.max_restarts, "Restarts exhausted");
                return Err(Error::RestartsExhausted(restart.max_restarts, Box::new(error)));
            }

            let delay: Duration = backoff.next().unwrap_or(restart.max);
            warn!(
                instance,
                error = %error,
                attempt = failures,
                delay_ms = delay.as_millis(),
                "Pipeline failed, restarting from the last checkpoint"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    use bytes::Bytes;
    use chrono::{NaiveDate, TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::checkpoint::store::FileCheckpointStore;
    use crate::config::RetryConfig;
    use crate::enricher::LookupError;
    use crate::message::{GeoData, Location, SourceRecord};
    use crate::sink::SinkClientType;
    use crate::sink::memory::MemorySink;
    use crate::source::memory::MemorySource;

    #[derive(Clone)]
    struct FixedLookup {
        table: Arc<HashMap<String, Location>>,
    }

    impl FixedLookup {
        fn new(entries: &[(&str, &str, &str, &str)]) -> Self {
            let table = entries
                .iter()
                .map(|(ip, country, state, city)| {
                    (
                        ip.to_string(),
                        Location {
                            country: country.to_string(),
                            state: state.to_string(),
                            city: city.to_string(),
                        },
                    )
                })
                .collect();
            Self {
                table: Arc::new(table),
            }
        }
    }

    impl GeoLookup for FixedLookup {
        async fn lookup(&self, ip: &str) -> std::result::Result<Location, LookupError> {
            self.table.get(ip).cloned().ok_or(LookupError::Status(500))
        }
    }

    struct TestComponents {
        source: MemorySource,
        lookup: FixedLookup,
        sinks: Vec<(String, MemorySink)>,
        sink_batch_size: usize,
    }

    impl Components for TestComponents {
        type Reader = MemorySource;
        type Lookup = FixedLookup;

        async fn reader(
            &self,
            _instance: u16,
            _resume_from: PartitionOffsets,
            _cancel: CancellationToken,
        ) -> Result<MemorySource> {
            Ok(self.source.clone())
        }

        fn lookup(&self, _instance: u16) -> Result<FixedLookup> {
            Ok(self.lookup.clone())
        }

        async fn sinks(&self, _instance: u16) -> Result<Vec<NamedSink>> {
            Ok(self
                .sinks
                .iter()
                .map(|(name, sink)| NamedSink {
                    name: name.clone(),
                    client: SinkClientType::Memory(sink.clone()),
                    batch_size: self.sink_batch_size,
                    // every failed write fails the run
                    flush_retry: RetryConfig {
                        attempts: 0,
                        base: Duration::from_millis(1),
                        max: Duration::from_millis(1),
                    },
                })
                .collect())
        }
    }

    fn settings(checkpoint_dir: Option<&std::path::Path>) -> Settings {
        let mut settings = Settings::load([
            ("KAFKA_URL", "localhost:9092"),
            ("KAFKA_TOPIC", "bootcamp-events"),
            ("KAFKA_GROUP", "web-events.consumer"),
            ("CLICKFLOW_SINKS", "log"),
        ])
        .unwrap();
        settings.checkpoint.interval = Duration::from_millis(20);
        settings.checkpoint.barrier_timeout = Duration::from_secs(2);
        settings.checkpoint.dir = checkpoint_dir.map(|d| d.to_path_buf());
        settings.restart.base = Duration::from_millis(5);
        settings.restart.max = Duration::from_millis(20);
        settings.shutdown_timeout = Duration::from_secs(2);
        settings
    }

    fn event_time(secs: i64) -> String {
        (Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs))
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    fn record(partition: i32, offset: i64, ip: &str, secs: i64) -> SourceRecord {
        let payload = serde_json::json!({
            "ip": ip,
            "event_time": event_time(secs),
            "url": "/a",
            "referrer": "-",
            "host": "x.com",
            "user_agent": "UA",
            "headers": "{}",
        });
        SourceRecord {
            partition,
            offset,
            key: None,
            payload: Bytes::from(payload.to_string()),
        }
    }

    fn raw(partition: i32, offset: i64, payload: &str) -> SourceRecord {
        SourceRecord {
            partition,
            offset,
            key: None,
            payload: Bytes::from(payload.to_string()),
        }
    }

    async fn stored_offsets(dir: &std::path::Path) -> PartitionOffsets {
        FileCheckpointStore::new(dir, 0)
            .await
            .unwrap()
            .load_latest()
            .await
            .unwrap()
            .unwrap()
            .offsets
    }

    #[tokio::test]
    async fn enriches_and_writes_to_every_sink() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new(
            vec![
                record(0, 0, "8.8.8.8", 0),
                record(0, 1, "1.1.1.1", 1),
                raw(0, 2, "not json"),
                raw(0, 3, r#"{"ip":"2.2.2.2","event_time":"2024-01-01 00:00:00"}"#),
                record(0, 4, "9.9.9.9", 60),
                // 58 seconds behind the newest event, past the lateness bound
                record(0, 5, "4.4.4.4", 2),
            ],
            2,
        );
        let primary = MemorySink::default();
        let secondary = MemorySink::default();
        let components = TestComponents {
            source,
            lookup: FixedLookup::new(&[
                ("8.8.8.8", "US", "CA", "Mountain View"),
                ("9.9.9.9", "CH", "Zurich", "Zurich"),
            ]),
            sinks: vec![
                ("primary".to_string(), primary.clone()),
                ("secondary".to_string(), secondary.clone()),
            ],
            sink_batch_size: 10,
        };

        Job::new(settings(Some(dir.path())), components)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let rows = primary.rows();
        assert_eq!(rows, secondary.rows());
        let ips: Vec<&str> = rows.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["8.8.8.8", "1.1.1.1", "9.9.9.9"]);

        let located = &rows[0];
        assert_eq!(
            located.event_timestamp,
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
        assert_eq!(located.event_timestamp_text(), "2024-01-01 00:00:00.000");
        assert_eq!(
            located.geodata_text(),
            r#"{"country":"US","state":"CA","city":"Mountain View"}"#
        );
        assert_eq!(rows[1].geodata, GeoData::empty());
        assert_eq!(rows[1].geodata_text(), "{}");

        // the final checkpoint covers the whole input
        assert_eq!(stored_offsets(dir.path()).await, PartitionOffsets::from([(0, 6)]));
    }

    #[tokio::test]
    async fn restart_replays_from_checkpoint_without_losing_events() {
        let records: Vec<SourceRecord> = (0..2)
            .flat_map(|partition| {
                (0..30).map(move |offset| {
                    record(partition, offset, &format!("10.0.{partition}.{offset}"), offset)
                })
            })
            .collect();
        let expected: BTreeSet<String> = records
            .iter()
            .map(|r| format!("10.0.{}.{}", r.partition, r.offset))
            .collect();

        // 60 rows in batches of at most 5, so every crash point below is reached
        for crash_after in 0..12 {
            let dir = tempfile::tempdir().unwrap();
            let source =
                MemorySource::new(records.clone(), 4).with_read_delay(Duration::from_millis(5));
            let sink = MemorySink::default();
            sink.fail_after(crash_after);
            let components = TestComponents {
                source,
                lookup: FixedLookup::new(&[]),
                sinks: vec![("memory".to_string(), sink.clone())],
                sink_batch_size: 5,
            };
            let mut settings = settings(Some(dir.path()));
            settings.watermark.lateness = Duration::from_secs(2);

            Job::new(settings, components)
                .run(CancellationToken::new())
                .await
                .unwrap();

            let written: Vec<String> = sink.rows().into_iter().map(|r| r.ip).collect();
            let unique: BTreeSet<String> = written.iter().cloned().collect();
            // duplicates are allowed, gaps are not
            assert_eq!(unique, expected, "crash after {crash_after} batches");
            assert!(written.len() >= expected.len());
            assert_eq!(sink.failed_writes(), 1, "crash after {crash_after} batches");
            assert_eq!(
                stored_offsets(dir.path()).await,
                PartitionOffsets::from([(0, 30), (1, 30)])
            );
        }
    }

    #[tokio::test]
    async fn quiet_partition_is_pinned_by_the_first_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        // both partitions hold a record from before the job started, skipped at the latest offset
        let source = MemorySource::new(
            vec![record(0, 0, "10.0.0.0", 0), record(1, 0, "10.0.1.0", 0)],
            4,
        )
        .starting_at_end();
        for offset in 1..4 {
            source.push(record(0, offset, &format!("10.0.0.{offset}"), offset));
        }
        let sink = MemorySink::default();
        let components = || TestComponents {
            source: source.clone(),
            lookup: FixedLookup::new(&[]),
            sinks: vec![("memory".to_string(), sink.clone())],
            sink_batch_size: 5,
        };

        Job::new(settings(Some(dir.path())), components())
            .run(CancellationToken::new())
            .await
            .unwrap();
        // partition 1 delivered nothing and is still recorded at its start
        assert_eq!(
            stored_offsets(dir.path()).await,
            PartitionOffsets::from([(0, 4), (1, 1)])
        );

        for offset in 1..4 {
            source.push(record(1, offset, &format!("10.0.1.{offset}"), offset));
        }
        Job::new(settings(Some(dir.path())), components())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let ips: BTreeSet<String> = sink.rows().into_iter().map(|r| r.ip).collect();
        let expected: BTreeSet<String> = (0..2)
            .flat_map(|partition| (1..4).map(move |offset| format!("10.0.{partition}.{offset}")))
            .collect();
        assert_eq!(ips, expected);
        assert_eq!(
            stored_offsets(dir.path()).await,
            PartitionOffsets::from([(0, 4), (1, 4)])
        );
    }

    #[tokio::test]
    async fn out_of_range_event_time_is_dropped_without_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new(
            vec![
                raw(0, 0, r#"{"ip":"1.1.1.1","event_time":"-262143-01-01T00:00:00.000Z"}"#),
                raw(0, 1, r#"{"ip":"2.2.2.2","event_time":"0000-01-01T00:00:00.000Z"}"#),
                record(0, 2, "8.8.8.8", 0),
            ],
            4,
        );
        let sink = MemorySink::default();
        let components = TestComponents {
            source,
            lookup: FixedLookup::new(&[]),
            sinks: vec![("memory".to_string(), sink.clone())],
            sink_batch_size: 5,
        };
        let mut settings = settings(Some(dir.path()));
        settings.restart.max_restarts = 0;
        settings.watermark.lateness = Duration::MAX;

        Job::new(settings, components)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let ips: Vec<String> = sink.rows().into_iter().map(|r| r.ip).collect();
        assert_eq!(ips, vec!["2.2.2.2", "8.8.8.8"]);
        assert_eq!(sink.failed_writes(), 0);
        assert_eq!(stored_offsets(dir.path()).await, PartitionOffsets::from([(0, 3)]));
    }

    #[tokio::test]
    async fn gives_up_after_max_restarts() {
        let source = MemorySource::new((0..5).map(|o| record(0, o, "8.8.8.8", o)).collect(), 5);
        let sink = MemorySink::default();
        sink.fail_next(usize::MAX);
        let components = TestComponents {
            source,
            lookup: FixedLookup::new(&[]),
            sinks: vec![("memory".to_string(), sink.clone())],
            sink_batch_size: 1,
        };
        let mut settings = settings(None);
        settings.checkpoint.interval = Duration::from_secs(10);
        settings.watermark.lateness = Duration::ZERO;
        settings.restart.max_restarts = 2;

        let result = Job::new(settings, components)
            .run(CancellationToken::new())
            .await;
        assert!(
            matches!(result, Err(Error::RestartsExhausted(2, _))),
            "{result:?}"
        );
        assert!(sink.rows().is_empty());
        assert_eq!(sink.failed_writes(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_an_unfinished_job() {
        let source = MemorySource::new(
            (0..1_000).map(|o| record(0, o, "8.8.8.8", o)).collect(),
            1,
        )
        .with_read_delay(Duration::from_millis(5));
        let sink = MemorySink::default();
        let components = TestComponents {
            source,
            lookup: FixedLookup::new(&[("8.8.8.8", "US", "CA", "Mountain View")]),
            sinks: vec![("memory".to_string(), sink.clone())],
            sink_batch_size: 1,
        };
        let mut settings = settings(None);
        settings.watermark.lateness = Duration::ZERO;

        let cancel = CancellationToken::new();
        let job = Job::new(settings, components);
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), job.run(cancel))
            .await
            .expect("job did not stop")
            .unwrap();

        let rows = sink.rows();
        assert!(!rows.is_empty());
        assert!(rows.len() < 1_000);
    }
}
