use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to start reading a partition that has no checkpointed offset. The position is resolved
/// to a concrete offset once, when the source connects, and reused by every later seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    Earliest,
    /// Only records produced after the job starts.
    #[default]
    Latest,
    /// The consumer group's committed offset, falling back to latest.
    Committed,
}

impl StartOffset {
    fn auto_offset_reset(self) -> &'static str {
        match self {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest | StartOffset::Committed => "latest",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic carrying the click events.
    pub topic: String,
    /// Used for committing offsets after a checkpoint; partitions are assigned explicitly.
    pub consumer_group: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    pub start_offset: StartOffset,
    /// Any supported librdkafka client option, applied before ours.
    pub kafka_raw_config: HashMap<String, String>,
}

/// The slice of the topic's partitions owned by one pipeline instance: partition `p` belongs to
/// instance `p % parallelism`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub parallelism: u16,
    pub instance: u16,
}

impl PartitionAssignment {
    pub fn single() -> Self {
        Self {
            parallelism: 1,
            instance: 0,
        }
    }

    pub fn owns(&self, partition: i32) -> bool {
        let parallelism = i32::from(self.parallelism.max(1));
        partition.rem_euclid(parallelism) == i32::from(self.instance)
    }
}

/// A record read from Kafka.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
}

struct ClickflowContext;

impl ClientContext for ClickflowContext {}

impl ConsumerContext for ClickflowContext {
    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed consumer group offsets"),
            Err(e) => error!(?e, "Committing consumer group offsets"),
        }
    }
}

type ClickflowConsumer = StreamConsumer<ClickflowContext>;

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Option<Result<Vec<KafkaMessage>>>>,
    },
    Seek {
        offsets: BTreeMap<i32, i64>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Commit {
        offsets: BTreeMap<i32, i64>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    StartOffsets {
        respond_to: oneshot::Sender<BTreeMap<i32, i64>>,
    },
}

struct KafkaActor {
    consumer: Arc<ClickflowConsumer>,
    topic: String,
    partitions: Vec<i32>,
    /// Where each owned partition starts when no checkpoint names it.
    start_offsets: BTreeMap<i32, i64>,
    read_timeout: Duration,
    batch_size: usize,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
    cancel_token: CancellationToken,
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        assignment: PartitionAssignment,
        resume_from: BTreeMap<i32, i64>,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", config.start_offset.auto_offset_reset());
        for (key, value) in &config.kafka_raw_config {
            client_config.set(key, value);
        }
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let consumer: Arc<ClickflowConsumer> = Arc::new(
            client_config
                .create_with_context(ClickflowContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        // Fetching metadata doubles as the credentials check, creating the consumer never fails
        // on bad credentials.
        let partitions: Vec<i32> = topic_partitions(Arc::clone(&consumer), config.topic.clone())
            .await?
            .into_iter()
            .filter(|p| assignment.owns(*p))
            .collect();
        let start_offsets = resolve_start_offsets(
            Arc::clone(&consumer),
            config.topic.clone(),
            partitions.clone(),
            config.start_offset,
        )
        .await?;
        info!(
            topic = %config.topic,
            ?partitions,
            ?start_offsets,
            instance = assignment.instance,
            "Assigning Kafka partitions"
        );

        let mut actor = KafkaActor {
            consumer,
            topic: config.topic,
            partitions,
            start_offsets,
            read_timeout,
            batch_size,
            handler_rx,
            cancel_token,
        };
        actor.assign(&resume_from)?;

        tokio::spawn(async move {
            info!("Starting Kafka consumer...");
            // terminates once every KafkaSource handle is dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        // a dropped receiver means the caller gave up waiting, nothing to report back to
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let _ = respond_to.send(self.read_messages().await);
            }
            KafkaActorMessage::Seek {
                offsets,
                respond_to,
            } => {
                let _ = respond_to.send(self.assign(&offsets));
            }
            KafkaActorMessage::Commit {
                offsets,
                respond_to,
            } => {
                let _ = respond_to.send(self.commit(offsets).await);
            }
            KafkaActorMessage::StartOffsets { respond_to } => {
                let _ = respond_to.send(self.start_offsets.clone());
            }
        }
    }

    /// (Re)assigns the owned partitions. Partitions with a known offset resume from it, the rest
    /// from their resolved start offset.
    fn assign(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for partition in &self.partitions {
            let offset = offsets
                .get(partition)
                .or_else(|| self.start_offsets.get(partition))
                .copied()
                .ok_or_else(|| Error::Kafka(format!("No start offset for partition {partition}")))?;
            tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(offset))
                .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        }
        self.consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to assign partitions: {e}")))
    }

    async fn read_messages(&mut self) -> Option<Result<Vec<KafkaMessage>>> {
        if self.cancel_token.is_cancelled() {
            return None;
        }

        // Give up after this many failures in a row, a successful read resets the count.
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;

        let mut messages: Vec<KafkaMessage> = Vec::with_capacity(self.batch_size);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        while messages.len() < self.batch_size {
            tokio::select! {
                biased;

                _ = &mut timeout => break,

                _ = self.cancel_token.cancelled() => break,

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Some(Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                ))));
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    messages.push(KafkaMessage {
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
                        // a record without payload decodes as malformed further down
                        value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                    });
                }
            }
        }
        debug!(msg_count = messages.len(), "Read messages from Kafka");
        Some(Ok(messages))
    }

    /// Commits `offsets` (the next offset to read per partition) to the consumer group.
    async fn commit(&mut self, offsets: BTreeMap<i32, i64>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset))
                .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        }
        // commit may block on the broker round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for commit task: {e:?}")))?
    }
}

async fn topic_partitions(consumer: Arc<ClickflowConsumer>, topic: String) -> Result<Vec<i32>> {
    // fetch_metadata is a blocking librdkafka call
    tokio::task::spawn_blocking(move || {
        let metadata = consumer
            .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
            .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;
        let topic_metadata = metadata
            .topics()
            .first()
            .ok_or_else(|| Error::Kafka(format!("No metadata found for topic {topic}")))?;
        if let Some(err) = topic_metadata.error() {
            return Err(Error::Kafka(format!("Topic {topic} is not available: {err:?}")));
        }
        Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
    })
    .await
    .map_err(|e| Error::Other(format!("Waiting for metadata task: {e:?}")))?
}

/// Turns the [StartOffset] of every partition into a concrete offset: the low or high watermark,
/// or the group's committed offset where there is one.
async fn resolve_start_offsets(
    consumer: Arc<ClickflowConsumer>,
    topic: String,
    partitions: Vec<i32>,
    start_offset: StartOffset,
) -> Result<BTreeMap<i32, i64>> {
    // both lookups are blocking librdkafka calls
    tokio::task::spawn_blocking(move || {
        let mut committed = BTreeMap::new();
        if start_offset == StartOffset::Committed && !partitions.is_empty() {
            let mut tpl = TopicPartitionList::new();
            for partition in &partitions {
                tpl.add_partition_offset(&topic, *partition, Offset::Invalid)
                    .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
            }
            let stored = consumer
                .committed_offsets(tpl, METADATA_TIMEOUT)
                .map_err(|e| Error::Kafka(format!("Failed to fetch committed offsets: {e}")))?;
            for elem in stored.elements() {
                if let Offset::Offset(offset) = elem.offset() {
                    committed.insert(elem.partition(), offset);
                }
            }
        }

        let mut offsets = BTreeMap::new();
        for partition in partitions {
            let offset = match committed.get(&partition) {
                Some(offset) => *offset,
                None => {
                    let (low, high) = consumer
                        .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                        .map_err(|e| {
                            Error::Kafka(format!("Failed to fetch watermarks of {partition}: {e}"))
                        })?;
                    match start_offset {
                        StartOffset::Earliest => low,
                        StartOffset::Latest | StartOffset::Committed => high,
                    }
                }
            };
            offsets.insert(partition, offset);
        }
        Ok(offsets)
    })
    .await
    .map_err(|e| Error::Other(format!("Waiting for start offsets task: {e:?}")))?
}

/// Handle to the consumer actor. Cheap to clone.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaSource {
    /// Connects, assigns the partitions owned by `assignment` and positions them at
    /// `resume_from` (next offset to read per partition) where known.
    pub async fn connect(
        config: KafkaSourceConfig,
        assignment: PartitionAssignment,
        resume_from: BTreeMap<i32, i64>,
        batch_size: usize,
        read_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(
            config,
            assignment,
            resume_from,
            batch_size,
            read_timeout,
            rx,
            cancel_token,
        )
        .await?;
        Ok(Self { actor_tx: tx })
    }

    /// Reads up to one batch. `None` once the source has been cancelled.
    pub async fn read_messages(&self) -> Option<Result<Vec<KafkaMessage>>> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(KafkaActorMessage::Read { respond_to: tx })
            .await;
        match rx.await {
            Ok(messages) => messages,
            Err(_) => Some(Err(Error::Other("Actor task terminated".into()))),
        }
    }

    pub async fn seek(&self, offsets: BTreeMap<i32, i64>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(KafkaActorMessage::Seek {
                offsets,
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn commit_offsets(&self, offsets: BTreeMap<i32, i64>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(KafkaActorMessage::Commit {
                offsets,
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    /// The resolved start offset of every owned partition.
    pub async fn start_offsets(&self) -> Result<BTreeMap<i32, i64>> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(KafkaActorMessage::StartOffsets { respond_to: tx })
            .await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_assignment_splits_by_modulo() {
        let first = PartitionAssignment {
            parallelism: 2,
            instance: 0,
        };
        let second = PartitionAssignment {
            parallelism: 2,
            instance: 1,
        };
        let owned_by_first: Vec<i32> = (0..6).filter(|p| first.owns(*p)).collect();
        let owned_by_second: Vec<i32> = (0..6).filter(|p| second.owns(*p)).collect();
        assert_eq!(owned_by_first, vec![0, 2, 4]);
        assert_eq!(owned_by_second, vec![1, 3, 5]);
        assert!((0..6).all(|p| PartitionAssignment::single().owns(p)));
    }

    #[test]
    fn start_offset_defaults_to_latest() {
        assert_eq!(StartOffset::default(), StartOffset::Latest);
        assert_eq!(StartOffset::Earliest.auto_offset_reset(), "earliest");
        assert_eq!(StartOffset::Committed.auto_offset_reset(), "latest");
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn test_read_seek_and_commit() {
        use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
        use rdkafka::producer::{FutureProducer, FutureRecord};

        let topic = format!("clickflow_source_test_{}", uuid::Uuid::new_v4().simple());
        let admin: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("admin client");
        admin
            .create_topics(
                &[NewTopic::new(&topic, 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .expect("create topic");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("producer");
        for i in 0..5 {
            producer
                .send(
                    FutureRecord::<str, _>::to(&topic).payload(&format!("event-{i}")),
                    Duration::from_secs(5),
                )
                .await
                .expect("produce");
        }

        let config = KafkaSourceConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic.clone(),
            consumer_group: format!("{topic}-group"),
            auth: None,
            tls: None,
            start_offset: StartOffset::Earliest,
            kafka_raw_config: HashMap::new(),
        };
        let source = KafkaSource::connect(
            config.clone(),
            PartitionAssignment::single(),
            BTreeMap::new(),
            5,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .expect("connect");

        let messages = source.read_messages().await.unwrap().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].value, Bytes::from("event-0"));

        source.seek(BTreeMap::from([(0, 3)])).await.unwrap();
        let replayed = source.read_messages().await.unwrap().unwrap();
        assert_eq!(replayed.first().map(|m| m.offset), Some(3));

        source.commit_offsets(BTreeMap::from([(0, 5)])).await.unwrap();
        assert_eq!(source.start_offsets().await.unwrap(), BTreeMap::from([(0, 0)]));

        // a latest start is pinned when connecting, later seeks do not move it to the new end
        let latest = KafkaSource::connect(
            KafkaSourceConfig {
                start_offset: StartOffset::Latest,
                consumer_group: format!("{topic}-latest"),
                ..config
            },
            PartitionAssignment::single(),
            BTreeMap::new(),
            5,
            Duration::from_secs(2),
            CancellationToken::new(),
        )
        .await
        .expect("connect");
        assert_eq!(latest.start_offsets().await.unwrap(), BTreeMap::from([(0, 5)]));
        producer
            .send(
                FutureRecord::<str, _>::to(&topic).payload("event-5"),
                Duration::from_secs(5),
            )
            .await
            .expect("produce");
        latest.seek(BTreeMap::new()).await.unwrap();
        let fresh = latest.read_messages().await.unwrap().unwrap();
        assert_eq!(fresh.first().map(|m| m.offset), Some(5));
    }
}
