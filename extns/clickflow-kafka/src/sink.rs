use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream::FuturesUnordered};
use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    /// How long a single record may sit in the producer before delivery is reported as failed.
    pub send_timeout: Duration,
}

/// Producer for the processed-events topic. Cloning shares the underlying producer.
#[derive(Clone)]
pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

pub struct KafkaSinkMessage {
    /// Caller-side id, echoed back in the response.
    pub id: String,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

pub struct KafkaSinkResponse {
    pub id: String,
    pub status: Result<()>,
}

pub fn new_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set(
            "message.timeout.ms",
            config.send_timeout.as_millis().to_string(),
        )
        .set("client.id", "clickflow-kafka-sink")
        .set_log_level(RDKafkaLogLevel::Warning);

    crate::update_auth_config(&mut client_config, config.tls, config.auth);

    let producer: FutureProducer = client_config
        .create()
        .map_err(|e| Error::Kafka(format!("Failed to create producer: {e}")))?;

    Ok(KafkaSink {
        producer,
        topic: config.topic,
        send_timeout: config.send_timeout,
    })
}

impl KafkaSink {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Sends all messages concurrently and reports a status per message. Responses come back in
    /// completion order, use the `id` to correlate.
    pub async fn sink_messages(&self, messages: Vec<KafkaSinkMessage>) -> Vec<KafkaSinkResponse> {
        let mut send_futures = FuturesUnordered::new();
        let message_count = messages.len();
        for msg in messages {
            let fut = async move {
                let KafkaSinkMessage {
                    id,
                    key,
                    headers: inp_headers,
                    payload,
                } = msg;
                let mut headers = OwnedHeaders::new();
                for (key, value) in &inp_headers {
                    headers = headers.insert(Header {
                        key,
                        value: Some(value),
                    });
                }
                let mut record: FutureRecord<'_, String, _> = FutureRecord::to(&self.topic)
                    .headers(headers)
                    .payload(payload.as_ref());
                if let Some(ref key) = key {
                    record = record.key(key);
                }
                match self.producer.send(record, self.send_timeout).await {
                    Ok(_) => KafkaSinkResponse { id, status: Ok(()) },
                    Err((e, _)) => {
                        tracing::error!(?e, topic = %self.topic, "Sending payload to Kafka topic");
                        KafkaSinkResponse {
                            id,
                            status: Err(Error::Kafka(format!("Sending payload to kafka: {e:?}"))),
                        }
                    }
                }
            };
            send_futures.push(fut);
        }
        let mut results = Vec::with_capacity(message_count);
        while let Some(status) = send_futures.next().await {
            results.push(status);
        }
        results
    }

    /// Waits until every in-flight record has been delivered or failed.
    pub async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        // librdkafka's flush blocks the calling thread
        tokio::task::spawn_blocking(move || {
            producer
                .flush(timeout)
                .map_err(|e| Error::Kafka(format!("Flushing producer: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for flush task: {e:?}")))?
    }
}
