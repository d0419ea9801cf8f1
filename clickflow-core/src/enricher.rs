//! Geolocation enrichment. Every event leaves this stage, with geodata when the lookup succeeded
//! and with `{}` otherwise. Lookups run concurrently up to a limit, results are emitted in arrival
//! order.

use std::sync::Arc;

use backoff::retry::Retry;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::checkpoint::{AckPayload, Reporter};
use crate::config::{EnricherConfig, OnFailure};
use crate::message::{EnrichedEvent, GeoData, Location, StreamMessage, TimedEvent};
use crate::metrics::{instance_labels, job_metrics};
use crate::{Error, Result};

/// Lookup against the [ip2location.io](https://www.ip2location.io/) REST API.
pub mod ip2location;

/// Why a single lookup produced no location.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("lookup returned status {0}")]
    Status(u16),

    #[error("malformed lookup response - {0}")]
    Body(String),

    #[error("lookup request failed - {0}")]
    Transport(String),

    #[error("lookup service rejected the request - {0}")]
    Api(String),

    #[error("lookup timed out")]
    Timeout,
}

impl LookupError {
    /// Client errors and API rejections will not go away by asking again.
    fn is_retryable(&self) -> bool {
        match self {
            LookupError::Status(status) => *status >= 500 || *status == 429,
            LookupError::Transport(_) | LookupError::Timeout => true,
            LookupError::Body(_) | LookupError::Api(_) => false,
        }
    }
}

/// Resolves an ip address to a location.
#[trait_variant::make(GeoLookup: Send)]
pub trait LocalGeoLookup: Sync + 'static {
    async fn lookup(&self, ip: &str) -> std::result::Result<Location, LookupError>;
}

/// Applies the timeout and failure policy around a [GeoLookup].
pub struct Enricher<L> {
    lookup: Arc<L>,
    config: EnricherConfig,
    instance: u16,
}

impl<L> Clone for Enricher<L> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
            config: self.config.clone(),
            instance: self.instance,
        }
    }
}

impl<L: GeoLookup> Enricher<L> {
    pub fn new(lookup: L, config: EnricherConfig, instance: u16) -> Self {
        Self {
            lookup: Arc::new(lookup),
            config,
            instance,
        }
    }

    /// Never fails; a failed lookup yields empty geodata.
    pub async fn enrich(&self, event: TimedEvent) -> EnrichedEvent {
        let geodata = match self.locate(&event.event.ip).await {
            Ok(location) => GeoData::from(location),
            Err(e) => {
                warn!(
                    ip = %event.event.ip,
                    partition = event.partition,
                    offset = event.offset,
                    error = %e,
                    "Geolocation lookup failed, emitting empty geodata"
                );
                job_metrics()
                    .enrich_failure_total
                    .get_or_create(&instance_labels(self.instance))
                    .inc();
                GeoData::empty()
            }
        };
        EnrichedEvent { event, geodata }
    }

    async fn locate(&self, ip: &str) -> std::result::Result<Location, LookupError> {
        let lookup = &self.lookup;
        let attempt = async {
            match self.config.on_failure {
                OnFailure::FailOpen => lookup.lookup(ip).await,
                OnFailure::Retry(retry) => {
                    Retry::new(
                        retry.strategy(),
                        move || lookup.lookup(ip),
                        |e: &LookupError| e.is_retryable(),
                    )
                    .await
                }
            }
        };
        tokio::time::timeout(self.config.timeout, attempt)
            .await
            .map_err(|_| LookupError::Timeout)?
    }
}

/// Enrichment stage task. Barriers leave the stage after every event that arrived before them.
pub(crate) async fn run<L: GeoLookup>(
    enricher: Enricher<L>,
    input: mpsc::Receiver<StreamMessage<TimedEvent>>,
    output: mpsc::Sender<StreamMessage<EnrichedEvent>>,
    reporter: Reporter,
) -> Result<()> {
    let concurrency = enricher.config.concurrency.max(1);
    let mut enriched = ReceiverStream::new(input)
        .map(|message| {
            let enricher = enricher.clone();
            async move {
                match message {
                    StreamMessage::Event(event) => StreamMessage::Event(enricher.enrich(event).await),
                    StreamMessage::Barrier(barrier) => StreamMessage::Barrier(barrier),
                }
            }
        })
        .buffered(concurrency);

    let mut forwarded: u64 = 0;
    while let Some(message) = enriched.next().await {
        match &message {
            StreamMessage::Event(_) => forwarded += 1,
            StreamMessage::Barrier(barrier) => {
                reporter.ack(barrier.id, AckPayload::Forwarded).await?;
            }
        }
        output
            .send(message)
            .await
            .map_err(|_| Error::Enricher("downstream closed".to_string()))?;
    }
    info!(forwarded, "Enrichment stage stopped");
    Ok(())
}
