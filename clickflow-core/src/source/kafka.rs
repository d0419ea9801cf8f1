use std::time::Duration;

use clickflow_kafka::{KafkaSource, KafkaSourceConfig, PartitionAssignment};
use tokio_util::sync::CancellationToken;

use crate::message::{PartitionOffsets, SourceRecord};
use crate::source;

pub(crate) async fn new_kafka_source(
    cfg: KafkaSourceConfig,
    assignment: PartitionAssignment,
    resume_from: PartitionOffsets,
    batch_size: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> crate::Result<KafkaSource> {
    Ok(KafkaSource::connect(cfg, assignment, resume_from, batch_size, timeout, cancel).await?)
}

impl source::SourceReader for KafkaSource {
    fn name(&self) -> &'static str {
        "Kafka"
    }

    async fn read(&self) -> crate::Result<Option<Vec<SourceRecord>>> {
        // a topic never runs dry; a cancelled consumer hands back nothing and the stage notices
        // the cancellation itself
        match self.read_messages().await {
            None => Ok(Some(vec![])),
            Some(messages) => Ok(Some(messages?.into_iter().map(SourceRecord::from).collect())),
        }
    }

    async fn start_offsets(&self) -> crate::Result<PartitionOffsets> {
        Ok(KafkaSource::start_offsets(self).await?)
    }

    async fn seek(&self, offsets: &PartitionOffsets) -> crate::Result<()> {
        Ok(KafkaSource::seek(self, offsets.clone()).await?)
    }

    async fn commit(&self, offsets: &PartitionOffsets) -> crate::Result<()> {
        Ok(self.commit_offsets(offsets.clone()).await?)
    }
}
