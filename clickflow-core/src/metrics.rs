//! Process-global prometheus-client registry. Nothing serves it over HTTP, the binary logs the
//! encoded snapshot on shutdown.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::{Error, Result};

const REGISTRY_PREFIX: &str = "clickflow";

pub(crate) const INSTANCE_LABEL: &str = "instance";
pub(crate) const PARTITION_LABEL: &str = "partition";
pub(crate) const SINK_LABEL: &str = "sink";
pub(crate) const OUTCOME_LABEL: &str = "outcome";

const READ_TOTAL: &str = "read";
const MALFORMED_TOTAL: &str = "malformed";
const LATE_TOTAL: &str = "late";
const ENRICH_FAILURE_TOTAL: &str = "enrich_failure";
const SINK_WRITE_TOTAL: &str = "sink_write";
const CHECKPOINT_TOTAL: &str = "checkpoint";
const RESTART_TOTAL: &str = "restart";
const LAST_CHECKPOINT_ID: &str = "last_checkpoint_id";

type Labels = Vec<(String, String)>;

struct GlobalRegistry {
    // each metric is registered once, contention is not a concern
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

pub(crate) struct JobMetrics {
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) malformed_total: Family<Labels, Counter>,
    pub(crate) late_total: Family<Labels, Counter>,
    pub(crate) enrich_failure_total: Family<Labels, Counter>,
    pub(crate) sink_write_total: Family<Labels, Counter>,
    pub(crate) checkpoint_total: Family<Labels, Counter>,
    pub(crate) restart_total: Family<Labels, Counter>,
    pub(crate) last_checkpoint_id: Family<Labels, Gauge>,
}

impl JobMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            malformed_total: Family::default(),
            late_total: Family::default(),
            enrich_failure_total: Family::default(),
            sink_write_total: Family::default(),
            checkpoint_total: Family::default(),
            restart_total: Family::default(),
            last_checkpoint_id: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            READ_TOTAL,
            "Total number of records read from the source",
            metrics.read_total.clone(),
        );
        registry.register(
            MALFORMED_TOTAL,
            "Total number of records dropped because they could not be decoded or timestamped",
            metrics.malformed_total.clone(),
        );
        registry.register(
            LATE_TOTAL,
            "Total number of events dropped because they arrived behind the watermark",
            metrics.late_total.clone(),
        );
        registry.register(
            ENRICH_FAILURE_TOTAL,
            "Total number of geolocation lookups that failed and fell back to empty geodata",
            metrics.enrich_failure_total.clone(),
        );
        registry.register(
            SINK_WRITE_TOTAL,
            "Total number of rows handed to a sink",
            metrics.sink_write_total.clone(),
        );
        registry.register(
            CHECKPOINT_TOTAL,
            "Total number of checkpoints by outcome",
            metrics.checkpoint_total.clone(),
        );
        registry.register(
            RESTART_TOTAL,
            "Total number of pipeline restarts",
            metrics.restart_total.clone(),
        );
        registry.register(
            LAST_CHECKPOINT_ID,
            "Id of the most recently committed checkpoint",
            metrics.last_checkpoint_id.clone(),
        );
        metrics
    }
}

static JOB_METRICS: OnceLock<JobMetrics> = OnceLock::new();

pub(crate) fn job_metrics() -> &'static JobMetrics {
    JOB_METRICS.get_or_init(JobMetrics::new)
}

pub(crate) fn instance_labels(instance: u16) -> Labels {
    vec![(INSTANCE_LABEL.to_string(), instance.to_string())]
}

pub(crate) fn partition_labels(instance: u16, partition: i32) -> Labels {
    vec![
        (INSTANCE_LABEL.to_string(), instance.to_string()),
        (PARTITION_LABEL.to_string(), partition.to_string()),
    ]
}

pub(crate) fn sink_labels(instance: u16, sink: &str) -> Labels {
    vec![
        (INSTANCE_LABEL.to_string(), instance.to_string()),
        (SINK_LABEL.to_string(), sink.to_string()),
    ]
}

pub(crate) fn outcome_labels(instance: u16, outcome: &str) -> Labels {
    vec![
        (INSTANCE_LABEL.to_string(), instance.to_string()),
        (OUTCOME_LABEL.to_string(), outcome.to_string()),
    ]
}

/// Encodes the current state of every registered metric in the OpenMetrics text format.
pub fn snapshot() -> Result<String> {
    // make sure the families show up even if nothing was recorded yet
    let _ = job_metrics();
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &state).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_recorded_families() {
        job_metrics()
            .late_total
            .get_or_create(&partition_labels(7, 3))
            .inc();
        job_metrics()
            .sink_write_total
            .get_or_create(&sink_labels(7, "postgres"))
            .inc_by(2);

        let text = snapshot().unwrap();
        assert!(text.contains("clickflow_late_total"), "{text}");
        assert!(text.contains(r#"partition="3""#), "{text}");
        assert!(text.contains(r#"sink="postgres""#), "{text}");
        assert!(text.ends_with("# EOF\n"));
    }
}
