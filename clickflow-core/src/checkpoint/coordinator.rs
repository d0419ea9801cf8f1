//! Drives the barrier protocol for one pipeline run.
//!
//! ```text
//!   Running --tick--> Snapshotting --all acks, stored--> Committed --> Running
//!                          |
//!                          +--timeout / stage failure / store error--> Failed
//! ```
//!
//! At most one barrier is in flight. A drain barrier is injected when the source runs dry or the
//! job is cancelled; once it commits the run is over.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::{
    AckPayload, Checkpoint, SinkMarker, StageId, StageReport, committed_offsets,
};
use crate::config::CheckpointConfig;
use crate::message::{BarrierKind, PartitionOffsets};
use crate::metrics::{instance_labels, job_metrics, outcome_labels};
use crate::source::SourceControl;
use crate::{Error, Result};

const OUTCOME_COMMITTED: &str = "committed";
const OUTCOME_TIMEOUT: &str = "timeout";
const OUTCOME_FAILED: &str = "failed";
const OUTCOME_DISCARDED: &str = "discarded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoordinatorState {
    Running,
    Snapshotting,
    Committed,
    Failed,
}

/// How a run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The source ran dry and everything read has been committed.
    Finished,
    /// The job was cancelled.
    Stopped,
}

/// Acknowledgements collected for the barrier in flight.
struct PendingCheckpoint {
    barrier_id: u64,
    kind: BarrierKind,
    deadline: Instant,
    source: Option<PartitionOffsets>,
    buffered: Option<PartitionOffsets>,
    enriched: bool,
    sinks: BTreeMap<String, Option<SinkMarker>>,
}

impl PendingCheckpoint {
    fn new(barrier_id: u64, kind: BarrierKind, sinks: &[String], deadline: Instant) -> Self {
        Self {
            barrier_id,
            kind,
            deadline,
            source: None,
            buffered: None,
            enriched: false,
            sinks: sinks.iter().map(|name| (name.clone(), None)).collect(),
        }
    }

    fn record(&mut self, stage: StageId, payload: AckPayload) -> Result<()> {
        match (stage, payload) {
            (StageId::Source, AckPayload::SourceOffsets(offsets)) => self.source = Some(offsets),
            (StageId::Watermark, AckPayload::Buffered(offsets)) => self.buffered = Some(offsets),
            (StageId::Enricher, AckPayload::Forwarded) => self.enriched = true,
            (StageId::Sink(name), AckPayload::Sink(marker)) => match self.sinks.get_mut(&name) {
                Some(slot) => *slot = Some(marker),
                None => {
                    return Err(Error::Checkpoint(format!(
                        "ack from unknown sink {name} for barrier {}",
                        self.barrier_id
                    )));
                }
            },
            (stage, payload) => {
                return Err(Error::Checkpoint(format!(
                    "unexpected ack {payload:?} from {stage} for barrier {}",
                    self.barrier_id
                )));
            }
        }
        Ok(())
    }

    /// The checkpoint, once every participant acknowledged.
    fn complete(&self) -> Option<Checkpoint> {
        let (Some(source), Some(buffered)) = (&self.source, &self.buffered) else {
            return None;
        };
        if !self.enriched {
            return None;
        }
        let sinks = self
            .sinks
            .iter()
            .map(|(name, marker)| marker.map(|marker| (name.clone(), marker)))
            .collect::<Option<BTreeMap<_, _>>>()?;
        Some(Checkpoint {
            checkpoint_id: self.barrier_id,
            offsets: committed_offsets(source, buffered),
            sinks,
            created_at: Utc::now(),
        })
    }
}

pub(crate) struct Coordinator<S> {
    instance: u16,
    config: CheckpointConfig,
    shutdown_timeout: Duration,
    store: S,
    sinks: Vec<String>,
    control: mpsc::Sender<SourceControl>,
    reports: mpsc::Receiver<StageReport>,
    cancel: CancellationToken,
    state: CoordinatorState,
    /// Id of the last barrier injected, or of the checkpoint the run resumed from.
    last_barrier_id: u64,
    pending: Option<PendingCheckpoint>,
    end_of_input: bool,
}

impl<S: CheckpointStore> Coordinator<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance: u16,
        config: CheckpointConfig,
        shutdown_timeout: Duration,
        store: S,
        sinks: Vec<String>,
        resumed_from: Option<u64>,
        control: mpsc::Sender<SourceControl>,
        reports: mpsc::Receiver<StageReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance,
            config,
            shutdown_timeout,
            store,
            sinks,
            control,
            reports,
            cancel,
            state: CoordinatorState::Running,
            last_barrier_id: resumed_from.unwrap_or(0),
            pending: None,
            end_of_input: false,
        }
    }

    pub(crate) fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Runs until the run finishes, is cancelled, or fails. On error the state is
    /// [CoordinatorState::Failed] and the caller tears the run down.
    pub(crate) async fn run(&mut self) -> Result<Outcome> {
        let result = self.coordinate().await;
        if let Err(e) = &result {
            self.state = CoordinatorState::Failed;
            error!(instance = self.instance, error = %e, "Checkpoint coordinator failed");
        }
        result
    }

    async fn coordinate(&mut self) -> Result<Outcome> {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let barrier_timeout = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.shutdown().await,
                report = self.reports.recv() => {
                    let Some(report) = report else {
                        return Err(Error::Forwarder("every stage stopped before the run completed".to_string()));
                    };
                    if let Some(outcome) = self.handle_report(report).await? {
                        return Ok(outcome);
                    }
                }
                _ = barrier_timeout => {
                    let id = self.pending.as_ref().map_or(0, |p| p.barrier_id);
                    self.count(OUTCOME_TIMEOUT);
                    return Err(Error::BarrierTimeout {
                        id,
                        timeout_ms: self.config.barrier_timeout.as_millis(),
                    });
                }
                _ = ticker.tick(), if self.pending.is_none() && !self.end_of_input => {
                    self.inject(BarrierKind::Checkpoint).await?;
                }
            }
        }
    }

    /// Returns the outcome once a drain barrier committed.
    async fn handle_report(&mut self, report: StageReport) -> Result<Option<Outcome>> {
        match report {
            StageReport::Ack {
                barrier_id,
                stage,
                payload,
            } => {
                let Some(pending) = self.pending.as_mut().filter(|p| p.barrier_id == barrier_id)
                else {
                    debug!(barrier = barrier_id, %stage, "Ignoring ack for a discarded barrier");
                    return Ok(None);
                };
                debug!(barrier = barrier_id, %stage, "Barrier acknowledged");
                pending.record(stage, payload)?;
                let Some(checkpoint) = pending.complete() else {
                    return Ok(None);
                };
                let kind = pending.kind;
                self.commit(checkpoint).await?;

                if kind == BarrierKind::Drain {
                    return Ok(Some(if self.end_of_input && !self.cancel.is_cancelled() {
                        Outcome::Finished
                    } else {
                        Outcome::Stopped
                    }));
                }
                if self.end_of_input {
                    self.inject(BarrierKind::Drain).await?;
                }
                Ok(None)
            }
            StageReport::EndOfInput => {
                info!(instance = self.instance, "Source reached end of input, draining");
                self.end_of_input = true;
                if self.pending.is_none() {
                    self.inject(BarrierKind::Drain).await?;
                }
                Ok(None)
            }
            StageReport::Failed { stage, error } => {
                self.count(OUTCOME_FAILED);
                error!(%stage, error = %error, "Stage failed");
                Err(error)
            }
        }
    }

    async fn inject(&mut self, kind: BarrierKind) -> Result<()> {
        let barrier_id = self.last_barrier_id + 1;
        self.control
            .send(SourceControl::InjectBarrier {
                id: barrier_id,
                kind,
            })
            .await
            .map_err(|_| Error::Checkpoint("source stopped accepting barriers".to_string()))?;
        self.last_barrier_id = barrier_id;
        self.pending = Some(PendingCheckpoint::new(
            barrier_id,
            kind,
            &self.sinks,
            Instant::now() + self.config.barrier_timeout,
        ));
        self.state = CoordinatorState::Snapshotting;
        debug!(barrier = barrier_id, ?kind, "Injected barrier");
        Ok(())
    }

    async fn commit(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.store.commit(&checkpoint).await?;
        self.pending = None;
        self.state = CoordinatorState::Committed;
        self.count(OUTCOME_COMMITTED);
        job_metrics()
            .last_checkpoint_id
            .get_or_create(&instance_labels(self.instance))
            .set(i64::try_from(checkpoint.checkpoint_id).unwrap_or(i64::MAX));
        info!(
            instance = self.instance,
            checkpoint = checkpoint.checkpoint_id,
            offsets = ?checkpoint.offsets,
            "Checkpoint committed"
        );

        // best effort, a full queue only delays the informational group commit
        if self
            .control
            .try_send(SourceControl::Committed(checkpoint.offsets))
            .is_err()
        {
            debug!(checkpoint = checkpoint.checkpoint_id, "Skipped upstream offset commit");
        }
        self.state = CoordinatorState::Running;
        Ok(())
    }

    /// Discards a checkpoint in progress and tries to commit a final drain barrier within the
    /// shutdown timeout.
    async fn shutdown(&mut self) -> Result<Outcome> {
        info!(instance = self.instance, "Stopping, injecting final barrier");
        match self.pending.as_ref().map(|p| (p.barrier_id, p.kind)) {
            Some((_, BarrierKind::Drain)) => {}
            Some((barrier_id, BarrierKind::Checkpoint)) => {
                info!(barrier = barrier_id, "Discarding checkpoint in progress");
                self.count(OUTCOME_DISCARDED);
                self.pending = None;
                self.inject(BarrierKind::Drain).await?;
            }
            None => self.inject(BarrierKind::Drain).await?,
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            tokio::select! {
                report = self.reports.recv() => {
                    let Some(report) = report else {
                        warn!("Stages stopped before the final barrier completed");
                        return Ok(Outcome::Stopped);
                    };
                    if let Some(outcome) = self.handle_report(report).await? {
                        return Ok(outcome);
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        timeout_ms = self.shutdown_timeout.as_millis(),
                        "Final checkpoint did not complete in time, discarding it"
                    );
                    self.count(OUTCOME_DISCARDED);
                    self.pending = None;
                    return Ok(Outcome::Stopped);
                }
            }
        }
    }

    fn count(&self, outcome: &str) {
        job_metrics()
            .checkpoint_total
            .get_or_create(&outcome_labels(self.instance, outcome))
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Reporter;
    use crate::checkpoint::store::MemoryCheckpointStore;

    struct Harness {
        control: mpsc::Receiver<SourceControl>,
        source: Reporter,
        watermark: Reporter,
        enricher: Reporter,
        sink: Reporter,
        store: MemoryCheckpointStore,
        cancel: CancellationToken,
    }

    fn coordinator(
        interval_ms: u64,
        barrier_timeout_ms: u64,
        resumed_from: Option<u64>,
    ) -> (Coordinator<MemoryCheckpointStore>, Harness) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (report_tx, report_rx) = mpsc::channel(64);
        let store = MemoryCheckpointStore::default();
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new(
            0,
            CheckpointConfig {
                interval: Duration::from_millis(interval_ms),
                barrier_timeout: Duration::from_millis(barrier_timeout_ms),
                dir: None,
            },
            Duration::from_millis(500),
            store.clone(),
            vec!["memory".to_string()],
            resumed_from,
            control_tx,
            report_rx,
            cancel.clone(),
        );
        let harness = Harness {
            control: control_rx,
            source: Reporter::new(StageId::Source, report_tx.clone()),
            watermark: Reporter::new(StageId::Watermark, report_tx.clone()),
            enricher: Reporter::new(StageId::Enricher, report_tx.clone()),
            sink: Reporter::new(StageId::Sink("memory".to_string()), report_tx),
            store,
            cancel,
        };
        (coordinator, harness)
    }

    impl Harness {
        async fn next_barrier(&mut self) -> (u64, BarrierKind) {
            loop {
                match self.control.recv().await.unwrap() {
                    SourceControl::InjectBarrier { id, kind } => return (id, kind),
                    SourceControl::Committed(_) => continue,
                }
            }
        }

        async fn ack_all(&self, id: u64, source: PartitionOffsets, buffered: PartitionOffsets) {
            self.source
                .ack(id, AckPayload::SourceOffsets(source))
                .await
                .unwrap();
            self.watermark
                .ack(id, AckPayload::Buffered(buffered))
                .await
                .unwrap();
            self.enricher.ack(id, AckPayload::Forwarded).await.unwrap();
            self.sink
                .ack(id, AckPayload::Sink(SinkMarker { rows: id, batches: id }))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn commits_aligned_barriers_and_drains_at_end_of_input() {
        let (mut coordinator, mut harness) = coordinator(20, 5_000, Some(4));
        assert_eq!(coordinator.state(), CoordinatorState::Running);
        let run = tokio::spawn(async move {
            let outcome = coordinator.run().await;
            (outcome, coordinator.state())
        });

        let (id, kind) = harness.next_barrier().await;
        assert_eq!((id, kind), (5, BarrierKind::Checkpoint));
        harness
            .ack_all(
                id,
                PartitionOffsets::from([(0, 50), (1, 20)]),
                PartitionOffsets::from([(0, 42)]),
            )
            .await;
        let committed = loop {
            match harness.control.recv().await.unwrap() {
                SourceControl::Committed(offsets) => break offsets,
                SourceControl::InjectBarrier { .. } => panic!("barrier before commit"),
            }
        };
        assert_eq!(committed, PartitionOffsets::from([(0, 42), (1, 20)]));
        let stored = harness.store.load_latest().await.unwrap().unwrap();
        assert_eq!(stored.checkpoint_id, 5);
        assert_eq!(stored.sinks["memory"], SinkMarker { rows: 5, batches: 5 });

        harness.source.end_of_input().await.unwrap();
        // a periodic barrier may already be on its way, the drain follows it
        let id = loop {
            let (id, kind) = harness.next_barrier().await;
            harness
                .ack_all(id, PartitionOffsets::from([(0, 60), (1, 20)]), PartitionOffsets::new())
                .await;
            if kind == BarrierKind::Drain {
                break id;
            }
        };

        let (outcome, state) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), Outcome::Finished);
        assert_eq!(state, CoordinatorState::Running);
        let stored = harness.store.load_latest().await.unwrap().unwrap();
        assert_eq!(stored.checkpoint_id, id);
        assert_eq!(stored.offsets, PartitionOffsets::from([(0, 60), (1, 20)]));
    }

    #[tokio::test]
    async fn missing_ack_times_out_and_fails() {
        let (mut coordinator, mut harness) = coordinator(10, 100, None);
        let run = tokio::spawn(async move {
            let outcome = coordinator.run().await;
            (outcome, coordinator.state())
        });

        let (id, _) = harness.next_barrier().await;
        assert_eq!(id, 1);
        // the sink never acknowledges
        harness
            .source
            .ack(id, AckPayload::SourceOffsets(PartitionOffsets::from([(0, 1)])))
            .await
            .unwrap();

        let (outcome, state) = run.await.unwrap();
        assert!(matches!(outcome, Err(Error::BarrierTimeout { id: 1, .. })));
        assert_eq!(state, CoordinatorState::Failed);
        assert!(harness.store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_failure_fails_the_run() {
        let (mut coordinator, harness) = coordinator(10_000, 10_000, None);
        harness
            .sink
            .failed(Error::Sink("disk full".to_string()))
            .await;
        assert!(matches!(coordinator.run().await, Err(Error::Sink(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
    }

    #[tokio::test]
    async fn cancel_discards_pending_checkpoint_and_drains() {
        let (mut coordinator, mut harness) = coordinator(10, 5_000, None);
        let run = tokio::spawn(async move { coordinator.run().await });

        let (pending_id, _) = harness.next_barrier().await;
        harness.cancel.cancel();
        let (drain_id, kind) = harness.next_barrier().await;
        assert_eq!(kind, BarrierKind::Drain);
        assert_eq!(drain_id, pending_id + 1);

        // late acks for the discarded barrier change nothing
        harness
            .ack_all(pending_id, PartitionOffsets::from([(0, 5)]), PartitionOffsets::new())
            .await;
        harness
            .ack_all(drain_id, PartitionOffsets::from([(0, 9)]), PartitionOffsets::new())
            .await;

        assert_eq!(run.await.unwrap().unwrap(), Outcome::Stopped);
        let stored = harness.store.load_latest().await.unwrap().unwrap();
        assert_eq!(stored.checkpoint_id, drain_id);
        assert_eq!(stored.offsets, PartitionOffsets::from([(0, 9)]));
    }

    #[tokio::test]
    async fn cancel_gives_up_after_shutdown_timeout() {
        let (mut coordinator, mut harness) = coordinator(10_000, 10_000, None);
        harness.cancel.cancel();
        let run = tokio::spawn(async move { coordinator.run().await });
        let (_, kind) = harness.next_barrier().await;
        assert_eq!(kind, BarrierKind::Drain);
        assert_eq!(run.await.unwrap().unwrap(), Outcome::Stopped);
        assert!(harness.store.load_latest().await.unwrap().is_none());
    }
}
