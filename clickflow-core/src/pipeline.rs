//! Wires one run of one pipeline instance:
//!
//! ```text
//! source -> watermark -> enricher -> fan out -> sink writer (one per sink)
//!    ^                                               |
//!    +------ coordinator <--- acks from every stage -+
//! ```

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::coordinator::{Coordinator, Outcome};
use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::{Checkpoint, Reporter, StageId};
use crate::config::Settings;
use crate::enricher::{Enricher, GeoLookup};
use crate::message::PartitionOffsets;
use crate::sink::{NamedSink, SinkWriter};
use crate::source::{SourceReader, SourceStage};
use crate::watermark::WatermarkGenerator;
use crate::{Result, enricher, sink, watermark};

/// Barrier requests and commit notices; only a handful are ever queued.
const CONTROL_CAPACITY: usize = 16;

/// Everything one run needs; rebuilt on every restart except the reader and the enricher.
pub(crate) struct RunContext<'a, R, L, S> {
    pub(crate) instance: u16,
    pub(crate) settings: &'a Settings,
    pub(crate) reader: R,
    pub(crate) enricher: Enricher<L>,
    pub(crate) sinks: Vec<NamedSink>,
    pub(crate) store: S,
    /// The checkpoint to resume from, if any.
    pub(crate) resume: Option<Checkpoint>,
}

/// Runs the pipeline from the given checkpoint until it finishes, is cancelled or fails.
pub(crate) async fn run_once<R, L, S>(
    ctx: RunContext<'_, R, L, S>,
    cancel: CancellationToken,
) -> Result<Outcome>
where
    R: SourceReader,
    L: GeoLookup,
    S: CheckpointStore,
{
    let RunContext {
        instance,
        settings,
        reader,
        enricher,
        sinks,
        store,
        resume,
    } = ctx;
    // every owned partition is pinned, so the first checkpoint covers quiet partitions too
    let mut resume_offsets: PartitionOffsets = reader.start_offsets().await?;
    if let Some(checkpoint) = &resume {
        resume_offsets.extend(checkpoint.offsets.iter().map(|(p, o)| (*p, *o)));
    }
    reader.seek(&resume_offsets).await?;
    info!(
        instance,
        checkpoint = resume.as_ref().map(|c| c.checkpoint_id),
        offsets = ?resume_offsets,
        "Starting pipeline run"
    );

    let capacity = settings.channel_capacity;
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    // a barrier produces one ack per stage, one barrier is in flight at a time
    let (report_tx, report_rx) = mpsc::channel(CONTROL_CAPACITY + 4 * (sinks.len() + 3));
    let (source_tx, source_rx) = mpsc::channel(capacity);
    let (watermark_tx, watermark_rx) = mpsc::channel(capacity);
    let (enricher_tx, enricher_rx) = mpsc::channel(capacity);

    // stages stop reading on this one, the coordinator and readers watch the job token
    let run_cancel = cancel.child_token();
    let mut tasks = JoinSet::new();

    let source_reporter = Reporter::new(StageId::Source, report_tx.clone());
    let source = SourceStage::new(
        reader,
        instance,
        resume_offsets,
        settings.source.read_retry,
        control_rx,
        source_tx,
        source_reporter.clone(),
        run_cancel.clone(),
    );
    spawn_stage(&mut tasks, source_reporter, source.run());

    let watermark_reporter = Reporter::new(StageId::Watermark, report_tx.clone());
    spawn_stage(
        &mut tasks,
        watermark_reporter.clone(),
        watermark::run(
            WatermarkGenerator::new(instance, settings.watermark),
            source_rx,
            watermark_tx,
            watermark_reporter,
        ),
    );

    let enricher_reporter = Reporter::new(StageId::Enricher, report_tx.clone());
    spawn_stage(
        &mut tasks,
        enricher_reporter.clone(),
        enricher::run(enricher, watermark_rx, enricher_tx, enricher_reporter.clone()),
    );

    let mut sink_names = Vec::with_capacity(sinks.len());
    let mut sink_inputs = Vec::with_capacity(sinks.len());
    for named in sinks {
        let marker = resume
            .as_ref()
            .and_then(|c| c.sinks.get(&named.name).copied())
            .unwrap_or_default();
        let reporter = Reporter::new(StageId::Sink(named.name.clone()), report_tx.clone());
        let (tx, rx) = mpsc::channel(capacity);
        sink_names.push(named.name.clone());
        sink_inputs.push(tx);
        spawn_stage(
            &mut tasks,
            reporter.clone(),
            sink::run(SinkWriter::new(named, marker, instance), rx, reporter),
        );
    }
    spawn_stage(
        &mut tasks,
        enricher_reporter,
        sink::fan_out(enricher_rx, sink_inputs),
    );
    // only the stages may keep the report channel open
    drop(report_tx);

    let mut coordinator = Coordinator::new(
        instance,
        settings.checkpoint.clone(),
        settings.shutdown_timeout,
        store,
        sink_names,
        resume.as_ref().map(|c| c.checkpoint_id),
        control_tx,
        report_rx,
        cancel,
    );
    let outcome = coordinator.run().await;
    info!(instance, state = ?coordinator.state(), outcome = ?outcome.as_ref().ok(), "Pipeline run ended");

    match &outcome {
        Ok(_) => {
            // after a drain every stage ends on its own once its input closes
            let drained = tokio::time::timeout(settings.shutdown_timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        error!(?e, "Pipeline task panicked");
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(instance, "Pipeline tasks did not stop in time, aborting them");
            }
        }
        Err(_) => {
            // intake halts, everything in flight is dropped and replayed on restart
            run_cancel.cancel();
        }
    }
    // wait for aborted stages too, the next run reuses the reader
    tasks.shutdown().await;
    outcome
}

/// Spawns a stage; a stage error is handed to the coordinator, which fails the run.
fn spawn_stage<F>(tasks: &mut JoinSet<()>, reporter: Reporter, stage: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move {
        if let Err(e) = stage.await {
            error!(stage = %reporter.stage(), error = %e, "Pipeline stage failed");
            reporter.failed(e).await;
        }
    });
}
