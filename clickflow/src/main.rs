use std::env;
use std::error::Error;

use clickflow_core::{Job, Settings};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let settings = Settings::load(env::vars())?;

    match matches.subcommand() {
        Some((cmdline::CHECK_CONFIG, _)) => {
            info!(
                topic = %settings.source.kafka.topic,
                parallelism = settings.parallelism,
                "Configuration is valid"
            );
            Ok(())
        }
        Some((cmdline::RUN, _)) => run_job(settings).await,
        _ => Err("unknown subcommand".into()),
    }
}

async fn run_job(settings: Settings) -> Result<(), Box<dyn Error>> {
    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let job = Job::from_settings(settings);
    let result = job.run(cancel).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    match clickflow_core::metrics::snapshot() {
        Ok(metrics) => info!(%metrics, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    result.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
