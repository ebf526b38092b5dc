use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use channel_controller::bridge::{self, BridgeProcess};
use channel_controller::config::{BridgeTarget, Cli, ControllerConfig};
use channel_controller::controller::{Controller, ControllerParts};
use channel_controller::event::EventNamePublisher;
use channel_controller::fetch::YtDlpFetcher;
use channel_controller::orchestrator::Orchestrator;
use channel_controller::player;
use channel_controller::queue::DownloadQueue;
use channel_controller::script::ProcessScriptExecutor;

fn main() -> Result<()> {
    // stdout may carry the bridge protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(run(config));
    // Stdin reads park a blocking thread that never returns on its own.
    runtime.shutdown_background();
    result
}

async fn run(config: ControllerConfig) -> Result<()> {
    let timings = config.timings.clone();

    let (process, handle, intents, tasks) = match &config.bridge {
        BridgeTarget::Process { bin, args } => {
            let (process, handle, intents, tasks) =
                BridgeProcess::spawn(bin, args, timings.bridge_request_timeout)?;
            (Some(process), handle, intents, tasks)
        }
        BridgeTarget::Stdio => {
            let (handle, intents, tasks) = bridge::connect_stdio(timings.bridge_request_timeout);
            (None, handle, intents, tasks)
        }
    };
    let handle = Arc::new(handle);

    let publisher = EventNamePublisher::new(handle.clone(), config.venue.clone(), timings.event_refresh_after);
    let title_query = config.player_process.as_deref().and_then(player::for_process);
    if title_query.is_none() {
        info!("no player process configured, the event keeps the generic custom label");
    }
    let (orchestrator, timers) = Orchestrator::new(
        Arc::new(ProcessScriptExecutor),
        config.scripts.clone(),
        publisher,
        title_query,
        timings.clone(),
        config.labels.clone(),
    );

    let (download_tx, downloads) = mpsc::unbounded_channel();
    let (queue, queue_worker) = DownloadQueue::spawn(
        Arc::new(YtDlpFetcher::new(config.yt_dlp.clone())),
        config.download_dir.clone(),
        download_tx,
    );

    let controller = Controller::new(ControllerParts {
        orchestrator,
        timers,
        queue,
        downloads,
        download_root: config.download_dir.clone(),
        notifier: handle.clone(),
        media_dir: config.media_dir.clone(),
        timings: timings.clone(),
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));
    info!(venue = %config.venue, downloads = %config.download_dir.display(), "channel controller started");
    let mut controller_task = tokio::spawn(controller.run(intents, shutdown.clone()));

    // Everything after shutdown starts shares one grace deadline.
    let deadline = tokio::select! {
        joined = &mut controller_task => {
            if let Err(err) = joined {
                error!("controller task failed: {err}");
            }
            Instant::now() + timings.shutdown_grace
        }
        _ = shutdown.cancelled() => {
            let deadline = Instant::now() + timings.shutdown_grace;
            match timeout_at(deadline, &mut controller_task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("controller task failed: {err}"),
                Err(_) => {
                    error!(grace = ?timings.shutdown_grace, "cleanup did not finish in time, forcing exit");
                    std::process::exit(1);
                }
            }
            deadline
        }
    };

    if timeout_at(deadline, queue_worker).await.is_err() {
        warn!("download queue worker still running at exit");
    }
    bridge::shut_down(&handle, tasks, process, deadline).await;
    info!("channel controller stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!("cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C");
        }
    }
    shutdown.cancel();
}
