mod capture;
mod dispatch;
mod error;
mod executable;
mod mpv;
mod notify;
mod post_capture;
mod recorder;
mod resolver;
mod scheduler;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tvrec_proto::config::Config;
use tvrec_proto::guide::JsonGuideStore;
use tvrec_proto::state::StateStore;

use crate::dispatch::CommandRefresher;
use crate::error::JobError;
use crate::notify::{CommandNotifier, Notifier};
use crate::recorder::{JobOutcome, JobRequest, JobRunner, Recorder};
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "tvrecd")]
#[command(version)]
#[command(about = "Scheduled TV guide refresh and stream capture")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background update loop until interrupted
    Serve,
    /// Record one program
    Record {
        /// Channel id as stored in the guide
        channel: Option<String>,
        /// Program start, epoch seconds
        start: Option<String>,
    },
}

fn init_logging() -> anyhow::Result<PathBuf> {
    let data_dir = tvrec_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("tvrecd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tvrec_daemon=debug")),
        )
        .init();

    Ok(log_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging()?;
    info!("Log file: {:?}", log_path);

    let config = Arc::new(match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    });
    info!(
        "Config loaded from: {:?}",
        cli.config.clone().unwrap_or_else(Config::config_path)
    );

    let guide = Arc::new(JsonGuideStore::new(config.paths.guide_file.clone()));
    let state = Arc::new(StateStore::new(
        config.paths.state_file.clone(),
        &config.service,
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(CommandNotifier::new(config.notify.command.clone()));
    let recorder = Arc::new(Recorder::new(
        config.clone(),
        guide.clone(),
        executable::default_locator(state.clone()),
        Arc::new(mpv::MpvFactory::new(config.resolver.mpv.clone())),
        notifier.clone(),
    ));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Serve => {
            if !config.service.enabled {
                info!("Background service disabled in config");
                return Ok(());
            }
            let jobs = TaskTracker::new();
            let dispatchers = dispatch::from_config(&config, guide.clone(), recorder.clone(), &jobs);
            let refresher = Arc::new(CommandRefresher::new(
                config.service.refresh_command.clone(),
                guide.clone(),
            ));
            let scheduler = Scheduler::new(&config.service, state, refresher, dispatchers, notifier);
            scheduler.run(cancel).await;

            jobs.close();
            if !jobs.is_empty() {
                info!("Waiting for {} capture jobs to stop", jobs.len());
            }
            jobs.wait().await;
        }
        Command::Record { channel, start } => {
            let request = match JobRequest::parse(channel.as_deref(), start.as_deref()) {
                Ok(request) => request,
                Err(e) => {
                    notifier.notify("TV Recorder", &e.to_string()).await;
                    return Err(e.into());
                }
            };
            match recorder.record(&request, &cancel).await {
                Ok(JobOutcome::Recorded { path, .. }) => info!("Recorded {}", path.display()),
                Ok(JobOutcome::Skipped) => {}
                Err(JobError::Cancelled) => warn!("Recording cancelled"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
