//! One capture job: `(channel, start)` in, a `.ts` file out.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use tvrec_proto::config::Config;
use tvrec_proto::guide::MetadataStore;
use tvrec_proto::{naming, platform};

use crate::capture::{compute_duration_secs, CaptureController};
use crate::error::JobError;
use crate::executable::ExecutableLocator;
use crate::notify::Notifier;
use crate::post_capture::PostCapture;
use crate::resolver::{EngineFactory, SourceResolver};

const NOTIFY_TITLE: &str = "TV Recorder";

/// Validated job parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub channel: String,
    /// Epoch seconds as given on the command line.
    pub start_epoch: i64,
}

impl JobRequest {
    pub fn new(channel: &str, start: DateTime<Utc>) -> Self {
        Self {
            channel: channel.to_string(),
            start_epoch: start.timestamp(),
        }
    }

    /// Both parameters are required; a missing or non-numeric start is a
    /// configuration error for this invocation only.
    pub fn parse(channel: Option<&str>, start: Option<&str>) -> Result<Self, JobError> {
        let channel = channel
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| JobError::Configuration("missing channel parameter".into()))?;
        let raw = start
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| JobError::Configuration("missing start parameter".into()))?;
        let start_epoch = raw
            .parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| JobError::Configuration(format!("invalid start timestamp {:?}", raw)))?;
        Ok(Self {
            channel: channel.to_string(),
            start_epoch,
        })
    }

    pub fn start(&self) -> Result<DateTime<Utc>, JobError> {
        DateTime::from_timestamp(self.start_epoch, 0).ok_or_else(|| {
            JobError::Configuration(format!("start timestamp {} out of range", self.start_epoch))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Recorded { path: PathBuf, bytes: u64 },
    /// Nothing to record: no stream reference or no matching program.
    Skipped,
}

/// Anything that can run a capture job; the dispatcher only needs this.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn record(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError>;
}

pub struct Recorder {
    config: Arc<Config>,
    store: Arc<dyn MetadataStore>,
    locator: Arc<dyn ExecutableLocator>,
    engines: Arc<dyn EngineFactory>,
    notifier: Arc<dyn Notifier>,
    controller: CaptureController,
    post_capture: PostCapture,
}

impl Recorder {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn MetadataStore>,
        locator: Arc<dyn ExecutableLocator>,
        engines: Arc<dyn EngineFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let controller = CaptureController::new(&config.capture);
        let post_capture = PostCapture::from_config(&config.post_capture);
        Self {
            config,
            store,
            locator,
            engines,
            notifier,
            controller,
            post_capture,
        }
    }

    fn capture_root(&self) -> Result<PathBuf, JobError> {
        self.config
            .paths
            .capture_dir
            .as_ref()
            .map(|dir| platform::expand_path(&dir.to_string_lossy()))
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| JobError::Configuration("capture folder is not set".into()))
    }

    async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let start = request.start()?;
        let root = self.capture_root()?;
        // before any network work
        let executable = self.locator.locate(&self.config.capture).await?;

        let reference = self
            .store
            .stream_url(&request.channel)
            .await
            .map_err(|e| JobError::MetadataLookup(format!("{:#}", e)))?;
        let Some(reference) = reference else {
            info!("recorder: no stream reference for channel");
            return Ok(JobOutcome::Skipped);
        };

        let program = self
            .store
            .program_at(&request.channel, start)
            .await
            .map_err(|e| JobError::MetadataLookup(format!("{:#}", e)))?;
        let Some(program) = program else {
            info!("recorder: no program starts at this time");
            return Ok(JobOutcome::Skipped);
        };

        let folder = naming::program_folder(&root, &program);
        naming::ensure_folder(&folder).await?;
        let duration_secs = compute_duration_secs(&program, &self.config.capture);

        let resolver = SourceResolver::new(self.engines.as_ref(), &self.config.resolver);
        let url = resolver.resolve(&reference, cancel).await?;

        let target = folder.join(naming::file_name(&request.channel, &program, &Local::now()));
        let captured = self
            .controller
            .capture(&executable, &url, duration_secs, &target, cancel)
            .await;

        if !matches!(captured, Err(JobError::Cancelled)) {
            self.post_capture
                .run(&request.channel, &request.start_epoch.to_string(), &url)
                .await;
        }

        let report = captured?;
        if report.capped {
            warn!("recorder: transcoder overran its budget and was stopped");
        }
        Ok(JobOutcome::Recorded {
            path: target,
            bytes: report.bytes,
        })
    }
}

#[async_trait]
impl JobRunner for Recorder {
    async fn record(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let span = info_span!("job", channel = %request.channel, start = request.start_epoch);
        async {
            let result = self.run(request, cancel).await;
            match &result {
                Ok(JobOutcome::Recorded { path, bytes }) => {
                    info!("recorder: saved {} ({} bytes)", path.display(), bytes)
                }
                Ok(JobOutcome::Skipped) => info!("recorder: nothing to record"),
                Err(e) if e.is_user_visible() => {
                    warn!("recorder: {}", e);
                    self.notifier.notify(NOTIFY_TITLE, &e.to_string()).await;
                }
                Err(e) => warn!("recorder: job aborted: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }
}
