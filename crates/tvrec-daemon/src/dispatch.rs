//! Downstream work triggered by each update cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tvrec_proto::config::Config;
use tvrec_proto::guide::{JsonGuideStore, MetadataStore};

use crate::error::JobError;
use crate::post_capture::run_command;
use crate::recorder::{JobRequest, JobRunner};

/// Refreshes the cached schedule data before dispatch.
#[async_trait]
pub trait CacheRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Runs the configured refresh command (if any), then checks the guide
/// file is readable.
pub struct CommandRefresher {
    command: Option<Vec<String>>,
    guide: Arc<JsonGuideStore>,
}

impl CommandRefresher {
    pub fn new(command: Option<Vec<String>>, guide: Arc<JsonGuideStore>) -> Self {
        Self { command, guide }
    }
}

#[async_trait]
impl CacheRefresher for CommandRefresher {
    async fn refresh(&self) -> anyhow::Result<()> {
        if let Some(command) = self.command.as_ref().filter(|c| !c.is_empty()) {
            info!("refresh: running {}", command.join(" "));
            run_command(command, &[]).await?;
        }
        let guide = self.guide.load().await?;
        info!(
            "refresh: guide has {} channels, {} programs",
            guide.channels.len(),
            guide.programs.len()
        );
        Ok(())
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;
    async fn dispatch(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Hands the cycle to an external command (notification / autoplay
/// scheduling lives outside this daemon).
pub struct HookDispatcher {
    name: String,
    command: Vec<String>,
}

impl HookDispatcher {
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }
}

#[async_trait]
impl Dispatcher for HookDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        run_command(&self.command, &[]).await
    }
}

const MAX_BEFORE_MINUTES: u64 = 24 * 60;

/// Schedules a capture job for every flagged program that has not been
/// scheduled yet.  Each job waits on its own task until
/// `start - before_minutes`, so a cycle never blocks on a recording.
/// Job tasks are spawned on `jobs`; the owner closes and waits on it at
/// shutdown so cancelled captures finish their cleanup.
pub struct AutoplaywithDispatcher {
    store: Arc<dyn MetadataStore>,
    runner: Arc<dyn JobRunner>,
    before: chrono::Duration,
    scheduled: Mutex<HashSet<(String, i64)>>,
    jobs: TaskTracker,
}

impl AutoplaywithDispatcher {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        runner: Arc<dyn JobRunner>,
        before_minutes: u64,
        jobs: TaskTracker,
    ) -> Self {
        Self {
            store,
            runner,
            before: chrono::Duration::minutes(before_minutes.min(MAX_BEFORE_MINUTES) as i64),
            scheduled: Mutex::new(HashSet::new()),
            jobs,
        }
    }

    /// Keys for programs not yet scheduled; marks them scheduled.
    fn claim(&self, requests: Vec<JobRequest>, now: DateTime<Utc>) -> Vec<JobRequest> {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
        // forget programs that started more than a day ago
        let horizon = (now - chrono::Duration::days(1)).timestamp();
        scheduled.retain(|(_, start)| *start >= horizon);
        requests
            .into_iter()
            .filter(|r| scheduled.insert((r.channel.clone(), r.start_epoch)))
            .collect()
    }

    fn delay_until(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (start - self.before - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl Dispatcher for AutoplaywithDispatcher {
    fn name(&self) -> &str {
        "autoplaywiths"
    }

    async fn dispatch(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let now = Utc::now();
        let pending = self.store.pending_captures(now).await?;
        let requests = pending
            .iter()
            .map(|p| JobRequest::new(&p.channel, p.start_date))
            .collect();

        for request in self.claim(requests, now) {
            let Ok(start) = request.start() else {
                continue;
            };
            let delay = self.delay_until(start, now);
            info!(
                "autoplaywiths: {} at {} scheduled in {}s",
                request.channel,
                start,
                delay.as_secs()
            );

            let runner = self.runner.clone();
            let cancel = cancel.clone();
            self.jobs.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("autoplaywiths: {} cancelled before start", request.channel);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match runner.record(&request, &cancel).await {
                    Err(JobError::Cancelled) => {
                        info!("autoplaywiths: {} cancelled during capture", request.channel)
                    }
                    Err(e) => debug!("autoplaywiths: {} ended with {}", request.channel, e),
                    Ok(_) => {}
                }
            });
        }
        Ok(())
    }
}

/// The dispatchers enabled in `config`, in cycle order.
pub fn from_config(
    config: &Config,
    store: Arc<dyn MetadataStore>,
    runner: Arc<dyn JobRunner>,
    jobs: &TaskTracker,
) -> Vec<Arc<dyn Dispatcher>> {
    let mut dispatchers: Vec<Arc<dyn Dispatcher>> = Vec::new();
    let d = &config.dispatch;
    for (name, hook) in [("notifications", &d.notifications), ("autoplays", &d.autoplays)] {
        if !hook.enabled {
            continue;
        }
        if hook.command.is_empty() {
            warn!("dispatch: {} enabled without a command", name);
            continue;
        }
        dispatchers.push(Arc::new(HookDispatcher::new(name, hook.command.clone())));
    }
    if d.autoplaywiths.enabled {
        dispatchers.push(Arc::new(AutoplaywithDispatcher::new(
            store,
            runner,
            config.capture.before_minutes,
            jobs.clone(),
        )));
    }
    dispatchers
}
