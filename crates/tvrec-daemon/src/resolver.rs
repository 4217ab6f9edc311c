//! Turns a stored channel reference into a URL the transcoder can read.
//!
//! Direct `http(s)` references pass straight through.  Anything else is
//! handed to a playback engine, which is polled until it reports playing;
//! the URL it ended up opening is the resolved stream.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvrec_proto::config::ResolverConfig;
use tvrec_proto::guide::is_network_url;

use crate::error::JobError;

/// A player that can open an opaque reference and report what it is
/// actually playing.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    async fn play(&self, reference: &str) -> anyhow::Result<()>;
    async fn is_playing(&self) -> bool;
    /// The concrete file/URL currently open, if any.
    async fn playing_url(&self) -> Option<String>;
    async fn stop(&self);
}

/// Creates one engine per resolution so concurrent jobs never share a player.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn start(&self) -> anyhow::Result<Box<dyn PlaybackEngine>>;
}

pub struct SourceResolver<'a> {
    engines: &'a dyn EngineFactory,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> SourceResolver<'a> {
    pub fn new(engines: &'a dyn EngineFactory, config: &ResolverConfig) -> Self {
        Self {
            engines,
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    #[cfg(test)]
    fn with_timing(engines: &'a dyn EngineFactory, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            engines,
            timeout,
            poll_interval,
        }
    }

    /// Number of "is playing" checks made before giving up.
    pub fn max_polls(&self) -> u32 {
        let timeout = self.timeout.as_millis();
        let poll = self.poll_interval.as_millis().max(1);
        timeout.div_ceil(poll) as u32
    }

    pub async fn resolve(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        if is_network_url(reference) {
            debug!("resolver: {} is already a network URL", reference);
            return Ok(reference.trim().to_string());
        }

        let engine = self
            .engines
            .start()
            .await
            .map_err(|e| JobError::Engine(e.to_string()))?;

        if let Err(e) = engine.play(reference).await {
            engine.stop().await;
            return Err(JobError::Engine(e.to_string()));
        }

        let result = self.poll(engine.as_ref(), cancel).await;
        engine.stop().await;

        match &result {
            Ok(url) => info!("resolver: {} -> {}", reference, url),
            Err(e) => warn!("resolver: {} not resolved: {}", reference, e),
        }
        result
    }

    async fn poll(
        &self,
        engine: &dyn PlaybackEngine,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let attempts = self.max_polls();
        for attempt in 1..=attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if engine.is_playing().await {
                debug!("resolver: playing after {} polls", attempt);
                return match engine.playing_url().await {
                    Some(url) if !url.trim().is_empty() => Ok(url),
                    _ => Err(JobError::EmptyResolution),
                };
            }
        }
        Err(JobError::ResolutionTimeout {
            timeout_secs: self.timeout.as_secs(),
        })
    }
}
