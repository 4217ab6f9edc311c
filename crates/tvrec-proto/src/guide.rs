//! Schedule data as seen by the recorder.
//!
//! The guide itself (fetching listings, caching them) lives elsewhere; this
//! module only defines the typed records and the lookup boundary the
//! recorder consumes.  Rows are validated when they cross that boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// URL schemes that are directly playable without a resolution step.
pub fn is_network_url(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Opaque addon-scheme reference (e.g. `plugin://...`).
pub fn is_addon_reference(reference: &str) -> bool {
    reference.trim_start().starts_with("plugin://")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub lineup: String,
    #[serde(default)]
    pub logo: Option<String>,
    /// Raw reference: direct network URL or addon-scheme reference.
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_visible() -> bool {
    true
}

fn default_weight() -> i32 {
    -1
}

impl Channel {
    pub fn is_playable(&self) -> bool {
        self.stream_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl std::hash::Hash for Channel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub channel: String,
    pub title: String,
    #[serde(default)]
    pub sub_title: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_date: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub episode: Option<String>,
    #[serde(default)]
    pub is_movie: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub notification_scheduled: bool,
    #[serde(default)]
    pub autoplay_scheduled: bool,
    #[serde(default)]
    pub autoplaywith_scheduled: bool,
}

fn default_language() -> String {
    "en".to_string()
}

impl Program {
    /// A plain (non-movie, no season/episode) program with nothing scheduled.
    pub fn new(channel: &str, title: &str, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            channel: channel.to_string(),
            title: title.to_string(),
            sub_title: String::new(),
            start_date,
            end_date,
            description: String::new(),
            categories: Vec::new(),
            season: None,
            episode: None,
            is_movie: false,
            language: default_language(),
            notification_scheduled: false,
            autoplay_scheduled: false,
            autoplaywith_scheduled: false,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end_date - self.start_date).num_seconds()
    }

    pub fn is_valid(&self) -> bool {
        self.end_date > self.start_date
    }

    /// `(season, episode)` when both are present and non-empty.
    pub fn season_episode(&self) -> Option<(&str, &str)> {
        match (self.season.as_deref(), self.episode.as_deref()) {
            (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => Some((s, e)),
            _ => None,
        }
    }
}

/// On-disk shape of the cached guide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuideFile {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub programs: Vec<Program>,
}

/// Lookup boundary the recorder and dispatchers consume.
///
/// "Not found" is `Ok(None)` / an empty list; `Err` means the store itself
/// could not be read.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn stream_url(&self, channel: &str) -> anyhow::Result<Option<String>>;

    async fn program_at(
        &self,
        channel: &str,
        start: DateTime<Utc>,
    ) -> anyhow::Result<Option<Program>>;

    /// Programs flagged for capture that have not started yet.
    async fn pending_captures(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Program>>;
}

/// Store backed by the JSON file the guide writes.  The file is re-read on
/// every call so a refresh between cycles is picked up without restarting.
pub struct JsonGuideStore {
    path: PathBuf,
}

impl JsonGuideStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> anyhow::Result<GuideFile> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            anyhow::anyhow!("cannot read guide file {}: {}", self.path.display(), e)
        })?;
        let mut guide: GuideFile = serde_json::from_str(&content)?;
        let before = guide.programs.len();
        guide.programs.retain(Program::is_valid);
        if guide.programs.len() != before {
            warn!(
                "guide: dropped {} programs with end <= start",
                before - guide.programs.len()
            );
        }
        debug!(
            "guide: loaded {} channels, {} programs",
            guide.channels.len(),
            guide.programs.len()
        );
        Ok(guide)
    }
}

#[async_trait]
impl MetadataStore for JsonGuideStore {
    async fn stream_url(&self, channel: &str) -> anyhow::Result<Option<String>> {
        let guide = self.load().await?;
        Ok(guide
            .channels
            .into_iter()
            .find(|c| c.id == channel)
            .filter(Channel::is_playable)
            .and_then(|c| c.stream_url))
    }

    async fn program_at(
        &self,
        channel: &str,
        start: DateTime<Utc>,
    ) -> anyhow::Result<Option<Program>> {
        let guide = self.load().await?;
        Ok(guide
            .programs
            .into_iter()
            .find(|p| p.channel == channel && p.start_date.timestamp() == start.timestamp()))
    }

    async fn pending_captures(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Program>> {
        let guide = self.load().await?;
        let mut pending: Vec<Program> = guide
            .programs
            .into_iter()
            .filter(|p| p.autoplaywith_scheduled && p.start_date > now)
            .collect();
        pending.sort_by_key(|p| p.start_date);
        Ok(pending)
    }
}
