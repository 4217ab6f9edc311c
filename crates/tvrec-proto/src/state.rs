use crate::config::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Interval selector → seconds between update cycles.
pub const INTERVALS: [u64; 4] = [7200, 21600, 43200, 86400];
const DEFAULT_INTERVAL_SECS: u64 = 21600;
/// Poll period in fixed-time mode when no time of day is configured.
pub const UNSET_TIME_POLL_SECS: u64 = 3600;

/// When the scheduler should wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Interval { secs: u64 },
    /// `None` when no usable "HH:MM" is configured.
    FixedTime(Option<(u32, u32)>),
}

/// Process-wide scheduler state.  Persisted as strings so other tools that
/// share the file see the same encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Epoch seconds of the last finished cycle.
    #[serde(default)]
    pub last_run_timestamp: String,
    /// "0" = interval, "1" = fixed time.
    #[serde(default)]
    pub schedule_mode: String,
    /// "0".."3"
    #[serde(default)]
    pub interval_selector: String,
    /// "HH:MM"
    #[serde(default)]
    pub fixed_time_of_day: String,
    /// Last transcoder path copied into a sandbox.
    #[serde(default)]
    pub ffmpeg_last: String,
}

impl ServiceState {
    pub fn from_config(service: &ServiceConfig) -> Self {
        Self {
            schedule_mode: service.mode.clone(),
            interval_selector: service.interval.clone(),
            fixed_time_of_day: service.time.clone(),
            ..Self::default()
        }
    }

    /// Missing or unparsable values count as "never ran".
    pub fn last_run(&self) -> f64 {
        self.last_run_timestamp.trim().parse::<f64>().unwrap_or(0.0)
    }

    pub fn set_last_run(&mut self, epoch_secs: f64) {
        self.last_run_timestamp = epoch_secs.to_string();
    }

    pub fn schedule(&self) -> Schedule {
        if self.schedule_mode.trim() == "1" {
            Schedule::FixedTime(parse_time_of_day(&self.fixed_time_of_day))
        } else {
            let secs = self
                .interval_selector
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| INTERVALS.get(i).copied())
                .unwrap_or(DEFAULT_INTERVAL_SECS);
            Schedule::Interval { secs }
        }
    }
}

/// Parse "HH:MM".  Out-of-range values yield `None`.
pub fn parse_time_of_day(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.trim().split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

/// Reads and writes [`ServiceState`] as JSON.
pub struct StateStore {
    state_file: PathBuf,
    defaults: ServiceState,
}

impl StateStore {
    pub fn new(state_file: PathBuf, service: &ServiceConfig) -> Self {
        Self {
            state_file,
            defaults: ServiceState::from_config(service),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    /// Effective state: blanks in the file are filled from config.
    pub async fn load(&self) -> ServiceState {
        let mut state = self.load_raw().await;
        if state.schedule_mode.trim().is_empty() {
            state.schedule_mode = self.defaults.schedule_mode.clone();
        }
        if state.interval_selector.trim().is_empty() {
            state.interval_selector = self.defaults.interval_selector.clone();
        }
        if state.fixed_time_of_day.trim().is_empty() {
            state.fixed_time_of_day = self.defaults.fixed_time_of_day.clone();
        }
        state
    }

    /// File contents as stored.  Never fails: a missing or corrupt file
    /// reads as empty and is replaced on the next save.
    async fn load_raw(&self) -> ServiceState {
        match tokio::fs::read_to_string(&self.state_file).await {
            Ok(content) => match serde_json::from_str::<ServiceState>(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!("state: ignoring corrupt {}: {}", self.state_file.display(), e);
                    ServiceState::default()
                }
            },
            Err(_) => ServiceState::default(),
        }
    }

    pub async fn save(&self, state: &ServiceState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let target = self.state_file.clone();
        // unique temp file in the same directory, renamed over the target
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let dir = match target.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&target)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn record_run(&self, epoch_secs: f64) -> anyhow::Result<()> {
        let mut state = self.load_raw().await;
        state.set_last_run(epoch_secs);
        self.save(&state).await
    }

    pub async fn set_ffmpeg_last(&self, configured: &str) -> anyhow::Result<()> {
        let mut state = self.load_raw().await;
        state.ffmpeg_last = configured.to_string();
        self.save(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(mode: &str, interval: &str, time: &str) -> ServiceState {
        ServiceState {
            last_run_timestamp: String::new(),
            schedule_mode: mode.into(),
            interval_selector: interval.into(),
            fixed_time_of_day: time.into(),
            ffmpeg_last: String::new(),
        }
    }

    #[test]
    fn test_interval_selectors() {
        assert_eq!(state("0", "0", "").schedule(), Schedule::Interval { secs: 7200 });
        assert_eq!(state("0", "1", "").schedule(), Schedule::Interval { secs: 21600 });
        assert_eq!(state("0", "2", "").schedule(), Schedule::Interval { secs: 43200 });
        assert_eq!(state("0", "3", "").schedule(), Schedule::Interval { secs: 86400 });
        assert_eq!(state("0", "9", "").schedule(), Schedule::Interval { secs: 21600 });
        assert_eq!(state("0", "x", "").schedule(), Schedule::Interval { secs: 21600 });
    }

    #[test]
    fn test_fixed_time_mode() {
        assert_eq!(state("1", "0", "03:30").schedule(), Schedule::FixedTime(Some((3, 30))));
        assert_eq!(state("1", "0", "").schedule(), Schedule::FixedTime(None));
        assert_eq!(state("1", "0", "25:00").schedule(), Schedule::FixedTime(None));
    }

    #[test]
    fn test_last_run_parsing() {
        let mut s = state("0", "0", "");
        assert_eq!(s.last_run(), 0.0);
        s.last_run_timestamp = "1704139200.5".into();
        assert_eq!(s.last_run(), 1704139200.5);
        s.set_last_run(42.0);
        assert_eq!(s.last_run_timestamp, "42");
    }

    #[tokio::test]
    async fn test_store_roundtrip_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = ServiceConfig {
            mode: "1".into(),
            time: "04:15".into(),
            ..ServiceConfig::default()
        };
        let store = StateStore::new(dir.path().join("state.json"), &service);

        let fresh = store.load().await;
        assert_eq!(fresh.last_run(), 0.0);
        assert_eq!(fresh.schedule(), Schedule::FixedTime(Some((4, 15))));

        store.record_run(1000.0).await.unwrap();
        store.set_ffmpeg_last("/sdcard/ffmpeg").await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded.last_run(), 1000.0);
        assert_eq!(loaded.ffmpeg_last, "/sdcard/ffmpeg");
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_one_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(StateStore::new(
            dir.path().join("state.json"),
            &ServiceConfig::default(),
        ));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.record_run(i as f64).await
                } else {
                    store.set_ffmpeg_last("/sdcard/ffmpeg").await
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // every write lands as a whole file, no temp files left behind
        let loaded = store.load().await;
        assert!(serde_json::to_string(&loaded).is_ok());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.path(), dir.path().join("state.json"));
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = StateStore::new(path, &ServiceConfig::default());
        let loaded = store.load().await;
        assert_eq!(loaded.schedule(), Schedule::Interval { secs: 21600 });
    }
}
