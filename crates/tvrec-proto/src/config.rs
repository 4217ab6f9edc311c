use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

/// Hard ceiling on any single capture, regardless of margins.
pub const MAX_CAPTURE_SECS: u64 = 4 * 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub post_capture: PostCaptureConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root folder for recordings.  Capture jobs refuse to run while unset.
    #[serde(default)]
    pub capture_dir: Option<PathBuf>,
    /// Cached schedule data (channels + programs) written by the guide.
    #[serde(default = "default_guide_file")]
    pub guide_file: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            capture_dir: None,
            guide_file: default_guide_file(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Configured transcoder path.  Empty means "discover it".
    #[serde(default)]
    pub ffmpeg: String,
    #[serde(default)]
    pub before_minutes: u64,
    #[serde(default)]
    pub after_minutes: u64,
    /// Clamped to [`MAX_CAPTURE_SECS`] when used.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Extra wall-clock time the supervisor grants the transcoder past the
    /// computed duration before killing it.
    #[serde(default = "default_wall_clock_grace_secs")]
    pub wall_clock_grace_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg: String::new(),
            before_minutes: 0,
            after_minutes: 0,
            max_duration_secs: default_max_duration_secs(),
            wall_clock_grace_secs: default_wall_clock_grace_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl CaptureConfig {
    pub fn duration_ceiling(&self) -> u64 {
        self.max_duration_secs.min(MAX_CAPTURE_SECS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolve_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Explicit mpv binary; discovered on PATH when unset.
    #[serde(default)]
    pub mpv: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_resolve_timeout(),
            poll_interval_secs: default_poll_interval(),
            mpv: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run one cycle immediately when the service starts.
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default)]
    pub notify_on_finish: bool,
    /// "0" = interval, "1" = fixed time of day.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// "0".."3" → 2h, 6h, 12h, 24h.
    #[serde(default = "default_interval")]
    pub interval: String,
    /// "HH:MM", used in fixed-time mode.
    #[serde(default)]
    pub time: String,
    /// External program that refreshes the guide file.
    #[serde(default)]
    pub refresh_command: Option<Vec<String>>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_startup: false,
            notify_on_finish: false,
            mode: default_mode(),
            interval: default_interval(),
            time: String::new(),
            refresh_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoplaywithConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub notifications: HookConfig,
    #[serde(default)]
    pub autoplays: HookConfig,
    #[serde(default)]
    pub autoplaywiths: AutoplaywithConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default_route: bool,
    /// Routing helper.  Invoked as `<command...> filter <url> <default>` or
    /// `<command...> default`.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCaptureConfig {
    /// Secondary script run as `<script> <channel> <start>` when it exists.
    #[serde(default = "default_hook_script")]
    pub hook_script: PathBuf,
    /// External player handed the URL once capture is done.
    #[serde(default)]
    pub player_command: Option<Vec<String>>,
    #[serde(default)]
    pub vpn: VpnConfig,
}

impl Default for PostCaptureConfig {
    fn default() -> Self {
        Self {
            hook_script: default_hook_script(),
            player_command: None,
            vpn: VpnConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_command")]
    pub command: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: default_notify_command(),
        }
    }
}

fn default_guide_file() -> PathBuf {
    platform::data_dir().join("guide.json")
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_hook_script() -> PathBuf {
    platform::data_dir().join("playwith.sh")
}

fn default_max_duration_secs() -> u64 {
    MAX_CAPTURE_SECS
}

fn default_wall_clock_grace_secs() -> u64 {
    300
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_resolve_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "0".to_string()
}

fn default_interval() -> String {
    "1".to_string()
}

fn default_notify_command() -> Option<String> {
    Some("notify-send".to_string())
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
