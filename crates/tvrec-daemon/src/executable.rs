//! Locating a usable transcoder binary before any network work starts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tvrec_proto::config::CaptureConfig;
use tvrec_proto::platform;
use tvrec_proto::state::StateStore;

use crate::error::JobError;

#[async_trait]
pub trait ExecutableLocator: Send + Sync {
    async fn locate(&self, capture: &CaptureConfig) -> Result<PathBuf, JobError>;
}

/// Configured path (expanded), or discovery when nothing is configured.
fn source_path(capture: &CaptureConfig) -> Option<PathBuf> {
    let configured = capture.ffmpeg.trim();
    if configured.is_empty() {
        platform::find_ffmpeg_binary()
    } else {
        Some(platform::expand_path(configured))
    }
}

/// Fails when the file is missing; grants the owner execute bit if absent.
async fn ensure_executable(path: &Path) -> Result<PathBuf, JobError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(JobError::Configuration(format!(
            "ffmpeg executable not found at {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let mode = meta.permissions().mode();
                if mode & 0o100 == 0 {
                    info!("executable: granting execute permission on {}", path.display());
                    let perms = std::fs::Permissions::from_mode(mode | 0o100);
                    if let Err(e) = tokio::fs::set_permissions(path, perms).await {
                        warn!("executable: chmod {} failed: {}", path.display(), e);
                    }
                }
            }
            Err(e) => warn!("executable: stat {} failed: {}", path.display(), e),
        }
    }

    Ok(path.to_path_buf())
}

/// Regular desktop/server platforms: run the binary where it lives.
pub struct HostLocator;

#[async_trait]
impl ExecutableLocator for HostLocator {
    async fn locate(&self, capture: &CaptureConfig) -> Result<PathBuf, JobError> {
        let path = source_path(capture).ok_or_else(|| {
            JobError::Configuration("ffmpeg executable not configured or found".into())
        })?;
        debug!("executable: host path {}", path.display());
        ensure_executable(&path).await
    }
}

/// Sandboxed platforms where user storage is mounted no-exec: the binary is
/// copied into the app's private directory and run from there.
pub struct SandboxLocator {
    private_dir: Option<PathBuf>,
    state: Arc<StateStore>,
}

impl SandboxLocator {
    pub fn new(private_dir: Option<PathBuf>, state: Arc<StateStore>) -> Self {
        Self { private_dir, state }
    }

    pub fn for_current_app(state: Arc<StateStore>) -> Self {
        let app_id = platform::current_app_id();
        let private_dir = (!app_id.is_empty()).then(|| platform::sandbox_private_dir(&app_id));
        Self::new(private_dir, state)
    }
}

#[async_trait]
impl ExecutableLocator for SandboxLocator {
    async fn locate(&self, capture: &CaptureConfig) -> Result<PathBuf, JobError> {
        let private_dir = self.private_dir.as_ref().ok_or_else(|| {
            JobError::Configuration("cannot determine sandbox application id".into())
        })?;
        let target = private_dir.join("ffmpeg");
        let configured = capture.ffmpeg.trim();
        let last = self.state.load().await.ffmpeg_last;
        let target_exists = tokio::fs::try_exists(&target).await.unwrap_or(false);

        if let Some(source) = source_path(capture) {
            let changed = configured != last;
            if changed || (!target_exists && source != target) {
                info!(
                    "executable: copying {} into sandbox {}",
                    source.display(),
                    target.display()
                );
                match tokio::fs::copy(&source, &target).await {
                    Ok(_) => {
                        if let Err(e) = self.state.set_ffmpeg_last(configured).await {
                            warn!("executable: could not persist last ffmpeg path: {}", e);
                        }
                    }
                    Err(e) => warn!("executable: copy failed: {}", e),
                }
            }
        }

        ensure_executable(&target).await
    }
}

/// Pick the locator for the platform we are running on.
pub fn default_locator(state: Arc<StateStore>) -> Arc<dyn ExecutableLocator> {
    if cfg!(target_os = "android") {
        Arc::new(SandboxLocator::for_current_app(state))
    } else {
        Arc::new(HostLocator)
    }
}
