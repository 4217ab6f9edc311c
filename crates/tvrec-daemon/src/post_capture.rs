//! What happens after a capture: the user's play-with script, optional VPN
//! routing, then handing the stream to an external player.

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};
use tvrec_proto::config::PostCaptureConfig;
use tvrec_proto::guide::is_addon_reference;

/// Run `argv + extra` to completion; non-zero exit is an error.
pub(crate) async fn run_command(argv: &[String], extra: &[&str]) -> anyhow::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let status = Command::new(program)
        .args(args)
        .args(extra)
        .status()
        .await
        .with_context(|| format!("failed to run {}", program))?;
    if !status.success() {
        bail!("{} exited with status: {:?}", program, status.code());
    }
    Ok(())
}

#[async_trait]
pub trait VpnRouter: Send + Sync {
    /// Route traffic for an addon URL, optionally falling back to the default.
    async fn filter_and_switch(&self, url: &str, default_route: bool) -> anyhow::Result<()>;
    async fn default_route(&self) -> anyhow::Result<()>;
}

/// Routing helper invoked as `<cmd> filter <url> <0|1>` / `<cmd> default`.
pub struct CommandVpnRouter {
    command: Vec<String>,
}

impl CommandVpnRouter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl VpnRouter for CommandVpnRouter {
    async fn filter_and_switch(&self, url: &str, default_route: bool) -> anyhow::Result<()> {
        let flag = if default_route { "1" } else { "0" };
        run_command(&self.command, &["filter", url, flag]).await
    }

    async fn default_route(&self) -> anyhow::Result<()> {
        run_command(&self.command, &["default"]).await
    }
}

pub struct PostCapture {
    config: PostCaptureConfig,
    vpn: Option<Arc<dyn VpnRouter>>,
}

impl PostCapture {
    pub fn new(config: PostCaptureConfig, vpn: Option<Arc<dyn VpnRouter>>) -> Self {
        Self { config, vpn }
    }

    pub fn from_config(config: &PostCaptureConfig) -> Self {
        let vpn = (config.vpn.enabled && !config.vpn.command.is_empty()).then(|| {
            Arc::new(CommandVpnRouter::new(config.vpn.command.clone())) as Arc<dyn VpnRouter>
        });
        Self::new(config.clone(), vpn)
    }

    /// Every step is best effort; failures are logged and skipped.
    pub async fn run(&self, channel: &str, start: &str, url: &str) {
        self.run_hook_script(channel, start).await;

        let Some(player) = self.config.player_command.as_ref().filter(|p| !p.is_empty()) else {
            debug!("post-capture: no player configured");
            return;
        };

        self.route(url).await;

        let Some((program, args)) = player.split_first() else {
            return;
        };
        info!("post-capture: handing {} to {}", url, program);
        match Command::new(program).args(args).arg(url).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => debug!("post-capture: player exited with {}", status),
                        Err(e) => warn!("post-capture: player wait failed: {}", e),
                    }
                });
            }
            Err(e) => warn!("post-capture: failed to launch player {}: {}", program, e),
        }
    }

    async fn run_hook_script(&self, channel: &str, start: &str) {
        let script = &self.config.hook_script;
        if !tokio::fs::try_exists(script).await.unwrap_or(false) {
            return;
        }
        let argv = [script.display().to_string()];
        match run_command(&argv, &[channel, start]).await {
            Ok(()) => debug!("post-capture: hook {} done", script.display()),
            Err(e) => warn!("post-capture: hook {} failed: {:#}", script.display(), e),
        }
    }

    async fn route(&self, url: &str) {
        if !self.config.vpn.enabled {
            return;
        }
        let Some(vpn) = &self.vpn else {
            return;
        };
        let default_route = self.config.vpn.default_route;
        let result = if is_addon_reference(url) {
            vpn.filter_and_switch(url, default_route).await
        } else if default_route {
            vpn.default_route().await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            debug!("post-capture: vpn routing ignored: {:#}", e);
        }
    }
}
