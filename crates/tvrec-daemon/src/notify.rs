use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Surfaces a message to the user outside the log file.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// Runs `<command> <title> <message>` (e.g. `notify-send`).  With no
/// command, or when the command fails, the message goes to the log at WARN.
pub struct CommandNotifier {
    command: Option<String>,
}

impl CommandNotifier {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, title: &str, message: &str) {
        let Some(command) = &self.command else {
            warn!("{}: {}", title, message);
            return;
        };

        match Command::new(command).arg(title).arg(message).status().await {
            Ok(status) if status.success() => debug!("notify: sent \"{}\"", title),
            Ok(status) => warn!("{}: {} (notifier exited with {})", title, message, status),
            Err(e) => warn!("{}: {} (notifier {} unavailable: {})", title, message, command, e),
        }
    }
}
