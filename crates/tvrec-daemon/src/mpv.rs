//! mpv IPC driver used as the playback engine for stream resolution.
//!
//! Architecture:
//!
//! ```text
//!   MpvEngine::spawn()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event / property-change   → logged and dropped
//! ```
//!
//! Every resolution gets its own idle mpv with its own socket, so two
//! recordings starting at once never fight over one player.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::resolver::{EngineFactory, PlaybackEngine};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn get_property(&self, name: &str) -> Option<Value> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => resp.get("data").cloned(),
            Err(e) => {
                debug!("mpv: get_property {} failed: {}", name, e);
                None
            }
        }
    }

    async fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_property(name).await.and_then(|v| v.as_bool())
    }

    async fn get_string(&self, name: &str) -> Option<String> {
        self.get_property(name)
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
    }
}

/// One headless mpv process driven over IPC.
pub struct MpvEngine {
    handle: MpvHandle,
    process: Mutex<Option<tokio::process::Child>>,
    socket_name: String,
}

impl MpvEngine {
    fn command(binary: &Path, socket_name: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("--idle=yes")
            .arg("--no-video")
            .arg("--ao=null")
            .arg("--no-terminal")
            .arg(tvrec_proto::platform::mpv_socket_arg(socket_name))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    #[cfg(unix)]
    pub async fn spawn(binary: &Path) -> anyhow::Result<Self> {
        let socket_name = tvrec_proto::platform::mpv_socket_name();
        let socket_path = PathBuf::from(&socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning {} (socket {})", binary.display(), socket_name);
        let child = Self::command(binary, &socket_name).spawn()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        debug!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            handle: start_io_tasks(BufReader::new(read_half), write_half),
            process: Mutex::new(Some(child)),
            socket_name,
        })
    }

    #[cfg(windows)]
    pub async fn spawn(binary: &Path) -> anyhow::Result<Self> {
        let socket_name = tvrec_proto::platform::mpv_socket_name();
        info!("mpv: spawning {} (pipe {})", binary.display(), socket_name);
        let child = Self::command(binary, &socket_name).spawn()?;

        let pipe_path = format!(r"\\.\pipe\{}", socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                debug!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(Self {
                    handle: start_io_tasks(BufReader::new(read_half), write_half),
                    process: Mutex::new(Some(child)),
                    socket_name,
                });
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    async fn kill(&self) {
        if let Some(mut p) = self.process.lock().await.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    async fn play(&self, reference: &str) -> anyhow::Result<()> {
        self.handle.send(json!(["loadfile", reference])).await?;
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        // idle-active goes false once a file is loaded; core-idle goes false
        // once data actually flows.
        let idle = self.handle.get_bool("idle-active").await.unwrap_or(true);
        let core_idle = self.handle.get_bool("core-idle").await.unwrap_or(true);
        !idle && !core_idle
    }

    async fn playing_url(&self) -> Option<String> {
        match self.handle.get_string("stream-open-filename").await {
            Some(url) => Some(url),
            None => self.handle.get_string("path").await,
        }
    }

    async fn stop(&self) {
        let _ = self.handle.send(json!(["stop"])).await;
        self.kill().await;
    }
}

/// Spawns mpv on demand, one process per resolution.
pub struct MpvFactory {
    binary: Option<PathBuf>,
}

impl MpvFactory {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl EngineFactory for MpvFactory {
    async fn start(&self) -> anyhow::Result<Box<dyn PlaybackEngine>> {
        let binary = match &self.binary {
            Some(b) => b.clone(),
            None => tvrec_proto::platform::find_mpv_binary()
                .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?,
        };
        Ok(Box::new(MpvEngine::spawn(&binary).await?))
    }
}

fn start_io_tasks<R, W>(reader: BufReader<R>, writer: W) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending));

    MpvHandle { tx: cmd_tx }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) else {
                    debug!("mpv reader: event {}", trimmed);
                    continue;
                };

                let mut map = pending.lock().await;
                if let Some(tx) = map.remove(&req_id) {
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                        Err(anyhow::anyhow!("mpv error: {}", err))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the reader/writer pair against an in-memory peer that answers
    /// like mpv does.
    #[tokio::test]
    async fn test_request_response_matching() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let handle = start_io_tasks(BufReader::new(client_read), client_write);

        tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["request_id"].as_u64().unwrap();
                // unsolicited event first; must be ignored
                let event = json!({"event": "property-change", "id": 1, "data": false});
                let reply = match req["command"][1].as_str() {
                    Some("path") => json!({"request_id": id, "error": "success", "data": "http://x/y.ts"}),
                    _ => json!({"request_id": id, "error": "property unavailable"}),
                };
                let out = format!("{}\n{}\n", event, reply);
                server_write.write_all(out.as_bytes()).await.unwrap();
            }
        });

        assert_eq!(handle.get_string("path").await.as_deref(), Some("http://x/y.ts"));
        assert_eq!(handle.get_string("stream-open-filename").await, None);
        assert!(handle.send(json!(["get_property", "nope"])).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_fails_requests() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let handle = start_io_tasks(BufReader::new(client_read), client_write);
        drop(server);
        assert!(handle.send(json!(["get_property", "path"])).await.is_err());
    }
}
