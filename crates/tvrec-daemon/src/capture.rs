//! Stream-copy capture: spawn the transcoder, pipe its stdout into the
//! target `.ts` file, and supervise the process until it exits.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvrec_proto::config::CaptureConfig;
use tvrec_proto::guide::Program;

use crate::error::JobError;

/// Backoff after an empty read while the transcoder is still alive.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(100);

/// Reconnect ceiling handed to the transcoder, in seconds.
const RECONNECT_DELAY_MAX: &str = "300";

/// `nominal + margins`, clamped to `ceiling`.  Negative nominal lengths
/// count as zero.
pub fn capped_duration(nominal_secs: i64, before_minutes: u64, after_minutes: u64, ceiling: u64) -> u64 {
    let margins = before_minutes.saturating_add(after_minutes).saturating_mul(60);
    (nominal_secs.max(0) as u64).saturating_add(margins).min(ceiling)
}

pub fn compute_duration_secs(program: &Program, capture: &CaptureConfig) -> u64 {
    capped_duration(
        program.duration_secs(),
        capture.before_minutes,
        capture.after_minutes,
        capture.duration_ceiling(),
    )
}

/// Arguments for a raw MPEG-TS stream copy of `url` to stdout.
pub fn transcoder_args(url: &str, duration_secs: u64) -> Vec<String> {
    let secs = duration_secs.to_string();
    [
        "-y",
        "-i",
        url,
        "-reconnect",
        "1",
        "-reconnect_at_eof",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        RECONNECT_DELAY_MAX,
        "-t",
        secs.as_str(),
        "-c",
        "copy",
        "-f",
        "mpegts",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureReport {
    pub bytes: u64,
    /// The supervisor stopped the transcoder at the wall-clock cap.
    pub capped: bool,
}

enum LoopEnd {
    Exited(ExitStatus),
    Capped,
    Cancelled,
}

pub struct CaptureController {
    chunk_size: usize,
    grace: Duration,
}

impl CaptureController {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            grace: Duration::from_secs(config.wall_clock_grace_secs),
        }
    }

    /// Record `url` into `target` for at most `duration_secs`.
    ///
    /// A partially written file is left in place on every failure path.
    pub async fn capture(
        &self,
        executable: &Path,
        url: &str,
        duration_secs: u64,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport, JobError> {
        let args = transcoder_args(url, duration_secs);
        debug!("capture: {} {}", executable.display(), args.join(" "));

        let mut child = Command::new(executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::ProcessSpawn {
                program: executable.display().to_string(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {}", line);
                }
            });
        }

        let mut sink = match tokio::fs::File::create(target).await {
            Ok(f) => f,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e.into());
            }
        };

        info!("capture: writing {} for up to {}s", target.display(), duration_secs);
        let deadline = Instant::now() + Duration::from_secs(duration_secs) + self.grace;
        let streamed = self.stream(&mut child, &mut sink, deadline, cancel).await;

        // sink closes before the exit status is collected
        let flushed = sink.flush().await;
        drop(sink);

        let (end, bytes) = match streamed {
            Ok(v) => v,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e.into());
            }
        };
        flushed?;

        match end {
            LoopEnd::Cancelled => {
                info!("capture: cancelled after {} bytes", bytes);
                let _ = child.kill().await;
                Err(JobError::Cancelled)
            }
            LoopEnd::Capped => {
                warn!(
                    "capture: transcoder still running past {}s + grace, stopping it",
                    duration_secs
                );
                let _ = child.kill().await;
                if bytes == 0 {
                    return Err(JobError::EmptyOutput);
                }
                Ok(CaptureReport { bytes, capped: true })
            }
            LoopEnd::Exited(status) => {
                if !status.success() {
                    warn!("capture: transcoder exited with {}", status);
                    return Err(JobError::ProcessFailed {
                        code: status.code(),
                    });
                }
                if bytes == 0 {
                    return Err(JobError::EmptyOutput);
                }
                info!("capture: {} bytes written to {}", bytes, target.display());
                Ok(CaptureReport { bytes, capped: false })
            }
        }
    }

    async fn stream(
        &self,
        child: &mut Child,
        sink: &mut tokio::fs::File,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::io::Result<(LoopEnd, u64)> {
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("transcoder stdout not captured"))?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut bytes = 0u64;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok((LoopEnd::Cancelled, bytes)),
                _ = tokio::time::sleep_until(deadline) => return Ok((LoopEnd::Capped, bytes)),
                read = stdout.read(&mut buf) => read?,
            };

            if n > 0 {
                sink.write_all(&buf[..n]).await?;
                bytes += n as u64;
                continue;
            }

            if let Some(status) = child.try_wait()? {
                return Ok((LoopEnd::Exited(status), bytes));
            }
            tokio::time::sleep(EMPTY_READ_BACKOFF).await;
        }
    }
}
