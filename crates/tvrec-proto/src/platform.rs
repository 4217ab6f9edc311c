use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process counter so concurrent resolutions get distinct IPC sockets.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

const APP_DIR: &str = "tvrec";

/// IPC endpoint name for one mpv instance.  Unique per call.
#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}/tvrec-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
    format!("tvrec-mpv-{}-{}", std::process::id(), id)
}

#[cfg(unix)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server={}", socket_name)
}

#[cfg(windows)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", socket_name)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/tvrec on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

/// Expand a user-configured path: a leading `~` becomes the home directory
/// and `$VAR` / `${VAR}` segments are replaced from the environment.
/// Unknown variables are left untouched.
pub fn expand_path(raw: &str) -> PathBuf {
    let raw = raw.trim();
    let with_home = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            match dirs::home_dir() {
                Some(home) => format!("{}{}", home.display(), rest),
                None => raw.to_string(),
            }
        }
        _ => raw.to_string(),
    };
    PathBuf::from(expand_env(&with_home))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match (name.is_empty(), std::env::var(name)) {
            (false, Ok(value)) => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the ffmpeg binary when none is configured.
/// Order: `FFMPEG_PATH`, beside the current exe, then `PATH`.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFMPEG_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(p) = find_beside_exe(ffmpeg_binary_names()) {
        return Some(p);
    }

    find_on_path(ffmpeg_binary_names())
}

/// Find the mpv binary used as playback engine for stream resolution.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = mpv_binary_name();
    if let Some(p) = find_beside_exe(&[exe_name]) {
        return Some(p);
    }
    find_on_path(&[exe_name])
}

/// Application id of the current process on sandboxed platforms, read from
/// `/proc/<pid>/cmdline`.  Empty when unavailable.
pub fn current_app_id() -> String {
    let path = format!("/proc/{}/cmdline", std::process::id());
    match std::fs::read(&path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .split('\0')
            .next()
            .unwrap_or_default()
            .to_string(),
        Err(_) => String::new(),
    }
}

/// Private, executable-capable directory of a sandboxed app.
pub fn sandbox_private_dir(app_id: &str) -> PathBuf {
    Path::new("/data/data").join(app_id)
}
