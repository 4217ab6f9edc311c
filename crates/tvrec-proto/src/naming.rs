//! File and folder naming for recordings.

use chrono::{DateTime, TimeZone};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::guide::Program;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // \w is Unicode-aware in the regex crate
    RE.get_or_init(|| Regex::new(r"[^\w' ]+").expect("static regex"))
}

/// Strip everything except word characters, apostrophe and space.
pub fn sanitize(name: &str) -> String {
    unsafe_chars().replace_all(name, "").into_owned()
}

/// `{root}/{Movies|TVShows}/{sanitized title}`
pub fn program_folder(root: &Path, program: &Program) -> PathBuf {
    let subfolder = if program.is_movie { "Movies" } else { "TVShows" };
    root.join(subfolder).join(sanitize(&program.title))
}

/// Create the folder and its parents; succeeds if it already exists.
pub async fn ensure_folder(folder: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(folder).await
}

/// Title used in the file name: adds ` S{season}E{episode}` when both are set.
pub fn display_title(program: &Program) -> String {
    match program.season_episode() {
        Some((season, episode)) => format!("{} S{}E{}", program.title, season, episode),
        None => program.title.clone(),
    }
}

/// `"{channel} - {title} - {YYYY-mm-dd HH-MM}.ts"`
pub fn file_name<Tz>(channel: &str, program: &Program, recorded_at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{} - {} - {}.ts",
        sanitize(channel),
        sanitize(&display_title(program)),
        recorded_at.format("%Y-%m-%d %H-%M")
    )
}

pub fn target_path<Tz>(
    root: &Path,
    channel: &str,
    program: &Program,
    recorded_at: &DateTime<Tz>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    program_folder(root, program).join(file_name(channel, program, recorded_at))
}
