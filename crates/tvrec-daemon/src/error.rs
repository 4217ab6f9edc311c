use thiserror::Error;

/// Why a capture job stopped short of a recording.
///
/// None of these are fatal to the service loop; the caller logs them and
/// moves on.
#[derive(Debug, Error)]
pub enum JobError {
    /// Missing executable, unset capture folder, bad job arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stream did not start playing within {timeout_secs}s")]
    ResolutionTimeout { timeout_secs: u64 },

    #[error("player reported playing but returned no URL")]
    EmptyResolution,

    #[error("playback engine failed: {0}")]
    Engine(String),

    #[error("failed to spawn {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder exited with status {code:?}")]
    ProcessFailed { code: Option<i32> },

    #[error("transcoder produced no output")]
    EmptyOutput,

    #[error("metadata lookup failed: {0}")]
    MetadataLookup(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Errors the user should hear about, not just find in the log.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, JobError::Configuration(_))
    }
}
