//! Error kinds surfaced by the player core.

/// Everything the engine and its collaborators can fail with.
///
/// `NullVoiceChannel` is the one terminal kind for a `Play` command: the
/// engine re-enqueues every other failed play.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Play requested without a voice target.
    #[error("no voice channel to play in")]
    NullVoiceChannel,

    /// Downloader/searcher asked for an unsupported service.
    #[error("service unknown")]
    ServiceUnknown,

    /// Search produced no usable result.
    #[error("song not found")]
    SongNotFound,

    /// Storage miss.
    #[error("not found")]
    NotFound,

    /// Targeted write to an unregistered socket.
    #[error("socket does not exist")]
    NoSuchSocket,

    /// The eviction sweep could not remove some files.
    #[error("remove files: {0}")]
    BrokenFiles(String),

    /// An external process exited unsuccessfully.
    #[error("{command}: {stderr}")]
    CommandFailed {
        command: &'static str,
        stderr: String,
    },

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
