use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine.
///
/// Per-file problems (`Decode`, `Unprocessable`, `TransientIo`) are recovered
/// locally and aggregated into `RescanStats`; `Configuration`, `Store` and
/// `Pool` errors abort the current pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("scan error at {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("unprocessable file: {0}")]
    Unprocessable(PathBuf),

    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("group {0} not found")]
    GroupNotFound(i64),

    #[error("file {file_id} is not a member of group {group_id}")]
    NotAGroupMember { group_id: i64, file_id: i64 },
}

impl Error {
    /// Whether the error is fatal to a pipeline run (as opposed to a
    /// per-entry condition the caller aggregates and moves past).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Store(_) | Error::Pool(_)
        )
    }
}
