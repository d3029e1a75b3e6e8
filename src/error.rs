use std::io;
use std::path::PathBuf;

/// Conditions that stop the server before it can serve traffic.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("journal directory {}: {source}", path.display())]
    JournalDir { path: PathBuf, source: io::Error },

    #[error("journal directory {} is empty, nothing to restore", path.display())]
    EmptyJournalDir { path: PathBuf },

    #[error("failed to open journal {}: {source}", path.display())]
    JournalOpen { path: PathBuf, source: io::Error },

    #[error("failed to read journal {}: {source}", path.display())]
    JournalRead { path: PathBuf, source: io::Error },

    #[error("malformed journal record at {}:{line}: {source}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

/// A journal append that did not make it to disk. The record is dropped.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
