use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::InfoHash;
use crate::engine::TorrentHandle;

/// Failures reported by the transfer engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid torrent handle {0}")]
    InvalidHandle(TorrentHandle),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transfer {0} is already in the session")]
    Duplicate(InfoHash),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced to callers of the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{} does not exist", .0.display())]
    SourceNotFound(PathBuf),

    #[error("failed to parse descriptor {}: {source}", path.display())]
    DescriptorParse { path: PathBuf, source: EngineError },

    #[error("no transfer registered for {0}")]
    NotFound(TorrentHandle),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures of a single status poll. Both are handled inside the poller.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("handle {0} is no longer valid")]
    HandleInvalid(TorrentHandle),

    #[error("status fetch failed: {0}")]
    TransientStatus(EngineError),
}

/// Failures while saving or loading the checkpoint. Never fatal.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("checkpoint window elapsed before resume data arrived for {missing:?}")]
    Timeout { missing: Vec<TorrentHandle> },

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint format error: {0}")]
    Format(String),
}
