//! The seam between the session manager and the transfer engine.
//!
//! The engine owns the protocol side of every transfer. The manager only
//! talks to it through [`Engine`], which is shared between the manager and
//! all pollers, so every method takes `&self` and must tolerate concurrent
//! callers.

mod memory;

use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::crypto::InfoHash;
use crate::error::EngineError;
use crate::torrent::Metainfo;

pub use memory::{MemoryEngine, TransferStats};

/// Opaque reference to one transfer inside the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentHandle(u64);

impl TorrentHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for TorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time status of a single transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentStatus {
    pub has_metadata: bool,
    pub name: String,
    /// Fraction of wanted bytes that are done, 0.0 to 1.0
    pub progress: f64,
    /// Bytes per second
    pub download_rate: u64,
    /// Bytes per second
    pub upload_rate: u64,
    pub total_wanted: u64,
    pub total_done: u64,
    pub num_peers: u32,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddFlags {
    pub paused: bool,
    pub auto_managed: bool,
    /// Allocate files sparsely instead of up front
    pub sparse: bool,
}

impl Default for AddFlags {
    fn default() -> Self {
        Self {
            paused: false,
            auto_managed: false,
            sparse: true,
        }
    }
}

/// Everything the engine needs to admit a transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddTorrentParams {
    pub info_hash: Option<InfoHash>,
    pub metainfo: Option<Metainfo>,
    pub name: Option<String>,
    pub save_path: PathBuf,
    pub trackers: Vec<String>,
    pub flags: AddFlags,
    /// Bytes already verified on disk, restored from resume data.
    pub total_done: u64,
}

impl AddTorrentParams {
    pub fn from_metainfo(metainfo: Metainfo, save_path: impl Into<PathBuf>) -> Self {
        Self {
            info_hash: Some(metainfo.info_hash),
            name: Some(metainfo.name.clone()),
            trackers: metainfo.trackers.clone(),
            metainfo: Some(metainfo),
            save_path: save_path.into(),
            ..Self::default()
        }
    }

    /// A transfer can only be re-added when it is identified somehow.
    pub fn is_resumable(&self) -> bool {
        self.info_hash.is_some() || self.metainfo.is_some()
    }
}

/// Events queued by the engine and drained with [`Engine::pop_alerts`].
#[derive(Clone, PartialEq, Eq)]
pub enum Alert {
    ResumeDataReady { handle: TorrentHandle, data: Vec<u8> },
    ResumeDataFailed { handle: TorrentHandle, reason: String },
    MetadataReceived(TorrentHandle),
}

impl fmt::Debug for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResumeDataReady { handle, data } => write!(
                f,
                "ResumeDataReady {{ handle: {}, data: <{} bytes> }}",
                handle,
                data.len()
            ),
            Self::ResumeDataFailed { handle, reason } => {
                write!(f, "ResumeDataFailed({}, {:?})", handle, reason)
            }
            Self::MetadataReceived(handle) => write!(f, "MetadataReceived({})", handle),
        }
    }
}

pub trait Engine: Send + Sync {
    fn listen_on(&self, ports: RangeInclusive<u16>) -> Result<(), EngineError>;

    fn start_dht(&self);

    /// Reads and parses a descriptor file.
    fn parse_descriptor(&self, path: &Path) -> Result<Metainfo, EngineError>;

    /// Turns a magnet URI into add parameters (no metadata yet).
    fn parse_magnet(&self, uri: &str) -> Result<AddTorrentParams, EngineError>;

    fn add_torrent(&self, params: AddTorrentParams) -> Result<TorrentHandle, EngineError>;

    /// Drops the transfer; the handle is invalid afterwards.
    fn remove_torrent(&self, handle: TorrentHandle, delete_files: bool)
    -> Result<(), EngineError>;

    fn is_valid(&self, handle: TorrentHandle) -> bool;

    fn status(&self, handle: TorrentHandle) -> Result<TorrentStatus, EngineError>;

    fn trackers(&self, handle: TorrentHandle) -> Result<Vec<String>, EngineError>;

    fn pause(&self, handle: TorrentHandle) -> Result<(), EngineError>;

    fn resume(&self, handle: TorrentHandle) -> Result<(), EngineError>;

    fn pause_session(&self);

    fn resume_session(&self);

    /// Starts generating resume data. The blob arrives later as
    /// [`Alert::ResumeDataReady`].
    fn save_resume_data(&self, handle: TorrentHandle) -> Result<(), EngineError>;

    fn pop_alerts(&self) -> Vec<Alert>;

    fn read_resume_data(&self, data: &[u8]) -> Result<AddTorrentParams, EngineError>;

    /// Session-wide DHT routing table size.
    fn dht_node_count(&self) -> Option<u32> {
        None
    }

    /// Older engines expose the DHT counter under a different accessor.
    fn legacy_dht_node_count(&self) -> Option<u32> {
        None
    }
}

/// Reads the session DHT counter, falling back to the legacy accessor and
/// finally to zero.
pub fn dht_node_count(engine: &dyn Engine) -> u32 {
    engine
        .dht_node_count()
        .or_else(|| engine.legacy_dht_node_count())
        .unwrap_or(0)
}
