//! Saving and restoring resume data of every transfer.
//!
//! The checkpoint file is a magic/version header followed by length-prefixed
//! resume blobs until end of file:
//!
//! ```text
//! magic   8 bytes  "CASCKPT\0"
//! version u16 LE
//! len     u32 LE   \ repeated
//! blob    len bytes/
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Instant, sleep};

use crate::config::Config;
use crate::engine::{AddTorrentParams, Alert, Engine, TorrentHandle};
use crate::error::PersistenceError;

pub const MAGIC: &[u8; 8] = b"CASCKPT\0";
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2;

/// Outcome of one checkpoint save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Handles whose resume data made it into the file, in arrival order
    pub saved: Vec<TorrentHandle>,
    /// Handles that were asked for resume data but did not deliver in time
    pub missing: Vec<TorrentHandle>,
}

impl CheckpointReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Turns an incomplete report into [`PersistenceError::Timeout`].
    pub fn check(self) -> Result<Self, PersistenceError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(PersistenceError::Timeout {
                missing: self.missing,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    window: Duration,
    poll_interval: Duration,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(&Config::new(path.into()))
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.checkpoint_path.clone(),
            window: config.checkpoint_window,
            poll_interval: config.checkpoint_poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Asks the engine for resume data of every valid handle, waits up to
    /// the window for it, and replaces the checkpoint file with whatever
    /// arrived.
    pub async fn save(
        &self,
        engine: &dyn Engine,
        handles: &[TorrentHandle],
    ) -> Result<CheckpointReport, PersistenceError> {
        let mut pending = Vec::new();
        for &handle in handles {
            if !engine.is_valid(handle) {
                debug!("[{}] skipping invalid handle", handle);
                continue;
            }
            match engine.save_resume_data(handle) {
                Ok(()) => pending.push(handle),
                Err(err) => warn!("[{}] resume data request failed: {}", handle, err),
            }
        }

        let mut blobs = Vec::new();
        let mut report = CheckpointReport::default();
        let deadline = Instant::now() + self.window;
        while !pending.is_empty() {
            for alert in engine.pop_alerts() {
                match alert {
                    Alert::ResumeDataReady { handle, data } if pending.contains(&handle) => {
                        pending.retain(|h| *h != handle);
                        report.saved.push(handle);
                        blobs.push(data);
                    }
                    Alert::ResumeDataFailed { handle, reason } if pending.contains(&handle) => {
                        pending.retain(|h| *h != handle);
                        warn!("[{}] no resume data: {}", handle, reason);
                    }
                    alert => debug!("ignoring {:?}", alert),
                }
            }
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(self.poll_interval).await;
        }

        if !pending.is_empty() {
            warn!(
                "checkpoint window elapsed, dropping resume data of {:?}",
                pending
            );
            report.missing = pending;
        }

        write_blobs(&self.path, &blobs).await?;
        info!(
            "saved {} transfers to {}",
            blobs.len(),
            self.path.display()
        );
        Ok(report)
    }

    /// Reads the checkpoint back into add requests. A missing or unreadable
    /// file yields none.
    pub async fn load(&self, engine: &dyn Engine) -> Vec<AddTorrentParams> {
        let blobs = match read_blobs(&self.path).await {
            Ok(Some(blobs)) => blobs,
            Ok(None) => {
                info!("no checkpoint at {}, starting fresh", self.path.display());
                return Vec::new();
            }
            Err(err) => {
                warn!("failed to read {}: {}", self.path.display(), err);
                return Vec::new();
            }
        };

        let mut requests = Vec::with_capacity(blobs.len());
        for (index, blob) in blobs.iter().enumerate() {
            match engine.read_resume_data(blob) {
                Ok(params) if params.is_resumable() => requests.push(params),
                Ok(_) => warn!("checkpoint entry {} identifies no transfer, skipping", index),
                Err(err) => warn!("checkpoint entry {} is unreadable: {}", index, err),
            }
        }
        requests
    }
}

/// Replaces the checkpoint at `path` with `blobs`.
pub async fn write_blobs(path: &Path, blobs: &[Vec<u8>]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, encode(blobs)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Reads the blobs stored at `path`, `None` when there is no checkpoint.
pub async fn read_blobs(path: &Path) -> Result<Option<Vec<Vec<u8>>>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn encode(blobs: &[Vec<u8>]) -> Result<Vec<u8>, PersistenceError> {
    let body: usize = blobs.iter().map(|blob| 4 + blob.len()).sum();
    let mut bytes = Vec::with_capacity(HEADER_LEN + body);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    for blob in blobs {
        let len = u32::try_from(blob.len()).map_err(|_| {
            PersistenceError::Format(format!("blob too large: {} bytes", blob.len()))
        })?;
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(blob);
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Vec<u8>>, PersistenceError> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(PersistenceError::Format("not a checkpoint file".to_string()));
    }
    let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
    if version != VERSION {
        return Err(PersistenceError::Format(format!(
            "unsupported checkpoint version {}",
            version
        )));
    }

    let mut blobs = Vec::new();
    let mut rest = &bytes[HEADER_LEN..];
    while !rest.is_empty() {
        let (len, tail) = rest
            .split_first_chunk::<4>()
            .ok_or_else(|| truncated(blobs.len()))?;
        let len = u32::from_le_bytes(*len) as usize;
        if tail.len() < len {
            return Err(truncated(blobs.len()));
        }
        let (blob, tail) = tail.split_at(len);
        blobs.push(blob.to_vec());
        rest = tail;
    }
    Ok(blobs)
}

fn truncated(index: usize) -> PersistenceError {
    PersistenceError::Format(format!("entry {} is truncated", index))
}
