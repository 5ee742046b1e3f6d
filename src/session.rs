//! Lifecycle of every transfer in the session.
//!
//! The [`SessionManager`] owns the registry of active transfers. Each entry
//! pairs the record created at admission with the poller sampling it. The
//! manager is the only place transfers enter or leave the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channel::{Update, UpdateSender};
use crate::checkpoint::{Checkpoint, CheckpointReport};
use crate::config::Config;
use crate::engine::{self, AddTorrentParams, Engine, TorrentHandle, TorrentStatus};
use crate::error::{PersistenceError, SessionError};
use crate::poller::Poller;
use crate::record::TorrentRecord;

const MAGNET_PREFIX: &str = "magnet:";

struct Entry {
    record: TorrentRecord,
    poller: Poller,
}

pub struct SessionManager {
    engine: Arc<dyn Engine>,
    config: Config,
    checkpoint: Checkpoint,
    updates: UpdateSender,
    running: CancellationToken,
    registry: BTreeMap<TorrentHandle, Entry>,
}

impl SessionManager {
    /// Binds the engine to the configured ports and joins the DHT. Failing
    /// to listen is not fatal.
    pub fn new(engine: Arc<dyn Engine>, config: Config, updates: UpdateSender) -> Self {
        if let Err(err) = engine.listen_on(config.listen_ports.clone()) {
            warn!(
                "unable to listen on ports {}-{}: {}",
                config.listen_ports.start(),
                config.listen_ports.end(),
                err
            );
        }
        if config.start_dht {
            engine.start_dht();
        }
        Self {
            checkpoint: Checkpoint::from_config(&config),
            engine,
            config,
            updates,
            running: CancellationToken::new(),
            registry: BTreeMap::new(),
        }
    }

    /// Adds a transfer from a magnet URI or a descriptor file path.
    ///
    /// Magnet transfers start paused until the user resumes them.
    pub fn add_torrent(
        &mut self,
        source: &str,
        save_path: impl Into<PathBuf>,
    ) -> Result<TorrentRecord, SessionError> {
        let mut params = if source.starts_with(MAGNET_PREFIX) {
            let mut params = self.engine.parse_magnet(source)?;
            params.flags.paused = true;
            params
        } else {
            let path = Path::new(source);
            if !path.exists() {
                return Err(SessionError::SourceNotFound(path.to_path_buf()));
            }
            let metainfo = self.engine.parse_descriptor(path).map_err(|source| {
                SessionError::DescriptorParse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            AddTorrentParams::from_metainfo(metainfo, PathBuf::new())
        };
        params.save_path = save_path.into();
        params.flags.sparse = true;
        self.admit(params)
    }

    fn admit(&mut self, mut params: AddTorrentParams) -> Result<TorrentRecord, SessionError> {
        params.flags.auto_managed = false;
        let paused = params.flags.paused;
        let handle = self.engine.add_torrent(params)?;
        let status = self.engine.status(handle).unwrap_or_else(|err| {
            warn!("[{}] no initial status: {}", handle, err);
            TorrentStatus {
                paused,
                ..TorrentStatus::default()
            }
        });
        let record = TorrentRecord::new(handle, &status);
        info!("[{}] added '{}'", handle, record.name());

        self.updates.send(Update::Added(record.clone()));
        let poller = Poller::spawn(
            handle,
            Arc::clone(&self.engine),
            self.updates.clone(),
            &self.running,
            self.config.poll_interval,
        );
        self.registry.insert(
            handle,
            Entry {
                record: record.clone(),
                poller,
            },
        );
        Ok(record)
    }

    /// Stops sampling the transfer and drops it from the engine. Downloaded
    /// data is only deleted when the config asks for it.
    pub async fn remove_torrent(
        &mut self,
        handle: TorrentHandle,
    ) -> Result<TorrentRecord, SessionError> {
        let entry = self
            .registry
            .get(&handle)
            .ok_or(SessionError::NotFound(handle))?;
        entry.poller.stop();
        if let Err(err) = self
            .engine
            .remove_torrent(handle, self.config.delete_data_on_remove)
        {
            warn!("[{}] engine failed to remove transfer: {}", handle, err);
        }
        let entry = self
            .registry
            .remove(&handle)
            .ok_or(SessionError::NotFound(handle))?;
        let exit = entry.poller.join().await;
        debug!("[{}] poller joined: {:?}", handle, exit);
        self.updates.send(Update::Removed(handle));
        info!("[{}] removed", handle);
        Ok(entry.record)
    }

    pub fn pause_torrent(&mut self, handle: TorrentHandle) -> Result<(), SessionError> {
        self.set_paused(handle, true)
    }

    pub fn resume_torrent(&mut self, handle: TorrentHandle) -> Result<(), SessionError> {
        self.set_paused(handle, false)
    }

    fn set_paused(&mut self, handle: TorrentHandle, paused: bool) -> Result<(), SessionError> {
        let entry = self
            .registry
            .get_mut(&handle)
            .ok_or(SessionError::NotFound(handle))?;
        if paused {
            self.engine.pause(handle)?;
        } else {
            self.engine.resume(handle)?;
        }
        entry.record.set_paused(paused);
        self.updates.send(Update::Paused(handle, paused));
        Ok(())
    }

    pub fn dht_node_count(&self) -> u32 {
        engine::dht_node_count(self.engine.as_ref())
    }

    /// Writes a checkpoint of every registered transfer. The engine session
    /// stays paused while resume data is collected and is resumed afterwards
    /// unless the manager is shutting down.
    pub async fn save_checkpoint(&self) -> Result<CheckpointReport, PersistenceError> {
        let handles: Vec<_> = self.registry.keys().copied().collect();
        self.engine.pause_session();
        let result = self.checkpoint.save(self.engine.as_ref(), &handles).await;
        if !self.running.is_cancelled() {
            self.engine.resume_session();
        }
        result
    }

    /// Re-adds every transfer found in the checkpoint. Transfers the engine
    /// refuses are skipped.
    pub async fn restore(&mut self) -> Vec<TorrentRecord> {
        let requests = self.checkpoint.load(self.engine.as_ref()).await;
        let mut records = Vec::with_capacity(requests.len());
        for params in requests {
            let label = params
                .name
                .clone()
                .or_else(|| params.info_hash.map(|info_hash| info_hash.to_hex()))
                .unwrap_or_default();
            match self.admit(params) {
                Ok(record) => records.push(record),
                Err(err) => warn!("unable to restore '{}': {}", label, err),
            }
        }
        info!("restored {} transfers", records.len());
        records
    }

    /// Records as they were when each transfer was admitted, with later
    /// pause/resume calls applied.
    pub fn records(&self) -> impl Iterator<Item = &TorrentRecord> {
        self.registry.values().map(|entry| &entry.record)
    }

    pub fn contains(&self, handle: TorrentHandle) -> bool {
        self.registry.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops every poller, checkpoints the session and pauses the engine.
    /// Returns the checkpoint outcome, `None` when it could not be written.
    pub async fn shutdown(mut self) -> Option<CheckpointReport> {
        info!("shutting down {} transfers...", self.registry.len());
        self.running.cancel();

        let report = match self.save_checkpoint().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("failed to save checkpoint: {}", err);
                None
            }
        };

        let mut join_set = JoinSet::new();
        for (_, entry) in std::mem::take(&mut self.registry) {
            join_set.spawn(entry.poller.join());
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                warn!("error encountered while shutting down: {:?}", err);
            }
        }

        self.engine.pause_session();
        report
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.running.cancel();
    }
}
