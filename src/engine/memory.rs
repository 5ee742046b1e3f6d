use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use url::Url;

use crate::bencoding::Value;
use crate::crypto::InfoHash;
use crate::engine::{AddFlags, AddTorrentParams, Alert, Engine, TorrentHandle, TorrentStatus};
use crate::error::EngineError;
use crate::torrent::Metainfo;

const RESUME_FILE_FORMAT: &str = "cascade resume file";
const RESUME_FILE_VERSION: i64 = 1;

/// Live counters of a transfer, as the wire layer would report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub download_rate: u64,
    pub upload_rate: u64,
    pub total_done: u64,
    pub num_peers: u32,
}

/// An in-process engine that keeps transfers in memory.
///
/// It parses real descriptors and magnet URIs and produces real bencoded
/// resume data, but never moves any payload. Counters only change through
/// [`MemoryEngine::set_stats`] and [`MemoryEngine::advance`].
pub struct MemoryEngine {
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
}

#[derive(Default)]
struct Inner {
    transfers: BTreeMap<TorrentHandle, Transfer>,
    alerts: Vec<Alert>,
    listen_ports: Option<RangeInclusive<u16>>,
    dht_started: bool,
    dht_node_count: Option<u32>,
    legacy_dht_node_count: Option<u32>,
    session_paused: bool,
    deleted_data: Vec<TorrentHandle>,
}

struct Transfer {
    info_hash: Option<InfoHash>,
    name: Option<String>,
    metainfo: Option<Metainfo>,
    save_path: PathBuf,
    trackers: Vec<String>,
    flags: AddFlags,
    stats: TransferStats,
    failing_status_calls: usize,
    tracker_error: bool,
    withhold_resume_data: bool,
}

impl Transfer {
    fn status(&self, session_paused: bool) -> TorrentStatus {
        let (has_metadata, name, total_wanted) = match &self.metainfo {
            Some(metainfo) => (true, metainfo.name.clone(), metainfo.total_length()),
            None => (false, self.name.clone().unwrap_or_default(), 0),
        };
        let total_done = self.stats.total_done.min(total_wanted);
        let progress = if total_wanted == 0 {
            0.0
        } else {
            total_done as f64 / total_wanted as f64
        };
        TorrentStatus {
            has_metadata,
            name,
            progress,
            download_rate: self.stats.download_rate,
            upload_rate: self.stats.upload_rate,
            total_wanted,
            total_done,
            num_peers: self.stats.num_peers,
            paused: self.flags.paused || session_paused,
        }
    }

    fn resume_data(&self) -> Vec<u8> {
        let trackers = self
            .trackers
            .iter()
            .fold(Value::list(), |list, tracker| {
                list.with_value(Value::string(tracker))
            });
        let mut value = Value::dictionary()
            .with_entry("file-format", Value::string(RESUME_FILE_FORMAT))
            .with_entry("file-version", Value::Integer(RESUME_FILE_VERSION))
            .with_entry(
                "save_path",
                Value::string(self.save_path.to_string_lossy().as_bytes()),
            )
            .with_entry("paused", Value::Integer(self.flags.paused as i64))
            .with_entry("sparse", Value::Integer(self.flags.sparse as i64))
            .with_entry(
                "total_done",
                Value::Integer(i64::try_from(self.stats.total_done).unwrap_or(i64::MAX)),
            )
            .with_entry("trackers", trackers);
        if let Some(info_hash) = &self.info_hash {
            value = value.with_entry("info-hash", Value::String(info_hash.0.to_vec()));
        }
        if let Some(name) = &self.name {
            value = value.with_entry("name", Value::string(name));
        }
        if let Some(metainfo) = &self.metainfo {
            value = value.with_entry("info", metainfo.info.clone());
        }
        value.to_bytes()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn set_stats(&self, handle: TorrentHandle, stats: TransferStats) {
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&handle) {
            transfer.stats = stats;
        }
    }

    /// Completes a metadata-pending transfer as if the info dictionary had
    /// been fetched from peers.
    pub fn deliver_metadata(&self, handle: TorrentHandle, metainfo: Metainfo) {
        let mut inner = self.inner.lock();
        if let Some(transfer) = inner.transfers.get_mut(&handle) {
            transfer.info_hash = Some(metainfo.info_hash);
            transfer.name = Some(metainfo.name.clone());
            for tracker in &metainfo.trackers {
                if !transfer.trackers.contains(tracker) {
                    transfer.trackers.push(tracker.clone());
                }
            }
            transfer.metainfo = Some(metainfo);
            inner.alerts.push(Alert::MetadataReceived(handle));
        }
    }

    /// Makes the next `calls` status queries for `handle` fail.
    pub fn fail_status(&self, handle: TorrentHandle, calls: usize) {
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&handle) {
            transfer.failing_status_calls = calls;
        }
    }

    pub fn set_tracker_error(&self, handle: TorrentHandle, failing: bool) {
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&handle) {
            transfer.tracker_error = failing;
        }
    }

    /// Resume data requests for `handle` are accepted but never answered.
    pub fn withhold_resume_data(&self, handle: TorrentHandle) {
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&handle) {
            transfer.withhold_resume_data = true;
        }
    }

    /// Drops a transfer behind the manager's back, invalidating its handle.
    pub fn invalidate(&self, handle: TorrentHandle) {
        self.inner.lock().transfers.remove(&handle);
    }

    pub fn set_dht_node_count(&self, count: Option<u32>) {
        self.inner.lock().dht_node_count = count;
    }

    pub fn set_legacy_dht_node_count(&self, count: Option<u32>) {
        self.inner.lock().legacy_dht_node_count = count;
    }

    /// Moves every active transfer forward by `elapsed` at its current rate.
    pub fn advance(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        if inner.session_paused {
            return;
        }
        for transfer in inner.transfers.values_mut() {
            if transfer.flags.paused {
                continue;
            }
            if let Some(metainfo) = &transfer.metainfo {
                let step = (transfer.stats.download_rate as f64 * elapsed.as_secs_f64()) as u64;
                transfer.stats.total_done =
                    (transfer.stats.total_done + step).min(metainfo.total_length());
            }
        }
    }

    pub fn listen_ports(&self) -> Option<RangeInclusive<u16>> {
        self.inner.lock().listen_ports.clone()
    }

    pub fn dht_started(&self) -> bool {
        self.inner.lock().dht_started
    }

    pub fn is_session_paused(&self) -> bool {
        self.inner.lock().session_paused
    }

    pub fn data_deleted(&self, handle: TorrentHandle) -> bool {
        self.inner.lock().deleted_data.contains(&handle)
    }

    pub fn info_hash(&self, handle: TorrentHandle) -> Option<InfoHash> {
        self.inner
            .lock()
            .transfers
            .get(&handle)
            .and_then(|transfer| transfer.info_hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Engine for MemoryEngine {
    fn listen_on(&self, ports: RangeInclusive<u16>) -> Result<(), EngineError> {
        if ports.is_empty() {
            return Err(EngineError::Unavailable("empty listen port range".to_string()));
        }
        info!("listening on ports {}-{}", ports.start(), ports.end());
        self.inner.lock().listen_ports = Some(ports);
        Ok(())
    }

    fn start_dht(&self) {
        self.inner.lock().dht_started = true;
    }

    fn parse_descriptor(&self, path: &Path) -> Result<Metainfo, EngineError> {
        let bytes = std::fs::read(path)?;
        let value = Value::decode(&bytes).map_err(|err| EngineError::Parse(err.to_string()))?;
        Metainfo::try_from(value).map_err(|err| EngineError::Parse(err.to_string()))
    }

    fn parse_magnet(&self, uri: &str) -> Result<AddTorrentParams, EngineError> {
        let url = Url::parse(uri).map_err(|err| EngineError::Parse(err.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(EngineError::Parse(format!("not a magnet uri: {}", uri)));
        }
        let mut params = AddTorrentParams::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex = value.strip_prefix("urn:btih:").ok_or_else(|| {
                        EngineError::Parse(format!("unsupported exact topic: {}", value))
                    })?;
                    let info_hash = InfoHash::from_hex(hex)
                        .map_err(|err| EngineError::Parse(err.to_string()))?;
                    params.info_hash = Some(info_hash);
                }
                "dn" => params.name = Some(value.into_owned()),
                "tr" => params.trackers.push(value.into_owned()),
                _ => {}
            }
        }
        if params.info_hash.is_none() {
            return Err(EngineError::Parse(format!("missing info hash: {}", uri)));
        }
        Ok(params)
    }

    fn add_torrent(&self, params: AddTorrentParams) -> Result<TorrentHandle, EngineError> {
        let info_hash = params
            .metainfo
            .as_ref()
            .map(|metainfo| metainfo.info_hash)
            .or(params.info_hash);
        let mut inner = self.inner.lock();
        if let Some(info_hash) = info_hash {
            let duplicate = inner
                .transfers
                .values()
                .any(|transfer| transfer.info_hash == Some(info_hash));
            if duplicate {
                return Err(EngineError::Duplicate(info_hash));
            }
        }
        let handle = TorrentHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let transfer = Transfer {
            info_hash,
            name: params.name,
            metainfo: params.metainfo,
            save_path: params.save_path,
            trackers: params.trackers,
            flags: params.flags,
            stats: TransferStats {
                total_done: params.total_done,
                ..TransferStats::default()
            },
            failing_status_calls: 0,
            tracker_error: false,
            withhold_resume_data: false,
        };
        debug!("[{}] admitted into {}", handle, transfer.save_path.display());
        inner.transfers.insert(handle, transfer);
        Ok(handle)
    }

    fn remove_torrent(
        &self,
        handle: TorrentHandle,
        delete_files: bool,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner
            .transfers
            .remove(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        if delete_files {
            inner.deleted_data.push(handle);
        }
        Ok(())
    }

    fn is_valid(&self, handle: TorrentHandle) -> bool {
        self.inner.lock().transfers.contains_key(&handle)
    }

    fn status(&self, handle: TorrentHandle) -> Result<TorrentStatus, EngineError> {
        let mut inner = self.inner.lock();
        let session_paused = inner.session_paused;
        let transfer = inner
            .transfers
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        if transfer.failing_status_calls > 0 {
            transfer.failing_status_calls -= 1;
            return Err(EngineError::Unavailable("status temporarily unavailable".to_string()));
        }
        Ok(transfer.status(session_paused))
    }

    fn trackers(&self, handle: TorrentHandle) -> Result<Vec<String>, EngineError> {
        let inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        if transfer.tracker_error {
            return Err(EngineError::Unavailable("tracker list unavailable".to_string()));
        }
        Ok(transfer.trackers.clone())
    }

    fn pause(&self, handle: TorrentHandle) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        transfer.flags.paused = true;
        Ok(())
    }

    fn resume(&self, handle: TorrentHandle) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        transfer.flags.paused = false;
        Ok(())
    }

    fn pause_session(&self) {
        self.inner.lock().session_paused = true;
    }

    fn resume_session(&self) {
        self.inner.lock().session_paused = false;
    }

    fn save_resume_data(&self, handle: TorrentHandle) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        if transfer.withhold_resume_data {
            debug!("[{}] withholding resume data", handle);
            return Ok(());
        }
        let data = transfer.resume_data();
        inner.alerts.push(Alert::ResumeDataReady { handle, data });
        Ok(())
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut self.inner.lock().alerts)
    }

    fn read_resume_data(&self, data: &[u8]) -> Result<AddTorrentParams, EngineError> {
        let value = Value::decode(data).map_err(|err| EngineError::Parse(err.to_string()))?;
        read_resume_value(value).map_err(|err| EngineError::Parse(err.to_string()))
    }

    fn dht_node_count(&self) -> Option<u32> {
        self.inner.lock().dht_node_count
    }

    fn legacy_dht_node_count(&self) -> Option<u32> {
        self.inner.lock().legacy_dht_node_count
    }
}

fn read_resume_value(mut value: Value) -> anyhow::Result<AddTorrentParams> {
    let format: String = value.remove_entry("file-format")?.try_into()?;
    if format != RESUME_FILE_FORMAT {
        anyhow::bail!("unexpected resume file format '{}'", format);
    }
    let version: i64 = value.remove_entry("file-version")?.try_into()?;
    if version != RESUME_FILE_VERSION {
        anyhow::bail!("unsupported resume file version {}", version);
    }

    let save_path: String = value.remove_entry("save_path")?.try_into()?;
    let mut trackers = Vec::new();
    if let Some(list) = value.try_remove_entry("trackers") {
        for tracker in Vec::<Value>::try_from(list)? {
            trackers.push(String::try_from(tracker)?);
        }
    }
    let info_hash = match value.try_remove_entry("info-hash") {
        Some(bytes) => {
            let bytes: Vec<u8> = bytes.try_into()?;
            Some(InfoHash::try_from(bytes.as_slice())?)
        }
        None => None,
    };
    let name = value
        .try_remove_entry("name")
        .map(String::try_from)
        .transpose()?;
    let metainfo = value
        .try_remove_entry("info")
        .map(|info| Metainfo::from_info(info, trackers.clone()))
        .transpose()?;
    if let (Some(info_hash), Some(metainfo)) = (&info_hash, &metainfo) {
        if info_hash != &metainfo.info_hash {
            anyhow::bail!("info hash does not match the embedded info dictionary");
        }
    }
    let flag = |value: &mut Value, key: &str, default: bool| -> anyhow::Result<bool> {
        Ok(match value.try_remove_entry(key) {
            Some(flag) => i64::try_from(flag)? != 0,
            None => default,
        })
    };
    let flags = AddFlags {
        paused: flag(&mut value, "paused", false)?,
        auto_managed: false,
        sparse: flag(&mut value, "sparse", true)?,
    };
    let total_done = match value.try_remove_entry("total_done") {
        Some(total_done) => total_done.try_into()?,
        None => 0,
    };

    Ok(AddTorrentParams {
        info_hash: info_hash.or(metainfo.as_ref().map(|metainfo| metainfo.info_hash)),
        metainfo,
        name,
        save_path: PathBuf::from(save_path),
        trackers,
        flags,
        total_done,
    })
}

#[cfg(test)]
mod tests {
    use crate::torrent::tests::metainfo;

    use super::*;

    fn add(engine: &MemoryEngine, metainfo: Metainfo) -> TorrentHandle {
        engine
            .add_torrent(AddTorrentParams::from_metainfo(metainfo, "/downloads"))
            .unwrap()
    }

    #[test]
    fn parse_magnet() {
        let engine = MemoryEngine::new();
        let params = engine
            .parse_magnet(
                "magnet:?xt=urn:btih:e90cf5ec83e174d7dcb94821560dac201ae1f663&dn=alice.txt&tr=udp%3A%2F%2Ftracker%3A1337",
            )
            .unwrap();

        assert_eq!(
            params.info_hash,
            Some(InfoHash::from_hex("e90cf5ec83e174d7dcb94821560dac201ae1f663").unwrap())
        );
        assert_eq!(params.name.as_deref(), Some("alice.txt"));
        assert_eq!(params.trackers, vec!["udp://tracker:1337".to_string()]);
        assert!(params.metainfo.is_none());
    }

    #[test]
    fn parse_magnet_without_info_hash() {
        let engine = MemoryEngine::new();

        assert!(engine.parse_magnet("magnet:?dn=alice.txt").is_err());
        assert!(engine.parse_magnet("http://example.com").is_err());
    }

    #[test]
    fn status_of_descriptor_transfer() {
        let engine = MemoryEngine::new();
        let handle = add(&engine, metainfo("alice.txt", 1000));
        engine.set_stats(
            handle,
            TransferStats {
                download_rate: 100,
                upload_rate: 10,
                total_done: 250,
                num_peers: 3,
            },
        );

        let status = engine.status(handle).unwrap();

        assert!(status.has_metadata);
        assert_eq!(status.name, "alice.txt");
        assert_eq!(status.total_wanted, 1000);
        assert_eq!(status.progress, 0.25);
        assert_eq!(status.num_peers, 3);
        assert!(!status.paused);
    }

    #[test]
    fn duplicate_transfer() {
        let engine = MemoryEngine::new();
        add(&engine, metainfo("alice.txt", 1000));

        let result = engine.add_torrent(AddTorrentParams::from_metainfo(
            metainfo("alice.txt", 1000),
            "/elsewhere",
        ));

        assert!(matches!(result, Err(EngineError::Duplicate(_))));
    }

    #[test]
    fn removed_handle_is_invalid() {
        let engine = MemoryEngine::new();
        let handle = add(&engine, metainfo("alice.txt", 1000));

        engine.remove_torrent(handle, false).unwrap();

        assert!(!engine.is_valid(handle));
        assert!(matches!(
            engine.status(handle),
            Err(EngineError::InvalidHandle(_))
        ));
        assert!(!engine.data_deleted(handle));
    }

    #[test]
    fn resume_data_round_trip() {
        let engine = MemoryEngine::new();
        let metainfo = metainfo("alice.txt", 1000);
        let info_hash = metainfo.info_hash;
        let handle = add(&engine, metainfo);
        engine.set_stats(
            handle,
            TransferStats {
                total_done: 400,
                ..TransferStats::default()
            },
        );
        engine.pause(handle).unwrap();

        engine.save_resume_data(handle).unwrap();
        let data = match engine.pop_alerts().as_slice() {
            [Alert::ResumeDataReady { data, .. }] => data.clone(),
            alerts => panic!("unexpected alerts: {:?}", alerts),
        };
        let params = engine.read_resume_data(&data).unwrap();

        assert_eq!(params.info_hash, Some(info_hash));
        assert_eq!(params.save_path, PathBuf::from("/downloads"));
        assert_eq!(params.total_done, 400);
        assert!(params.flags.paused);
        assert_eq!(params.metainfo.map(|metainfo| metainfo.name).as_deref(), Some("alice.txt"));
    }

    #[test]
    fn withheld_resume_data_never_arrives() {
        let engine = MemoryEngine::new();
        let handle = add(&engine, metainfo("alice.txt", 1000));
        engine.withhold_resume_data(handle);

        engine.save_resume_data(handle).unwrap();

        assert!(engine.pop_alerts().is_empty());
    }

    #[test]
    fn reject_foreign_resume_data() {
        let engine = MemoryEngine::new();
        let foreign = Value::dictionary()
            .with_entry("file-format", Value::string("libtorrent resume file"))
            .to_bytes();

        assert!(engine.read_resume_data(&foreign).is_err());
        assert!(engine.read_resume_data(b"garbage").is_err());
    }

    #[test]
    fn advance_moves_unpaused_transfers() {
        let engine = MemoryEngine::new();
        let running = add(&engine, metainfo("a", 1000));
        let paused = add(&engine, metainfo("b", 1000));
        let stats = TransferStats {
            download_rate: 300,
            ..TransferStats::default()
        };
        engine.set_stats(running, stats);
        engine.set_stats(paused, stats);
        engine.pause(paused).unwrap();

        engine.advance(Duration::from_secs(2));
        engine.advance(Duration::from_secs(2));

        assert_eq!(engine.status(running).unwrap().total_done, 1000);
        assert_eq!(engine.status(paused).unwrap().total_done, 0);
    }
}
