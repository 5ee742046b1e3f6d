use std::fmt;

use bit_set::BitSet;
use size::Size;

use crate::engine::{TorrentHandle, TorrentStatus};

pub const FETCHING_METADATA: &str = "(fetching metadata…)";
pub const ETA_UNKNOWN: &str = "---";
pub const ETA_INFINITE: &str = "∞";
pub const ETA_PAUSED: &str = "Paused";

/// Observable fields of a [`TorrentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Progress,
    DownloadRate,
    UploadRate,
    TotalSize,
    Eta,
    Paused,
    PeerCount,
    TrackerCount,
    DhtNodeCount,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Name,
        Field::Progress,
        Field::DownloadRate,
        Field::UploadRate,
        Field::TotalSize,
        Field::Eta,
        Field::Paused,
        Field::PeerCount,
        Field::TrackerCount,
        Field::DhtNodeCount,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// The set of fields touched by one projection step.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Changes(BitSet);

impl Changes {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: Field) {
        self.0.insert(field.index());
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0.contains(field.index())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().map(|index| Field::ALL[index])
    }

    pub fn extend(&mut self, other: &Changes) {
        self.0.union_with(&other.0);
    }
}

impl fmt::Debug for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Field> for Changes {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        let mut changes = Self::none();
        for field in iter {
            changes.insert(field);
        }
        changes
    }
}

/// Display projection of one transfer.
///
/// Only [`TorrentRecord::update`] and [`TorrentRecord::set_paused`] mutate it;
/// both keep `paused ⇒ rates == 0 ∧ eta == "Paused"`.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRecord {
    handle: TorrentHandle,
    name: String,
    progress: f64,
    download_rate: u64,
    upload_rate: u64,
    total_size: u64,
    eta: String,
    paused: bool,
    peer_count: u32,
    tracker_count: usize,
    dht_node_count: u32,
}

impl TorrentRecord {
    /// Creates the record of a freshly admitted transfer.
    pub fn new(handle: TorrentHandle, status: &TorrentStatus) -> Self {
        let name = if status.has_metadata && !status.name.is_empty() {
            status.name.clone()
        } else {
            FETCHING_METADATA.to_string()
        };
        let mut record = Self {
            handle,
            name,
            progress: 0.0,
            download_rate: 0,
            upload_rate: 0,
            total_size: 0,
            eta: ETA_UNKNOWN.to_string(),
            paused: false,
            peer_count: 0,
            tracker_count: 0,
            dht_node_count: 0,
        };
        record.set_paused(status.paused);
        record
    }

    /// Projects an engine status sample onto the record and reports which
    /// fields changed. `trackers` is `None` when the tracker query failed.
    pub fn update(
        &mut self,
        status: &TorrentStatus,
        dht_node_count: u32,
        trackers: Option<usize>,
    ) -> Changes {
        let mut changes = Changes::none();
        assign(&mut self.paused, status.paused, Field::Paused, &mut changes);

        if status.has_metadata {
            assign(&mut self.name, status.name.clone(), Field::Name, &mut changes);
            let progress = status.progress.clamp(0.0, 1.0);
            assign(&mut self.progress, progress, Field::Progress, &mut changes);
            let total_size = status.total_wanted;
            assign(&mut self.total_size, total_size, Field::TotalSize, &mut changes);
            assign(&mut self.peer_count, status.num_peers, Field::PeerCount, &mut changes);
            let trackers = trackers.unwrap_or(0);
            assign(&mut self.tracker_count, trackers, Field::TrackerCount, &mut changes);
            let dht = dht_node_count;
            assign(&mut self.dht_node_count, dht, Field::DhtNodeCount, &mut changes);

            if !status.paused {
                let (down, up) = (status.download_rate, status.upload_rate);
                assign(&mut self.download_rate, down, Field::DownloadRate, &mut changes);
                assign(&mut self.upload_rate, up, Field::UploadRate, &mut changes);
                let remaining = status.total_wanted.saturating_sub(status.total_done);
                let eta = format_eta(remaining, status.download_rate);
                assign(&mut self.eta, eta, Field::Eta, &mut changes);
            }
        } else {
            let name = FETCHING_METADATA.to_string();
            assign(&mut self.name, name, Field::Name, &mut changes);
            assign(&mut self.progress, 0.0, Field::Progress, &mut changes);
            assign(&mut self.total_size, 0, Field::TotalSize, &mut changes);
            if !status.paused {
                let down = status.download_rate;
                assign(&mut self.download_rate, down, Field::DownloadRate, &mut changes);
                assign(&mut self.eta, ETA_UNKNOWN.to_string(), Field::Eta, &mut changes);
            }
        }

        if status.paused {
            changes.extend(&self.apply_paused());
        }
        changes
    }

    /// Reflects a pause/resume issued by the user before the next sample
    /// arrives.
    pub fn set_paused(&mut self, paused: bool) -> Changes {
        let mut changes = Changes::none();
        assign(&mut self.paused, paused, Field::Paused, &mut changes);
        if paused {
            changes.extend(&self.apply_paused());
        } else if self.eta == ETA_PAUSED {
            assign(&mut self.eta, ETA_UNKNOWN.to_string(), Field::Eta, &mut changes);
        }
        changes
    }

    fn apply_paused(&mut self) -> Changes {
        let mut changes = Changes::none();
        assign(&mut self.download_rate, 0, Field::DownloadRate, &mut changes);
        assign(&mut self.upload_rate, 0, Field::UploadRate, &mut changes);
        assign(&mut self.eta, ETA_PAUSED.to_string(), Field::Eta, &mut changes);
        changes
    }

    pub fn handle(&self) -> TorrentHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn eta(&self) -> &str {
        &self.eta
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn peer_count(&self) -> u32 {
        self.peer_count
    }

    pub fn tracker_count(&self) -> usize {
        self.tracker_count
    }

    pub fn dht_node_count(&self) -> u32 {
        self.dht_node_count
    }

    /// Row text of the transfer list: rates in KB/s followed by the eta.
    pub fn info_line(&self) -> String {
        format!(
            "D:{:.1} KB/s | U:{:.1} KB/s • {}",
            self.download_rate as f64 / 1024.0,
            self.upload_rate as f64 / 1024.0,
            self.eta
        )
    }

    pub fn size_label(&self) -> String {
        Size::from_bytes(self.total_size).to_string()
    }
}

fn assign<T: PartialEq>(slot: &mut T, value: T, field: Field, changes: &mut Changes) {
    if *slot != value {
        *slot = value;
        changes.insert(field);
    }
}

/// Renders the time needed to fetch `remaining` bytes at `rate` bytes/sec as
/// whole minutes and seconds, or `∞` when nothing is flowing.
pub fn format_eta(remaining: u64, rate: u64) -> String {
    if rate == 0 {
        return ETA_INFINITE.to_string();
    }
    let seconds = (remaining as f64 / rate as f64).round() as u64;
    format!("{}m {}s", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TorrentHandle {
        TorrentHandle::new(1)
    }

    fn status() -> TorrentStatus {
        TorrentStatus {
            has_metadata: true,
            name: "alice.txt".to_string(),
            progress: 0.5,
            download_rate: 100,
            upload_rate: 20,
            total_wanted: 30_500,
            total_done: 500,
            num_peers: 4,
            paused: false,
        }
    }

    fn assert_paused_invariant(record: &TorrentRecord) {
        if record.is_paused() {
            assert_eq!(record.download_rate(), 0);
            assert_eq!(record.upload_rate(), 0);
            assert_eq!(record.eta(), ETA_PAUSED);
        }
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(30_000, 100), "5m 0s");
        assert_eq!(format_eta(500, 100), "0m 5s");
        assert_eq!(format_eta(12_345, 100), "2m 3s");
        // 59.6s rounds up to a full minute instead of "0m 60s"
        assert_eq!(format_eta(596, 10), "1m 0s");
        assert_eq!(format_eta(1000, 0), ETA_INFINITE);
    }

    #[test]
    fn metadata_ready_and_running() {
        let mut record = TorrentRecord::new(handle(), &status());

        let changes = record.update(&status(), 42, Some(3));

        assert_eq!(record.name(), "alice.txt");
        assert_eq!(record.progress(), 0.5);
        assert_eq!(record.total_size(), 30_500);
        assert_eq!(record.download_rate(), 100);
        assert_eq!(record.upload_rate(), 20);
        assert_eq!(record.eta(), "5m 0s");
        assert_eq!(record.peer_count(), 4);
        assert_eq!(record.tracker_count(), 3);
        assert_eq!(record.dht_node_count(), 42);
        assert!(changes.contains(Field::Eta));
        assert!(!changes.contains(Field::Name));
        assert!(!changes.contains(Field::Paused));
    }

    #[test]
    fn zero_rate_means_infinite_eta() {
        let mut record = TorrentRecord::new(handle(), &status());

        record.update(
            &TorrentStatus {
                download_rate: 0,
                ..status()
            },
            0,
            Some(1),
        );

        assert_eq!(record.eta(), ETA_INFINITE);
    }

    #[test]
    fn paused_overrides_reported_rates() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(&status(), 0, Some(1));

        let changes = record.update(
            &TorrentStatus {
                paused: true,
                ..status()
            },
            0,
            Some(1),
        );

        assert!(record.is_paused());
        assert_paused_invariant(&record);
        assert_eq!(
            changes,
            Changes::from_iter([Field::Paused, Field::DownloadRate, Field::UploadRate, Field::Eta])
        );
    }

    #[test]
    fn metadata_pending() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(&status(), 9, Some(2));

        record.update(
            &TorrentStatus {
                has_metadata: false,
                name: String::new(),
                download_rate: 55,
                upload_rate: 77,
                ..status()
            },
            100,
            Some(5),
        );

        assert_eq!(record.name(), FETCHING_METADATA);
        assert_eq!(record.progress(), 0.0);
        assert_eq!(record.total_size(), 0);
        assert_eq!(record.eta(), ETA_UNKNOWN);
        assert_eq!(record.download_rate(), 55);
        // not refreshed without metadata
        assert_eq!(record.upload_rate(), 20);
        assert_eq!(record.tracker_count(), 2);
        assert_eq!(record.dht_node_count(), 9);
    }

    #[test]
    fn paused_metadata_pending_keeps_invariant() {
        let pending = TorrentStatus {
            has_metadata: false,
            name: "ubuntu.iso".to_string(),
            download_rate: 10,
            paused: true,
            ..TorrentStatus::default()
        };

        let mut record = TorrentRecord::new(handle(), &pending);
        assert_eq!(record.name(), FETCHING_METADATA);
        assert_eq!(record.progress(), 0.0);
        assert_paused_invariant(&record);

        record.update(&pending, 0, None);
        assert_paused_invariant(&record);
    }

    #[test]
    fn tracker_query_failure_counts_zero() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(&status(), 0, Some(4));

        let changes = record.update(&status(), 0, None);

        assert_eq!(record.tracker_count(), 0);
        assert_eq!(changes, Changes::from_iter([Field::TrackerCount]));
    }

    #[test]
    fn progress_is_clamped() {
        let mut record = TorrentRecord::new(handle(), &status());

        record.update(
            &TorrentStatus {
                progress: 1.7,
                ..status()
            },
            0,
            None,
        );

        assert_eq!(record.progress(), 1.0);
    }

    #[test]
    fn identical_sample_changes_nothing() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(&status(), 1, Some(1));

        assert!(record.update(&status(), 1, Some(1)).is_empty());
    }

    #[test]
    fn user_pause_and_resume() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(&status(), 0, None);

        let changes = record.set_paused(true);
        assert!(changes.contains(Field::Paused));
        assert_paused_invariant(&record);

        record.set_paused(false);
        assert!(!record.is_paused());
        assert_eq!(record.eta(), ETA_UNKNOWN);
    }

    #[test]
    fn info_line() {
        let mut record = TorrentRecord::new(handle(), &status());
        record.update(
            &TorrentStatus {
                download_rate: 2048,
                upload_rate: 512,
                total_wanted: 2048 * 65,
                total_done: 0,
                ..status()
            },
            0,
            None,
        );

        assert_eq!(record.info_line(), "D:2.0 KB/s | U:0.5 KB/s • 1m 5s");
    }
}
