//! The consumer end of the update channel.
//!
//! A [`Dashboard`] owns the live records. It applies every queued update in
//! order and tells the [`Presentation`] exactly which fields changed.

use std::collections::BTreeMap;

use log::debug;

use crate::channel::{Update, UpdateReceiver};
use crate::engine::TorrentHandle;
use crate::record::{Changes, Field, TorrentRecord};

/// Identifier the presentation layer hands out for a displayed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayId(pub u64);

pub trait Presentation {
    /// A new transfer appeared. Returns the id used for later calls.
    fn torrent_added(&mut self, record: &TorrentRecord) -> DisplayId;

    fn record_changed(&mut self, id: DisplayId, record: &TorrentRecord, changes: &Changes);

    fn torrent_removed(&mut self, _id: DisplayId) {}

    /// Replaces the content of the detail view, `None` clears it.
    fn show_detail(&mut self, _record: Option<&TorrentRecord>) {}
}

struct Row {
    id: DisplayId,
    record: TorrentRecord,
}

pub struct Dashboard<P> {
    updates: UpdateReceiver,
    rows: BTreeMap<TorrentHandle, Row>,
    selected: Option<TorrentHandle>,
    presentation: P,
}

impl<P: Presentation> Dashboard<P> {
    pub fn new(updates: UpdateReceiver, presentation: P) -> Self {
        Self {
            updates,
            rows: BTreeMap::new(),
            selected: None,
            presentation,
        }
    }

    /// Applies everything queued so far without waiting. Returns the number
    /// of updates processed.
    pub fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Some(update) = self.updates.try_recv() {
            self.apply(update);
            processed += 1;
        }
        processed
    }

    /// Applies updates until every producer is gone, then hands the
    /// presentation back.
    pub async fn run(mut self) -> P {
        while let Some(update) = self.updates.recv().await {
            self.apply(update);
        }
        debug!("update channel closed, {} transfers on display", self.rows.len());
        self.presentation
    }

    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Added(record) => {
                let handle = record.handle();
                if let Some(row) = self.rows.get_mut(&handle) {
                    let changes: Changes = Field::ALL.into_iter().collect();
                    row.record = record;
                    self.presentation.record_changed(row.id, &row.record, &changes);
                } else {
                    let id = self.presentation.torrent_added(&record);
                    self.rows.insert(handle, Row { id, record });
                }
            }
            Update::Status(sample) => {
                let Some(row) = self.rows.get_mut(&sample.handle) else {
                    debug!("[{}] ignoring sample of unknown transfer", sample.handle);
                    return;
                };
                let changes = row
                    .record
                    .update(&sample.status, sample.dht_nodes, sample.trackers);
                self.changed(sample.handle, changes);
            }
            Update::Paused(handle, paused) => {
                let Some(row) = self.rows.get_mut(&handle) else {
                    return;
                };
                let changes = row.record.set_paused(paused);
                self.changed(handle, changes);
            }
            Update::Removed(handle) => {
                if let Some(row) = self.rows.remove(&handle) {
                    self.presentation.torrent_removed(row.id);
                    if self.selected == Some(handle) {
                        self.selected = None;
                        self.presentation.show_detail(None);
                    }
                }
            }
        }
    }

    fn changed(&mut self, handle: TorrentHandle, changes: Changes) {
        if changes.is_empty() {
            return;
        }
        let Some(row) = self.rows.get(&handle) else {
            return;
        };
        self.presentation.record_changed(row.id, &row.record, &changes);
        if self.selected == Some(handle) {
            self.presentation.show_detail(Some(&row.record));
        }
    }

    /// Routes a transfer to the detail view. Unknown handles clear it.
    pub fn select(&mut self, handle: Option<TorrentHandle>) {
        self.selected = handle.filter(|handle| self.rows.contains_key(handle));
        let record = self
            .selected
            .and_then(|handle| self.rows.get(&handle))
            .map(|row| &row.record);
        self.presentation.show_detail(record);
    }

    pub fn selected(&self) -> Option<TorrentHandle> {
        self.selected
    }

    pub fn record(&self, handle: TorrentHandle) -> Option<&TorrentRecord> {
        self.rows.get(&handle).map(|row| &row.record)
    }

    pub fn records(&self) -> impl Iterator<Item = &TorrentRecord> {
        self.rows.values().map(|row| &row.record)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn presentation(&self) -> &P {
        &self.presentation
    }
}
