//! Carries updates from pollers and the session manager to the single
//! presentation-side consumer.
//!
//! Producers never block and never fail: once the consumer is gone updates
//! are dropped on the floor.

use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::engine::{TorrentHandle, TorrentStatus};
use crate::record::TorrentRecord;

/// A raw status sample taken by a poller.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub handle: TorrentHandle,
    pub status: TorrentStatus,
    pub dht_nodes: u32,
    /// `None` when the tracker query failed
    pub trackers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Added(TorrentRecord),
    Status(StatusUpdate),
    Paused(TorrentHandle, bool),
    Removed(TorrentHandle),
}

impl Update {
    pub fn handle(&self) -> TorrentHandle {
        match self {
            Self::Added(record) => record.handle(),
            Self::Status(update) => update.handle,
            Self::Paused(handle, _) | Self::Removed(handle) => *handle,
        }
    }
}

pub fn channel() -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UpdateSender { tx }, UpdateReceiver { rx })
}

#[derive(Clone)]
pub struct UpdateSender {
    tx: UnboundedSender<Update>,
}

impl UpdateSender {
    /// Enqueues an update, returns `false` if it was dropped.
    pub fn send(&self, update: Update) -> bool {
        match self.tx.send(update) {
            Ok(()) => true,
            Err(err) => {
                debug!("[{}] consumer gone, dropping update", err.0.handle());
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct UpdateReceiver {
    rx: UnboundedReceiver<Update>,
}

impl UpdateReceiver {
    /// Waits for the next update. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await
    }

    /// Next update if one is already queued.
    pub fn try_recv(&mut self) -> Option<Update> {
        match self.rx.try_recv() {
            Ok(update) => Some(update),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything queued right now, in arrival order.
    pub fn drain(&mut self) -> Vec<Update> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
