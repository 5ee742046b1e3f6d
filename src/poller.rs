use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::channel::{StatusUpdate, Update, UpdateSender};
use crate::engine::{self, Engine, TorrentHandle};
use crate::error::PollError;

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Stopped,
    HandleInvalid,
}

/// Periodic status sampler bound to one transfer.
pub struct Poller {
    handle: TorrentHandle,
    join_handle: JoinHandle<PollerExit>,
    cancellation_token: CancellationToken,
}

impl Poller {
    /// Starts sampling `handle` every `period`. The poller also stops when
    /// `parent` is cancelled.
    pub fn spawn(
        handle: TorrentHandle,
        engine: Arc<dyn Engine>,
        updates: UpdateSender,
        parent: &CancellationToken,
        period: Duration,
    ) -> Self {
        let cancellation_token = parent.child_token();
        let token_clone = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            let exit = run(handle, engine.as_ref(), &updates, token_clone, period).await;
            info!("[{}] poller exited: {:?}", handle, exit);
            exit
        });
        Self {
            handle,
            join_handle,
            cancellation_token,
        }
    }

    pub fn handle(&self) -> TorrentHandle {
        self.handle
    }

    /// Asks the poller to stop. Takes effect before its next sample.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub async fn join(self) -> PollerExit {
        match self.join_handle.await {
            Ok(exit) => exit,
            Err(err) => {
                warn!("[{}] poller task failed: {}", self.handle, err);
                PollerExit::Stopped
            }
        }
    }

    /// Stops the poller and waits for it to wind down.
    pub async fn shutdown(self) -> PollerExit {
        self.stop();
        self.join().await
    }
}

async fn run(
    handle: TorrentHandle,
    engine: &dyn Engine,
    updates: &UpdateSender,
    cancellation_token: CancellationToken,
    period: Duration,
) -> PollerExit {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => return PollerExit::Stopped,
            _ = ticks.tick() => {}
        }
        match sample(engine, handle) {
            Ok(update) => {
                updates.send(Update::Status(update));
            }
            Err(PollError::HandleInvalid(_)) => return PollerExit::HandleInvalid,
            Err(err @ PollError::TransientStatus(_)) => {
                warn!("[{}] skipping sample: {}", handle, err);
            }
        }
    }
}

/// Takes one status sample of `handle`.
pub fn sample(engine: &dyn Engine, handle: TorrentHandle) -> Result<StatusUpdate, PollError> {
    if !engine.is_valid(handle) {
        return Err(PollError::HandleInvalid(handle));
    }
    let status = engine.status(handle).map_err(|err| {
        if engine.is_valid(handle) {
            PollError::TransientStatus(err)
        } else {
            PollError::HandleInvalid(handle)
        }
    })?;
    let trackers = match engine.trackers(handle) {
        Ok(trackers) => Some(trackers.len()),
        Err(err) => {
            debug!("[{}] tracker query failed: {}", handle, err);
            None
        }
    };
    Ok(StatusUpdate {
        handle,
        status,
        dht_nodes: engine::dht_node_count(engine),
        trackers,
    })
}

#[cfg(test)]
mod tests {
    use crate::channel::{UpdateReceiver, channel};
    use crate::engine::{AddTorrentParams, MemoryEngine, TransferStats};
    use crate::torrent::tests::metainfo;

    use super::*;

    const PERIOD: Duration = Duration::from_secs(1);

    fn setup() -> (Arc<MemoryEngine>, TorrentHandle, UpdateSender, UpdateReceiver) {
        let _ = env_logger::try_init();
        let engine = Arc::new(MemoryEngine::new());
        let handle = engine
            .add_torrent(AddTorrentParams::from_metainfo(
                metainfo("alice.txt", 1000),
                "/downloads",
            ))
            .unwrap();
        let (tx, rx) = channel();
        (engine, handle, tx, rx)
    }

    fn statuses(rx: &mut UpdateReceiver) -> Vec<StatusUpdate> {
        rx.drain()
            .into_iter()
            .filter_map(|update| match update {
                Update::Status(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sample_reports_trackers_and_dht() {
        let (engine, handle, _, _) = setup();
        engine.set_dht_node_count(Some(12));
        engine.set_stats(
            handle,
            TransferStats {
                download_rate: 50,
                ..TransferStats::default()
            },
        );

        let update = sample(engine.as_ref(), handle).unwrap();

        assert_eq!(update.handle, handle);
        assert_eq!(update.status.download_rate, 50);
        assert_eq!(update.dht_nodes, 12);
        assert_eq!(update.trackers, Some(1));
    }

    #[test]
    fn sample_tolerates_tracker_failure() {
        let (engine, handle, _, _) = setup();
        engine.set_tracker_error(handle, true);

        assert_eq!(sample(engine.as_ref(), handle).unwrap().trackers, None);
    }

    #[test]
    fn sample_of_invalid_handle() {
        let (engine, handle, _, _) = setup();
        engine.invalidate(handle);

        assert!(matches!(
            sample(engine.as_ref(), handle),
            Err(PollError::HandleInvalid(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_period() {
        let (engine, handle, tx, mut rx) = setup();
        let token = CancellationToken::new();

        let poller = Poller::spawn(handle, engine.clone(), tx, &token, PERIOD);
        tokio::time::sleep(PERIOD * 2 + PERIOD / 2).await;

        assert_eq!(poller.handle(), handle);
        assert_eq!(statuses(&mut rx).len(), 3);
        assert_eq!(poller.shutdown().await, PollerExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_skip_ticks() {
        let (engine, handle, tx, mut rx) = setup();
        engine.fail_status(handle, 2);
        let token = CancellationToken::new();

        let poller = Poller::spawn(handle, engine.clone(), tx, &token, PERIOD);
        tokio::time::sleep(PERIOD * 3 + PERIOD / 2).await;

        assert_eq!(statuses(&mut rx).len(), 2);
        assert!(!poller.is_finished());
        poller.stop();
        assert_eq!(poller.join().await, PollerExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_handle_becomes_invalid() {
        let (engine, handle, tx, mut rx) = setup();
        let token = CancellationToken::new();

        let poller = Poller::spawn(handle, engine.clone(), tx, &token, PERIOD);
        tokio::time::sleep(PERIOD / 2).await;
        engine.invalidate(handle);

        assert_eq!(poller.join().await, PollerExit::HandleInvalid);
        assert_eq!(statuses(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_poller() {
        let (engine, handle, tx, mut rx) = setup();
        let token = CancellationToken::new();

        let poller = Poller::spawn(handle, engine.clone(), tx, &token, PERIOD);
        tokio::time::sleep(PERIOD / 2).await;
        token.cancel();

        assert_eq!(poller.join().await, PollerExit::Stopped);
        statuses(&mut rx);
        tokio::time::sleep(PERIOD * 3).await;
        assert!(statuses(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_before_first_tick_emits_nothing() {
        let (engine, handle, tx, mut rx) = setup();
        let token = CancellationToken::new();
        token.cancel();

        let poller = Poller::spawn(handle, engine.clone(), tx, &token, PERIOD);

        assert_eq!(poller.join().await, PollerExit::Stopped);
        assert!(statuses(&mut rx).is_empty());
    }
}
