use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};

use cascade::channel;
use cascade::config::Config;
use cascade::dashboard::{Dashboard, DisplayId, Presentation};
use cascade::engine::{Engine, MemoryEngine, TransferStats};
use cascade::record::{Changes, Field, TorrentRecord};
use cascade::session::SessionManager;

const USAGE: &str = "usage: cascade <download-dir> [magnet-uri | descriptor]...";
const TICK: Duration = Duration::from_secs(1);

/// Prints the transfer list to stdout.
#[derive(Default)]
struct Console {
    next_id: u64,
}

impl Presentation for Console {
    fn torrent_added(&mut self, record: &TorrentRecord) -> DisplayId {
        self.next_id += 1;
        println!(
            "+ {} {} ({})",
            record.handle(),
            record.name(),
            record.size_label()
        );
        DisplayId(self.next_id)
    }

    fn record_changed(&mut self, _id: DisplayId, record: &TorrentRecord, changes: &Changes) {
        let visible = [Field::Name, Field::Progress, Field::Eta, Field::Paused];
        if visible.iter().any(|field| changes.contains(*field)) {
            println!(
                "  {} {} {:5.1}% {}",
                record.handle(),
                record.name(),
                record.progress() * 100.0,
                record.info_line()
            );
        }
    }

    fn torrent_removed(&mut self, id: DisplayId) {
        println!("- {:?}", id);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let save_path = PathBuf::from(args.next().context(USAGE)?);

    let engine = Arc::new(MemoryEngine::new());
    let (tx, rx) = channel::channel();
    let config = Config::default();
    info!("checkpoint at {}", config.checkpoint_path.display());
    let mut session = SessionManager::new(engine.clone(), config, tx);

    session.restore().await;
    for source in args {
        if let Err(err) = session.add_torrent(&source, save_path.clone()) {
            warn!("unable to add {}: {}", source, err);
        }
    }
    // the in-memory engine moves nothing on its own
    for record in session.records() {
        let total_done = engine
            .status(record.handle())
            .map(|status| status.total_done)
            .unwrap_or_default();
        engine.set_stats(
            record.handle(),
            TransferStats {
                download_rate: 256 * 1024,
                upload_rate: 32 * 1024,
                total_done,
                num_peers: 1,
            },
        );
    }

    let dashboard = tokio::spawn(Dashboard::new(rx, Console::default()).run());
    let clock = engine.clone();
    let ticker = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(TICK);
        loop {
            ticks.tick().await;
            clock.advance(TICK);
        }
    });

    tokio::signal::ctrl_c().await?;
    ticker.abort();

    match session.shutdown().await {
        Some(report) if !report.is_complete() => {
            warn!("checkpoint is missing {:?}", report.missing)
        }
        Some(report) => info!("checkpointed {} transfers", report.saved.len()),
        None => warn!("no checkpoint written"),
    }
    dashboard.await?;
    Ok(())
}
