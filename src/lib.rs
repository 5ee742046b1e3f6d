pub mod bencoding;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod poller;
pub mod record;
pub mod session;
pub mod torrent;
