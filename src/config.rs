use std::ffi::OsString;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "cascade";
const CHECKPOINT_FILE: &str = "resume.dat";

/// Configuration settings for the session manager
#[derive(Clone, Debug)]
pub struct Config {
    // Engine Settings
    /// Ports the engine tries to listen on, first free one wins
    pub listen_ports: RangeInclusive<u16>,
    /// Whether to join the DHT when the session starts
    pub start_dht: bool,

    // Poller Settings
    /// Interval between status samples of a single transfer
    pub poll_interval: Duration,

    // Checkpoint Settings
    /// File holding the resume data of all transfers
    pub checkpoint_path: PathBuf,
    /// How long a checkpoint waits for resume data before giving up
    pub checkpoint_window: Duration,
    /// Interval between engine alert drains while waiting for resume data
    pub checkpoint_poll_interval: Duration,

    // Removal Settings
    /// Delete downloaded data when a transfer is removed
    pub delete_data_on_remove: bool,
}

impl Config {
    pub fn with_listen_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.listen_ports = ports;
        self
    }

    pub fn with_dht(mut self, enabled: bool) -> Self {
        self.start_dht = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_checkpoint_window(mut self, window: Duration) -> Self {
        self.checkpoint_window = window;
        self
    }

    pub fn with_delete_data_on_remove(mut self, delete: bool) -> Self {
        self.delete_data_on_remove = delete;
        self
    }
}

impl Config {
    pub fn new(checkpoint_path: PathBuf) -> Self {
        Self {
            listen_ports: 6881..=6891,
            start_dht: true,
            poll_interval: Duration::from_secs(1),
            checkpoint_path,
            checkpoint_window: Duration::from_secs(3),
            checkpoint_poll_interval: Duration::from_millis(50),
            delete_data_on_remove: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(default_checkpoint_path())
    }
}

/// Per-user checkpoint location: `$XDG_CONFIG_HOME/cascade/resume.dat`,
/// or `$HOME/.config/cascade/resume.dat`.
pub fn default_checkpoint_path() -> PathBuf {
    checkpoint_path_from(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

fn checkpoint_path_from(config_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    let config_dir = match (config_home, home) {
        (Some(config_home), _) if !config_home.is_empty() => PathBuf::from(config_home),
        (_, Some(home)) if !home.is_empty() => PathBuf::from(home).join(".config"),
        _ => PathBuf::from("."),
    };
    config_dir.join(APP_DIR).join(CHECKPOINT_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new(PathBuf::from("/tmp/resume.dat"));

        assert_eq!(config.listen_ports, 6881..=6891);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.checkpoint_window, Duration::from_secs(3));
        assert!(config.start_dht);
        assert!(!config.delete_data_on_remove);
    }

    #[test]
    fn checkpoint_path_prefers_xdg() {
        let path = checkpoint_path_from(Some("/xdg".into()), Some("/home/me".into()));

        assert_eq!(path, PathBuf::from("/xdg/cascade/resume.dat"));
    }

    #[test]
    fn checkpoint_path_falls_back_to_home() {
        assert_eq!(
            checkpoint_path_from(Some("".into()), Some("/home/me".into())),
            PathBuf::from("/home/me/.config/cascade/resume.dat")
        );
        assert_eq!(
            checkpoint_path_from(None, None),
            PathBuf::from("./cascade/resume.dat")
        );
    }
}
