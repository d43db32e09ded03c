//! Settings file
//!
//! An optional TOML file supplies defaults for the `build` command:
//!
//! ```toml
//! output = "/var/lib/treos/update.tar"
//! tmpdir = "/var/tmp"
//! wait = 3000
//! boot-dir = "/boot"
//! feed-dir = "/var/lib/treos/feed"
//! poll-interval = 1000
//! live = false
//! ```
//!
//! Command line flags and `TREOS_*` environment variables win over the file.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settle period before a candidate head converges.
pub const DEFAULT_WAIT_MS: u64 = 3000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Where the update package is written
    pub output: PathBuf,
    /// Staging directory for packages being written
    pub tmpdir: PathBuf,
    /// Settle period in milliseconds
    pub wait: u64,
    /// Directory holding the installed kernels, initcpios and disk images
    pub boot_dir: PathBuf,
    /// Local mirror of the revision feed
    pub feed_dir: Option<PathBuf>,
    /// Feed polling interval in milliseconds
    pub poll_interval: u64,
    /// Keep following the lineage after the first package
    pub live: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: PathBuf::from("update.tar"),
            tmpdir: std::env::temp_dir(),
            wait: DEFAULT_WAIT_MS,
            boot_dir: PathBuf::from("/boot"),
            feed_dir: None,
            poll_interval: DEFAULT_POLL_INTERVAL_MS,
            live: false,
        }
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings file {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.wait)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }
}
