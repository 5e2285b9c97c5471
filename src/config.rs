//! System rule configuration
//!
//! The controller consumes an already parsed [`FwConfig`] through a
//! [`ConfigSource`], plus a change signal produced by [`ConfigWatcher`].
//!
//! # File format
//!
//! ```json
//! {
//!   "SystemRules": [
//!     {
//!       "Rule": {
//!         "Description": "Allow pinging the gateway",
//!         "Table": "mangle",
//!         "Chain": "OUTPUT",
//!         "Parameters": "-p icmp",
//!         "Target": "ACCEPT",
//!         "TargetParameters": ""
//!       },
//!       "Enabled": true
//!     }
//!   ]
//! }
//! ```

use crate::core::error::{Error, Result};
use crate::core::rules::SystemRule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File name of the system rule configuration.
pub const CONFIG_FILE_NAME: &str = "system-fw.json";

/// How often the watcher polls the source for changes.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Parsed system rule configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FwConfig {
    #[serde(default)]
    pub system_rules: Vec<SystemRule>,
}

impl FwConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Entries whose intent is "enabled", in file order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &SystemRule> {
        self.system_rules.iter().filter(|r| r.enabled)
    }
}

/// Where the configuration comes from.
pub trait ConfigSource: Send + Sync + 'static {
    /// Reads and parses the current configuration.
    fn load(&self) -> Result<FwConfig>;

    /// Token that changes whenever the configuration content changes.
    fn revision(&self) -> Result<String>;
}

/// JSON configuration file on disk. A missing file is an empty configuration.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ConfigSource for FileConfig {
    fn load(&self) -> Result<FwConfig> {
        let Some(bytes) = self.read()? else {
            debug!("No configuration at {}", self.path.display());
            return Ok(FwConfig::default());
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {e}", self.path.display())))
    }

    fn revision(&self) -> Result<String> {
        let Some(bytes) = self.read()? else {
            return Ok(String::new());
        };
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// In-memory configuration that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub FwConfig);

impl ConfigSource for StaticConfig {
    fn load(&self) -> Result<FwConfig> {
        Ok(self.0.clone())
    }

    fn revision(&self) -> Result<String> {
        Ok(String::new())
    }
}

/// Reacts to configuration changes.
pub trait ConfigReload: Send + Sync + 'static {
    fn config_changed(&self) -> impl Future<Output = ()> + Send;
}

/// Polls a [`ConfigSource`] and notifies a [`ConfigReload`] on every change.
pub struct ConfigWatcher {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Starts watching. The revision at call time is the baseline.
    pub fn spawn<T: ConfigReload>(
        source: Arc<dyn ConfigSource>,
        target: Arc<T>,
        period: Duration,
    ) -> Self {
        let initial = source.revision().unwrap_or_default();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut last = initial;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let revision = match source.revision() {
                    Ok(revision) => revision,
                    Err(e) => {
                        warn!("Could not read configuration: {e}");
                        continue;
                    }
                };
                if revision != last {
                    info!("Configuration changed, reloading system rules");
                    last = revision;
                    target.config_changed().await;
                }
            }
            debug!("Configuration watcher stopped");
        });

        Self { stop_tx, handle }
    }

    /// Stops watching and waits for the task to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("Configuration watcher ended abnormally: {e}");
        }
    }
}
