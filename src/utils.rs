//! Utility functions for paths and host capability detection
//!
//! # Configuration Location
//!
//! - Root: `/etc/fwsentry/system-fw.json`
//! - Other users: `~/.config/fwsentry/system-fw.json` (XDG config dir)
//!
//! # Example
//!
//! ```
//! use fwsentry::utils::default_config_path;
//!
//! let path = default_config_path(true);
//! assert_eq!(path.to_str(), Some("/etc/fwsentry/system-fw.json"));
//! ```

use crate::config::CONFIG_FILE_NAME;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const SYSTEM_CONFIG_DIR: &str = "/etc/fwsentry";
const IF_INET6: &str = "/proc/net/if_inet6";

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "fwsentry", "fwsentry").map(|pd| pd.config_dir().to_path_buf())
}

/// Where the system rule configuration is read from when none is given.
pub fn default_config_path(is_root: bool) -> PathBuf {
    let dir = if is_root {
        PathBuf::from(SYSTEM_CONFIG_DIR)
    } else {
        get_config_dir().unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR))
    };
    dir.join(CONFIG_FILE_NAME)
}

/// Whether the kernel has IPv6 enabled.
pub fn ipv6_supported() -> bool {
    ipv6_supported_at(Path::new(IF_INET6))
}

/// The file lists one line per configured IPv6 address; it is absent when
/// IPv6 is disabled.
fn ipv6_supported_at(path: &Path) -> bool {
    std::fs::read_to_string(path).is_ok_and(|s| !s.trim().is_empty())
}
