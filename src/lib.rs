//! fwsentry - Firewall state reconciliation
//!
//! Keeps the packet-filter rules an application firewall depends on
//! installed: traffic redirection into a userspace decision queue, a drop
//! rule for marked connections, and operator-configured system rules in
//! their own chains. Detects drift and reinstalls everything when another
//! tool flushes or edits the tables.
//!
//! # Architecture
//!
//! - [`core`] - Reconciliation engine, verification, watchdog and lifecycle
//! - [`config`] - System rule configuration and change watching
//! - [`validators`] - Input validation and sanitization
//! - [`utils`] - Default paths and host capability detection
//!
//! # Safety Features
//!
//! - One exclusive lock around every install/remove operation
//! - Existence checks (`-C`) make install and removal idempotent
//! - Fatal escalation when interception cannot be set up
//! - Periodic verification with a full clean + reinstall on drift

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use crate::config::{ConfigSource, FileConfig, FwConfig, StaticConfig};
pub use crate::core::controller::{Controller, ControllerOptions};
pub use crate::core::error::{Error, Result};
pub use crate::core::executor::{IptablesExecutor, RuleExecutor};
pub use crate::core::rules::{Action, Rule, Stack, SystemRule};
