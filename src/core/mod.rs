//! Core firewall reconciliation functionality
//!
//! This module contains the types and logic for keeping the interception
//! rules installed. It provides:
//!
//! - [`rules`]: Rule data model and iptables invocation builders
//! - [`chains`]: Registry of installed system chains
//! - [`executor`]: Running iptables/ip6tables invocations
//! - [`reconcile`]: Locked install/remove operations
//! - [`verify`]: Checking that the desired rules are live
//! - [`watchdog`]: Periodic drift detection and self-healing
//! - [`controller`]: Start/stop lifecycle tying it all together
//! - [`error`]: Error types for firewall operations

pub mod chains;
pub mod controller;
pub mod error;
pub mod executor;
pub mod reconcile;
pub mod rules;
pub mod verify;
pub mod watchdog;

#[cfg(test)]
pub mod test_helpers;
