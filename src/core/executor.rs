//! Runs iptables/ip6tables invocations
//!
//! The reconciler never spawns processes itself; it hands fully composed
//! argument vectors to a [`RuleExecutor`]. Production code uses
//! [`IptablesExecutor`], tests use a stateful in-memory double.
//!
//! # Environment Variables
//!
//! - `FWSENTRY_IPTABLES`: path of the IPv4 binary (default `iptables`)
//! - `FWSENTRY_IP6TABLES`: path of the IPv6 binary (default `ip6tables`)
//!
//! The defaults themselves can be set at build time with
//! `FWSENTRY_IPTABLES_PATH` / `FWSENTRY_IP6TABLES_PATH`.

use crate::core::error::{Error, Result};
use crate::core::rules::Stack;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Executes one packet-filter invocation against one protocol stack.
///
/// Returns the invocation's stdout. No retries happen at this layer.
pub trait RuleExecutor: Send + Sync + 'static {
    fn execute(&self, stack: Stack, args: &[String]) -> impl Future<Output = Result<String>> + Send;
}

impl<E: RuleExecutor> RuleExecutor for Arc<E> {
    fn execute(&self, stack: Stack, args: &[String]) -> impl Future<Output = Result<String>> + Send {
        (**self).execute(stack, args)
    }
}

// Packagers can pin absolute paths at build time
const DEFAULT_IPV4: &str = match option_env!("FWSENTRY_IPTABLES_PATH") {
    Some(path) => path,
    None => Stack::Ipv4.binary(),
};
const DEFAULT_IPV6: &str = match option_env!("FWSENTRY_IP6TABLES_PATH") {
    Some(path) => path,
    None => Stack::Ipv6.binary(),
};

/// [`RuleExecutor`] spawning the iptables binaries.
#[derive(Debug, Clone)]
pub struct IptablesExecutor {
    ipv4: String,
    ipv6: String,
}

impl Default for IptablesExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesExecutor {
    /// Uses `iptables`/`ip6tables` from PATH unless overridden by environment.
    pub fn new() -> Self {
        Self {
            ipv4: std::env::var("FWSENTRY_IPTABLES")
                .unwrap_or_else(|_| DEFAULT_IPV4.to_string()),
            ipv6: std::env::var("FWSENTRY_IP6TABLES")
                .unwrap_or_else(|_| DEFAULT_IPV6.to_string()),
        }
    }

    pub fn with_binaries(ipv4: impl Into<String>, ipv6: impl Into<String>) -> Self {
        Self {
            ipv4: ipv4.into(),
            ipv6: ipv6.into(),
        }
    }

    fn binary(&self, stack: Stack) -> &str {
        match stack {
            Stack::Ipv4 => &self.ipv4,
            Stack::Ipv6 => &self.ipv6,
        }
    }
}

impl RuleExecutor for IptablesExecutor {
    async fn execute(&self, stack: Stack, args: &[String]) -> Result<String> {
        let binary = self.binary(stack);
        debug!("{binary} {}", args.join(" "));

        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Execution {
                stack,
                args: args.to_vec(),
                message: format!("Failed to spawn {binary}: {e}"),
                exit_code: None,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Execution {
                stack,
                args: args.to_vec(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            })
        }
    }
}
