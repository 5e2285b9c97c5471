/// State verification for the live rule set
///
/// Lists the relevant chains through the executor and matches each listing
/// against structural fingerprints of the rules we install. The fingerprints
/// depend on the `iptables -n -L` output format; they are kept together here
/// so another [`StateVerifier`] can replace them if a structured query
/// becomes available.
use crate::core::chains::SystemChains;
use crate::core::executor::RuleExecutor;
use crate::core::rules::{DROP_MARK, Stack};
use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use tracing::{debug, warn};

static QUEUE_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"NFQUEUE.*ctstate NEW,RELATED.*NFQUEUE num.*bypass").expect("valid regex")
});

static DROP_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"DROP.*mark match 0x{DROP_MARK:x}")).expect("valid regex")
});

/// Decides whether the desired state is currently loaded.
///
/// Called with the reconciler's lock held; `chains` is the registry of
/// custom chains that must be linked.
pub trait StateVerifier: Send + Sync + 'static {
    fn is_loaded<E: RuleExecutor>(
        &self,
        executor: &E,
        stacks: &[Stack],
        chains: &SystemChains,
    ) -> impl Future<Output = bool> + Send;
}

/// Connection redirect with the bypass flag, in a `-t mangle OUTPUT` listing.
pub fn has_queue_rule(listing: &str) -> bool {
    QUEUE_RULE.is_match(listing)
}

/// Drop-on-mark rule, in a filter `OUTPUT` listing.
pub fn has_drop_rule(listing: &str) -> bool {
    DROP_RULE.is_match(listing)
}

/// A jump to `chain_name` in the listing of its parent chain.
///
/// The target is the first column of `iptables -n -L`.
pub fn has_chain_link(listing: &str, chain_name: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().next() == Some(chain_name))
}

/// [`StateVerifier`] matching `iptables -n -L` output against fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternVerifier;

impl PatternVerifier {
    pub fn new() -> Self {
        Self
    }
}

/// Runs a listing; a failure means the state is unknown.
async fn list<E: RuleExecutor>(executor: &E, stack: Stack, args: &[&str]) -> Option<String> {
    let argv: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
    match executor.execute(stack, &argv).await {
        Ok(out) => Some(out),
        Err(e) => {
            warn!("Listing {stack} {} failed, assuming rules are not loaded: {e}", argv.join(" "));
            None
        }
    }
}

impl StateVerifier for PatternVerifier {
    async fn is_loaded<E: RuleExecutor>(
        &self,
        executor: &E,
        stacks: &[Stack],
        chains: &SystemChains,
    ) -> bool {
        for &stack in stacks {
            let Some(filter) = list(executor, stack, &["-n", "-L", "OUTPUT"]).await else {
                return false;
            };
            let Some(mangle) = list(executor, stack, &["-n", "-L", "OUTPUT", "-t", "mangle"]).await
            else {
                return false;
            };

            if !has_drop_rule(&filter) {
                debug!("{stack}: drop rule missing");
                return false;
            }
            if !has_queue_rule(&mangle) {
                debug!("{stack}: queue rule missing");
                return false;
            }

            for (key, rule) in chains.all() {
                let Some(parent) =
                    list(executor, stack, &["-n", "-L", &rule.chain, "-t", &key.table]).await
                else {
                    return false;
                };
                if !has_chain_link(&parent, &key.chain) {
                    debug!("{stack}: chain {key} is not linked from {}", rule.chain);
                    return false;
                }
            }
        }
        true
    }
}
