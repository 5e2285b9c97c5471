//! Reconciliation engine
//!
//! Installs and removes the baseline rules and the configured system chains.
//! Every public operation holds one exclusive lock for its whole duration.
//! The lock guards the [`SystemChains`] registry, so the registry cannot be
//! touched outside a critical section, and no two operations ever interleave
//! their iptables invocations.
//!
//! # Stack ordering
//!
//! Invocations run IPv4 first, then IPv6 when enabled, one after another.
//! Install paths stop at the first failing stack (the IPv6 call is skipped
//! when IPv4 failed). Removal paths try every stack and report the first
//! failure, so a chain already gone on one stack never keeps the other one
//! installed.

use crate::core::chains::SystemChains;
use crate::core::error::{Error, Result};
use crate::core::executor::RuleExecutor;
use crate::core::rules::{self, Action, BaselineRule, Rule, Stack};
use crate::core::verify::StateVerifier;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const IPV4_ONLY: &[Stack] = &[Stack::Ipv4];
const DUAL_STACK: &[Stack] = &[Stack::Ipv4, Stack::Ipv6];

/// What a multi-stack invocation does when one stack fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    /// Skip the remaining stacks.
    Abort,
    /// Try the remaining stacks anyway.
    Continue,
}

fn with_action(action: Action, args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(action.as_ref().to_string());
    argv.extend_from_slice(args);
    argv
}

/// Owner of the exclusive lock, the chain registry and the queue number.
pub struct Reconciler<E> {
    executor: E,
    ipv6: bool,
    queue_num: AtomicU16,
    chains: Mutex<SystemChains>,
}

impl<E: RuleExecutor> Reconciler<E> {
    pub fn new(executor: E, ipv6: bool, queue_num: u16) -> Self {
        Self {
            executor,
            ipv6,
            queue_num: AtomicU16::new(queue_num),
            chains: Mutex::new(SystemChains::new()),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6
    }

    /// Stacks every invocation runs against, in order.
    pub fn stacks(&self) -> &'static [Stack] {
        if self.ipv6 { DUAL_STACK } else { IPV4_ONLY }
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num.load(Ordering::Relaxed)
    }

    pub fn set_queue_num(&self, queue_num: u16) {
        self.queue_num.store(queue_num, Ordering::Relaxed);
    }

    /// Copy of the registry, taken under the lock.
    pub async fn system_chains(&self) -> SystemChains {
        self.chains.lock().await.clone()
    }

    /// Applies (`enable`) or removes the three baseline rules, in install order.
    ///
    /// A failing DNS redirect is logged and skipped. A failing connection
    /// redirect or drop rule returns [`Error::FatalInstall`]; the caller must
    /// not keep running without them. Removal never fails.
    pub async fn install_baseline(&self, enable: bool, log_errors: bool) -> Result<()> {
        let _chains = self.chains.lock().await;
        if enable {
            self.install_baseline_locked(log_errors).await
        } else {
            self.remove_baseline_locked(log_errors).await;
            Ok(())
        }
    }

    /// Installs (`enable`) or deletes a configured rule inside its system chain.
    ///
    /// When enabling, the chain is created and linked first unless the
    /// registry already tracks it, and the rule is only added on stacks where
    /// a `-C` check does not find it. Executor errors are returned unmodified.
    pub async fn add_system_rule(&self, action: Action, rule: &Rule, enable: bool) -> Result<()> {
        crate::validators::validate_rule(rule)?;

        let mut chains = self.chains.lock().await;
        let args = rules::system_rule(rule);
        if enable {
            self.create_chain_locked(&mut chains, rule, true).await?;
            self.sync_rule(action, true, true, &args, OnFailure::Abort)
                .await
        } else {
            self.run_rule(action, false, true, &args).await
        }
    }

    /// Creates and links the system chain for `rule`, without adding the rule itself.
    pub async fn create_system_chain(&self, rule: &Rule, log_errors: bool) -> Result<()> {
        crate::validators::validate_rule(rule)?;

        let mut chains = self.chains.lock().await;
        self.create_chain_locked(&mut chains, rule, log_errors)
            .await
    }

    /// Flushes, unlinks and deletes every tracked system chain.
    pub async fn teardown_system_rules(&self, log_errors: bool) {
        let mut chains = self.chains.lock().await;
        self.teardown_locked(&mut chains, log_errors).await;
    }

    /// Removes the baseline rules, then every system chain.
    pub async fn clean_all(&self, log_errors: bool) {
        let mut chains = self.chains.lock().await;
        self.remove_baseline_locked(log_errors).await;
        self.teardown_locked(&mut chains, log_errors).await;
    }

    /// Unlinks, flushes and deletes the chain each rule would live in,
    /// tracked or not, on every stack where it is found.
    ///
    /// Covers chains left behind by a process that never reached a clean
    /// shutdown, whose registry is gone. Invalid rules are skipped.
    pub async fn remove_configured_chains(&self, rules: &[Rule], log_errors: bool) {
        let mut chains = self.chains.lock().await;
        for rule in rules {
            if let Err(e) = crate::validators::validate_rule(rule) {
                debug!("Not removing chain for invalid rule: {e}");
                continue;
            }
            self.remove_chain_locked(rule, log_errors).await;
            chains.unregister(&rule.key());
        }
    }

    /// Asks `verifier` whether the desired state is live, holding the lock
    /// for every listing call.
    pub async fn are_rules_loaded<V: StateVerifier>(&self, verifier: &V) -> bool {
        let chains = self.chains.lock().await;
        verifier
            .is_loaded(&self.executor, self.stacks(), &chains)
            .await
    }

    async fn install_baseline_locked(&self, log_errors: bool) -> Result<()> {
        let queue_num = self.queue_num();

        for baseline in BaselineRule::ALL {
            let args = baseline.args(queue_num);
            let Err(e) = self
                .sync_rule(baseline.install_action(), true, log_errors, &args, OnFailure::Abort)
                .await
            else {
                continue;
            };

            if baseline.is_critical() {
                return Err(Error::FatalInstall {
                    rule: baseline.name(),
                    source: Box::new(e),
                });
            }
            error!("Error while running {baseline} firewall rule: {e}");
        }
        Ok(())
    }

    /// Deletes each baseline rule wherever it is present. Failures are
    /// logged and the remaining rules and stacks are still attempted.
    async fn remove_baseline_locked(&self, log_errors: bool) {
        let queue_num = self.queue_num();

        for baseline in BaselineRule::ALL {
            let args = baseline.args(queue_num);
            if let Err(e) = self
                .sync_rule(
                    baseline.install_action(),
                    false,
                    log_errors,
                    &args,
                    OnFailure::Continue,
                )
                .await
            {
                debug!("Could not remove {baseline} rule: {e}");
            }
        }
    }

    async fn create_chain_locked(
        &self,
        chains: &mut SystemChains,
        rule: &Rule,
        log_errors: bool,
    ) -> Result<()> {
        let key = rule.key();
        if chains.contains(&key) {
            return Ok(());
        }

        // A leftover chain from a previous run makes -N fail; it is emptied
        // instead, and the jump below decides whether the chain counts as
        // installed.
        let chain = rules::system_chain(rule);
        let create = with_action(Action::NewChain, &chain);
        if let Err(e) = self.run_on_stacks(&create, OnFailure::Continue, false).await {
            debug!("Chain {key} not created: {e}");
            let flush = with_action(Action::Flush, &chain);
            if let Err(e) = self.run_on_stacks(&flush, OnFailure::Continue, false).await {
                debug!("Chain {key} not flushed: {e}");
            }
        }

        self.sync_rule(
            Action::Insert,
            true,
            log_errors,
            &rules::system_chain_jump(rule),
            OnFailure::Abort,
        )
        .await?;

        chains.register(key, rule.clone());
        Ok(())
    }

    async fn teardown_locked(&self, chains: &mut SystemChains, log_errors: bool) {
        for (key, rule) in chains.entries() {
            let chain = rules::system_chain(&rule);
            let steps = [
                with_action(Action::Flush, &chain),
                with_action(Action::Delete, &rules::system_chain_jump(&rule)),
                with_action(Action::DelChain, &chain),
            ];

            for argv in &steps {
                if let Err(e) = self
                    .run_on_stacks(argv, OnFailure::Continue, log_errors)
                    .await
                {
                    warn!("Teardown of {key} incomplete: {e}");
                }
            }

            // Unregistered even when a step failed, so a chain that is already
            // gone does not stay tracked forever. A chain whose unlink failed
            // may stay live but untracked.
            chains.unregister(&key);
        }
    }

    /// Removes one rule's chain and its jump, probing each stack first.
    async fn remove_chain_locked(&self, rule: &Rule, log_errors: bool) {
        let key = rule.key();
        if let Err(e) = self
            .sync_rule(
                Action::Insert,
                false,
                log_errors,
                &rules::system_chain_jump(rule),
                OnFailure::Continue,
            )
            .await
        {
            warn!("Could not unlink {key}: {e}");
        }

        let chain = rules::system_chain(rule);
        let list = [
            vec!["-n".to_string(), "-L".to_string()],
            chain.clone(),
        ]
        .concat();
        for &stack in self.stacks() {
            if self.executor.execute(stack, &list).await.is_err() {
                continue;
            }
            for action in [Action::Flush, Action::DelChain] {
                let argv = with_action(action, &chain);
                if let Err(e) = self.executor.execute(stack, &argv).await {
                    if log_errors {
                        error!("Error while running firewall rule, {stack} err: {e}");
                        error!("rule: {}", argv.join(" "));
                    }
                    break;
                }
            }
        }
    }

    /// Runs `action` (or `-D` when `!enable`) with `args` on every stack,
    /// stopping at the first failure.
    pub async fn run_rule(
        &self,
        action: Action,
        enable: bool,
        log_errors: bool,
        args: &[String],
    ) -> Result<()> {
        let action = if enable { action } else { Action::Delete };
        self.run_on_stacks(&with_action(action, args), OnFailure::Abort, log_errors)
            .await
    }

    /// Converges one rule per stack: checks it with `-C`, then adds it only
    /// where missing (`enable`) or deletes it only where present.
    async fn sync_rule(
        &self,
        action: Action,
        enable: bool,
        log_errors: bool,
        args: &[String],
        on_failure: OnFailure,
    ) -> Result<()> {
        let check = with_action(Action::Check, args);
        let apply = with_action(if enable { action } else { Action::Delete }, args);
        let mut first_error = None;

        for &stack in self.stacks() {
            let present = self.executor.execute(stack, &check).await.is_ok();
            if present == enable {
                continue;
            }

            if let Err(e) = self.executor.execute(stack, &apply).await {
                if log_errors {
                    error!("Error while running firewall rule, {stack} err: {e}");
                    error!("rule: {}", apply.join(" "));
                }
                if on_failure == OnFailure::Abort {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn run_on_stacks(
        &self,
        argv: &[String],
        on_failure: OnFailure,
        log_errors: bool,
    ) -> Result<()> {
        let mut first_error = None;

        for &stack in self.stacks() {
            if let Err(e) = self.executor.execute(stack, argv).await {
                if log_errors {
                    error!("Error while running firewall rule, {stack} err: {e}");
                    error!("rule: {}", argv.join(" "));
                }
                if on_failure == OnFailure::Abort {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
