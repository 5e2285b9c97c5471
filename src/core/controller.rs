//! Controller lifecycle
//!
//! [`Controller`] owns the reconciler, the verifier, the configuration source
//! and the background tasks. Construct it once and share it by reference.
//!
//! - [`init`](Controller::init): install baseline rules, start watching the
//!   configuration, load it, start the drift watchdog.
//! - [`stop`](Controller::stop): stop both tasks (waiting for them to exit),
//!   then remove everything that was installed.
//!
//! Both are no-ops when the controller is already in the requested state.

use crate::config::{ConfigReload, ConfigSource, ConfigWatcher, FwConfig, WATCH_INTERVAL};
use crate::core::error::{Error, Result};
use crate::core::executor::RuleExecutor;
use crate::core::reconcile::Reconciler;
use crate::core::rules::{Action, DEFAULT_QUEUE_NUM, Rule};
use crate::core::verify::{PatternVerifier, StateVerifier};
use crate::core::watchdog::{CHECK_INTERVAL, DriftTarget, Watchdog, WatchdogState};
use crate::validators::sanitize_description;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{Level, error, info, warn};

/// Startup settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Decision queue the redirect rules point at.
    pub queue_num: u16,
    /// Whether every invocation is mirrored on ip6tables.
    pub ipv6: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            queue_num: DEFAULT_QUEUE_NUM,
            ipv6: crate::utils::ipv6_supported(),
        }
    }
}

/// Cleanup only reports errors when debugging; rules missing at cleanup time
/// are the common case.
fn verbose_cleanup() -> bool {
    tracing::enabled!(Level::DEBUG)
}

/// State shared with the background tasks.
struct Shared<E, V> {
    reconciler: Reconciler<E>,
    verifier: V,
    config: Arc<dyn ConfigSource>,
    reload_cycles: Arc<AtomicU64>,
    /// Held for a whole config apply or drift reload, so the two never
    /// interleave their separately locked steps.
    reloading: Mutex<()>,
}

impl<E: RuleExecutor, V: StateVerifier> Shared<E, V> {
    /// Creates the chain and adds the rule for every enabled entry.
    ///
    /// Bad entries and failing rules are logged and skipped.
    async fn apply_config(&self, config: &FwConfig) {
        for entry in config.enabled_rules() {
            let rule = &entry.rule;
            if let Err(e) = self.reconciler.add_system_rule(Action::Add, rule, true).await {
                warn!(
                    "Skipping system rule '{}' ({} {}): {e}",
                    sanitize_description(&rule.description),
                    rule.table(),
                    rule.chain
                );
            }
        }
    }

    /// Loads the configuration and applies it. Never fatal.
    async fn load_config(&self, reload: bool) {
        match self.config.load() {
            Ok(config) => {
                info!(
                    "Loaded {} system rule(s){}",
                    config.system_rules.len(),
                    if reload { " (reload)" } else { "" }
                );
                self.apply_config(&config).await;
            }
            Err(e) => error!("Could not load firewall configuration: {e}"),
        }
    }
}

impl<E: RuleExecutor, V: StateVerifier> DriftTarget for Shared<E, V> {
    async fn is_loaded(&self) -> bool {
        self.reconciler.are_rules_loaded(&self.verifier).await
    }

    async fn reload(&self) -> Result<()> {
        let _reloading = self.reloading.lock().await;
        self.reconciler.clean_all(verbose_cleanup()).await;
        self.reconciler.install_baseline(true, true).await?;
        self.load_config(true).await;
        Ok(())
    }
}

impl<E: RuleExecutor, V: StateVerifier> ConfigReload for Shared<E, V> {
    async fn config_changed(&self) {
        let _reloading = self.reloading.lock().await;
        self.reconciler
            .teardown_system_rules(verbose_cleanup())
            .await;
        self.load_config(true).await;
    }
}

/// Tasks owned while running.
struct Lifecycle {
    watchdog: Option<Watchdog>,
    config_watcher: Option<ConfigWatcher>,
    fatal_tx: mpsc::UnboundedSender<Error>,
    fatal_rx: Option<mpsc::UnboundedReceiver<Error>>,
}

/// Installs, verifies and self-heals the interception rules.
pub struct Controller<E, V = PatternVerifier> {
    shared: Arc<Shared<E, V>>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl<E: RuleExecutor> Controller<E> {
    /// Controller verifying state with [`PatternVerifier`].
    pub fn new(executor: E, config: Arc<dyn ConfigSource>, options: ControllerOptions) -> Self {
        Self::with_verifier(executor, PatternVerifier::new(), config, options)
    }
}

impl<E: RuleExecutor, V: StateVerifier> Controller<E, V> {
    pub fn with_verifier(
        executor: E,
        verifier: V,
        config: Arc<dyn ConfigSource>,
        options: ControllerOptions,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                reconciler: Reconciler::new(executor, options.ipv6, options.queue_num),
                verifier,
                config,
                reload_cycles: Arc::new(AtomicU64::new(0)),
                reloading: Mutex::new(()),
            }),
            lifecycle: Mutex::new(Lifecycle {
                watchdog: None,
                config_watcher: None,
                fatal_tx,
                fatal_rx: Some(fatal_rx),
            }),
            running: AtomicBool::new(false),
        }
    }

    /// Installs the rules and starts the background tasks.
    ///
    /// Returns [`Error::FatalInstall`] when interception could not be set up;
    /// the caller must then clean up and terminate. Nothing is started in
    /// that case.
    pub async fn init(&self, queue_num: Option<u16>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        if let Some(queue_num) = queue_num {
            self.shared.reconciler.set_queue_num(queue_num);
        }

        if let Err(e) = self.shared.reconciler.install_baseline(true, true).await {
            error!("{e}");
            return Err(e);
        }

        lifecycle.config_watcher = Some(ConfigWatcher::spawn(
            self.shared.config.clone(),
            self.shared.clone(),
            WATCH_INTERVAL,
        ));
        {
            let _reloading = self.shared.reloading.lock().await;
            self.shared.load_config(false).await;
        }

        lifecycle.watchdog = Some(Watchdog::spawn(
            self.shared.clone(),
            CHECK_INTERVAL,
            self.shared.reload_cycles.clone(),
            lifecycle.fatal_tx.clone(),
        ));

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Firewall rules installed (queue {})",
            self.shared.reconciler.queue_num()
        );
        Ok(())
    }

    /// Stops the background tasks, then removes every installed rule.
    pub async fn stop(&self, queue_num: Option<u16>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return;
        }
        if let Some(queue_num) = queue_num {
            self.shared.reconciler.set_queue_num(queue_num);
        }

        if let Some(watcher) = lifecycle.config_watcher.take() {
            watcher.stop().await;
        }
        if let Some(watchdog) = lifecycle.watchdog.take() {
            watchdog.stop().await;
        }
        self.shared.reconciler.clean_all(verbose_cleanup()).await;

        self.running.store(false, Ordering::SeqCst);
        info!("Firewall rules removed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Removes the baseline rules and every system chain, including chains
    /// the configuration names but this process never installed (leftovers
    /// of a run that did not shut down cleanly).
    pub async fn clean_rules(&self, log_errors: bool) {
        let _reloading = self.shared.reloading.lock().await;
        self.shared.reconciler.clean_all(log_errors).await;

        match self.shared.config.load() {
            Ok(config) => {
                let rules: Vec<Rule> = config.system_rules.into_iter().map(|e| e.rule).collect();
                self.shared
                    .reconciler
                    .remove_configured_chains(&rules, log_errors)
                    .await;
            }
            Err(e) => warn!("Configured system chains not removed: {e}"),
        }
    }

    /// Adds (`enable`) or deletes a configured rule in its system chain.
    pub async fn add_system_rule(
        &self,
        action: Action,
        rule: &Rule,
        enable: bool,
    ) -> Result<()> {
        self.shared
            .reconciler
            .add_system_rule(action, rule, enable)
            .await
    }

    /// Whether the desired rules are currently live.
    pub async fn are_rules_loaded(&self) -> bool {
        self.shared.is_loaded().await
    }

    /// Receiver for fatal errors hit by the watchdog. Can be taken once.
    pub async fn fatal_events(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.lifecycle.lock().await.fatal_rx.take()
    }

    /// Completed drift reload cycles since construction.
    pub fn reload_cycles(&self) -> u64 {
        self.shared.reload_cycles.load(Ordering::SeqCst)
    }

    /// Watchdog state; [`WatchdogState::Exited`] when not running.
    pub async fn watchdog_state(&self) -> WatchdogState {
        self.lifecycle
            .lock()
            .await
            .watchdog
            .as_ref()
            .map_or(WatchdogState::Exited, Watchdog::state)
    }

    pub fn queue_num(&self) -> u16 {
        self.shared.reconciler.queue_num()
    }

    pub fn reconciler(&self) -> &Reconciler<E> {
        &self.shared.reconciler
    }
}
