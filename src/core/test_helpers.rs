//! Shared test utilities for core module tests
//!
//! Provides an in-memory iptables double so reconciliation, verification and
//! lifecycle tests never touch real netfilter state or need privileges.
//! This module is only compiled in test mode.

use crate::core::chains::SystemChains;
use crate::core::error::{Error, Result};
use crate::core::executor::RuleExecutor;
use crate::core::rules::{Rule, Stack};
use crate::core::verify::{PatternVerifier, StateVerifier};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const BUILTIN_CHAINS: [&str; 5] = ["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

type ChainId = (Stack, String, String);

struct Fault {
    stack: Option<Stack>,
    needle: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct MockState {
    chains: BTreeMap<ChainId, Vec<Vec<String>>>,
    calls: Vec<(Stack, String)>,
    faults: Vec<Fault>,
    failed: usize,
}

impl MockState {
    fn chain(&mut self, stack: Stack, table: &str, chain: &str) -> Option<&mut Vec<Vec<String>>> {
        let id = (stack, table.to_string(), chain.to_string());
        if BUILTIN_CHAINS.contains(&chain) {
            return Some(self.chains.entry(id).or_default());
        }
        self.chains.get_mut(&id)
    }

    fn take_fault(&mut self, stack: Stack, line: &str) -> bool {
        let Some(fault) = self.faults.iter_mut().find(|f| {
            f.stack.is_none_or(|s| s == stack)
                && line.contains(&f.needle)
                && f.remaining != Some(0)
        }) else {
            return false;
        };
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        true
    }
}

/// Stateful iptables/ip6tables double.
///
/// Understands `-A -I -D -C -N -F -X` and `-n -L`, keeps one rule table per
/// stack, records every call, and fails calls matching injected faults.
#[derive(Default)]
pub struct MockIptables {
    state: Mutex<MockState>,
}

fn failure(stack: Stack, argv: &[String], message: &str) -> Error {
    Error::Execution {
        stack,
        args: argv.to_vec(),
        message: message.to_string(),
        exit_code: Some(1),
    }
}

/// Renders a stored rule the way `iptables -n -L` prints it.
fn render(spec: &[String]) -> String {
    let mut target = "";
    let mut prot = "all";
    let mut extras = Vec::new();
    let mut it = spec.iter().map(String::as_str);

    while let Some(tok) = it.next() {
        match tok {
            "-j" => target = it.next().unwrap_or(""),
            "-p" | "--protocol" => prot = it.next().unwrap_or("all"),
            "-m" => {
                it.next();
            }
            "--ctstate" => extras.push(format!("ctstate {}", it.next().unwrap_or(""))),
            "--queue-num" => extras.push(format!("NFQUEUE num {}", it.next().unwrap_or(""))),
            "--queue-bypass" => extras.push("bypass".to_string()),
            "--mark" => {
                let mark: u32 = it.next().and_then(|m| m.parse().ok()).unwrap_or(0);
                extras.push(format!("mark match 0x{mark:x}"));
            }
            "--sport" => extras.push(format!("{prot} spt:{}", it.next().unwrap_or(""))),
            "--dport" => extras.push(format!("{prot} dpt:{}", it.next().unwrap_or(""))),
            other => extras.push(other.to_string()),
        }
    }

    format!(
        "{target:<10} {prot:<4} --  0.0.0.0/0            0.0.0.0/0            {}",
        extras.join(" ")
    )
    .trim_end()
    .to_string()
}

impl MockIptables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call on `stack` (or any stack) whose argv contains `needle`.
    pub fn fail_matching(&self, stack: Option<Stack>, needle: &str) {
        self.state.lock().unwrap().faults.push(Fault {
            stack,
            needle: needle.to_string(),
            remaining: None,
        });
    }

    /// Like [`fail_matching`](Self::fail_matching), for the next `times` matching calls only.
    pub fn fail_times(&self, stack: Option<Stack>, needle: &str, times: usize) {
        self.state.lock().unwrap().faults.push(Fault {
            stack,
            needle: needle.to_string(),
            remaining: Some(times),
        });
    }

    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    /// Simulates another tool flushing every table and deleting custom chains.
    pub fn wipe(&self, stack: Stack) {
        self.state
            .lock()
            .unwrap()
            .chains
            .retain(|(s, _, _), _| *s != stack);
    }

    /// Flushes a built-in chain or deletes a custom one behind our back.
    pub fn wipe_chain(&self, stack: Stack, table: &str, chain: &str) {
        let mut state = self.state.lock().unwrap();
        let id = (stack, table.to_string(), chain.to_string());
        if BUILTIN_CHAINS.contains(&chain) {
            state.chains.insert(id, Vec::new());
        } else {
            state.chains.remove(&id);
        }
    }

    pub fn chain_exists(&self, stack: Stack, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .chains
            .contains_key(&(stack, table.to_string(), chain.to_string()))
    }

    pub fn rule_count(&self, stack: Stack, table: &str, chain: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&(stack, table.to_string(), chain.to_string()))
            .map_or(0, Vec::len)
    }

    /// Rules across every table and chain of `stack`.
    pub fn total_rules(&self, stack: Stack) -> usize {
        self.state
            .lock()
            .unwrap()
            .chains
            .iter()
            .filter(|((s, _, _), _)| *s == stack)
            .map(|(_, rules)| rules.len())
            .sum()
    }

    pub fn calls(&self) -> Vec<(Stack, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, stack: Stack) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(s, _)| *s == stack)
            .map(|(_, line)| line)
            .collect()
    }

    /// Failed calls, not counting `-C` checks and listings.
    pub fn failed_calls(&self) -> usize {
        self.state.lock().unwrap().failed
    }

    fn apply(&self, stack: Stack, argv: &[String]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let line = argv.join(" ");
        state.calls.push((stack, line.clone()));

        let check = argv.iter().any(|a| a == "-C" || a == "-L");
        let result = Self::run(&mut state, stack, argv, &line);
        if result.is_err() && !check {
            state.failed += 1;
        }
        result
    }

    fn run(state: &mut MockState, stack: Stack, argv: &[String], line: &str) -> Result<String> {
        if state.take_fault(stack, line) {
            return Err(failure(stack, argv, "iptables: injected failure."));
        }

        let mut table = "filter".to_string();
        let mut rest = Vec::new();
        let mut it = argv.iter();
        while let Some(tok) = it.next() {
            match tok.as_str() {
                "-t" => table = it.next().cloned().unwrap_or_default(),
                "-n" => {}
                _ => rest.push(tok.clone()),
            }
        }

        let (Some(action), Some(chain)) = (rest.first(), rest.get(1)) else {
            return Err(failure(stack, argv, "iptables: bad argument."));
        };
        let spec = rest[2..].to_vec();
        let missing = "iptables: No chain/target/match by that name.";

        match action.as_str() {
            "-N" => {
                let id = (stack, table, chain.clone());
                if BUILTIN_CHAINS.contains(&chain.as_str()) || state.chains.contains_key(&id) {
                    return Err(failure(stack, argv, "iptables: Chain already exists."));
                }
                state.chains.insert(id, Vec::new());
                Ok(String::new())
            }
            "-X" => {
                if BUILTIN_CHAINS.contains(&chain.as_str())
                    || state.chains.remove(&(stack, table, chain.clone())).is_none()
                {
                    return Err(failure(stack, argv, missing));
                }
                Ok(String::new())
            }
            "-F" => {
                let rules = state
                    .chain(stack, &table, chain)
                    .ok_or_else(|| failure(stack, argv, missing))?;
                rules.clear();
                Ok(String::new())
            }
            "-A" | "-I" => {
                let rules = state
                    .chain(stack, &table, chain)
                    .ok_or_else(|| failure(stack, argv, missing))?;
                if action == "-A" {
                    rules.push(spec);
                } else {
                    rules.insert(0, spec);
                }
                Ok(String::new())
            }
            "-D" | "-C" => {
                let rules = state
                    .chain(stack, &table, chain)
                    .ok_or_else(|| failure(stack, argv, missing))?;
                let Some(pos) = rules.iter().position(|r| *r == spec) else {
                    return Err(failure(
                        stack,
                        argv,
                        "iptables: Bad rule (does a matching rule exist in that chain?).",
                    ));
                };
                if action == "-D" {
                    rules.remove(pos);
                }
                Ok(String::new())
            }
            "-L" => {
                let rules = state
                    .chain(stack, &table, chain)
                    .ok_or_else(|| failure(stack, argv, missing))?;
                let mut out = format!(
                    "Chain {chain} (policy ACCEPT)\ntarget     prot opt source               destination\n"
                );
                for rule in rules.iter() {
                    out.push_str(&render(rule));
                    out.push('\n');
                }
                Ok(out)
            }
            _ => Err(failure(stack, argv, "iptables: unknown option.")),
        }
    }
}

impl RuleExecutor for MockIptables {
    async fn execute(&self, stack: Stack, args: &[String]) -> Result<String> {
        self.apply(stack, args)
    }
}

/// [`PatternVerifier`] that reports "not loaded" for its first `failures` checks.
pub struct FlakyVerifier {
    failures: AtomicUsize,
    checks: AtomicUsize,
}

impl FlakyVerifier {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl StateVerifier for FlakyVerifier {
    async fn is_loaded<E: RuleExecutor>(
        &self,
        executor: &E,
        stacks: &[Stack],
        chains: &SystemChains,
    ) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let forced = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return false;
        }
        PatternVerifier.is_loaded(executor, stacks, chains).await
    }
}

/// Creates a system rule for `chain` in `table` ("" = default table).
pub fn test_rule(table: &str, chain: &str, target: &str) -> Rule {
    Rule {
        description: format!("test {chain}"),
        table: table.to_string(),
        chain: chain.to_string(),
        parameters: String::new(),
        target: target.to_string(),
        target_parameters: String::new(),
    }
}
