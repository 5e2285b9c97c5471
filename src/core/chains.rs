//! Registry of the custom chains this controller created
//!
//! A [`ChainKey`] is present if and only if the controller believes the chain
//! exists and is linked into its parent. The registry does no I/O; it is
//! only reachable through the reconciler's lock guard.

use crate::core::rules::Rule;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a custom chain: `(table, derived chain name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub table: String,
    pub chain: String,
}

impl ChainKey {
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.table, self.chain)
    }
}

/// Custom chains currently installed, with the rule that produced each one.
///
/// Ordered so teardown and verification walk chains deterministically.
#[derive(Debug, Default, Clone)]
pub struct SystemChains {
    chains: BTreeMap<ChainKey, Rule>,
}

impl SystemChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a created and linked chain. Returns `false` if it was already tracked.
    pub fn register(&mut self, key: ChainKey, rule: Rule) -> bool {
        self.chains.insert(key, rule).is_none()
    }

    /// Forgets a chain, returning the rule it was created for.
    pub fn unregister(&mut self, key: &ChainKey) -> Option<Rule> {
        self.chains.remove(key)
    }

    pub fn contains(&self, key: &ChainKey) -> bool {
        self.chains.contains_key(key)
    }

    pub fn all(&self) -> impl Iterator<Item = (&ChainKey, &Rule)> {
        self.chains.iter()
    }

    /// Snapshot of every entry, for loops that unregister while iterating.
    pub fn entries(&self) -> Vec<(ChainKey, Rule)> {
        self.chains
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
