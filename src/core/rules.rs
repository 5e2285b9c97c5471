//! Rule data model and iptables invocation builders
//!
//! Everything here is pure: functions compose argument vectors, they never
//! run anything. The [`Reconciler`](crate::core::reconcile::Reconciler)
//! decides when and against which [`Stack`] an invocation runs.
//!
//! # Baseline rules
//!
//! ```text
//! iptables -I INPUT --protocol udp --sport 53 -j NFQUEUE --queue-num 0 --queue-bypass
//! iptables -I OUTPUT -t mangle -m conntrack --ctstate NEW,RELATED -j NFQUEUE --queue-num 0 --queue-bypass
//! iptables -A OUTPUT -m mark --mark 101285 -j DROP
//! ```
//!
//! # System chains
//!
//! A configured [`Rule`] lives in its own chain, `fwsentry-filter-<chain>`,
//! jumped to from the top of `<chain>`.

use crate::core::chains::ChainKey;
use serde::{Deserialize, Serialize};

/// Mark placed on denied connections by the decision engine.
/// Packets carrying it are dropped on the OUTPUT chain.
pub const DROP_MARK: u32 = 0x18BA5;

/// Prefix of every chain created for a system rule.
pub const SYSTEM_CHAIN_PREFIX: &str = "fwsentry-filter";

/// Table used when a rule leaves `Table` empty.
pub const DEFAULT_TABLE: &str = "filter";

/// Decision queue used when none is given at startup.
pub const DEFAULT_QUEUE_NUM: u16 = 0;

/// Protocol stack an invocation is run against. Ordered the way invocations run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::AsRefStr,
)]
pub enum Stack {
    #[strum(serialize = "iptables")]
    Ipv4,
    #[strum(serialize = "ip6tables")]
    Ipv6,
}

impl Stack {
    /// Name of the binary driving this stack
    pub const fn binary(self) -> &'static str {
        match self {
            Stack::Ipv4 => "iptables",
            Stack::Ipv6 => "ip6tables",
        }
    }
}

/// The modifier placed in front of a rule specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Action {
    #[strum(serialize = "-A")]
    Add,
    #[strum(serialize = "-I")]
    Insert,
    #[strum(serialize = "-D")]
    Delete,
    #[strum(serialize = "-F")]
    Flush,
    #[strum(serialize = "-N")]
    NewChain,
    #[strum(serialize = "-X")]
    DelChain,
    #[strum(serialize = "-C")]
    Check,
}

/// A desired packet-filter directive read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub table: String,
    pub chain: String,
    #[serde(default)]
    pub parameters: String,
    pub target: String,
    #[serde(default)]
    pub target_parameters: String,
}

impl Rule {
    /// Table this rule applies to, falling back to [`DEFAULT_TABLE`].
    pub fn table(&self) -> &str {
        if self.table.is_empty() {
            DEFAULT_TABLE
        } else {
            &self.table
        }
    }

    /// Name of the custom chain holding this rule.
    pub fn chain_name(&self) -> String {
        format!("{SYSTEM_CHAIN_PREFIX}-{}", self.chain)
    }

    /// Registry identity of this rule's custom chain.
    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.table(), self.chain_name())
    }
}

/// A configured rule plus its enable/disable intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemRule {
    pub rule: Rule,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The three rules that are always present while the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum BaselineRule {
    #[strum(serialize = "dns-redirect")]
    DnsRedirect,
    #[strum(serialize = "connection-redirect")]
    ConnectionRedirect,
    #[strum(serialize = "drop-marked")]
    DropMarked,
}

impl BaselineRule {
    /// Install order.
    pub const ALL: [BaselineRule; 3] = [
        BaselineRule::DnsRedirect,
        BaselineRule::ConnectionRedirect,
        BaselineRule::DropMarked,
    ];

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether the controller can operate without this rule.
    ///
    /// DNS responses only feed the domain cache, so a missing DNS redirect
    /// degrades the decision engine but leaves interception intact.
    pub const fn is_critical(self) -> bool {
        !matches!(self, BaselineRule::DnsRedirect)
    }

    /// Action used when installing the rule.
    pub const fn install_action(self) -> Action {
        match self {
            BaselineRule::DnsRedirect | BaselineRule::ConnectionRedirect => Action::Insert,
            BaselineRule::DropMarked => Action::Add,
        }
    }

    /// Rule specification, without the leading action.
    pub fn args(self, queue_num: u16) -> Vec<String> {
        match self {
            BaselineRule::DnsRedirect => dns_redirect(queue_num),
            BaselineRule::ConnectionRedirect => connection_redirect(queue_num),
            BaselineRule::DropMarked => drop_marked(),
        }
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// `INPUT --protocol udp --sport 53 -j NFQUEUE --queue-num N --queue-bypass`
pub fn dns_redirect(queue_num: u16) -> Vec<String> {
    let queue = queue_num.to_string();
    owned(&[
        "INPUT",
        "--protocol",
        "udp",
        "--sport",
        "53",
        "-j",
        "NFQUEUE",
        "--queue-num",
        &queue,
        "--queue-bypass",
    ])
}

/// `OUTPUT -t mangle -m conntrack --ctstate NEW,RELATED -j NFQUEUE --queue-num N --queue-bypass`
pub fn connection_redirect(queue_num: u16) -> Vec<String> {
    let queue = queue_num.to_string();
    owned(&[
        "OUTPUT",
        "-t",
        "mangle",
        "-m",
        "conntrack",
        "--ctstate",
        "NEW,RELATED",
        "-j",
        "NFQUEUE",
        "--queue-num",
        &queue,
        "--queue-bypass",
    ])
}

/// `OUTPUT -m mark --mark 101285 -j DROP`
pub fn drop_marked() -> Vec<String> {
    let mark = DROP_MARK.to_string();
    owned(&["OUTPUT", "-m", "mark", "--mark", &mark, "-j", "DROP"])
}

/// Arguments naming the rule's custom chain: `<chain_name> -t <table>`.
/// Used with `-N`, `-F` and `-X`.
pub fn system_chain(rule: &Rule) -> Vec<String> {
    vec![rule.chain_name(), "-t".into(), rule.table().into()]
}

/// Jump from the parent chain into the custom chain: `<chain> -t <table> -j <chain_name>`.
pub fn system_chain_jump(rule: &Rule) -> Vec<String> {
    vec![
        rule.chain.clone(),
        "-t".into(),
        rule.table().into(),
        "-j".into(),
        rule.chain_name(),
    ]
}

/// The rule's own specification inside its custom chain.
pub fn system_rule(rule: &Rule) -> Vec<String> {
    let mut args = system_chain(rule);
    args.extend(rule.parameters.split_whitespace().map(String::from));
    args.push("-j".into());
    args.push(rule.target.clone());
    args.extend(rule.target_parameters.split_whitespace().map(String::from));
    args
}
