use crate::core::rules::Stack;
use thiserror::Error;

/// Core error types for fwsentry
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables/ip6tables invocation failed
    #[error("{stack} error: {message}")]
    Execution {
        stack: Stack,
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },

    /// A baseline rule the controller cannot operate without failed to install.
    ///
    /// Never raised by the reconciler for anything but the connection-redirect
    /// and drop rules. The lifecycle layer escalates it to process termination.
    #[error("Fatal: could not install {rule} rule: {source}")]
    FatalInstall {
        rule: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A configured system rule is unusable
    #[error("Invalid rule, {field}: {message}")]
    InvalidRule { field: String, message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for errors the lifecycle layer must escalate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalInstall { .. })
    }

    /// Raw executor message, looking through a fatal wrapper.
    pub fn executor_message(&self) -> Option<&str> {
        match self {
            Error::Execution { message, .. } => Some(message),
            Error::FatalInstall { source, .. } => source.executor_message(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run fwsentry as root")
                .with_suggestion("Or grant the CAP_NET_ADMIN and CAP_NET_RAW capabilities");
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or point FWSENTRY_IPTABLES/FWSENTRY_IP6TABLES at the binaries");
        }

        // xtables lock held by another tool
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall manager may be modifying rules")
                .with_suggestion("Check for conflicting services: systemctl status firewalld ufw");
        }

        // Missing NFQUEUE/conntrack support
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Kernel is missing a required netfilter extension")
                .with_suggestion("Load the queue module: sudo modprobe nfnetlink_queue")
                .with_suggestion("Load conntrack support: sudo modprobe xt_conntrack")
                .with_suggestion("Check the configured target name for typos");
        }

        // Chain errors
        if lower.contains("chain") && (lower.contains("does not exist") || lower.contains("doesn't exist")) {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Check the Chain field of the system rule")
                .with_suggestion("Built-in chains are upper case: INPUT, OUTPUT, FORWARD");
        }

        // Table errors
        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("Valid tables: filter, nat, mangle, raw, security")
                .with_suggestion("Load the table module, e.g.: sudo modprobe iptable_mangle");
        }

        // Rule syntax
        if lower.contains("bad argument") || lower.contains("unknown option") || lower.contains("try `iptables -h'") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Check Parameters and TargetParameters for typos")
                .with_suggestion("Test the rule by hand with iptables before adding it");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -n -L")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
