//! Validation of configured system rules
//!
//! Malformed entries are the configuration loader's problem, but the
//! reconciler still refuses to act on a rule that would produce a broken
//! invocation: empty chain or target, names iptables would reject, or
//! control characters smuggled into the argument tail.

use crate::core::error::{Error, Result};
use crate::core::rules::Rule;

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN - 1`).
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Strips characters that have no business in a log line.
///
/// Keeps ASCII alphanumerics and a small set of punctuation, capped at 64 chars.
pub fn sanitize_description(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/'))
        .take(64)
        .collect()
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::InvalidRule {
        field: field.to_string(),
        message: message.into(),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Validates a table name. Empty means the default table.
pub fn validate_table(name: &str) -> Result<()> {
    if !name.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(invalid("Table", format!("'{name}' is not a table name")));
    }
    Ok(())
}

/// Validates a chain or target name.
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if name.starts_with('-') {
        return Err(invalid(field, format!("'{name}' looks like an option")));
    }
    if !name.chars().all(is_name_char) {
        return Err(invalid(field, format!("'{name}' contains invalid characters")));
    }
    Ok(())
}

/// Validates a free-form argument tail (Parameters, TargetParameters).
///
/// Arguments are passed to iptables without a shell, so only control
/// characters are rejected.
pub fn validate_arguments(field: &str, args: &str) -> Result<()> {
    if args.chars().any(char::is_control) {
        return Err(invalid(field, "contains control characters"));
    }
    Ok(())
}

/// Checks that a rule can be turned into well-formed invocations.
pub fn validate_rule(rule: &Rule) -> Result<()> {
    validate_table(&rule.table)?;
    validate_name("Chain", &rule.chain)?;
    validate_name("Target", &rule.target)?;
    validate_arguments("Parameters", &rule.parameters)?;
    validate_arguments("TargetParameters", &rule.target_parameters)?;

    let chain_name = rule.chain_name();
    if chain_name.len() > MAX_CHAIN_NAME_LEN {
        return Err(invalid(
            "Chain",
            format!("derived chain '{chain_name}' exceeds {MAX_CHAIN_NAME_LEN} characters"),
        ));
    }
    Ok(())
}
