//! Storage key generation.
//!
//! A key has the shape `{namespace}:{identity}:{resource}`. Each component is
//! normalized so that it can never contain the `:` delimiter, which keeps keys
//! unambiguous and lets glob patterns target a single component.

use sha2::{Digest, Sha256};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "rl";

/// Longest normalized component kept verbatim; longer ones are digested.
pub const MAX_COMPONENT_LEN: usize = 64;

/// Sentinel for empty identities and resources.
pub const UNKNOWN_COMPONENT: &str = "unknown";

const DELIMITER: char = ':';
const SUBSTITUTE: char = '_';

/// Builds storage keys and reset patterns for (identity, resource) pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    namespace: String,
}

impl KeyBuilder {
    /// Create a key builder under the given namespace.
    pub fn new(namespace: &str) -> Self {
        let namespace = if namespace.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            normalize(namespace)
        };
        Self { namespace }
    }

    /// The normalized namespace tag.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Build the counter key for an identity and resource.
    pub fn build_key(&self, identity: &str, resource: &str) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.namespace,
            normalize(identity),
            normalize(resource),
            d = DELIMITER
        )
    }

    /// Glob pattern matching every key built for `identity`.
    pub fn build_client_pattern(&self, identity: &str) -> String {
        format!(
            "{}{d}{}{d}*",
            escape_glob(&self.namespace),
            escape_glob(&normalize(identity)),
            d = DELIMITER
        )
    }

    /// Glob pattern matching every key built for `resource`.
    pub fn build_resource_pattern(&self, resource: &str) -> String {
        format!(
            "{}{d}*{d}{}",
            escape_glob(&self.namespace),
            escape_glob(&normalize(resource)),
            d = DELIMITER
        )
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

fn is_reserved(c: char) -> bool {
    matches!(c, ':' | '/' | '\\' | '?' | '&' | '=' | '+') || c.is_whitespace()
}

/// Normalize one key component.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UNKNOWN_COMPONENT.to_string();
    }

    let normalized: String = trimmed
        .chars()
        .map(|c| if is_reserved(c) { SUBSTITUTE } else { c })
        .collect();

    if normalized.chars().count() > MAX_COMPONENT_LEN {
        hex::encode(Sha256::digest(trimmed.as_bytes()))
    } else {
        normalized
    }
}

/// Escape glob metacharacters so they match literally.
fn escape_glob(component: &str) -> String {
    let mut escaped = String::with_capacity(component.len());
    for c in component.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
