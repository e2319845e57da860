//! Rate limit rules configuration and matching.
//!
//! A [`RuleSet`] holds three scopes of rules. Resolution walks them in
//! precedence order and the first match wins:
//!
//! 1. client rules, matched on the exact identity
//! 2. resource rules, matched exactly or by a trailing `*` prefix, in
//!    declaration order
//! 3. the default rule

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, trace};

use crate::error::{Result, TurnstileError};

/// Default permit limit when no rule is configured.
pub const DEFAULT_PERMIT_LIMIT: u64 = 100;
/// Default window when no rule is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Longest window a rule may use. Keeps window expiry representable in
/// timestamps and in Redis millisecond expiries.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
/// Trailing marker that turns a resource endpoint into a prefix match.
pub const WILDCARD: char = '*';

/// A quota: how many permits are granted per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Requests admitted per window
    pub permit_limit: u64,
    /// Window length, anchored at the first request
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    /// Advisory queue depth; carried for callers, not enforced here
    #[serde(default)]
    pub queue_limit: u32,
}

impl Rule {
    /// Create a rule with no queue.
    pub fn new(permit_limit: u64, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
            queue_limit: 0,
        }
    }

    /// Set the advisory queue limit.
    pub fn with_queue_limit(mut self, queue_limit: u32) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    /// Reject rules that could never admit anything or never expire.
    pub fn validate(&self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(TurnstileError::Config(
                "permit_limit must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(TurnstileError::Config(
                "window must be greater than zero".to_string(),
            ));
        }
        if self.window > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "window must be at most {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for Rule {
    fn default() -> Self {
        Self::new(DEFAULT_PERMIT_LIMIT, DEFAULT_WINDOW)
    }
}

/// A rule bound to one caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRule {
    /// Identity this rule applies to, compared exactly
    pub client_id: String,
    /// The quota for this client
    pub rate_limit: Rule,
}

/// A rule bound to a resource or a family of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Resource to match; a trailing `*` matches any resource with that prefix
    pub endpoint: String,
    /// The quota for this resource
    pub rate_limit: Rule,
}

impl ResourceRule {
    /// Whether this rule applies to `resource`.
    pub fn matches(&self, resource: &str) -> bool {
        match self.endpoint.strip_suffix(WILDCARD) {
            Some(prefix) => resource.starts_with(prefix),
            None => self.endpoint == resource,
        }
    }
}

/// Which scope supplied a resolved rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Client,
    Resource,
    Default,
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Client => write!(f, "client"),
            RuleScope::Resource => write!(f, "resource"),
            RuleScope::Default => write!(f, "default"),
        }
    }
}

/// The complete set of configured rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rule used when nothing more specific matches
    #[serde(default)]
    pub default_rule: Rule,
    /// Per-client overrides, checked first
    #[serde(default)]
    pub client_rules: Vec<ClientRule>,
    /// Per-resource overrides, checked in order
    #[serde(default)]
    pub resource_rules: Vec<ResourceRule>,
}

impl RuleSet {
    /// Create a rule set with only a default rule.
    pub fn new(default_rule: Rule) -> Self {
        Self {
            default_rule,
            client_rules: Vec::new(),
            resource_rules: Vec::new(),
        }
    }

    /// Append a client rule.
    pub fn with_client_rule(mut self, client_id: impl Into<String>, rule: Rule) -> Self {
        self.client_rules.push(ClientRule {
            client_id: client_id.into(),
            rate_limit: rule,
        });
        self
    }

    /// Append a resource rule.
    pub fn with_resource_rule(mut self, endpoint: impl Into<String>, rule: Rule) -> Self {
        self.resource_rules.push(ResourceRule {
            endpoint: endpoint.into(),
            rate_limit: rule,
        });
        self
    }

    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check every configured rule.
    pub fn validate(&self) -> Result<()> {
        self.default_rule
            .validate()
            .map_err(|e| TurnstileError::Config(format!("default rule: {}", e)))?;

        for client in &self.client_rules {
            client
                .rate_limit
                .validate()
                .map_err(|e| TurnstileError::Config(format!("client rule '{}': {}", client.client_id, e)))?;
        }

        for resource in &self.resource_rules {
            resource
                .rate_limit
                .validate()
                .map_err(|e| TurnstileError::Config(format!("resource rule '{}': {}", resource.endpoint, e)))?;
        }

        Ok(())
    }

    /// Find the rule that applies to an identity and resource.
    pub fn resolve(&self, identity: &str, resource: &str) -> Result<Rule> {
        let (scope, rule) = self.select(identity, resource);

        trace!(
            identity = %identity,
            resource = %resource,
            scope = %scope,
            permit_limit = rule.permit_limit,
            window = ?rule.window,
            "Resolved rate limit rule"
        );

        rule.validate()
            .map_err(|e| TurnstileError::Config(format!("{} rule for '{}': {}", scope, resource, e)))?;
        Ok(*rule)
    }

    /// Pick the first matching rule and the scope it came from.
    pub fn select(&self, identity: &str, resource: &str) -> (RuleScope, &Rule) {
        if let Some(client) = self.client_rules.iter().find(|c| c.client_id == identity) {
            return (RuleScope::Client, &client.rate_limit);
        }

        if let Some(res) = self.resource_rules.iter().find(|r| r.matches(resource)) {
            return (RuleScope::Resource, &res.rate_limit);
        }

        (RuleScope::Default, &self.default_rule)
    }
}

/// Serialize durations as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_minute(limit: u64) -> Rule {
        Rule::new(limit, Duration::from_secs(60))
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
default_rule:
  permit_limit: 100
  window_secs: 60
client_rules:
  - client_id: premium-key
    rate_limit:
      permit_limit: 1000
      window_secs: 60
      queue_limit: 10
resource_rules:
  - endpoint: "GET /api/orders"
    rate_limit:
      permit_limit: 5
      window_secs: 1
  - endpoint: "POST /api/*"
    rate_limit:
      permit_limit: 20
      window_secs: 30
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.default_rule, per_minute(100));
        assert_eq!(rules.client_rules.len(), 1);
        assert_eq!(rules.client_rules[0].rate_limit.queue_limit, 10);
        assert_eq!(rules.resource_rules.len(), 2);
        assert_eq!(rules.resource_rules[0].rate_limit.window, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_default_uses_builtin() {
        let rules = RuleSet::from_yaml("client_rules: []").unwrap();
        assert_eq!(rules.default_rule, Rule::default());
    }

    #[test]
    fn test_parse_rejects_zero_limit() {
        let yaml = r#"
default_rule:
  permit_limit: 0
  window_secs: 60
"#;
        let err = RuleSet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_client_rule_takes_precedence() {
        let rules = RuleSet::new(per_minute(100))
            .with_client_rule("vip", per_minute(1000))
            .with_resource_rule("GET /a", per_minute(5));

        assert_eq!(rules.resolve("vip", "GET /a").unwrap(), per_minute(1000));
        assert_eq!(rules.resolve("someone", "GET /a").unwrap(), per_minute(5));
        assert_eq!(rules.select("vip", "GET /a").0, RuleScope::Client);
    }

    #[test]
    fn test_client_match_is_exact() {
        let rules = RuleSet::new(per_minute(100)).with_client_rule("vip", per_minute(1000));

        assert_eq!(rules.select("VIP", "r").0, RuleScope::Default);
        assert_eq!(rules.select("vip2", "r").0, RuleScope::Default);
    }

    #[test]
    fn test_wildcard_resource_rule() {
        let rules = RuleSet::new(per_minute(100)).with_resource_rule("GET /api/*", per_minute(7));

        assert_eq!(rules.resolve("c", "GET /api/orders").unwrap(), per_minute(7));
        assert_eq!(rules.resolve("c", "GET /api/").unwrap(), per_minute(7));
        assert_eq!(rules.resolve("c", "GET /other").unwrap(), per_minute(100));
    }

    #[test]
    fn test_first_declared_resource_rule_wins() {
        let rules = RuleSet::new(per_minute(100))
            .with_resource_rule("GET /api/*", per_minute(7))
            .with_resource_rule("GET /api/orders", per_minute(3));

        assert_eq!(rules.resolve("c", "GET /api/orders").unwrap(), per_minute(7));

        let reordered = RuleSet::new(per_minute(100))
            .with_resource_rule("GET /api/orders", per_minute(3))
            .with_resource_rule("GET /api/*", per_minute(7));

        assert_eq!(reordered.resolve("c", "GET /api/orders").unwrap(), per_minute(3));
    }

    #[test]
    fn test_default_rule_fallback() {
        let rules = RuleSet::new(per_minute(42));
        let (scope, rule) = rules.select("anyone", "anything");

        assert_eq!(scope, RuleScope::Default);
        assert_eq!(*rule, per_minute(42));
    }

    #[test]
    fn test_resolve_rejects_invalid_rule() {
        let rules = RuleSet::new(per_minute(100))
            .with_resource_rule("GET /broken", Rule::new(5, Duration::ZERO));

        let err = rules.resolve("c", "GET /broken").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(rules.resolve("c", "GET /fine").is_ok());
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        assert!(Rule::new(1, MAX_WINDOW).validate().is_ok());

        for window in [MAX_WINDOW + Duration::from_secs(1), Duration::from_secs(u64::MAX), Duration::MAX] {
            let err = Rule::new(1, window).validate().unwrap_err();
            assert!(matches!(err, TurnstileError::Config(_)));
        }

        let yaml = format!("default_rule:\n  permit_limit: 1\n  window_secs: {}\n", u64::MAX);
        assert!(RuleSet::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_queue_limit_is_carried() {
        let rule = per_minute(10).with_queue_limit(4);
        assert_eq!(rule.queue_limit, 4);
        assert!(rule.validate().is_ok());
        assert_eq!(rule, Rule { queue_limit: 4, ..per_minute(10) });
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-rules-{}.yaml", std::process::id()));
        std::fs::write(&path, "default_rule:\n  permit_limit: 7\n  window_secs: 5\n").unwrap();

        let loaded = RuleSet::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.unwrap().default_rule, Rule::new(7, Duration::from_secs(5)));
        assert!(matches!(
            RuleSet::from_file("/nonexistent/turnstile-rules.yaml").unwrap_err(),
            TurnstileError::Io(_)
        ));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let rules = RuleSet::new(per_minute(100))
            .with_resource_rule("a*", per_minute(1))
            .with_resource_rule("ab*", per_minute(2));

        for _ in 0..10 {
            assert_eq!(rules.resolve("x", "abc").unwrap(), per_minute(1));
        }
    }
}
