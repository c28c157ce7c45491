//! Rate limit policies and the per-category policy registry.
//!
//! Policies are loaded once at start-up and never change afterwards, so the
//! registry is shared read-only between request handlers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Category for the high-traffic, low-cost read path.
pub const STANDARD_CATEGORY: &str = "standard";
/// Category for the low-traffic, expensive write path.
pub const EXPENSIVE_CATEGORY: &str = "expensive";

/// Longest window a policy may declare (one year).
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// How many requests a client may make to one category within a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Number of requests allowed inside the window
    pub max_requests: u32,
    /// Length of the trailing window in seconds
    pub window_secs: u64,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    pub fn new(max_requests: u32, window_secs: u64) -> Result<Self> {
        let policy = Self {
            max_requests,
            window_secs,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Both the request budget and the window must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TollgateError::Policy(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(TollgateError::Policy(
                "window_secs must be greater than zero".to_string(),
            ));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(TollgateError::Policy(format!(
                "window_secs must not exceed {}",
                MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The window as a signed span for timestamp arithmetic.
    pub(crate) fn window_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.min(MAX_WINDOW_SECS) as i64)
    }
}

/// Static mapping from endpoint category to its policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRegistry {
    /// Map of category name to policy
    #[serde(default)]
    pub categories: HashMap<String, RateLimitPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut categories = HashMap::new();
        categories.insert(
            STANDARD_CATEGORY.to_string(),
            RateLimitPolicy {
                max_requests: 100,
                window_secs: 60,
            },
        );
        categories.insert(
            EXPENSIVE_CATEGORY.to_string(),
            RateLimitPolicy {
                max_requests: 10,
                window_secs: 60,
            },
        );
        Self { categories }
    }
}

impl PolicyRegistry {
    /// Create a registry with no categories.
    pub fn empty() -> Self {
        Self {
            categories: HashMap::new(),
        }
    }

    /// Add or replace the policy for a category.
    pub fn with_policy(mut self, category: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.categories.insert(category.into(), policy);
        self
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string and validate every policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let registry: PolicyRegistry = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit policies: {}", e))
        })?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        for (category, policy) in &self.categories {
            if category.is_empty() {
                return Err(TollgateError::Policy(
                    "category names must not be empty".to_string(),
                ));
            }
            policy.validate().map_err(|e| match e {
                TollgateError::Policy(reason) => {
                    TollgateError::Policy(format!("category '{}': {}", category, reason))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Look up the policy for a category.
    pub fn get(&self, category: &str) -> Option<&RateLimitPolicy> {
        self.categories.get(category)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_two_tiers() {
        let registry = PolicyRegistry::default();
        let standard = registry.get(STANDARD_CATEGORY).unwrap();
        let expensive = registry.get(EXPENSIVE_CATEGORY).unwrap();

        assert!(standard.max_requests > expensive.max_requests);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_parse_policies() {
        let yaml = r#"
categories:
  search:
    max_requests: 60
    window_secs: 60
  run_tests:
    max_requests: 5
    window_secs: 300
"#;
        let registry = PolicyRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("run_tests"),
            Some(&RateLimitPolicy {
                max_requests: 5,
                window_secs: 300
            })
        );
        assert_eq!(registry.get("search").unwrap().window(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let yaml = r#"
categories:
  broken:
    max_requests: 0
    window_secs: 60
"#;
        let result = PolicyRegistry::from_yaml(yaml);
        assert!(matches!(result, Err(TollgateError::Policy(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(RateLimitPolicy::new(10, 0).is_err());
        assert!(RateLimitPolicy::new(10, 1).is_ok());
        assert!(RateLimitPolicy::new(10, MAX_WINDOW_SECS + 1).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let result = PolicyRegistry::from_yaml("categories: [not, a, map]");
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_unknown_category_has_no_policy() {
        let registry = PolicyRegistry::empty()
            .with_policy("login", RateLimitPolicy::new(3, 60).unwrap());
        assert!(registry.get("login").is_some());
        assert!(registry.get("logout").is_none());
    }
}
