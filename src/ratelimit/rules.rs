//! Rate limit rules configuration and matching.
//!
//! A rule binds an identifier prefix to a policy. Identifiers are matched
//! against the longest prefix; a rule without a prefix catches everything
//! else.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::algorithm::secs;
use super::fixed_window::WindowAlignment;
use crate::error::{Result, WardenError};

/// Named window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }
}

/// A window length, either a [`TimeUnit`] or a number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Unit(TimeUnit),
    Seconds(f64),
}

impl WindowSpec {
    pub fn duration(&self) -> Result<Duration> {
        match self {
            WindowSpec::Unit(unit) => Ok(Duration::from_secs(unit.as_secs())),
            WindowSpec::Seconds(secs) => Duration::try_from_secs_f64(*secs)
                .ok()
                .filter(|window| !window.is_zero())
                .ok_or_else(|| {
                    WardenError::Config(format!("window must be a positive duration, got {secs}"))
                }),
        }
    }
}

/// Strategy and parameters applied by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicyConfig {
    TokenBucket {
        capacity: u64,
        /// Tokens added per second
        refill_rate: f64,
    },
    LeakyBucket {
        capacity: u64,
        /// Units drained per second
        leak_rate: f64,
    },
    FixedWindow {
        limit: u64,
        window: WindowSpec,
        #[serde(default)]
        alignment: WindowAlignment,
    },
    SlidingLog {
        limit: u64,
        window: WindowSpec,
    },
    SlidingWindow {
        limit: u64,
        window: WindowSpec,
    },
    Concurrent {
        max_concurrent: u64,
    },
}

impl PolicyConfig {
    /// Name of the strategy, as used in the `algorithm` tag.
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            PolicyConfig::TokenBucket { .. } => "token_bucket",
            PolicyConfig::LeakyBucket { .. } => "leaky_bucket",
            PolicyConfig::FixedWindow { .. } => "fixed_window",
            PolicyConfig::SlidingLog { .. } => "sliding_log",
            PolicyConfig::SlidingWindow { .. } => "sliding_window",
            PolicyConfig::Concurrent { .. } => "concurrent",
        }
    }

    /// How long state keeps influencing decisions after its last write.
    /// `None` for concurrent policies, whose leases live until released.
    pub fn state_horizon(&self) -> Result<Option<Duration>> {
        let horizon = match self {
            PolicyConfig::TokenBucket {
                capacity,
                refill_rate,
            } => secs(*capacity as f64 / *refill_rate),
            PolicyConfig::LeakyBucket {
                capacity,
                leak_rate,
            } => secs(*capacity as f64 / *leak_rate),
            PolicyConfig::FixedWindow { window, .. } | PolicyConfig::SlidingLog { window, .. } => {
                window.duration()?
            }
            // The previous window still weighs in during the current one
            PolicyConfig::SlidingWindow { window, .. } => window.duration()? * 2,
            PolicyConfig::Concurrent { .. } => return Ok(None),
        };
        Ok(Some(horizon))
    }
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name, used in logs
    pub name: String,
    /// Identifier prefix this rule applies to (if not set, matches everything)
    #[serde(default)]
    pub prefix: Option<String>,
    /// The policy enforced for matching identifiers
    pub policy: PolicyConfig,
}

impl Rule {
    fn matches(&self, identifier: &str) -> bool {
        self.prefix
            .as_deref()
            .map_or(true, |prefix| identifier.starts_with(prefix))
    }

    fn specificity(&self) -> usize {
        self.prefix.as_deref().map_or(0, str::len)
    }
}

/// A complete set of rate limit rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RateLimitRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check names are unique and free of `:`, and that at most one rule
    /// claims each prefix.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() || rule.name.contains(':') {
                return Err(WardenError::Config(format!(
                    "rule name '{}' must be non-empty and must not contain ':'",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(WardenError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if !prefixes.insert(rule.prefix.as_deref()) {
                return Err(WardenError::Config(format!(
                    "rule '{}' repeats prefix {:?}",
                    rule.name, rule.prefix
                )));
            }
        }
        Ok(())
    }

    /// Find the rule with the longest prefix matching `identifier`.
    pub fn find_rule(&self, identifier: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(identifier))
            .max_by_key(|rule| rule.specificity())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
rules:
  - name: default
    policy:
      algorithm: token_bucket
      capacity: 100
      refill_rate: 10
  - name: login
    prefix: "login:"
    policy:
      algorithm: fixed_window
      limit: 5
      window: minute
  - name: login-admin
    prefix: "login:admin:"
    policy:
      algorithm: sliding_log
      limit: 2
      window: 30
  - name: uploads
    prefix: "upload:"
    policy:
      algorithm: concurrent
      max_concurrent: 3
"#;

    #[test]
    fn test_parse_rules() {
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.rules.len(), 4);
        assert_eq!(
            rules.rules[0].policy,
            PolicyConfig::TokenBucket {
                capacity: 100,
                refill_rate: 10.0
            }
        );
        assert_eq!(
            rules.rules[1].policy,
            PolicyConfig::FixedWindow {
                limit: 5,
                window: WindowSpec::Unit(TimeUnit::Minute),
                alignment: WindowAlignment::FirstRequest,
            }
        );
    }

    #[test]
    fn test_find_rule_longest_prefix() {
        let rules = RateLimitRules::from_yaml(RULES).unwrap();

        assert_eq!(rules.find_rule("login:admin:root").unwrap().name, "login-admin");
        assert_eq!(rules.find_rule("login:alice").unwrap().name, "login");
        assert_eq!(rules.find_rule("upload:bob").unwrap().name, "uploads");
        assert_eq!(rules.find_rule("api:carol").unwrap().name, "default");
    }

    #[test]
    fn test_find_rule_no_catch_all() {
        let yaml = r#"
rules:
  - name: login
    prefix: "login:"
    policy:
      algorithm: leaky_bucket
      capacity: 3
      leak_rate: 0.5
"#;
        let rules = RateLimitRules::from_yaml(yaml).unwrap();
        assert!(rules.find_rule("api:alice").is_none());
        assert!(rules.find_rule("login:alice").is_some());
    }

    #[test]
    fn test_window_spec_durations() {
        assert_eq!(
            WindowSpec::Unit(TimeUnit::Hour).duration().unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            WindowSpec::Seconds(0.5).duration().unwrap(),
            Duration::from_millis(500)
        );
        assert!(WindowSpec::Seconds(0.0).duration().is_err());
        assert!(WindowSpec::Seconds(-3.0).duration().is_err());
    }

    #[test]
    fn test_epoch_alignment_parsed() {
        let yaml = r#"
rules:
  - name: minute
    policy:
      algorithm: fixed_window
      limit: 10
      window: 60
      alignment: epoch
"#;
        let rules = RateLimitRules::from_yaml(yaml).unwrap();
        assert_eq!(
            rules.rules[0].policy,
            PolicyConfig::FixedWindow {
                limit: 10,
                window: WindowSpec::Seconds(60.0),
                alignment: WindowAlignment::Epoch,
            }
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
rules:
  - name: a
    prefix: "x:"
    policy: { algorithm: concurrent, max_concurrent: 1 }
  - name: a
    prefix: "y:"
    policy: { algorithm: concurrent, max_concurrent: 1 }
"#;
        assert!(matches!(
            RateLimitRules::from_yaml(yaml),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_prefixes_rejected() {
        let yaml = r#"
rules:
  - name: a
    policy: { algorithm: concurrent, max_concurrent: 1 }
  - name: b
    policy: { algorithm: concurrent, max_concurrent: 2 }
"#;
        assert!(RateLimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_colon_in_name_rejected() {
        let yaml = r#"
rules:
  - name: "login:admin"
    policy: { algorithm: concurrent, max_concurrent: 1 }
"#;
        assert!(RateLimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_state_horizon() {
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        let horizons: Vec<_> = rules
            .rules
            .iter()
            .map(|rule| rule.policy.state_horizon().unwrap())
            .collect();
        assert_eq!(
            horizons,
            vec![
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(60)),
                Some(Duration::from_secs(30)),
                None,
            ]
        );

        let sliding = PolicyConfig::SlidingWindow {
            limit: 5,
            window: WindowSpec::Unit(TimeUnit::Minute),
        };
        assert_eq!(sliding.state_horizon().unwrap(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let yaml = r#"
rules:
  - name: a
    policy: { algorithm: gcra, limit: 1 }
"#;
        assert!(RateLimitRules::from_yaml(yaml).is_err());
    }
}
