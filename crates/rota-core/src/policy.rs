use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::config::{ActionDefaults, ActionsConfig};

/// Resolved timeout / retry settings for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPolicy {
    pub max_retry: u32,
    pub timeout_seconds: u64,
    pub hard_timeout_seconds: u64,
}

impl ActionPolicy {
    fn resolve(
        max_retry: u32,
        timeout_seconds: u64,
        hard_timeout_seconds: Option<u64>,
    ) -> Self {
        let derived = timeout_seconds.saturating_mul(u64::from(max_retry) + 1);
        Self {
            max_retry,
            timeout_seconds,
            hard_timeout_seconds: hard_timeout_seconds.unwrap_or(derived),
        }
    }

    /// Soft deadline length for one processing attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Ceiling on total processing time, counted from the first claim.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_seconds)
    }
}

impl From<&ActionDefaults> for ActionPolicy {
    fn from(d: &ActionDefaults) -> Self {
        Self::resolve(d.max_retry, d.timeout_seconds, d.hard_timeout_seconds)
    }
}

/// Immutable action-name → policy table, built once at process start.
#[derive(Debug, Clone)]
pub struct ActionPolicies {
    default: ActionPolicy,
    overrides: HashMap<String, ActionPolicy>,
}

impl ActionPolicies {
    pub fn from_config(config: &ActionsConfig) -> Self {
        let defaults = &config.default;
        let overrides = config
            .overrides
            .iter()
            .map(|(action, o)| {
                let policy = ActionPolicy::resolve(
                    o.max_retry.unwrap_or(defaults.max_retry),
                    o.timeout_seconds.unwrap_or(defaults.timeout_seconds),
                    o.hard_timeout_seconds.or(defaults.hard_timeout_seconds),
                );
                debug!(%action, ?policy, "action override registered");
                (action.clone(), policy)
            })
            .collect();

        Self {
            default: ActionPolicy::from(defaults),
            overrides,
        }
    }

    /// Policy for `action`, falling back to the default for unknown names.
    pub fn policy(&self, action: &str) -> &ActionPolicy {
        self.overrides.get(action).unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &ActionPolicy {
        &self.default
    }
}

impl Default for ActionPolicies {
    fn default() -> Self {
        Self::from_config(&ActionsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionOverride;

    #[test]
    fn unknown_action_uses_default() {
        let policies = ActionPolicies::default();
        let p = policies.policy("anything");
        assert_eq!(p.max_retry, 1);
        assert_eq!(p.timeout_seconds, 60);
        assert_eq!(p.hard_timeout_seconds, 120);
    }

    #[test]
    fn override_inherits_unset_fields() {
        let mut config = ActionsConfig::default();
        config.overrides.insert(
            "snapshot".to_string(),
            ActionOverride {
                timeout_seconds: Some(3600),
                ..Default::default()
            },
        );
        let policies = ActionPolicies::from_config(&config);

        let snap = policies.policy("snapshot");
        assert_eq!(snap.timeout_seconds, 3600);
        assert_eq!(snap.max_retry, 1);
        assert_eq!(snap.hard_timeout(), Duration::from_secs(7200));
        assert_eq!(policies.policy("backup"), policies.default_policy());
    }

    #[test]
    fn explicit_hard_timeout_wins() {
        let mut config = ActionsConfig::default();
        config.default.hard_timeout_seconds = Some(900);
        let policies = ActionPolicies::from_config(&config);
        assert_eq!(policies.default_policy().hard_timeout_seconds, 900);
    }
}
