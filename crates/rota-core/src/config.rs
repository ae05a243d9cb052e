use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRY: u32 = 1;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_LIMIT_MAX: u32 = 1000;
pub const DEFAULT_MATERIALIZER_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_IDLE_INTERVAL_SECS: u64 = 5;

/// Top-level config (rota.toml + ROTA_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tick cadence of the background loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_materializer_interval")]
    pub materializer_interval_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            materializer_interval_secs: DEFAULT_MATERIALIZER_INTERVAL_SECS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
        }
    }
}

/// Page size policy for list operations.
///
/// A client may ask for any limit; anything above `limit_max` is clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_limit")]
    pub limit_default: u32,
    #[serde(default = "default_limit_max")]
    pub limit_max: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            limit_default: DEFAULT_LIMIT,
            limit_max: DEFAULT_LIMIT_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay between two polls of an external operation.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Back-off after a claim attempt found nothing to do.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            idle_interval_secs: DEFAULT_IDLE_INTERVAL_SECS,
        }
    }
}

/// Default per-action settings plus named overrides.
///
/// ```toml
/// [actions.default]
/// max_retry = 1
/// timeout_seconds = 60
///
/// [actions.overrides.snapshot]
/// timeout_seconds = 3600
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub default: ActionDefaults,
    #[serde(default)]
    pub overrides: HashMap<String, ActionOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefaults {
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Absolute ceiling for a job's total processing time, measured from its
    /// first claim. Derived from `timeout_seconds * (max_retry + 1)` when unset.
    #[serde(default)]
    pub hard_timeout_seconds: Option<u64>,
}

impl Default for ActionDefaults {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            hard_timeout_seconds: None,
        }
    }
}

/// Per-action override; every unset field inherits from [`ActionDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOverride {
    pub max_retry: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub hard_timeout_seconds: Option<u64>,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rota/rota.db", home)
}
fn default_materializer_interval() -> u64 {
    DEFAULT_MATERIALIZER_INTERVAL_SECS
}
fn default_reaper_interval() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}
fn default_limit() -> u32 {
    DEFAULT_LIMIT
}
fn default_limit_max() -> u32 {
    DEFAULT_LIMIT_MAX
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_idle_interval() -> u64 {
    DEFAULT_IDLE_INTERVAL_SECS
}
fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}
fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl RotaConfig {
    /// Load config from a TOML file with ROTA_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `ROTA_ACTIONS__DEFAULT__TIMEOUT_SECONDS=120`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: Self = Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::RotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour. Every loop period must be
    /// positive.
    pub fn validate(&self) -> crate::error::Result<()> {
        let periods = [
            ("scheduler.materializer_interval_secs", self.scheduler.materializer_interval_secs),
            ("scheduler.reaper_interval_secs", self.scheduler.reaper_interval_secs),
            ("worker.poll_interval_secs", self.worker.poll_interval_secs),
            ("worker.idle_interval_secs", self.worker.idle_interval_secs),
        ];
        for (key, secs) in periods {
            if secs == 0 {
                return Err(crate::error::RotaError::Config(format!("{key} must be at least 1")));
            }
        }
        Ok(())
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(RotaConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ROTA_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rota/rota.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = RotaConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.actions.default.max_retry, 1);
            assert_eq!(config.actions.default.timeout_seconds, 60);
            assert_eq!(config.pagination.limit_max, 1000);
            assert!(config.actions.overrides.is_empty());
            Ok(())
        });
    }

    #[test]
    fn zero_interval_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "rota.toml",
                r#"
                [scheduler]
                reaper_interval_secs = 0
                "#,
            )?;
            let err = RotaConfig::load(Some("rota.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            assert!(err.to_string().contains("scheduler.reaper_interval_secs"));

            jail.create_file("rota.toml", "")?;
            jail.set_env("ROTA_WORKER__POLL_INTERVAL_SECS", "0");
            let err = RotaConfig::load(Some("rota.toml")).unwrap_err();
            assert!(err.to_string().contains("worker.poll_interval_secs"));
            Ok(())
        });
    }

    #[test]
    fn overrides_from_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "rota.toml",
                r#"
                [actions.default]
                timeout_seconds = 120

                [actions.overrides.snapshot]
                timeout_seconds = 3600
                "#,
            )?;
            jail.set_env("ROTA_ACTIONS__OVERRIDES__SNAPSHOT__MAX_RETRY", "3");
            jail.set_env("ROTA_PAGINATION__LIMIT_MAX", "50");

            let config = RotaConfig::load(Some("rota.toml")).unwrap();
            assert_eq!(config.actions.default.timeout_seconds, 120);
            let snapshot = &config.actions.overrides["snapshot"];
            assert_eq!(snapshot.timeout_seconds, Some(3600));
            assert_eq!(snapshot.max_retry, Some(3));
            assert_eq!(config.pagination.limit_max, 50);
            Ok(())
        });
    }
}
