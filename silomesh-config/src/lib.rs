//! Silo process configuration.
//!
//! Loading hierarchy `env > file > defaults`, grounded on
//! `knhk-config::config::load_config`; section-per-subsystem shape grounded
//! on `knhk-sidecar::config::SidecarConfig`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid env override {key}={value}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MembershipConfig {
    pub heartbeat_period_ms: u64,
    pub probe_period_ms: u64,
    pub suspicion_threshold_k: u32,
    pub suspicion_window_ms: u64,
    pub cleanup_defunct_after_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: 10_000,
            probe_period_ms: 10_000,
            suspicion_threshold_k: 3,
            suspicion_window_ms: 60_000,
            cleanup_defunct_after_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    pub response_timeout_ms: u64,
    pub system_response_timeout_ms: u64,
    pub max_retries: u32,
    pub sweeper_period_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 30_000,
            system_response_timeout_ms: 10_000,
            max_retries: 5,
            sweeper_period_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DirectoryConfig {
    pub cache_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { cache_capacity: 65_536 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TxnLockConfig {
    pub max_group_size: usize,
    pub default_group_deadline_ms: u64,
}

impl Default for TxnLockConfig {
    fn default() -> Self {
        Self {
            max_group_size: 32,
            default_group_deadline_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SiloConfig {
    pub cluster_id: String,
    pub bind_address: String,
    pub role: String,
    pub stateless_worker_cpu_multiplier: u32,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            cluster_id: "dev-cluster".to_string(),
            bind_address: "127.0.0.1:11111".to_string(),
            role: "default".to_string(),
            stateless_worker_cpu_multiplier: 8,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub silo: SiloConfig,
    pub membership: MembershipConfig,
    pub router: RouterConfig,
    pub directory: DirectoryConfig,
    pub txn_lock: TxnLockConfig,
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `SILOMESH_*` environment overrides on top of whatever was
    /// loaded from file/defaults. Unknown keys are ignored; malformed
    /// values for a known key return an error rather than silently using
    /// the old value.
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        macro_rules! override_u64 {
            ($env:expr, $field:expr) => {
                if let Ok(v) = std::env::var($env) {
                    $field = v.parse().map_err(|_| ConfigError::InvalidEnv {
                        key: $env.to_string(),
                        value: v.clone(),
                        reason: "expected an integer".to_string(),
                    })?;
                }
            };
        }
        macro_rules! override_u32 {
            ($env:expr, $field:expr) => {
                if let Ok(v) = std::env::var($env) {
                    $field = v.parse().map_err(|_| ConfigError::InvalidEnv {
                        key: $env.to_string(),
                        value: v.clone(),
                        reason: "expected an integer".to_string(),
                    })?;
                }
            };
        }

        if let Ok(v) = std::env::var("SILOMESH_CLUSTER_ID") {
            self.silo.cluster_id = v;
        }
        if let Ok(v) = std::env::var("SILOMESH_BIND_ADDRESS") {
            self.silo.bind_address = v;
        }
        override_u64!("SILOMESH_HEARTBEAT_PERIOD_MS", self.membership.heartbeat_period_ms);
        override_u64!("SILOMESH_PROBE_PERIOD_MS", self.membership.probe_period_ms);
        override_u32!(
            "SILOMESH_SUSPICION_THRESHOLD_K",
            self.membership.suspicion_threshold_k
        );
        override_u64!("SILOMESH_RESPONSE_TIMEOUT_MS", self.router.response_timeout_ms);
        override_u32!("SILOMESH_MAX_RETRIES", self.router.max_retries);
        override_u64!("SILOMESH_MAX_GROUP_SIZE_MS", self.txn_lock.default_group_deadline_ms);

        Ok(self)
    }

    /// `env > file > defaults`, per `knhk-config::config::load_config`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        base.apply_env_overrides()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.router.max_retries > 0);
        assert!(cfg.membership.suspicion_threshold_k > 0);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = RuntimeConfig::load(Some(Path::new("/nonexistent/silomesh.toml"))).unwrap();
        assert_eq!(cfg, RuntimeConfig::default().apply_env_overrides().unwrap());
    }

    #[test]
    fn env_override_wins_over_file_and_defaults() {
        std::env::set_var("SILOMESH_MAX_RETRIES", "11");
        let cfg = RuntimeConfig::default().apply_env_overrides().unwrap();
        assert_eq!(cfg.router.max_retries, 11);
        std::env::remove_var("SILOMESH_MAX_RETRIES");
    }

    #[test]
    fn invalid_env_value_is_an_error_not_a_silent_default() {
        std::env::set_var("SILOMESH_MAX_RETRIES", "not-a-number");
        let result = RuntimeConfig::default().apply_env_overrides();
        assert!(result.is_err());
        std::env::remove_var("SILOMESH_MAX_RETRIES");
    }
}
