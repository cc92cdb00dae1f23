//! Configuration management for the resilience engine

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ErrorContext, GalleonError, Result};

/// Environment variable naming a configuration file
pub const CONFIG_ENV_VAR: &str = "GALLEON_RESILIENCE_CONFIG";

/// Main configuration for the resilience engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Worker pool sizes
    pub executors: ExecutorConfig,
    /// Metadata cache settings
    pub cache: CacheConfig,
    /// Scan scheduling
    pub scan: ScanConfig,
    /// Replication task settings
    pub replication: ReplicationConfig,
    /// Reduction task settings
    pub reduction: ReductionConfig,
    /// Activity registry settings
    pub activity: ActivityConfig,
}

/// Bounded worker pools, one per blocking-risk class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Short, cache-bound pool/group resolution
    pub pool_info_workers: usize,
    /// Namespace queries and pool scans
    pub namespace_workers: usize,
    /// Concurrent copy operations
    pub copy_workers: usize,
    /// Concurrent removal operations
    pub remove_workers: usize,
}

/// Metadata cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of pool -> group entries
    pub pool_info_ttl_seconds: u64,
    /// Lifetime of file attribute entries
    pub file_info_ttl_seconds: u64,
    /// Attempts for a failed upstream load before the caller gives up
    pub upstream_retries: u32,
    /// Delay between upstream attempts
    pub upstream_retry_delay_ms: u64,
}

/// Scan scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Run the periodic scanner at all
    pub periodic_enabled: bool,
    /// Interval between periodic passes
    pub period_seconds: u64,
    /// Wait after a DOWN transition before scanning the pool
    pub down_grace_period_seconds: u64,
    /// Wait after a RESTART transition before scanning the pool
    pub restart_grace_period_seconds: u64,
    /// Events arriving this soon after start are dropped
    pub startup_delay_seconds: u64,
}

/// Replication task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Expiry of the transient pin, a safety valve for crashed tasks
    pub sticky_ttl_seconds: u64,
    /// Bound on any single remote request to a pool
    pub request_timeout_seconds: u64,
}

/// Reduction task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// Extra attempts for a failed removal
    pub max_retries: u32,
}

/// Activity registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Default bound on listings
    pub default_list_limit: usize,
    /// How long issued correlation ids are remembered by the message guard
    pub correlation_retention_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_info_workers: 4,
            namespace_workers: 4,
            copy_workers: 8,
            remove_workers: 4,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_info_ttl_seconds: 60,
            file_info_ttl_seconds: 30,
            upstream_retries: 3,
            upstream_retry_delay_ms: 500,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            periodic_enabled: true,
            period_seconds: 24 * 60 * 60,
            down_grace_period_seconds: 60,
            restart_grace_period_seconds: 30,
            startup_delay_seconds: 30,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_seconds: 2 * 60 * 60,
            request_timeout_seconds: 60,
        }
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            default_list_limit: 100,
            correlation_retention_seconds: 10 * 60,
        }
    }
}

impl CacheConfig {
    pub fn pool_info_ttl(&self) -> Duration {
        Duration::from_secs(self.pool_info_ttl_seconds)
    }

    pub fn file_info_ttl(&self) -> Duration {
        Duration::from_secs(self.file_info_ttl_seconds)
    }

    pub fn upstream_retry_delay(&self) -> Duration {
        Duration::from_millis(self.upstream_retry_delay_ms)
    }
}

impl ScanConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    pub fn down_grace_period(&self) -> Duration {
        Duration::from_secs(self.down_grace_period_seconds)
    }

    pub fn restart_grace_period(&self) -> Duration {
        Duration::from_secs(self.restart_grace_period_seconds)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }
}

impl ReplicationConfig {
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl ActivityConfig {
    pub fn correlation_retention(&self) -> Duration {
        Duration::from_secs(self.correlation_retention_seconds)
    }
}

impl ResilienceConfig {
    /// Rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let executors = &self.executors;
        for (name, size) in [
            ("pool_info_workers", executors.pool_info_workers),
            ("namespace_workers", executors.namespace_workers),
            ("copy_workers", executors.copy_workers),
            ("remove_workers", executors.remove_workers),
        ] {
            crate::ensure!(size > 0, ConfigError, "executors.{} must be greater than zero", name);
        }
        crate::ensure!(
            self.cache.pool_info_ttl_seconds > 0 && self.cache.file_info_ttl_seconds > 0,
            ConfigError,
            "cache TTLs must be greater than zero"
        );
        crate::ensure!(
            self.cache.upstream_retries > 0,
            ConfigError,
            "cache.upstream_retries must be greater than zero"
        );
        crate::ensure!(
            self.scan.period_seconds > 0,
            ConfigError,
            "scan.period_seconds must be greater than zero"
        );
        crate::ensure!(
            self.replication.sticky_ttl_seconds > 0,
            ConfigError,
            "replication.sticky_ttl_seconds must be greater than zero"
        );
        crate::ensure!(
            self.replication.request_timeout_seconds > 0,
            ConfigError,
            "replication.request_timeout_seconds must be greater than zero"
        );
        crate::ensure!(
            self.activity.default_list_limit > 0,
            ConfigError,
            "activity.default_list_limit must be greater than zero"
        );
        Ok(())
    }

    /// Loads from `GALLEON_RESILIENCE_CONFIG` when set, defaults otherwise
    pub fn load() -> Result<Self> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            return ConfigLoader::load_from_file(Path::new(&config_path));
        }
        Ok(Self::default())
    }
}

/// Configuration loader utility
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from file
    pub fn load_from_file(path: &Path) -> Result<ResilienceConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::load_from_toml(&content)?,
            Some("yaml") | Some("yml") => Self::load_from_yaml(&content)?,
            Some("json") => Self::load_from_json(&content)?,
            _ => {
                return Err(GalleonError::ConfigError(
                    "Unsupported config file format".to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn load_from_toml(content: &str) -> Result<ResilienceConfig> {
        toml::from_str(content)
            .map_err(|e| GalleonError::ConfigError(format!("Failed to parse TOML config: {}", e)))
    }

    /// Load configuration from YAML string
    pub fn load_from_yaml(content: &str) -> Result<ResilienceConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| GalleonError::ConfigError(format!("Failed to parse YAML config: {}", e)))
    }

    /// Load configuration from JSON string
    pub fn load_from_json(content: &str) -> Result<ResilienceConfig> {
        serde_json::from_str(content)
            .map_err(|e| GalleonError::ConfigError(format!("Failed to parse JSON config: {}", e)))
    }

    /// Save configuration to file
    pub fn save_to_file(config: &ResilienceConfig, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::save_to_toml(config)?,
            Some("yaml") | Some("yml") => Self::save_to_yaml(config)?,
            Some("json") => Self::save_to_json(config)?,
            _ => {
                return Err(GalleonError::ConfigError(
                    "Unsupported config file format".to_string(),
                ))
            }
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Save configuration to TOML string
    pub fn save_to_toml(config: &ResilienceConfig) -> Result<String> {
        toml::to_string_pretty(config).map_err(|e| {
            GalleonError::ConfigError(format!("Failed to serialize TOML config: {}", e))
        })
    }

    /// Save configuration to YAML string
    pub fn save_to_yaml(config: &ResilienceConfig) -> Result<String> {
        serde_yaml::to_string(config).map_err(|e| {
            GalleonError::ConfigError(format!("Failed to serialize YAML config: {}", e))
        })
    }

    /// Save configuration to JSON string
    pub fn save_to_json(config: &ResilienceConfig) -> Result<String> {
        serde_json::to_string_pretty(config).map_err(|e| {
            GalleonError::ConfigError(format!("Failed to serialize JSON config: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.reduction.max_retries, 1);
        assert_eq!(config.executors.copy_workers, 8);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = ConfigLoader::load_from_toml(
            r#"
            [executors]
            copy_workers = 2

            [scan]
            down_grace_period_seconds = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.executors.copy_workers, 2);
        assert_eq!(config.executors.remove_workers, 4);
        assert_eq!(config.scan.down_grace_period(), Duration::from_secs(5));
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ResilienceConfig::default();
        config.executors.remove_workers = 0;
        assert!(matches!(config.validate(), Err(GalleonError::ConfigError(_))));
    }

    #[test]
    fn test_file_round_trip_per_format() {
        let dir = TempDir::new().unwrap();
        let mut config = ResilienceConfig::default();
        config.cache.file_info_ttl_seconds = 7;

        for name in ["resilience.toml", "resilience.yaml", "resilience.json"] {
            let path = dir.path().join(name);
            ConfigLoader::save_to_file(&config, &path).unwrap();
            let loaded = ConfigLoader::load_from_file(&path).unwrap();
            assert_eq!(loaded, config, "round trip through {}", name);
        }
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resilience.ini");
        std::fs::write(&path, "").unwrap();
        assert!(ConfigLoader::load_from_file(&path).is_err());
    }
}
