//! Object manager configuration.
//!
//! Configuration can be built in code with [`ObjectManagerBuilder`] or
//! loaded from TOML:
//!
//! ```
//! use horizon_observer::ObjectManagerConfig;
//!
//! let config = ObjectManagerConfig::from_toml_str(r#"
//! global_pool_name = "Pool"
//! export_version = 1
//! "#).unwrap();
//! assert_eq!(config.global_pool_name, "Pool");
//! ```

use horizon_observer_core::{ExportOptions, ExportVersion};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::manager::ObjectManager;

/// Default name of the global object pool context.
pub const DEFAULT_GLOBAL_POOL_NAME: &str = "Global Object Pool";

/// Configuration for an [`ObjectManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectManagerConfig {
    /// Name of the global object pool context.
    pub global_pool_name: String,
    /// Producer version written into property exports.
    pub producer_version: String,
    /// Export format version used for property exports.
    pub export_version: u32,
    /// Check after every detach that no multi-context entry of the context
    /// was left behind. Violations are logged as errors.
    pub verify_context_invariants: bool,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            global_pool_name: DEFAULT_GLOBAL_POOL_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            export_version: ExportVersion::CURRENT.as_u32(),
            verify_context_invariants: cfg!(debug_assertions),
        }
    }
}

impl ObjectManagerConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.export_options()?;
        Ok(config)
    }

    /// Export options for property exports, validating the configured version.
    pub fn export_options(&self) -> Result<ExportOptions, ConfigError> {
        let version = ExportVersion::from_u32(self.export_version)
            .map_err(|_| ConfigError::UnsupportedExportVersion(self.export_version))?;
        Ok(ExportOptions {
            version,
            producer_version: self.producer_version.clone(),
        })
    }
}

/// Builder for creating an [`ObjectManager`] with custom configuration.
#[derive(Debug, Default)]
pub struct ObjectManagerBuilder {
    config: ObjectManagerConfig,
}

impl ObjectManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name of the global object pool context.
    pub fn global_pool_name(mut self, name: impl Into<String>) -> Self {
        self.config.global_pool_name = name.into();
        self
    }

    /// Set the producer version written into exports.
    pub fn producer_version(mut self, version: impl Into<String>) -> Self {
        self.config.producer_version = version.into();
        self
    }

    pub fn export_version(mut self, version: ExportVersion) -> Self {
        self.config.export_version = version.as_u32();
        self
    }

    pub fn verify_context_invariants(mut self, verify: bool) -> Self {
        self.config.verify_context_invariants = verify;
        self
    }

    pub fn build(self) -> ObjectManager {
        ObjectManager::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = ObjectManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ObjectManagerConfig::default());
        assert_eq!(config.export_options().unwrap().version, ExportVersion::V2);
    }

    #[test]
    fn test_unsupported_export_version() {
        let err = ObjectManagerConfig::from_toml_str("export_version = 9").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedExportVersion(9)));
    }

    #[test]
    fn test_parse_error() {
        let err = ObjectManagerConfig::from_toml_str("export_version = \"two\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_builder() {
        let manager = ObjectManagerBuilder::new()
            .global_pool_name("Everything")
            .export_version(ExportVersion::V1)
            .producer_version("9.9")
            .build();
        assert_eq!(manager.global_pool().name(), "Everything");
        let options = manager.config().export_options().unwrap();
        assert_eq!(options.version, ExportVersion::V1);
        assert_eq!(options.producer_version, "9.9");
    }
}
