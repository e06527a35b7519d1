// ============================================================================
// Host Configuration
// ============================================================================

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-wide configuration
///
/// Every field has a default so a partial JSON file is enough.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// User impulse-response directory (None = resolve from the environment)
    pub irs_dir: Option<PathBuf>,

    /// Packaged impulse-response directories (None = resolve from the environment)
    pub system_irs_dirs: Option<Vec<PathBuf>>,

    /// Community package searched for capture-path kernels
    pub community_package_input: Option<String>,

    /// Community package searched for render-path kernels
    pub community_package_output: Option<String>,

    /// Largest host period the realtime path preallocates for
    pub max_period: usize,

    /// Capacity of the worker queue
    pub worker_queue: usize,

    /// Connect polling attempts before giving up
    pub connect_retries: u32,

    /// Sleep between connect polling attempts
    pub connect_retry_interval_ms: u64,

    /// Capacity of the plugin event channel
    pub event_queue: usize,

    /// Plugin chain per direction
    pub input_plugins: Vec<PluginConfig>,
    pub output_plugins: Vec<PluginConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            irs_dir: None,
            system_irs_dirs: None,
            community_package_input: None,
            community_package_output: None,
            max_period: 8192,
            worker_queue: 64,
            connect_retries: 200,
            connect_retry_interval_ms: 5,
            event_queue: 256,
            input_plugins: Vec::new(),
            output_plugins: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HostConfig = serde_json::from_str(&text)?;
        log::debug!("loaded host config from {}", path.display());
        Ok(config)
    }

    /// Fill unset storage locations from the environment
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if self.irs_dir.is_none() {
            self.irs_dir = Some(rtfx_env::get_irs_dir()?);
        }
        if self.system_irs_dirs.is_none() {
            self.system_irs_dirs = Some(rtfx_env::system_irs_dirs());
        }
        Ok(self)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

/// One entry of a plugin chain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Plugin type identifier ("convolver", "filter", "echo_canceller", "gain")
    pub plugin_type: String,
    /// Stable tag, unique within a pipeline; defaults to the plugin type
    #[serde(default)]
    pub tag: Option<String>,
    /// Plugin parameters
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl PluginConfig {
    /// Create a new plugin config
    pub fn new(plugin_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            tag: None,
            parameters,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.plugin_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HostConfig = serde_json::from_str(r#"{ "max_period": 4096 }"#).unwrap();
        assert_eq!(config.max_period, 4096);
        assert_eq!(config.worker_queue, 64);
        assert!(config.irs_dir.is_none());
    }

    #[test]
    fn test_plugin_config_tag_defaults_to_type() {
        let json = r#"{ "plugin_type": "convolver", "parameters": { "kernel_name": "hall" } }"#;
        let config: PluginConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tag(), "convolver");
        assert_eq!(config.clone().with_tag("room").tag(), "room");
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = HostConfig::load(Path::new("/nonexistent/rtfx.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
