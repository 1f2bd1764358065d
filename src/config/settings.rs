//! Bridge settings and configuration management.
//!
//! Settings come from several sources, applied with the usual precedence:
//! defaults, then a configuration file, then environment variables, then
//! command line arguments.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    /// Failed to serialize TOML configuration.
    #[error("Failed to serialize TOML configuration: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    /// Failed to parse JSON configuration.
    #[error("Failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Unsupported file format.
    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

/// Main bridge settings.
///
/// # Example
///
/// ```rust
/// use webview_bridge::config::BridgeSettings;
///
/// let settings = BridgeSettings::default()
///     .with_custom_scheme("myapp")
///     .with_include_session_id(true);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Hand every navigation decision to the authority.
    #[serde(default)]
    pub use_should_override_url_loading: bool,

    /// Inject the resource observer script when a page starts.
    #[serde(default)]
    pub use_on_load_resource: bool,

    /// URL schemes whose subresources the authority serves.
    #[serde(default)]
    pub resource_custom_schemes: Vec<String>,

    /// Tag every outbound payload with the session id.
    #[serde(default)]
    pub include_session_id: bool,

    /// Whether the host can persist credentials securely.
    #[serde(default = "default_secure_storage_supported")]
    pub secure_storage_supported: bool,

    /// Upper bound on a custom-scheme wait in milliseconds (0 = wait until
    /// the authority answers or the request is interrupted).
    #[serde(default)]
    pub custom_scheme_timeout_ms: u64,

    /// Capacity of the outbound request queue.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Hosts whose subresources are answered with an empty body.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Maximum number of live sessions (0 = unlimited).
    #[serde(default)]
    pub max_sessions: usize,
}

// Default value functions for serde
fn default_secure_storage_supported() -> bool {
    true
}

fn default_channel_buffer_size() -> usize {
    256
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            use_should_override_url_loading: false,
            use_on_load_resource: false,
            resource_custom_schemes: Vec::new(),
            include_session_id: false,
            secure_storage_supported: default_secure_storage_supported(),
            custom_scheme_timeout_ms: 0,
            channel_buffer_size: default_channel_buffer_size(),
            blocked_hosts: Vec::new(),
            max_sessions: 0,
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl BridgeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from a TOML or JSON file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match file_extension(path).as_str() {
            "toml" => Ok(toml::from_str(&content)?),
            "json" => Ok(serde_json::from_str(&content)?),
            ext => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    /// Saves settings to a file; the format follows the extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match file_extension(path).as_str() {
            "toml" => toml::to_string_pretty(self)?,
            "json" => serde_json::to_string_pretty(self)?,
            ext => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };

        fs::write(path, content)?;
        Ok(())
    }

    /// Loads settings from `WEBVIEW_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("WEBVIEW_BRIDGE_USE_SHOULD_OVERRIDE_URL_LOADING") {
            self.use_should_override_url_loading = parse_bool(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_USE_ON_LOAD_RESOURCE") {
            self.use_on_load_resource = parse_bool(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_RESOURCE_CUSTOM_SCHEMES") {
            self.resource_custom_schemes = parse_list(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_INCLUDE_SESSION_ID") {
            self.include_session_id = parse_bool(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_SECURE_STORAGE_SUPPORTED") {
            self.secure_storage_supported = parse_bool(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_CUSTOM_SCHEME_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                self.custom_scheme_timeout_ms = timeout;
            }
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_CHANNEL_BUFFER_SIZE") {
            if let Ok(size) = val.parse() {
                self.channel_buffer_size = size;
            }
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_BLOCKED_HOSTS") {
            self.blocked_hosts = parse_list(&val);
        }

        if let Ok(val) = env::var("WEBVIEW_BRIDGE_MAX_SESSIONS") {
            if let Ok(max) = val.parse() {
                self.max_sessions = max;
            }
        }
    }

    pub fn merge_with_env(mut self) -> Self {
        self.apply_env_overrides();
        self
    }

    /// Applies command line overrides.
    ///
    /// ```rust
    /// use webview_bridge::config::{BridgeSettings, CliArgs};
    ///
    /// let args = CliArgs {
    ///     include_session_id: Some(true),
    ///     ..Default::default()
    /// };
    /// let settings = BridgeSettings::default().merge_with_args(&args);
    /// assert!(settings.include_session_id);
    /// ```
    pub fn merge_with_args(mut self, args: &CliArgs) -> Self {
        if let Some(value) = args.use_should_override_url_loading {
            self.use_should_override_url_loading = value;
        }
        if let Some(value) = args.use_on_load_resource {
            self.use_on_load_resource = value;
        }
        if let Some(ref schemes) = args.resource_custom_schemes {
            self.resource_custom_schemes = schemes.clone();
        }
        if let Some(value) = args.include_session_id {
            self.include_session_id = value;
        }
        if let Some(value) = args.secure_storage_supported {
            self.secure_storage_supported = value;
        }
        if let Some(timeout) = args.custom_scheme_timeout_ms {
            self.custom_scheme_timeout_ms = timeout;
        }
        if let Some(size) = args.channel_buffer_size {
            self.channel_buffer_size = size;
        }
        if let Some(ref hosts) = args.blocked_hosts {
            self.blocked_hosts = hosts.clone();
        }
        if let Some(max) = args.max_sessions {
            self.max_sessions = max;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "Channel buffer size must be at least 1".to_string(),
            ));
        }
        if self.channel_buffer_size > 65536 {
            return Err(ConfigError::ValidationError(
                "Channel buffer size cannot exceed 65536".to_string(),
            ));
        }

        if self.custom_scheme_timeout_ms > 300000 {
            return Err(ConfigError::ValidationError(
                "Custom scheme timeout cannot exceed 300000ms (5 minutes)".to_string(),
            ));
        }

        for scheme in &self.resource_custom_schemes {
            let valid = scheme
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
            if !valid {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid custom scheme: {:?}",
                    scheme
                )));
            }
        }

        if self.blocked_hosts.iter().any(|host| host.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "Blocked hosts cannot contain empty entries".to_string(),
            ));
        }

        Ok(())
    }

    /// Custom-scheme wait bound, `None` when waits are unbounded.
    pub fn custom_scheme_timeout(&self) -> Option<Duration> {
        (self.custom_scheme_timeout_ms > 0).then(|| Duration::from_millis(self.custom_scheme_timeout_ms))
    }

    // Builder-style methods

    pub fn with_should_override_url_loading(mut self, enabled: bool) -> Self {
        self.use_should_override_url_loading = enabled;
        self
    }

    pub fn with_on_load_resource(mut self, enabled: bool) -> Self {
        self.use_on_load_resource = enabled;
        self
    }

    pub fn with_custom_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.resource_custom_schemes.push(scheme.into());
        self
    }

    pub fn with_include_session_id(mut self, enabled: bool) -> Self {
        self.include_session_id = enabled;
        self
    }

    pub fn with_secure_storage(mut self, supported: bool) -> Self {
        self.secure_storage_supported = supported;
        self
    }

    pub fn with_custom_scheme_timeout(mut self, timeout_ms: u64) -> Self {
        self.custom_scheme_timeout_ms = timeout_ms;
        self
    }

    pub fn with_blocked_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.push(host.into());
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}

fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Command line overrides. All fields are optional so that only the flags
/// actually given replace file and environment values.
#[derive(Debug, Default, Clone)]
pub struct CliArgs {
    pub use_should_override_url_loading: Option<bool>,
    pub use_on_load_resource: Option<bool>,
    pub resource_custom_schemes: Option<Vec<String>>,
    pub include_session_id: Option<bool>,
    pub secure_storage_supported: Option<bool>,
    pub custom_scheme_timeout_ms: Option<u64>,
    pub channel_buffer_size: Option<usize>,
    pub blocked_hosts: Option<Vec<String>>,
    pub max_sessions: Option<usize>,
    /// Configuration file path.
    pub config_file: Option<PathBuf>,
}

impl CliArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the whole chain: file (if given), environment, then `self`.
    /// The result is validated.
    pub fn load_settings(&self) -> Result<BridgeSettings, ConfigError> {
        let mut settings = if let Some(ref config_file) = self.config_file {
            BridgeSettings::from_file(config_file)?
        } else {
            BridgeSettings::default()
        };

        settings = settings.merge_with_env();
        settings = settings.merge_with_args(self);
        settings.validate()?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert!(!settings.use_should_override_url_loading);
        assert!(!settings.use_on_load_resource);
        assert!(settings.resource_custom_schemes.is_empty());
        assert!(settings.secure_storage_supported);
        assert_eq!(settings.custom_scheme_timeout_ms, 0);
        assert_eq!(settings.channel_buffer_size, 256);
        assert!(settings.custom_scheme_timeout().is_none());
    }

    #[test]
    fn test_builder_methods() {
        let settings = BridgeSettings::default()
            .with_should_override_url_loading(true)
            .with_custom_scheme("myapp")
            .with_custom_scheme_timeout(1500)
            .with_blocked_host("ads.example")
            .with_max_sessions(4);

        assert!(settings.use_should_override_url_loading);
        assert_eq!(settings.resource_custom_schemes, vec!["myapp".to_string()]);
        assert_eq!(settings.custom_scheme_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.blocked_hosts, vec!["ads.example".to_string()]);
        assert_eq!(settings.max_sessions, 4);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = BridgeSettings::default();
        settings.channel_buffer_size = 0;
        assert!(settings.validate().is_err());

        let settings = BridgeSettings::default().with_custom_scheme("1bad");
        assert!(settings.validate().is_err());

        let settings = BridgeSettings::default().with_custom_scheme("my app");
        assert!(settings.validate().is_err());

        let settings = BridgeSettings::default().with_blocked_host("  ");
        assert!(settings.validate().is_err());

        let settings = BridgeSettings::default().with_custom_scheme("x-app+v1.2");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_cli_args_merge() {
        let args = CliArgs {
            resource_custom_schemes: Some(vec!["myapp".into()]),
            secure_storage_supported: Some(false),
            ..Default::default()
        };

        let settings = BridgeSettings::default().merge_with_args(&args);

        assert_eq!(settings.resource_custom_schemes, vec!["myapp".to_string()]);
        assert!(!settings.secure_storage_supported);
        assert_eq!(settings.channel_buffer_size, 256); // Unchanged
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        let settings = BridgeSettings::default()
            .with_custom_scheme("myapp")
            .with_include_session_id(true);

        settings.to_file(&path).unwrap();
        assert_eq!(BridgeSettings::from_file(&path).unwrap(), settings);
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"use_on_load_resource": true, "blocked_hosts": ["t.example"]}}"#).unwrap();

        let settings = BridgeSettings::from_file(file.path()).unwrap();
        assert!(settings.use_on_load_resource);
        assert_eq!(settings.blocked_hosts, vec!["t.example".to_string()]);
        assert_eq!(settings.channel_buffer_size, 256);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            BridgeSettings::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
    }
}
