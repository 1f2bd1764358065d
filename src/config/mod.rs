//! Configuration for the decision bridge.
//!
//! - Loading settings from files (TOML/JSON)
//! - Environment variable overrides (`WEBVIEW_BRIDGE_*`)
//! - CLI argument overrides
//! - Validation and defaults
//!
//! # Example
//!
//! ```rust,no_run
//! use webview_bridge::config::BridgeSettings;
//!
//! let settings = BridgeSettings::from_file("bridge.toml").unwrap();
//! let settings = settings.merge_with_env();
//! ```

mod settings;

pub use settings::{BridgeSettings, CliArgs, ConfigError};
