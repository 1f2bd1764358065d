//! # webview-bridge
//!
//! Forwards a web engine's navigation, authentication, TLS trust,
//! client-certificate, safe-browsing and resource-interception decisions to
//! an external decision authority over an asynchronous message channel, and
//! applies the answers back to the engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webview_bridge::{
//!     bridge::{BridgeCollaborators, HostBlockList, InMemoryCredentialStore, UnsupportedKeyLoader, WebViewBridge},
//!     channel::{IpcChannel, MessageChannel},
//!     config::BridgeSettings,
//!     replay::{LoggingCookieFlusher, LoggingLauncher},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = BridgeSettings::default().with_custom_scheme("myapp");
//!     let channel: Arc<dyn MessageChannel> = Arc::new(IpcChannel::new(tokio::runtime::Handle::current()));
//!
//!     let bridge = WebViewBridge::new(&settings, channel, BridgeCollaborators {
//!         launcher: Arc::new(LoggingLauncher::default()),
//!         credentials: Arc::new(InMemoryCredentialStore::new()),
//!         key_loader: Arc::new(UnsupportedKeyLoader),
//!         rules: Arc::new(HostBlockList::default()),
//!         cookies: Arc::new(LoggingCookieFlusher),
//!     });
//!     let session = bridge.open_session()?;
//!     let decision = bridge.should_override_url_loading(&session, "tel:5551234");
//!     assert!(decision.overrides_loading());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`channel`]: message channel to the authority and correlated calls
//! - [`bridge`]: per-decision coordinators, sessions and the [`WebViewBridge`] facade
//! - [`config`]: configuration loading and management
//! - [`replay`]: scripted authority and engine event replay
//!
//! ## Configuration
//!
//! Configuration follows a precedence chain:
//! 1. Default values
//! 2. Configuration file (TOML/JSON)
//! 3. Environment variables (`WEBVIEW_BRIDGE_*`)
//! 4. CLI arguments
//!
//! See [`config::BridgeSettings`] for all available options.

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Full version string with name
pub const FULL_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Module Exports
// ============================================================================

/// Message channel to the decision authority.
pub mod channel;

/// Engine-facing decision coordinators and session state.
pub mod bridge;

/// Configuration management for loading settings from files, env, and CLI.
pub mod config;

/// Scripted authority and event replay used by the binary.
pub mod replay;

// ============================================================================
// Re-exports for Convenience
// ============================================================================

pub use bridge::{
    BridgeCollaborators, NavigationDecision, SessionContext, SessionOptions, WebResourceResponse, WebViewBridge,
};
pub use channel::{ChannelError, ChannelOutcome, IpcChannel, MessageChannel};
pub use config::{BridgeSettings, CliArgs, ConfigError};

// ============================================================================
// Prelude Module
// ============================================================================

/// Prelude module for convenient imports.
///
/// ```rust
/// use webview_bridge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bridge::{
        ClientCertDecision, HttpAuthDecision, NavigationDecision, PendingDecision, SafeBrowsingDecision,
        ServerTrustDecision, SessionContext, WebViewBridge,
    };
    pub use crate::channel::{AuthorityProcessor, ChannelOutcome, InterruptToken, IpcChannel, MessageChannel};
    pub use crate::config::{BridgeSettings, CliArgs};
    pub use crate::{FULL_VERSION, NAME, VERSION};
}
