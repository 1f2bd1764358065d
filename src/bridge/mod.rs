//! Engine-facing decision bridge.
//!
//! Every hook the web engine raises lands here, is turned into a call on the
//! [`MessageChannel`](crate::channel::MessageChannel) and resolved once the
//! decision authority answers.
//!
//! # Submodules
//!
//! - [`session`] - per-page decision state and the session registry
//! - [`handle`] - single-use decision tokens wrapping engine handlers
//! - [`navigation`] - URL override policy and OS intent launching
//! - [`auth`] - HTTP-auth, TLS trust and client-certificate challenges
//! - [`credentials`] - stored HTTP-auth credentials
//! - [`resource`] - custom-scheme serving and content blocking
//! - [`safe_browsing`] - safe-browsing interstitial decisions
//! - [`lifecycle`] - page start/finish/error tracking and script injection
//! - [`client`] - the [`WebViewBridge`] facade tying it all together

pub mod auth;
pub mod client;
pub mod credentials;
pub mod handle;
pub mod lifecycle;
pub mod navigation;
pub mod resource;
pub mod safe_browsing;
pub mod scripts;
pub mod session;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use auth::{
    AuthChallengeCoordinator, ClientCertAction, HttpAuthAction, KeyLoadError, KeyLoader, KeyMaterial,
    ServerTrustAction, ServerTrustChallenge, SslErrorKind, UnsupportedKeyLoader,
};
pub use client::{BridgeCollaborators, WebViewBridge};
pub use credentials::{Credential, CredentialStore, CredentialStoreError, InMemoryCredentialStore, ProtectionSpace};
pub use handle::{
    ClientCertDecision, ClientCertHandler, DecisionKind, HttpAuthDecision, HttpAuthHandler, PendingDecision,
    SafeBrowsingDecision, SafeBrowsingHandler, ServerTrustDecision, ServerTrustHandler,
};
pub use lifecycle::{status_text, CookieFlusher, PageLifecycle, ScriptHost};
pub use navigation::{ExternalLauncher, LaunchError, LaunchIntent, NavigationDecision, NavigationPolicy};
pub use resource::{HostBlockList, ResourceInterceptor, RuleMatchError, RuleMatcher, WebResourceResponse};
pub use safe_browsing::{SafeBrowsingAction, SafeBrowsingCoordinator, ThreatType};
pub use session::{DecisionState, SessionContext, SessionError, SessionOptions, SessionRegistry};

/// Decodes an authority response into `T`. Absent or mismatched shapes
/// yield `None`, which every caller maps to its safe action.
pub(crate) fn parse_response<T: DeserializeOwned>(response: Option<&Value>) -> Option<T> {
    let response = response?;
    match serde_json::from_value(response.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!("Ignoring malformed authority response: {}", e);
            None
        }
    }
}
