//! Navigation policy: decides how a URL is handled before the engine loads it.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::bridge::session::SessionContext;
use crate::channel::MessageChannel;

pub const METHOD_SHOULD_OVERRIDE_URL_LOADING: &str = "shouldOverrideUrlLoading";

const VIEW_SCHEMES: &[&str] = &["geo:", "mailto:", "market:", "intent:"];

/// What the engine should do with a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    /// The URL was handed to the operating system.
    Intercepted,
    /// The authority (or a failed launch) owns the navigation; do not load.
    Delegated,
    /// Not ours: the engine proceeds with its normal load.
    HandledExternally,
}

impl NavigationDecision {
    /// Value for the engine's "override URL loading" callback.
    pub fn overrides_loading(self) -> bool {
        !matches!(self, Self::HandledExternally)
    }
}

/// Intent handed to the operating system's activity launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchIntent {
    /// Open the dialer for a `tel:` URI.
    Dial { uri: String },
    /// Generic view intent (`geo:`, `mailto:`, `market:`, `intent:`).
    View { uri: String },
    /// Compose a message to `address`, optionally prefilled with `body`.
    Sms { address: String, body: Option<String> },
}

impl LaunchIntent {
    /// Classifies `url` by scheme. `None` for schemes the OS does not take.
    pub fn classify(url: &str) -> Option<Self> {
        if strip_scheme(url, "tel:").is_some() {
            return Some(Self::Dial { uri: url.to_string() });
        }
        if VIEW_SCHEMES.iter().any(|scheme| strip_scheme(url, scheme).is_some()) {
            return Some(Self::View { uri: url.to_string() });
        }
        // sms:5551212?body=This is the message
        let rest = strip_scheme(url, "sms:")?;
        let (address, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };
        let body = query.and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "body")
                .map(|(_, value)| value.into_owned())
        });
        Some(Self::Sms {
            address: address.to_string(),
            body,
        })
    }
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = url.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &url[scheme.len()..])
}

/// Errors reported by the operating system launcher.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No application can handle {0}")]
    NoHandler(String),

    #[error("Launch failed: {0}")]
    Failed(String),
}

/// Host operating system facility that starts external activities.
pub trait ExternalLauncher: Send + Sync {
    fn launch(&self, intent: &LaunchIntent) -> Result<(), LaunchError>;
}

/// Decides URL handling before the engine fetches anything.
pub struct NavigationPolicy {
    channel: Arc<dyn MessageChannel>,
    launcher: Arc<dyn ExternalLauncher>,
}

impl NavigationPolicy {
    pub fn new(channel: Arc<dyn MessageChannel>, launcher: Arc<dyn ExternalLauncher>) -> Self {
        Self { channel, launcher }
    }

    pub fn decide(&self, session: &SessionContext, url: &str) -> NavigationDecision {
        if session.options().use_should_override_url_loading {
            let mut payload = session.base_payload();
            payload.insert("url".into(), Value::from(url));
            self.channel.invoke(METHOD_SHOULD_OVERRIDE_URL_LOADING, payload);
            debug!("Delegated navigation to {} to the authority", url);
            return NavigationDecision::Delegated;
        }

        let Some(intent) = LaunchIntent::classify(url) else {
            return NavigationDecision::HandledExternally;
        };

        match self.launcher.launch(&intent) {
            Ok(()) => {
                info!("Launched external handler for {}", url);
                NavigationDecision::Intercepted
            }
            Err(e) => {
                error!("Error launching {}: {}", url, e);
                NavigationDecision::Delegated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tel() {
        assert_eq!(
            LaunchIntent::classify("tel:5551234"),
            Some(LaunchIntent::Dial {
                uri: "tel:5551234".into()
            })
        );
    }

    #[test]
    fn test_classify_view_schemes() {
        for url in [
            "geo:37.78,-122.41",
            "mailto:someone@example.com",
            "market://details?id=app",
            "intent://scan/#Intent;end",
        ] {
            assert_eq!(LaunchIntent::classify(url), Some(LaunchIntent::View { uri: url.into() }));
        }
    }

    #[test]
    fn test_classify_sms_with_body() {
        assert_eq!(
            LaunchIntent::classify("sms:5551234?body=hi"),
            Some(LaunchIntent::Sms {
                address: "5551234".into(),
                body: Some("hi".into()),
            })
        );
        assert_eq!(
            LaunchIntent::classify("sms:5551234?body=see%20you+soon"),
            Some(LaunchIntent::Sms {
                address: "5551234".into(),
                body: Some("see you soon".into()),
            })
        );
    }

    #[test]
    fn test_classify_sms_without_body() {
        assert_eq!(
            LaunchIntent::classify("sms:5551234"),
            Some(LaunchIntent::Sms {
                address: "5551234".into(),
                body: None,
            })
        );
        assert_eq!(
            LaunchIntent::classify("sms:5551234?subject=x"),
            Some(LaunchIntent::Sms {
                address: "5551234".into(),
                body: None,
            })
        );
    }

    #[test]
    fn test_classify_ignores_web_urls() {
        assert_eq!(LaunchIntent::classify("https://example.com"), None);
        assert_eq!(LaunchIntent::classify("te"), None);
        assert_eq!(
            LaunchIntent::classify("TEL:123"),
            Some(LaunchIntent::Dial { uri: "TEL:123".into() })
        );
    }

    #[test]
    fn test_overrides_loading() {
        assert!(NavigationDecision::Intercepted.overrides_loading());
        assert!(NavigationDecision::Delegated.overrides_loading());
        assert!(!NavigationDecision::HandledExternally.overrides_loading());
    }
}
