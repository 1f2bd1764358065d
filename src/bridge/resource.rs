//! Subresource interception: custom schemes served by the authority and
//! rule-based content blocking.
//!
//! [`ResourceInterceptor::intercept`] runs inside the engine's synchronous
//! fetch callback. For custom schemes it blocks the calling thread on a
//! correlated call; every failure collapses to `None`, which lets the
//! engine fall back to its default handling.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::bridge::parse_response;
use crate::bridge::session::SessionContext;
use crate::channel::{invoke_and_wait, InterruptToken, MessageChannel};

pub const METHOD_LOAD_RESOURCE_CUSTOM_SCHEME: &str = "onLoadResourceCustomScheme";

/// Response handed back to the engine in place of a network fetch.
#[derive(Clone, PartialEq, Eq)]
pub struct WebResourceResponse {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub data: Vec<u8>,
}

impl WebResourceResponse {
    pub fn new(content_type: Option<String>, content_encoding: Option<String>, data: Vec<u8>) -> Self {
        Self {
            content_type,
            content_encoding,
            data,
        }
    }

    /// Empty body, used to block a resource.
    pub fn empty(content_type: &str) -> Self {
        Self::new(Some(content_type.to_string()), None, Vec::new())
    }
}

impl std::fmt::Debug for WebResourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebResourceResponse")
            .field("content_type", &self.content_type)
            .field("content_encoding", &self.content_encoding)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Errors raised by a rule-matching backend.
#[derive(Debug, Error)]
pub enum RuleMatchError {
    #[error("Invalid URL for rule matching: {0}")]
    InvalidUrl(String),

    #[error("Rule evaluation failed: {0}")]
    Evaluation(String),
}

/// Content-blocking rule engine.
pub trait RuleMatcher: Send + Sync {
    /// Substitute response for `url`, or `None` when no rule applies.
    fn check_url(&self, url: &str, content_type: Option<&str>) -> Result<Option<WebResourceResponse>, RuleMatchError>;

    /// Number of active rules.
    fn rule_count(&self) -> usize;
}

/// Blocks every resource whose host is, or is a subdomain of, a listed host.
#[derive(Debug, Clone, Default)]
pub struct HostBlockList {
    hosts: Vec<String>,
}

impl HostBlockList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|host| normalize_host(host.as_ref()))
            .filter(|host| !host.is_empty())
            .collect();
        Self { hosts }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }
        self.hosts
            .iter()
            .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl RuleMatcher for HostBlockList {
    fn check_url(&self, url: &str, content_type: Option<&str>) -> Result<Option<WebResourceResponse>, RuleMatchError> {
        if self.hosts.is_empty() {
            return Ok(None);
        }
        let parsed = Url::parse(url).map_err(|e| RuleMatchError::InvalidUrl(format!("{url}: {e}")))?;
        let Some(host) = parsed.host_str() else {
            return Ok(None);
        };
        if !self.is_blocked(host) {
            return Ok(None);
        }
        debug!("Blocking {} by host rule", url);
        Ok(Some(WebResourceResponse::empty(content_type.unwrap_or("text/plain"))))
    }

    fn rule_count(&self) -> usize {
        self.hosts.len()
    }
}

#[derive(Deserialize)]
struct CustomSchemeResponse {
    #[serde(rename = "content-type")]
    content_type: Option<String>,
    #[serde(rename = "content-encoding")]
    content_encoding: Option<String>,
    base64data: Option<String>,
}

/// Answers the engine's synchronous subresource callback.
pub struct ResourceInterceptor {
    channel: Arc<dyn MessageChannel>,
    rules: Arc<dyn RuleMatcher>,
    wait_timeout: Option<Duration>,
}

impl ResourceInterceptor {
    /// `wait_timeout` bounds the custom-scheme wait; `None` waits until the
    /// authority answers or the engine interrupts.
    pub fn new(channel: Arc<dyn MessageChannel>, rules: Arc<dyn RuleMatcher>, wait_timeout: Option<Duration>) -> Self {
        Self {
            channel,
            rules,
            wait_timeout,
        }
    }

    pub fn intercept(
        &self,
        session: &SessionContext,
        url: &str,
        scheme: &str,
        interrupt: &InterruptToken,
    ) -> Option<WebResourceResponse> {
        if session.options().handles_custom_scheme(scheme) {
            let mut payload = session.base_payload();
            payload.insert("url".into(), Value::from(url));
            payload.insert("scheme".into(), Value::from(scheme));

            let waited = match invoke_and_wait(
                self.channel.as_ref(),
                METHOD_LOAD_RESOURCE_CUSTOM_SCHEME,
                payload,
                interrupt,
                self.wait_timeout,
            ) {
                Ok(waited) => waited,
                Err(e) => {
                    warn!("Custom scheme request for {} abandoned: {}", url, e);
                    return None;
                }
            };

            if let Some(err) = waited.error {
                error!("Custom scheme request for {} failed: {}", url, err);
                return None;
            }

            if let Some(result) = waited.result {
                return self.custom_scheme_response(url, &result);
            }
        }

        if self.rules.rule_count() > 0 {
            return self.check_rules(url, None);
        }

        None
    }

    fn custom_scheme_response(&self, url: &str, result: &Value) -> Option<WebResourceResponse> {
        let Some(response) = parse_response::<CustomSchemeResponse>(Some(result)) else {
            warn!("Malformed custom scheme response for {}", url);
            return None;
        };

        // Blocked content takes priority over the authority's body.
        if let Some(blocked) = self.check_rules(url, response.content_type.as_deref()) {
            return Some(blocked);
        }

        let encoded = response.base64data.unwrap_or_default();
        let cleaned: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        match BASE64.decode(cleaned.as_bytes()) {
            Ok(data) => Some(WebResourceResponse::new(
                response.content_type,
                response.content_encoding,
                data,
            )),
            Err(e) => {
                warn!("Invalid base64 body for {}: {}", url, e);
                None
            }
        }
    }

    fn check_rules(&self, url: &str, content_type: Option<&str>) -> Option<WebResourceResponse> {
        match self.rules.check_url(url, content_type) {
            Ok(response) => response,
            Err(e) => {
                warn!("Content blocker failed for {}: {}", url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_block_list_matches_subdomains() {
        let list = HostBlockList::new(["doubleclick.net", " Tracker.example. "]);
        assert_eq!(list.rule_count(), 2);
        assert!(list.is_blocked("ads.doubleclick.net"));
        assert!(list.is_blocked("tracker.example"));
        assert!(!list.is_blocked("notdoubleclick.net"));
        assert!(!list.is_blocked(""));
    }

    #[test]
    fn test_host_block_list_substitutes_empty_body() {
        let list = HostBlockList::new(["doubleclick.net"]);
        let blocked = list
            .check_url("https://ads.doubleclick.net/pixel.gif", Some("image/gif"))
            .unwrap()
            .unwrap();
        assert_eq!(blocked.content_type.as_deref(), Some("image/gif"));
        assert!(blocked.data.is_empty());

        assert!(list.check_url("https://example.com/", None).unwrap().is_none());
        assert!(list.check_url("not a url", None).is_err());
    }

    #[test]
    fn test_empty_block_list_never_fails() {
        let list = HostBlockList::default();
        assert!(list.check_url("not a url", None).unwrap().is_none());
    }
}
