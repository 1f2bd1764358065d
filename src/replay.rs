//! Scripted decision authority and engine event replay.
//!
//! An authority script holds canned answers keyed by method name plus a list
//! of engine events. [`ScriptedAuthority`] answers channel requests from the
//! script; [`Replayer`] pushes the events through a [`WebViewBridge`] and
//! reports what the engine was told to do for each one.
//!
//! ```toml
//! [responses.onReceivedHttpAuthRequest]
//! action = 1
//! username = "user"
//! password = "secret"
//!
//! [[events]]
//! type = "http_auth"
//! page_url = "https://example.com/"
//! host = "example.com"
//! realm = "admin"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::auth::{KeyMaterial, ServerTrustChallenge};
use crate::bridge::client::WebViewBridge;
use crate::bridge::handle::{
    ClientCertHandler, HttpAuthHandler, PendingDecision, SafeBrowsingHandler, ServerTrustHandler,
};
use crate::bridge::lifecycle::{CookieFlusher, ScriptCallback, ScriptHost};
use crate::bridge::navigation::{ExternalLauncher, LaunchError, LaunchIntent};
use crate::bridge::session::{SessionContext, SessionError};
use crate::channel::{ChannelOutcome, InterruptToken, Payload};

/// Errors raised while loading or replaying an authority script.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read authority script: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML authority script: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON authority script: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported authority script format: {0}")]
    UnsupportedFormat(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Canned application error for a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// One engine hook to replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Navigate {
        url: String,
    },
    PageStarted {
        url: String,
    },
    PageFinished {
        url: String,
    },
    PageError {
        url: String,
        code: i32,
        description: String,
    },
    HttpError {
        url: String,
        status_code: u16,
    },
    HttpAuth {
        page_url: Option<String>,
        host: String,
        realm: Option<String>,
    },
    ServerTrust {
        url: String,
        primary_error: i32,
        /// Base64 DER certificate.
        certificate: Option<String>,
    },
    ClientCert {
        page_url: Option<String>,
        host: String,
        port: Option<u16>,
    },
    SafeBrowsingHit {
        url: String,
        threat_type: i32,
    },
    Resource {
        url: String,
        scheme: String,
    },
    ScaleChanged {
        old_scale: f32,
        new_scale: f32,
    },
}

impl ReplayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::PageStarted { .. } => "page_started",
            Self::PageFinished { .. } => "page_finished",
            Self::PageError { .. } => "page_error",
            Self::HttpError { .. } => "http_error",
            Self::HttpAuth { .. } => "http_auth",
            Self::ServerTrust { .. } => "server_trust",
            Self::ClientCert { .. } => "client_cert",
            Self::SafeBrowsingHit { .. } => "safe_browsing_hit",
            Self::Resource { .. } => "resource",
            Self::ScaleChanged { .. } => "scale_changed",
        }
    }
}

/// Canned authority answers plus the events to replay against them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorityScript {
    /// Successful answers keyed by method name.
    #[serde(default)]
    pub responses: HashMap<String, Value>,

    /// Application errors keyed by method name.
    #[serde(default)]
    pub errors: HashMap<String, ScriptedError>,

    #[serde(default)]
    pub events: Vec<ReplayEvent>,
}

impl AuthorityScript {
    /// Loads a TOML or JSON script, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "toml" => Ok(toml::from_str(&content)?),
            "json" => Ok(serde_json::from_str(&content)?),
            ext => Err(ReplayError::UnsupportedFormat(ext.to_string())),
        }
    }
}

/// Authority that answers from an [`AuthorityScript`]. Methods without an
/// entry are reported as not implemented, which every coordinator treats
/// as its safe action.
#[derive(Clone, Default)]
pub struct ScriptedAuthority {
    responses: Arc<HashMap<String, Value>>,
    errors: Arc<HashMap<String, ScriptedError>>,
    received: Arc<Mutex<Vec<(String, Payload)>>>,
}

impl ScriptedAuthority {
    pub fn new(script: &AuthorityScript) -> Self {
        Self {
            responses: Arc::new(script.responses.clone()),
            errors: Arc::new(script.errors.clone()),
            received: Arc::default(),
        }
    }

    pub fn answer(&self, method: &str, payload: Payload) -> ChannelOutcome {
        debug!("Authority received {}: {:?}", method, payload);
        self.received.lock().push((method.to_string(), payload));

        if let Some(err) = self.errors.get(method) {
            return ChannelOutcome::error(err.code.clone(), err.message.clone());
        }
        match self.responses.get(method) {
            Some(response) => ChannelOutcome::success(response.clone()),
            None => ChannelOutcome::NotImplemented,
        }
    }

    /// Every call received so far, in arrival order.
    pub fn received(&self) -> Vec<(String, Payload)> {
        self.received.lock().clone()
    }
}

/// What the engine was told for one replayed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayRecord {
    pub event: String,
    pub decision: String,
}

impl std::fmt::Display for ReplayRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<18} {}", self.event, self.decision)
    }
}

type DecisionSender = mpsc::Sender<String>;

struct RecordingAuthHandler(DecisionSender);

impl HttpAuthHandler for RecordingAuthHandler {
    fn proceed(self: Box<Self>, username: &str, _password: &str) {
        let _ = self.0.send(format!("proceed as {}", username));
    }

    fn cancel(self: Box<Self>) {
        let _ = self.0.send("cancel".into());
    }
}

struct RecordingTrustHandler(DecisionSender);

impl ServerTrustHandler for RecordingTrustHandler {
    fn proceed(self: Box<Self>) {
        let _ = self.0.send("proceed".into());
    }

    fn cancel(self: Box<Self>) {
        let _ = self.0.send("cancel".into());
    }
}

struct RecordingCertHandler(DecisionSender);

impl ClientCertHandler for RecordingCertHandler {
    fn proceed(self: Box<Self>, material: KeyMaterial) {
        let _ = self
            .0
            .send(format!("proceed with {} certificate(s)", material.certificate_chain.len()));
    }

    fn ignore(self: Box<Self>) {
        let _ = self.0.send("ignore".into());
    }

    fn cancel(self: Box<Self>) {
        let _ = self.0.send("cancel".into());
    }
}

struct RecordingSafeBrowsingHandler(DecisionSender);

impl SafeBrowsingHandler for RecordingSafeBrowsingHandler {
    fn back_to_safety(self: Box<Self>, report: bool) {
        let _ = self.0.send(format!("back to safety (report: {})", report));
    }

    fn proceed(self: Box<Self>, report: bool) {
        let _ = self.0.send(format!("proceed (report: {})", report));
    }

    fn show_interstitial(self: Box<Self>, report: bool) {
        let _ = self.0.send(format!("show interstitial (report: {})", report));
    }
}

/// Launcher that logs intents instead of starting activities.
#[derive(Clone, Default)]
pub struct LoggingLauncher {
    launched: Arc<Mutex<Vec<LaunchIntent>>>,
}

impl LoggingLauncher {
    pub fn launched(&self) -> Vec<LaunchIntent> {
        self.launched.lock().clone()
    }
}

impl ExternalLauncher for LoggingLauncher {
    fn launch(&self, intent: &LaunchIntent) -> Result<(), LaunchError> {
        info!("Launching {:?}", intent);
        self.launched.lock().push(intent.clone());
        Ok(())
    }
}

/// Cookie flusher that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCookieFlusher;

impl CookieFlusher for LoggingCookieFlusher {
    fn flush(&self) {
        debug!("Flushing cookies");
    }
}

/// Script host that records injected scripts.
#[derive(Default)]
pub struct RecordingScriptHost {
    evaluation_callbacks: bool,
    scripts: Mutex<Vec<String>>,
}

impl RecordingScriptHost {
    pub fn new(evaluation_callbacks: bool) -> Self {
        Self {
            evaluation_callbacks,
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }
}

impl ScriptHost for RecordingScriptHost {
    fn supports_evaluation_callbacks(&self) -> bool {
        self.evaluation_callbacks
    }

    fn evaluate_script(&self, script: &str, on_complete: Option<ScriptCallback>) {
        self.scripts.lock().push(script.to_string());
        if let Some(on_complete) = on_complete {
            on_complete(None);
        }
    }

    fn load_javascript_url(&self, script: &str) {
        self.scripts.lock().push(format!("javascript:{}", script));
    }
}

/// Pushes replay events through a bridge, one session for the whole run.
pub struct Replayer {
    bridge: Arc<WebViewBridge>,
    session: Arc<SessionContext>,
    host: Arc<dyn ScriptHost>,
    decision_timeout: Duration,
}

impl Replayer {
    pub fn new(bridge: Arc<WebViewBridge>, host: Arc<dyn ScriptHost>, decision_timeout: Duration) -> Result<Self, ReplayError> {
        let session = bridge.open_session()?;
        Ok(Self {
            bridge,
            session,
            host,
            decision_timeout,
        })
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Replays `events` in order. Must not run on the channel's delivery
    /// thread: asynchronous decisions are awaited by blocking.
    pub fn run(&self, events: &[ReplayEvent]) -> Vec<ReplayRecord> {
        events
            .iter()
            .map(|event| ReplayRecord {
                event: event.name().to_string(),
                decision: self.replay(event),
            })
            .collect()
    }

    fn replay(&self, event: &ReplayEvent) -> String {
        let bridge = &self.bridge;
        let session = &self.session;

        match event {
            ReplayEvent::Navigate { url } => {
                format!("{:?}", bridge.should_override_url_loading(session, url))
            }
            ReplayEvent::PageStarted { url } => {
                bridge.on_page_started(session, url, &self.host);
                "notified".into()
            }
            ReplayEvent::PageFinished { url } => {
                bridge.on_page_finished(session, url, &self.host);
                "notified".into()
            }
            ReplayEvent::PageError { url, code, description } => {
                bridge.on_received_error(session, url, *code, description);
                "notified".into()
            }
            ReplayEvent::HttpError { url, status_code } => {
                bridge.on_received_http_error(session, url, *status_code);
                "notified".into()
            }
            ReplayEvent::HttpAuth { page_url, host, realm } => {
                let (tx, rx) = mpsc::channel();
                let decision = PendingDecision::new(Box::new(RecordingAuthHandler(tx)) as Box<dyn HttpAuthHandler>);
                bridge.on_http_auth_request(session, page_url.as_deref(), host, realm.as_deref(), decision);
                self.await_decision(&rx)
            }
            ReplayEvent::ServerTrust {
                url,
                primary_error,
                certificate,
            } => {
                let certificate_der = certificate.as_deref().and_then(|encoded| match BASE64.decode(encoded) {
                    Ok(der) => Some(der),
                    Err(e) => {
                        warn!("Ignoring invalid certificate in script: {}", e);
                        None
                    }
                });
                let challenge = ServerTrustChallenge {
                    url: url.clone(),
                    primary_error: *primary_error,
                    certificate_der,
                };
                let (tx, rx) = mpsc::channel();
                let decision = PendingDecision::new(Box::new(RecordingTrustHandler(tx)) as Box<dyn ServerTrustHandler>);
                bridge.on_server_trust_request(session, challenge, decision);
                self.await_decision(&rx)
            }
            ReplayEvent::ClientCert { page_url, host, port } => {
                let (tx, rx) = mpsc::channel();
                let decision = PendingDecision::new(Box::new(RecordingCertHandler(tx)) as Box<dyn ClientCertHandler>);
                bridge.on_client_cert_request(session, page_url.as_deref(), host, *port, decision);
                self.await_decision(&rx)
            }
            ReplayEvent::SafeBrowsingHit { url, threat_type } => {
                let (tx, rx) = mpsc::channel();
                let decision =
                    PendingDecision::new(Box::new(RecordingSafeBrowsingHandler(tx)) as Box<dyn SafeBrowsingHandler>);
                bridge.on_safe_browsing_hit(session, url, *threat_type, decision);
                self.await_decision(&rx)
            }
            ReplayEvent::Resource { url, scheme } => {
                match bridge.should_intercept_request(session, url, scheme, &InterruptToken::new()) {
                    Some(response) => format!(
                        "serve {} bytes ({})",
                        response.data.len(),
                        response.content_type.as_deref().unwrap_or("unknown type")
                    ),
                    None => "default handling".into(),
                }
            }
            ReplayEvent::ScaleChanged { old_scale, new_scale } => {
                bridge.on_scale_changed(session, *old_scale, *new_scale);
                format!("scale {}", session.scale())
            }
        }
    }

    fn await_decision(&self, rx: &mpsc::Receiver<String>) -> String {
        match rx.recv_timeout(self.decision_timeout) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("No decision within {:?}: {}", self.decision_timeout, e);
                "pending".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCRIPT: &str = r#"
[responses.onReceivedHttpAuthRequest]
action = 1
username = "user"
password = "secret"

[errors.onSafeBrowsingHit]
code = "E1"
message = "boom"

[[events]]
type = "navigate"
url = "tel:5551234"

[[events]]
type = "http_auth"
page_url = "https://example.com/"
host = "example.com"
realm = "admin"
"#;

    #[test]
    fn test_parse_toml_script() {
        let script: AuthorityScript = toml::from_str(SCRIPT).unwrap();
        assert_eq!(script.responses["onReceivedHttpAuthRequest"]["username"], json!("user"));
        assert_eq!(script.errors["onSafeBrowsingHit"].code, "E1");
        assert_eq!(
            script.events,
            vec![
                ReplayEvent::Navigate {
                    url: "tel:5551234".into()
                },
                ReplayEvent::HttpAuth {
                    page_url: Some("https://example.com/".into()),
                    host: "example.com".into(),
                    realm: Some("admin".into()),
                },
            ]
        );
    }

    #[test]
    fn test_scripted_authority_answers() {
        let script: AuthorityScript = toml::from_str(SCRIPT).unwrap();
        let authority = ScriptedAuthority::new(&script);

        assert!(authority.answer("onReceivedHttpAuthRequest", Payload::new()).is_success());
        assert_eq!(
            authority.answer("onSafeBrowsingHit", Payload::new()),
            ChannelOutcome::error("E1", "boom")
        );
        assert_eq!(
            authority.answer("onReceivedClientCertRequest", Payload::new()),
            ChannelOutcome::NotImplemented
        );
        assert_eq!(authority.received().len(), 3);
    }

    #[test]
    fn test_json_script_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.json");
        fs::write(
            &path,
            r#"{"events": [{"type": "resource", "url": "myapp://x", "scheme": "myapp"}]}"#,
        )
        .unwrap();

        let script = AuthorityScript::from_file(&path).unwrap();
        assert!(script.responses.is_empty());
        assert_eq!(script.events[0].name(), "resource");
    }

    #[test]
    fn test_recording_script_host_runs_callbacks() {
        let host = RecordingScriptHost::new(true);
        let (tx, rx) = mpsc::channel();
        host.evaluate_script("1", Some(Box::new(move |_| tx.send(()).unwrap())));
        host.load_javascript_url("2");
        assert!(rx.try_recv().is_ok());
        assert_eq!(host.scripts(), vec!["1".to_string(), "javascript:2".to_string()]);
    }
}
