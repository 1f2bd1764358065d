//! HTTP authentication, TLS trust and client-certificate challenges.
//!
//! Each challenge is forwarded to the decision authority as a correlated
//! call; the engine's handler token is resolved from the delivery thread
//! once the authority answers. Malformed answers, channel errors and
//! unimplemented methods all resolve to `cancel`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::bridge::credentials::{Credential, CredentialStore, ProtectionSpace};
use crate::bridge::handle::{ClientCertDecision, HttpAuthDecision, ServerTrustDecision};
use crate::bridge::parse_response;
use crate::bridge::session::SessionContext;
use crate::channel::{ChannelOutcome, CorrelatedCall, MessageChannel, Payload};

pub const METHOD_HTTP_AUTH: &str = "onReceivedHttpAuthRequest";
pub const METHOD_SERVER_TRUST: &str = "onReceivedServerTrustAuthRequest";
pub const METHOD_CLIENT_CERT: &str = "onReceivedClientCertRequest";

/// Key store type used when the authority does not name one.
pub const DEFAULT_KEY_STORE_TYPE: &str = "PKCS12";

/// Where a challenge comes from. Immutable for the life of the challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeContext {
    pub space: ProtectionSpace,
    pub session_id: Uuid,
}

impl ChallengeContext {
    fn new(session: &SessionContext, host: &str, url: &ParsedUrl, realm: Option<&str>) -> Self {
        Self {
            space: ProtectionSpace::new(host, url.url.scheme(), realm.map(str::to_string), url.port),
            session_id: session.id(),
        }
    }

    /// Writes host, protocol, realm and port into `payload`.
    /// A missing port is sent as `-1`.
    fn write_into(&self, payload: &mut Payload) {
        payload.insert("host".into(), Value::from(self.space.host.clone()));
        payload.insert("protocol".into(), Value::from(self.space.protocol.clone()));
        payload.insert(
            "realm".into(),
            self.space.realm.clone().map_or(Value::Null, Value::from),
        );
        payload.insert(
            "port".into(),
            Value::from(self.space.port.map_or(-1, i64::from)),
        );
    }
}

/// Primary TLS validation error, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslErrorKind {
    NotYetValid,
    Expired,
    HostnameMismatch,
    UntrustedAuthority,
    DateInvalid,
    Generic,
}

impl SslErrorKind {
    /// Maps the engine's numeric code; unknown codes are generic.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NotYetValid,
            1 => Self::Expired,
            2 => Self::HostnameMismatch,
            3 => Self::UntrustedAuthority,
            4 => Self::DateInvalid,
            _ => Self::Generic,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::NotYetValid => 0,
            Self::Expired => 1,
            Self::HostnameMismatch => 2,
            Self::UntrustedAuthority => 3,
            Self::DateInvalid => 4,
            Self::Generic => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NotYetValid => "not-yet-valid",
            Self::Expired => "expired",
            Self::HostnameMismatch => "hostname-mismatch",
            Self::UntrustedAuthority => "untrusted-authority",
            Self::DateInvalid => "date-invalid",
            Self::Generic => "generic",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NotYetValid => "The certificate is not yet valid",
            Self::Expired => "The certificate has expired",
            Self::HostnameMismatch => "Hostname mismatch",
            Self::UntrustedAuthority => "The certificate authority is not trusted",
            Self::DateInvalid => "The date of the certificate is invalid",
            Self::Generic => "A generic error occurred",
        }
    }
}

/// TLS failure reported by the engine for one request.
#[derive(Debug, Clone)]
pub struct ServerTrustChallenge {
    pub url: String,
    pub primary_error: i32,
    /// Peer certificate in DER encoding, when the engine could extract it.
    pub certificate_der: Option<Vec<u8>>,
}

/// Authority answer to an HTTP-auth challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuthAction {
    Cancel,
    Proceed {
        credential: Credential,
        permanent_persistence: bool,
    },
    UseStoredCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpAuthResponse {
    action: Option<i64>,
    username: Option<String>,
    password: Option<String>,
    permanent_persistence: Option<bool>,
}

impl HttpAuthAction {
    pub fn from_response(response: Option<&Value>) -> Self {
        let Some(response) = parse_response::<HttpAuthResponse>(response) else {
            return Self::Cancel;
        };
        match (response.action, response.username, response.password) {
            (Some(1), Some(username), Some(password)) => Self::Proceed {
                credential: Credential::new(username, password),
                permanent_persistence: response.permanent_persistence.unwrap_or(false),
            },
            (Some(2), _, _) => Self::UseStoredCredentials,
            _ => Self::Cancel,
        }
    }
}

/// Authority answer to a TLS trust challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTrustAction {
    Cancel,
    Proceed,
}

#[derive(Deserialize)]
struct ActionResponse {
    action: Option<i64>,
}

impl ServerTrustAction {
    pub fn from_response(response: Option<&Value>) -> Self {
        match parse_response::<ActionResponse>(response).and_then(|r| r.action) {
            Some(1) => Self::Proceed,
            _ => Self::Cancel,
        }
    }
}

/// Authority answer to a client-certificate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCertAction {
    Cancel,
    Proceed {
        certificate_path: String,
        certificate_password: String,
        key_store_type: String,
    },
    Ignore,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCertResponse {
    action: Option<i64>,
    certificate_path: Option<String>,
    certificate_password: Option<String>,
    #[serde(alias = "androidKeyStoreType")]
    key_store_type: Option<String>,
}

impl ClientCertAction {
    pub fn from_response(response: Option<&Value>) -> Self {
        let Some(response) = parse_response::<ClientCertResponse>(response) else {
            return Self::Cancel;
        };
        match (response.action, response.certificate_path) {
            (Some(1), Some(certificate_path)) => Self::Proceed {
                certificate_path,
                certificate_password: response.certificate_password.unwrap_or_default(),
                key_store_type: response
                    .key_store_type
                    .unwrap_or_else(|| DEFAULT_KEY_STORE_TYPE.to_string()),
            },
            (Some(2), _) => Self::Ignore,
            _ => Self::Cancel,
        }
    }
}

/// Private key in DER encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKeyDer(pub Vec<u8>);

impl std::fmt::Debug for PrivateKeyDer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKeyDer({} bytes)", self.0.len())
    }
}

/// Certificate in DER encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDer(pub Vec<u8>);

/// Key and chain handed to the engine for client authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub private_key: PrivateKeyDer,
    pub certificate_chain: Vec<CertificateDer>,
}

/// Errors raised while loading client key material.
#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("Failed to read key store {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode key store: {0}")]
    Decode(String),

    #[error("Unsupported key store type: {0}")]
    UnsupportedStoreType(String),
}

/// Loads a private key and certificate chain from a named key store.
pub trait KeyLoader: Send + Sync {
    fn load(&self, path: &str, password: &str, store_type: &str) -> Result<KeyMaterial, KeyLoadError>;
}

/// Key loader for deployments without client-certificate support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedKeyLoader;

impl KeyLoader for UnsupportedKeyLoader {
    fn load(&self, _path: &str, _password: &str, store_type: &str) -> Result<KeyMaterial, KeyLoadError> {
        Err(KeyLoadError::UnsupportedStoreType(store_type.to_string()))
    }
}

/// Coordinates HTTP-auth, TLS trust and client-certificate decisions.
pub struct AuthChallengeCoordinator {
    channel: Arc<dyn MessageChannel>,
    credentials: Arc<dyn CredentialStore>,
    key_loader: Arc<dyn KeyLoader>,
    secure_storage_supported: bool,
}

impl AuthChallengeCoordinator {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        credentials: Arc<dyn CredentialStore>,
        key_loader: Arc<dyn KeyLoader>,
        secure_storage_supported: bool,
    ) -> Self {
        Self {
            channel,
            credentials,
            key_loader,
            secure_storage_supported,
        }
    }

    /// Forwards an HTTP-auth challenge for `host`/`realm` on the page at
    /// `page_url`. Returns the issued call, or `None` when the challenge was
    /// cancelled without asking the authority.
    pub fn on_http_auth_request(
        &self,
        session: &Arc<SessionContext>,
        page_url: Option<&str>,
        host: &str,
        realm: Option<&str>,
        decision: HttpAuthDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        let Some(url) = parse_url(page_url) else {
            warn!("Cancelling HTTP auth for {}: page URL unavailable", host);
            session.reset_decision_state();
            decision.cancel();
            return None;
        };

        let context = ChallengeContext::new(session, host, &url, realm);
        let failure_count = session.record_auth_challenge();

        let mut payload = session.base_payload();
        context.write_into(&mut payload);
        payload.insert("previousFailureCount".into(), Value::from(failure_count));

        debug!("HTTP auth challenge #{} for {:?}", failure_count, context.space);

        let resolution = HttpAuthResolution {
            session: Arc::clone(session),
            context,
            credentials: Arc::clone(&self.credentials),
            secure_storage_supported: self.secure_storage_supported,
        };

        Some(CorrelatedCall::issue(
            self.channel.as_ref(),
            METHOD_HTTP_AUTH,
            payload,
            move |outcome| resolution.apply(outcome, decision),
        ))
    }

    /// Forwards a TLS trust failure. Never persisted, never retried here.
    pub fn on_server_trust_request(
        &self,
        session: &Arc<SessionContext>,
        challenge: ServerTrustChallenge,
        decision: ServerTrustDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        let Some(url) = parse_url(Some(&challenge.url)) else {
            warn!("Cancelling server trust request: unparseable URL {}", challenge.url);
            decision.cancel();
            return None;
        };

        let host = url.url.host_str().unwrap_or_default().to_string();
        let context = ChallengeContext::new(session, &host, &url, None);
        let kind = SslErrorKind::from_code(challenge.primary_error);

        let mut payload = session.base_payload();
        context.write_into(&mut payload);
        payload.insert("error".into(), Value::from(challenge.primary_error));
        payload.insert(
            "serverCertificate".into(),
            challenge
                .certificate_der
                .as_deref()
                .map_or(Value::Null, |der| Value::from(BASE64.encode(der))),
        );
        payload.insert("message".into(), Value::from(kind.message()));

        debug!("Server trust challenge for {} ({})", host, kind.label());

        Some(CorrelatedCall::issue(
            self.channel.as_ref(),
            METHOD_SERVER_TRUST,
            payload,
            move |outcome| {
                let action = match outcome {
                    ChannelOutcome::Success(response) => ServerTrustAction::from_response(response.as_ref()),
                    ChannelOutcome::Error { code, message, .. } => {
                        error!("Server trust decision failed: {}, {}", code, message);
                        ServerTrustAction::Cancel
                    }
                    ChannelOutcome::NotImplemented => ServerTrustAction::Cancel,
                };
                match action {
                    ServerTrustAction::Proceed => {
                        info!("Authority trusted certificate for {}", host);
                        decision.proceed();
                    }
                    ServerTrustAction::Cancel => decision.cancel(),
                }
            },
        ))
    }

    /// Forwards a client-certificate request from `host:port` on the page
    /// at `page_url`.
    pub fn on_client_cert_request(
        &self,
        session: &Arc<SessionContext>,
        page_url: Option<&str>,
        host: &str,
        port: Option<u16>,
        decision: ClientCertDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        let Some(url) = parse_url(page_url) else {
            warn!("Cancelling client certificate request for {}: page URL unavailable", host);
            decision.cancel();
            return None;
        };

        let context = ChallengeContext {
            space: ProtectionSpace::new(host, url.url.scheme(), None, port),
            session_id: session.id(),
        };

        let mut payload = session.base_payload();
        context.write_into(&mut payload);

        let key_loader = Arc::clone(&self.key_loader);

        Some(CorrelatedCall::issue(
            self.channel.as_ref(),
            METHOD_CLIENT_CERT,
            payload,
            move |outcome| {
                let action = match outcome {
                    ChannelOutcome::Success(response) => ClientCertAction::from_response(response.as_ref()),
                    ChannelOutcome::Error { code, message, .. } => {
                        error!("Client certificate decision failed: {}, {}", code, message);
                        ClientCertAction::Cancel
                    }
                    ChannelOutcome::NotImplemented => ClientCertAction::Cancel,
                };
                match action {
                    ClientCertAction::Proceed {
                        certificate_path,
                        certificate_password,
                        key_store_type,
                    } => match key_loader.load(&certificate_path, &certificate_password, &key_store_type) {
                        Ok(material) => decision.proceed(material),
                        Err(e) => {
                            error!("Failed to load client certificate {}: {}", certificate_path, e);
                            decision.cancel();
                        }
                    },
                    ClientCertAction::Ignore => decision.ignore(),
                    ClientCertAction::Cancel => decision.cancel(),
                }
            },
        ))
    }
}

/// A parsed challenge URL together with the port written in it.
struct ParsedUrl {
    url: Url,
    /// Explicit port, kept even when it equals the scheme default.
    port: Option<u16>,
}

fn parse_url(raw: Option<&str>) -> Option<ParsedUrl> {
    let raw = raw?;
    match Url::parse(raw) {
        Ok(url) => {
            let port = url.port().or_else(|| {
                // `Url` drops a port equal to the scheme default.
                explicit_authority_port(raw).and_then(|_| url.port_or_known_default())
            });
            Some(ParsedUrl { url, port })
        }
        Err(e) => {
            warn!("Failed to parse URL {}: {}", raw, e);
            None
        }
    }
}

/// Port spelled out in the authority of `raw`, if any.
fn explicit_authority_port(raw: &str) -> Option<u16> {
    let (_, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host_port)| host_port);
    if host_port.ends_with(']') {
        return None;
    }
    let (_, port) = host_port.rsplit_once(':')?;
    port.parse().ok()
}

/// Everything the delivery thread needs to finish one HTTP-auth turn.
struct HttpAuthResolution {
    session: Arc<SessionContext>,
    context: ChallengeContext,
    credentials: Arc<dyn CredentialStore>,
    secure_storage_supported: bool,
}

impl HttpAuthResolution {
    fn apply(self, outcome: ChannelOutcome, decision: HttpAuthDecision) {
        let action = match outcome {
            ChannelOutcome::Success(response) => HttpAuthAction::from_response(response.as_ref()),
            ChannelOutcome::Error { code, message, .. } => {
                error!("HTTP auth decision failed: {}, {}", code, message);
                HttpAuthAction::Cancel
            }
            ChannelOutcome::NotImplemented => HttpAuthAction::Cancel,
        };

        match action {
            HttpAuthAction::Proceed {
                credential,
                permanent_persistence,
            } => {
                if permanent_persistence && self.secure_storage_supported {
                    if let Err(e) = self.credentials.save(&self.context.space, &credential) {
                        warn!("Failed to persist credential for {}: {}", self.context.space.host, e);
                    }
                }
                decision.proceed(&credential.username, &credential.password);
            }
            HttpAuthAction::UseStoredCredentials => {
                let credentials = &self.credentials;
                let space = &self.context.space;
                let next = self.session.next_proposed_credential(|| {
                    credentials.credentials(space).unwrap_or_else(|e| {
                        warn!("Failed to read stored credentials for {}: {}", space.host, e);
                        Vec::new()
                    })
                });
                match next {
                    Some(credential) => decision.proceed(&credential.username, &credential.password),
                    None => decision.cancel(),
                }
            }
            HttpAuthAction::Cancel => {
                self.session.reset_decision_state();
                decision.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_auth_action_parsing() {
        assert_eq!(
            HttpAuthAction::from_response(Some(&json!({
                "action": 1, "username": "u", "password": "p", "permanentPersistence": true
            }))),
            HttpAuthAction::Proceed {
                credential: Credential::new("u", "p"),
                permanent_persistence: true,
            }
        );
        assert_eq!(
            HttpAuthAction::from_response(Some(&json!({"action": 2}))),
            HttpAuthAction::UseStoredCredentials
        );
        assert_eq!(HttpAuthAction::from_response(Some(&json!({"action": 0}))), HttpAuthAction::Cancel);
        assert_eq!(HttpAuthAction::from_response(None), HttpAuthAction::Cancel);
    }

    #[test]
    fn test_http_auth_malformed_is_cancel() {
        // Proceed without a password.
        assert_eq!(
            HttpAuthAction::from_response(Some(&json!({"action": 1, "username": "u"}))),
            HttpAuthAction::Cancel
        );
        // Wrong action type.
        assert_eq!(
            HttpAuthAction::from_response(Some(&json!({"action": "1"}))),
            HttpAuthAction::Cancel
        );
        assert_eq!(HttpAuthAction::from_response(Some(&json!([1, 2]))), HttpAuthAction::Cancel);
        assert_eq!(HttpAuthAction::from_response(Some(&json!({"action": 7}))), HttpAuthAction::Cancel);
    }

    #[test]
    fn test_server_trust_action_parsing() {
        assert_eq!(ServerTrustAction::from_response(Some(&json!({"action": 1}))), ServerTrustAction::Proceed);
        assert_eq!(ServerTrustAction::from_response(Some(&json!({"action": 0}))), ServerTrustAction::Cancel);
        assert_eq!(ServerTrustAction::from_response(Some(&json!({}))), ServerTrustAction::Cancel);
    }

    #[test]
    fn test_client_cert_action_parsing() {
        assert_eq!(
            ClientCertAction::from_response(Some(&json!({
                "action": 1, "certificatePath": "certs/client.p12", "certificatePassword": "pw"
            }))),
            ClientCertAction::Proceed {
                certificate_path: "certs/client.p12".into(),
                certificate_password: "pw".into(),
                key_store_type: DEFAULT_KEY_STORE_TYPE.into(),
            }
        );
        assert_eq!(
            ClientCertAction::from_response(Some(&json!({
                "action": 1, "certificatePath": "a.jks", "androidKeyStoreType": "JKS"
            }))),
            ClientCertAction::Proceed {
                certificate_path: "a.jks".into(),
                certificate_password: String::new(),
                key_store_type: "JKS".into(),
            }
        );
        assert_eq!(ClientCertAction::from_response(Some(&json!({"action": 2}))), ClientCertAction::Ignore);
        assert_eq!(ClientCertAction::from_response(Some(&json!({"action": 1}))), ClientCertAction::Cancel);
    }

    #[test]
    fn test_ssl_error_classification() {
        assert_eq!(SslErrorKind::from_code(3).label(), "untrusted-authority");
        assert_eq!(SslErrorKind::from_code(2).message(), "Hostname mismatch");
        assert_eq!(SslErrorKind::from_code(42), SslErrorKind::Generic);
        for code in 0..=5 {
            assert_eq!(SslErrorKind::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_context_payload_uses_minus_one_for_default_port() {
        let session = SessionContext::new(Default::default());
        let url = parse_url(Some("https://example.com/login")).unwrap();
        let context = ChallengeContext::new(&session, "example.com", &url, Some("admin"));

        let mut payload = Payload::new();
        context.write_into(&mut payload);
        assert_eq!(payload["port"], json!(-1));
        assert_eq!(payload["protocol"], json!("https"));
        assert_eq!(payload["realm"], json!("admin"));

        let url = parse_url(Some("http://example.com:8080/")).unwrap();
        let context = ChallengeContext::new(&session, "example.com", &url, None);
        let mut payload = Payload::new();
        context.write_into(&mut payload);
        assert_eq!(payload["port"], json!(8080));
        assert_eq!(payload["realm"], Value::Null);
    }

    #[test]
    fn test_explicit_default_port_is_kept() {
        let session = SessionContext::new(Default::default());
        let url = parse_url(Some("https://user@example.com:443/login")).unwrap();
        assert_eq!(url.port, Some(443));

        let context = ChallengeContext::new(&session, "example.com", &url, None);
        let mut payload = Payload::new();
        context.write_into(&mut payload);
        assert_eq!(payload["port"], json!(443));
        assert_eq!(context.space.port, Some(443));

        assert_eq!(parse_url(Some("https://[::1]/")).unwrap().port, None);
        assert_eq!(parse_url(Some("http://[::1]:80/")).unwrap().port, Some(80));
        assert_eq!(explicit_authority_port("https://example.com/a:1"), None);
    }
}
