//! [`WebViewBridge`], the single entry point the engine integration talks to.
//!
//! The bridge owns the session registry and one instance of every decision
//! coordinator. Engine hooks are forwarded with the session they belong to.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::bridge::auth::{AuthChallengeCoordinator, KeyLoader, ServerTrustChallenge};
use crate::bridge::credentials::CredentialStore;
use crate::bridge::handle::{ClientCertDecision, HttpAuthDecision, SafeBrowsingDecision, ServerTrustDecision};
use crate::bridge::lifecycle::{CookieFlusher, PageLifecycle, ScriptHost};
use crate::bridge::navigation::{ExternalLauncher, NavigationDecision, NavigationPolicy};
use crate::bridge::resource::{ResourceInterceptor, RuleMatcher, WebResourceResponse};
use crate::bridge::safe_browsing::SafeBrowsingCoordinator;
use crate::bridge::session::{SessionContext, SessionError, SessionOptions, SessionRegistry};
use crate::channel::{CorrelatedCall, InterruptToken, MessageChannel};
use crate::config::BridgeSettings;

/// Host facilities the bridge depends on.
#[derive(Clone)]
pub struct BridgeCollaborators {
    pub launcher: Arc<dyn ExternalLauncher>,
    pub credentials: Arc<dyn CredentialStore>,
    pub key_loader: Arc<dyn KeyLoader>,
    pub rules: Arc<dyn RuleMatcher>,
    pub cookies: Arc<dyn CookieFlusher>,
}

pub struct WebViewBridge {
    sessions: SessionRegistry,
    default_options: SessionOptions,
    navigation: NavigationPolicy,
    auth: AuthChallengeCoordinator,
    resources: ResourceInterceptor,
    safe_browsing: SafeBrowsingCoordinator,
    lifecycle: PageLifecycle,
}

impl WebViewBridge {
    pub fn new(settings: &BridgeSettings, channel: Arc<dyn MessageChannel>, collaborators: BridgeCollaborators) -> Self {
        let BridgeCollaborators {
            launcher,
            credentials,
            key_loader,
            rules,
            cookies,
        } = collaborators;

        Self {
            sessions: SessionRegistry::with_max_sessions(settings.max_sessions),
            default_options: SessionOptions::from_settings(settings),
            navigation: NavigationPolicy::new(Arc::clone(&channel), launcher),
            auth: AuthChallengeCoordinator::new(
                Arc::clone(&channel),
                credentials,
                key_loader,
                settings.secure_storage_supported,
            ),
            resources: ResourceInterceptor::new(Arc::clone(&channel), rules, settings.custom_scheme_timeout()),
            safe_browsing: SafeBrowsingCoordinator::new(Arc::clone(&channel)),
            lifecycle: PageLifecycle::new(channel, cookies),
        }
    }

    /// Opens a session using the configured options.
    pub fn open_session(&self) -> Result<Arc<SessionContext>, SessionError> {
        self.open_session_with(self.default_options.clone())
    }

    pub fn open_session_with(&self, options: SessionOptions) -> Result<Arc<SessionContext>, SessionError> {
        let session = self.sessions.open(options)?;
        info!("Opened session {}", session.id());
        Ok(session)
    }

    pub fn close_session(&self, id: Uuid) -> Result<(), SessionError> {
        self.sessions.close(id)?;
        info!("Closed session {}", id);
        Ok(())
    }

    pub fn session(&self, id: Uuid) -> Option<Arc<SessionContext>> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    pub fn should_override_url_loading(&self, session: &Arc<SessionContext>, url: &str) -> NavigationDecision {
        self.navigation.decide(session, url)
    }

    pub fn on_http_auth_request(
        &self,
        session: &Arc<SessionContext>,
        page_url: Option<&str>,
        host: &str,
        realm: Option<&str>,
        decision: HttpAuthDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        self.auth.on_http_auth_request(session, page_url, host, realm, decision)
    }

    pub fn on_server_trust_request(
        &self,
        session: &Arc<SessionContext>,
        challenge: ServerTrustChallenge,
        decision: ServerTrustDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        self.auth.on_server_trust_request(session, challenge, decision)
    }

    pub fn on_client_cert_request(
        &self,
        session: &Arc<SessionContext>,
        page_url: Option<&str>,
        host: &str,
        port: Option<u16>,
        decision: ClientCertDecision,
    ) -> Option<Arc<CorrelatedCall>> {
        self.auth.on_client_cert_request(session, page_url, host, port, decision)
    }

    pub fn on_safe_browsing_hit(
        &self,
        session: &Arc<SessionContext>,
        url: &str,
        threat_type: i32,
        decision: SafeBrowsingDecision,
    ) -> Arc<CorrelatedCall> {
        self.safe_browsing.on_safe_browsing_hit(session, url, threat_type, decision)
    }

    /// Blocks the calling thread for custom schemes; see
    /// [`ResourceInterceptor::intercept`].
    pub fn should_intercept_request(
        &self,
        session: &Arc<SessionContext>,
        url: &str,
        scheme: &str,
        interrupt: &InterruptToken,
    ) -> Option<WebResourceResponse> {
        self.resources.intercept(session, url, scheme, interrupt)
    }

    pub fn on_page_started(&self, session: &Arc<SessionContext>, url: &str, host: &Arc<dyn ScriptHost>) {
        self.lifecycle.on_page_started(session, url, host);
    }

    pub fn on_page_finished(&self, session: &Arc<SessionContext>, url: &str, host: &Arc<dyn ScriptHost>) {
        self.lifecycle.on_page_finished(session, url, host);
    }

    pub fn on_received_error(&self, session: &Arc<SessionContext>, failing_url: &str, code: i32, description: &str) {
        self.lifecycle.on_received_error(session, failing_url, code, description);
    }

    pub fn on_received_http_error(&self, session: &Arc<SessionContext>, url: &str, status_code: u16) {
        self.lifecycle.on_received_http_error(session, url, status_code);
    }

    pub fn on_scale_changed(&self, session: &Arc<SessionContext>, old_scale: f32, new_scale: f32) {
        self.lifecycle.on_scale_changed(session, old_scale, new_scale);
    }
}
