//! Single-use decision tokens wrapping the engine's native handlers.
//!
//! The engine hands over a handler object that must be resolved exactly once.
//! [`PendingDecision`] owns that handler: every terminal method consumes the
//! token, so a second resolution does not compile. A token dropped without a
//! terminal call logs an error and applies the safest action for its kind.

use tracing::error;

use crate::bridge::auth::KeyMaterial;

/// Kind of decision a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    Navigation,
    HttpAuth,
    SslTrust,
    ClientCert,
    SafeBrowsing,
    ResourceFetch,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecisionKind::Navigation => "navigation",
            DecisionKind::HttpAuth => "http-auth",
            DecisionKind::SslTrust => "ssl-trust",
            DecisionKind::ClientCert => "client-cert",
            DecisionKind::SafeBrowsing => "safe-browsing",
            DecisionKind::ResourceFetch => "resource-fetch",
        };
        f.write_str(name)
    }
}

/// Engine handler for an HTTP authentication challenge.
pub trait HttpAuthHandler: Send {
    fn proceed(self: Box<Self>, username: &str, password: &str);
    fn cancel(self: Box<Self>);
}

/// Engine handler for a TLS trust failure.
pub trait ServerTrustHandler: Send {
    fn proceed(self: Box<Self>);
    fn cancel(self: Box<Self>);
}

/// Engine handler for a client-certificate request.
pub trait ClientCertHandler: Send {
    fn proceed(self: Box<Self>, material: KeyMaterial);
    fn ignore(self: Box<Self>);
    fn cancel(self: Box<Self>);
}

/// Engine handler for a safe-browsing hit.
pub trait SafeBrowsingHandler: Send {
    fn back_to_safety(self: Box<Self>, report: bool);
    fn proceed(self: Box<Self>, report: bool);
    fn show_interstitial(self: Box<Self>, report: bool);
}

/// Safest terminal action for a handler kind, applied when a token is dropped.
pub trait SafeFallback {
    const KIND: DecisionKind;

    fn resolve_safely(self: Box<Self>);
}

impl SafeFallback for dyn HttpAuthHandler {
    const KIND: DecisionKind = DecisionKind::HttpAuth;

    fn resolve_safely(self: Box<Self>) {
        self.cancel();
    }
}

impl SafeFallback for dyn ServerTrustHandler {
    const KIND: DecisionKind = DecisionKind::SslTrust;

    fn resolve_safely(self: Box<Self>) {
        self.cancel();
    }
}

impl SafeFallback for dyn ClientCertHandler {
    const KIND: DecisionKind = DecisionKind::ClientCert;

    fn resolve_safely(self: Box<Self>) {
        self.cancel();
    }
}

impl SafeFallback for dyn SafeBrowsingHandler {
    const KIND: DecisionKind = DecisionKind::SafeBrowsing;

    fn resolve_safely(self: Box<Self>) {
        self.show_interstitial(true);
    }
}

/// Owned, single-use token for one pending engine decision.
pub struct PendingDecision<H: ?Sized + SafeFallback> {
    handler: Option<Box<H>>,
}

pub type HttpAuthDecision = PendingDecision<dyn HttpAuthHandler>;
pub type ServerTrustDecision = PendingDecision<dyn ServerTrustHandler>;
pub type ClientCertDecision = PendingDecision<dyn ClientCertHandler>;
pub type SafeBrowsingDecision = PendingDecision<dyn SafeBrowsingHandler>;

impl<H: ?Sized + SafeFallback> PendingDecision<H> {
    pub fn new(handler: Box<H>) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    pub fn kind(&self) -> DecisionKind {
        H::KIND
    }

    fn take(mut self) -> Box<H> {
        match self.handler.take() {
            Some(handler) => handler,
            // Only `Drop` empties the option and it runs after every `take`.
            None => unreachable!("decision token resolved twice"),
        }
    }
}

impl<H: ?Sized + SafeFallback> Drop for PendingDecision<H> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            error!("{} decision dropped unresolved, applying safe fallback", H::KIND);
            handler.resolve_safely();
        }
    }
}

impl<H: ?Sized + SafeFallback> std::fmt::Debug for PendingDecision<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDecision")
            .field("kind", &H::KIND)
            .field("resolved", &self.handler.is_none())
            .finish()
    }
}

impl HttpAuthDecision {
    pub fn proceed(self, username: &str, password: &str) {
        self.take().proceed(username, password);
    }

    pub fn cancel(self) {
        self.take().cancel();
    }
}

impl ServerTrustDecision {
    pub fn proceed(self) {
        self.take().proceed();
    }

    pub fn cancel(self) {
        self.take().cancel();
    }
}

impl ClientCertDecision {
    pub fn proceed(self, material: KeyMaterial) {
        self.take().proceed(material);
    }

    pub fn ignore(self) {
        self.take().ignore();
    }

    pub fn cancel(self) {
        self.take().cancel();
    }
}

impl SafeBrowsingDecision {
    pub fn back_to_safety(self, report: bool) {
        self.take().back_to_safety(report);
    }

    pub fn proceed(self, report: bool) {
        self.take().proceed(report);
    }

    pub fn show_interstitial(self, report: bool) {
        self.take().show_interstitial(report);
    }
}
