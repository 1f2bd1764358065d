//! HTTP authentication credentials and the store they come from.
//!
//! The bridge never creates or destroys credentials; it only moves them
//! between the external [`CredentialStore`] and the engine.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Username/password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Key under which credentials are stored: (host, protocol, realm, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectionSpace {
    pub host: String,
    pub protocol: String,
    pub realm: Option<String>,
    /// As written in the URL, including an explicit scheme-default port.
    /// `None` when the URL carries no port.
    pub port: Option<u16>,
}

impl ProtectionSpace {
    pub fn new(host: impl Into<String>, protocol: impl Into<String>, realm: Option<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            protocol: protocol.into(),
            realm,
            port,
        }
    }
}

/// Errors raised by a credential store backend.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),

    #[error("Credential store I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent credential storage. Implementations provide their own
/// internal consistency; the bridge does not lock around them.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored credentials for `space`, oldest first.
    fn credentials(&self, space: &ProtectionSpace) -> Result<Vec<Credential>, CredentialStoreError>;

    /// Stores `credential` for `space`.
    fn save(&self, space: &ProtectionSpace, credential: &Credential) -> Result<(), CredentialStoreError>;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    entries: RwLock<HashMap<ProtectionSpace, Vec<Credential>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of credentials across all protection spaces.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn credentials(&self, space: &ProtectionSpace) -> Result<Vec<Credential>, CredentialStoreError> {
        Ok(self.entries.read().get(space).cloned().unwrap_or_default())
    }

    fn save(&self, space: &ProtectionSpace, credential: &Credential) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.write();
        let stored = entries.entry(space.clone()).or_default();
        // Same username replaces the old password.
        match stored.iter_mut().find(|c| c.username == credential.username) {
            Some(existing) => existing.password = credential.password.clone(),
            None => stored.push(credential.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ProtectionSpace {
        ProtectionSpace::new("example.com", "https", Some("admin".into()), None)
    }

    #[test]
    fn test_store_round_trip() {
        let store = InMemoryCredentialStore::new();
        assert!(store.is_empty());

        store.save(&space(), &Credential::new("alice", "one")).unwrap();
        store.save(&space(), &Credential::new("bob", "two")).unwrap();

        let found = store.credentials(&space()).unwrap();
        assert_eq!(found, vec![Credential::new("alice", "one"), Credential::new("bob", "two")]);
    }

    #[test]
    fn test_same_username_replaces_password() {
        let store = InMemoryCredentialStore::new();
        store.save(&space(), &Credential::new("alice", "one")).unwrap();
        store.save(&space(), &Credential::new("alice", "two")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.credentials(&space()).unwrap()[0].password, "two");
    }

    #[test]
    fn test_spaces_are_isolated() {
        let store = InMemoryCredentialStore::new();
        store.save(&space(), &Credential::new("alice", "one")).unwrap();

        let other = ProtectionSpace::new("example.com", "https", None, Some(8443));
        assert!(store.credentials(&other).unwrap().is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", Credential::new("alice", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
