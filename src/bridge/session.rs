//! Per-page session state and the registry holding live sessions.
//!
//! Every page the engine hosts gets its own [`SessionContext`]. Decision
//! state (the HTTP-auth failure counter and the queue of stored credentials
//! still to be offered) lives here rather than in globals, so concurrent
//! pages never observe each other's retries.
//!
//! # Example
//!
//! ```rust
//! use webview_bridge::bridge::session::{SessionOptions, SessionRegistry};
//!
//! let registry = SessionRegistry::new();
//! let session = registry.open(SessionOptions::default()).unwrap();
//! assert_eq!(session.record_auth_challenge(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bridge::credentials::Credential;
use crate::channel::Payload;
use crate::config::BridgeSettings;

/// Mutable decision state shared by every challenge within one page session.
#[derive(Debug, Default)]
pub struct DecisionState {
    auth_failure_count: u32,
    proposed_credentials: Option<VecDeque<Credential>>,
}

impl DecisionState {
    /// Back to `{0, absent}`.
    pub fn reset(&mut self) {
        self.auth_failure_count = 0;
        self.proposed_credentials = None;
    }

    pub fn auth_failure_count(&self) -> u32 {
        self.auth_failure_count
    }

    /// Whether the stored-credential queue has been populated.
    pub fn has_proposed_credentials(&self) -> bool {
        self.proposed_credentials.is_some()
    }

    /// Credentials still waiting to be offered.
    pub fn remaining_credentials(&self) -> usize {
        self.proposed_credentials.as_ref().map_or(0, VecDeque::len)
    }

    fn record_auth_challenge(&mut self) -> u32 {
        self.auth_failure_count = self.auth_failure_count.saturating_add(1);
        self.auth_failure_count
    }

    /// Pops the next stored credential, populating the queue through `load`
    /// the first time only.
    fn next_proposed_credential<F>(&mut self, load: F) -> Option<Credential>
    where
        F: FnOnce() -> Vec<Credential>,
    {
        self.proposed_credentials
            .get_or_insert_with(|| load().into())
            .pop_front()
    }
}

/// Per-session switches taken from [`BridgeSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Hand every navigation decision to the authority.
    pub use_should_override_url_loading: bool,

    /// Inject the resource observer script on page start.
    pub use_on_load_resource: bool,

    /// Schemes whose subresources are served by the authority.
    pub resource_custom_schemes: HashSet<String>,

    /// Tag every payload with the session id.
    pub include_session_id: bool,
}

impl SessionOptions {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            use_should_override_url_loading: settings.use_should_override_url_loading,
            use_on_load_resource: settings.use_on_load_resource,
            resource_custom_schemes: settings
                .resource_custom_schemes
                .iter()
                .map(|scheme| scheme.to_ascii_lowercase())
                .collect(),
            include_session_id: settings.include_session_id,
        }
    }

    /// Whether `scheme` is served by the authority.
    pub fn handles_custom_scheme(&self, scheme: &str) -> bool {
        self.resource_custom_schemes.contains(&scheme.to_ascii_lowercase())
    }

    pub fn with_custom_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.resource_custom_schemes
            .insert(scheme.into().to_ascii_lowercase());
        self
    }
}

/// State of one page session.
#[derive(Debug)]
pub struct SessionContext {
    id: Uuid,
    options: SessionOptions,
    decisions: Mutex<DecisionState>,
    loading: AtomicBool,
    page_started_at: Mutex<Option<DateTime<Utc>>>,
    scale: Mutex<f32>,
    created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_id(Uuid::new_v4(), options)
    }

    /// Creates a session with a specific ID (useful for testing).
    pub fn with_id(id: Uuid, options: SessionOptions) -> Self {
        Self {
            id,
            options,
            decisions: Mutex::new(DecisionState::default()),
            loading: AtomicBool::new(false),
            page_started_at: Mutex::new(None),
            scale: Mutex::new(1.0),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Counts a new HTTP-auth challenge and returns the updated count.
    pub fn record_auth_challenge(&self) -> u32 {
        self.decisions.lock().record_auth_challenge()
    }

    pub fn auth_failure_count(&self) -> u32 {
        self.decisions.lock().auth_failure_count()
    }

    /// See [`DecisionState::next_proposed_credential`].
    pub fn next_proposed_credential<F>(&self, load: F) -> Option<Credential>
    where
        F: FnOnce() -> Vec<Credential>,
    {
        self.decisions.lock().next_proposed_credential(load)
    }

    pub fn reset_decision_state(&self) {
        self.decisions.lock().reset();
    }

    /// Runs `f` with read access to the decision state.
    pub fn with_decision_state<R>(&self, f: impl FnOnce(&DecisionState) -> R) -> R {
        f(&self.decisions.lock())
    }

    /// Marks the page as loading and records the start time.
    pub fn mark_loading_started(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.loading.store(true, Ordering::SeqCst);
        *self.page_started_at.lock() = Some(now);
        now
    }

    pub fn mark_loading_finished(&self) {
        self.loading.store(false, Ordering::SeqCst);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn page_started_at(&self) -> Option<DateTime<Utc>> {
        *self.page_started_at.lock()
    }

    pub fn set_scale(&self, scale: f32) {
        *self.scale.lock() = scale;
    }

    pub fn scale(&self) -> f32 {
        *self.scale.lock()
    }

    /// Fresh payload, tagged with the session id when configured.
    pub fn base_payload(&self) -> Payload {
        let mut payload = Payload::new();
        if self.options.include_session_id {
            payload.insert("uuid".to_string(), Value::String(self.id.to_string()));
        }
        payload
    }
}

/// Errors that can occur during session management.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Maximum number of sessions ({0}) reached")]
    MaxSessionsReached(usize),
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionContext>>>,

    /// Maximum number of sessions allowed (0 = unlimited).
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates a registry with no session limit.
    pub fn new() -> Self {
        Self::with_max_sessions(0)
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Opens a new session.
    pub fn open(&self, options: SessionOptions) -> Result<Arc<SessionContext>, SessionError> {
        let mut sessions = self.sessions.write();

        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsReached(self.max_sessions));
        }

        let session = Arc::new(SessionContext::new(options));
        sessions.insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    /// Closes a session by its ID.
    pub fn close(&self, id: Uuid) -> Result<Arc<SessionContext>, SessionError> {
        self.sessions
            .write()
            .remove(&id)
            .ok_or(SessionError::NotFound(id))
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionContext>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().keys().copied().collect()
    }
}
