//! Page lifecycle tracking.
//!
//! Start, finish and error hooks keep the session's loading flag current,
//! reset decision state at page boundaries, inject the bridge scripts and
//! notify the authority. Notifications are fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, info};

use crate::bridge::scripts::{
    single_line, CONSOLE_BRIDGE_JS, MESSAGE_BRIDGE_JS, PLATFORM_READY_JS, RESOURCE_OBSERVER_JS,
};
use crate::bridge::session::SessionContext;
use crate::channel::MessageChannel;

pub const METHOD_LOAD_START: &str = "onLoadStart";
pub const METHOD_LOAD_STOP: &str = "onLoadStop";
pub const METHOD_LOAD_ERROR: &str = "onLoadError";
pub const METHOD_LOAD_HTTP_ERROR: &str = "onLoadHttpError";

static STATUS_TEXT: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (100, "Continue"),
        (101, "Switching Protocols"),
        (200, "OK"),
        (201, "Created"),
        (202, "Accepted"),
        (203, "Non-Authoritative Information"),
        (204, "No Content"),
        (205, "Reset Content"),
        (206, "Partial Content"),
        (300, "Multiple Choices"),
        (301, "Moved Permanently"),
        (302, "Found"),
        (303, "See Other"),
        (304, "Not Modified"),
        (307, "Temporary Redirect"),
        (308, "Permanent Redirect"),
        (400, "Bad Request"),
        (401, "Unauthorized"),
        (403, "Forbidden"),
        (404, "Not Found"),
        (405, "Method Not Allowed"),
        (406, "Not Acceptable"),
        (407, "Proxy Authentication Required"),
        (408, "Request Timeout"),
        (409, "Conflict"),
        (410, "Gone"),
        (411, "Length Required"),
        (412, "Precondition Failed"),
        (413, "Payload Too Large"),
        (414, "URI Too Long"),
        (415, "Unsupported Media Type"),
        (416, "Range Not Satisfiable"),
        (417, "Expectation Failed"),
        (418, "I'm a teapot"),
        (422, "Unprocessable Entity"),
        (425, "Too Early"),
        (426, "Upgrade Required"),
        (428, "Precondition Required"),
        (429, "Too Many Requests"),
        (431, "Request Header Fields Too Large"),
        (451, "Unavailable For Legal Reasons"),
        (500, "Internal Server Error"),
        (501, "Not Implemented"),
        (502, "Bad Gateway"),
        (503, "Service Unavailable"),
        (504, "Gateway Timeout"),
        (505, "HTTP Version Not Supported"),
        (511, "Network Authentication Required"),
    ])
});

/// Reason phrase for an HTTP status code.
pub fn status_text(code: u16) -> Option<&'static str> {
    STATUS_TEXT.get(&code).copied()
}

/// Callback receiving the result of a script evaluation.
pub type ScriptCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Script execution facility of the page's view.
pub trait ScriptHost: Send + Sync {
    /// Whether [`ScriptHost::evaluate_script`] reports completion.
    fn supports_evaluation_callbacks(&self) -> bool;

    /// Evaluates `script`, calling `on_complete` once it has run.
    fn evaluate_script(&self, script: &str, on_complete: Option<ScriptCallback>);

    /// Runs `script` as a `javascript:` URL, without completion reporting.
    fn load_javascript_url(&self, script: &str);
}

/// Persists the engine's cookie jar.
pub trait CookieFlusher: Send + Sync {
    fn flush(&self);
}

pub struct PageLifecycle {
    channel: Arc<dyn MessageChannel>,
    cookies: Arc<dyn CookieFlusher>,
}

impl PageLifecycle {
    pub fn new(channel: Arc<dyn MessageChannel>, cookies: Arc<dyn CookieFlusher>) -> Self {
        Self { channel, cookies }
    }

    pub fn on_page_started(&self, session: &SessionContext, url: &str, host: &Arc<dyn ScriptHost>) {
        if session.options().use_on_load_resource {
            host.load_javascript_url(&single_line(RESOURCE_OBSERVER_JS));
        }

        let started = session.mark_loading_started();
        debug!("Page {} started loading at {}", url, started);

        let mut payload = session.base_payload();
        payload.insert("url".into(), Value::from(url));
        self.channel.invoke(METHOD_LOAD_START, payload);
    }

    pub fn on_page_finished(&self, session: &SessionContext, url: &str, host: &Arc<dyn ScriptHost>) {
        session.mark_loading_finished();
        session.reset_decision_state();
        self.cookies.flush();

        if let Some(started) = session.page_started_at() {
            let elapsed = chrono::Utc::now() - started;
            info!("Page {} finished in {}ms", url, elapsed.num_milliseconds());
        }

        inject_bridge_scripts(host);

        let mut payload = session.base_payload();
        payload.insert("url".into(), Value::from(url));
        self.channel.invoke(METHOD_LOAD_STOP, payload);
    }

    pub fn on_received_error(&self, session: &SessionContext, failing_url: &str, code: i32, description: &str) {
        session.mark_loading_finished();
        session.reset_decision_state();

        let mut payload = session.base_payload();
        payload.insert("url".into(), Value::from(failing_url));
        payload.insert("code".into(), Value::from(code));
        payload.insert("message".into(), Value::from(description));
        self.channel.invoke(METHOD_LOAD_ERROR, payload);
    }

    /// Reports a main-frame HTTP error status. Decision state is untouched:
    /// the page itself still loads.
    pub fn on_received_http_error(&self, session: &SessionContext, url: &str, status_code: u16) {
        let mut payload = session.base_payload();
        payload.insert("url".into(), Value::from(url));
        payload.insert("statusCode".into(), Value::from(status_code));
        payload.insert(
            "description".into(),
            Value::from(status_text(status_code).unwrap_or("")),
        );
        self.channel.invoke(METHOD_LOAD_HTTP_ERROR, payload);
    }

    pub fn on_scale_changed(&self, session: &SessionContext, old_scale: f32, new_scale: f32) {
        debug!("Session {} scale {} -> {}", session.id(), old_scale, new_scale);
        session.set_scale(new_scale);
    }
}

/// Console bridge, then the message-bridge class, then the ready signal.
fn inject_bridge_scripts(host: &Arc<dyn ScriptHost>) {
    if host.supports_evaluation_callbacks() {
        host.evaluate_script(CONSOLE_BRIDGE_JS, None);
        let ready_host = Arc::clone(host);
        host.evaluate_script(
            MESSAGE_BRIDGE_JS,
            Some(Box::new(move |_| ready_host.evaluate_script(PLATFORM_READY_JS, None))),
        );
    } else {
        // Ordering here is best-effort.
        host.load_javascript_url(CONSOLE_BRIDGE_JS);
        host.load_javascript_url(MESSAGE_BRIDGE_JS);
        host.load_javascript_url(PLATFORM_READY_JS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(404), Some("Not Found"));
        assert_eq!(status_text(418), Some("I'm a teapot"));
        assert_eq!(status_text(599), None);
    }
}
