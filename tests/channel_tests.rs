//! Integration tests for the tokio-backed IPC channel
//!
//! Runs the real `IpcChannel` against an `AuthorityProcessor`, including the
//! blocking custom-scheme path and a full scripted replay.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;

use webview_bridge::bridge::{BridgeCollaborators, HostBlockList, InMemoryCredentialStore, UnsupportedKeyLoader, WebViewBridge};
use webview_bridge::channel::{
    invoke_and_wait, AuthorityProcessor, ChannelError, ChannelOutcome, InterruptToken, IpcChannel, MessageChannel,
    Payload,
};
use webview_bridge::config::BridgeSettings;
use webview_bridge::replay::{
    AuthorityScript, LoggingCookieFlusher, LoggingLauncher, RecordingScriptHost, Replayer,
    ScriptedAuthority,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns an authority answering every call with `answer(method)`.
fn spawn_authority<F>(channel: &IpcChannel, answer: F)
where
    F: Fn(&str) -> ChannelOutcome + Send + Sync + 'static,
{
    let mut processor = AuthorityProcessor::new(channel).unwrap();
    tokio::spawn(async move {
        processor
            .process(|method, _payload| {
                let outcome = answer(&method);
                async move { outcome }
            })
            .await;
    });
}

fn collaborators(settings: &BridgeSettings) -> BridgeCollaborators {
    BridgeCollaborators {
        launcher: Arc::new(LoggingLauncher::default()),
        credentials: Arc::new(InMemoryCredentialStore::new()),
        key_loader: Arc::new(UnsupportedKeyLoader),
        rules: Arc::new(HostBlockList::new(&settings.blocked_hosts)),
        cookies: Arc::new(LoggingCookieFlusher),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_round_trip() {
    let channel = IpcChannel::new(Handle::current());
    spawn_authority(&channel, |method| ChannelOutcome::success(json!({"method": method})));

    let (tx, rx) = mpsc::channel();
    channel.invoke_with_result(
        "onSafeBrowsingHit",
        Payload::new(),
        Box::new(move |outcome| tx.send(outcome).unwrap()),
    );

    let outcome = tokio::task::spawn_blocking(move || rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, ChannelOutcome::success(json!({"method": "onSafeBrowsingHit"})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_wait_on_delivery_thread_is_refused() {
    let channel = Arc::new(IpcChannel::new(Handle::current()));
    spawn_authority(&channel, |_| ChannelOutcome::Success(None));

    let (tx, rx) = mpsc::channel();
    let inner = Arc::clone(&channel);
    channel.invoke_with_result(
        "first",
        Payload::new(),
        Box::new(move |_| {
            let result = invoke_and_wait(inner.as_ref(), "second", Payload::new(), &InterruptToken::new(), None);
            tx.send(result).unwrap();
        }),
    );

    let result = tokio::task::spawn_blocking(move || rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .await
        .unwrap();
    assert_eq!(result, Err(ChannelError::DeliveryThread));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_buffer_reports_error_outcome() {
    let channel = IpcChannel::with_buffer_size(Handle::current(), 1);
    // Hold the receiver without draining it.
    let _processor = AuthorityProcessor::new(&channel).unwrap();

    channel.invoke("onLoadStart", Payload::new());

    let (tx, rx) = mpsc::channel();
    channel.invoke_with_result(
        "onReceivedServerTrustAuthRequest",
        Payload::new(),
        Box::new(move |outcome| tx.send(outcome).unwrap()),
    );

    let outcome = tokio::task::spawn_blocking(move || rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .await
        .unwrap();
    assert!(matches!(outcome, ChannelOutcome::Error { ref code, .. } if code == "channel_closed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_authority_reports_error_outcome() {
    let channel = IpcChannel::new(Handle::current());
    drop(AuthorityProcessor::new(&channel).unwrap());
    assert!(!channel.is_open());

    let result = tokio::task::spawn_blocking(move || {
        invoke_and_wait(&channel, "onLoadResourceCustomScheme", Payload::new(), &InterruptToken::new(), None)
    })
    .await
    .unwrap()
    .unwrap();

    assert!(result.result.is_none());
    assert!(result.error.unwrap().starts_with("channel_closed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_scheme_over_ipc() {
    let settings = BridgeSettings::default().with_custom_scheme("myapp");
    let channel = Arc::new(IpcChannel::new(Handle::current()));
    spawn_authority(&channel, |method| match method {
        "onLoadResourceCustomScheme" => ChannelOutcome::success(json!({
            "content-type": "text/plain",
            "base64data": "aGk="
        })),
        _ => ChannelOutcome::NotImplemented,
    });

    let bridge = WebViewBridge::new(&settings, channel, collaborators(&settings));

    let response = tokio::task::spawn_blocking(move || {
        let session = bridge.open_session().unwrap();
        bridge.should_intercept_request(&session, "myapp://greeting", "myapp", &InterruptToken::new())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.data, b"hi".to_vec());
    assert_eq!(response.content_type.as_deref(), Some("text/plain"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scripted_replay() {
    let script: AuthorityScript = toml::from_str(
        r#"
[responses.onReceivedHttpAuthRequest]
action = 1
username = "user"
password = "secret"

[responses.onSafeBrowsingHit]
action = 0
report = false

[[events]]
type = "navigate"
url = "tel:5551234"

[[events]]
type = "http_auth"
page_url = "https://example.com/"
host = "example.com"

[[events]]
type = "server_trust"
url = "https://self-signed.example/"
primary_error = 3

[[events]]
type = "safe_browsing_hit"
url = "https://bad.example/"
threat_type = 1

[[events]]
type = "http_error"
url = "https://example.com/missing"
status_code = 404
"#,
    )
    .unwrap();

    let settings = BridgeSettings::default();
    let channel = Arc::new(IpcChannel::new(Handle::current()));
    let authority = ScriptedAuthority::new(&script);
    {
        let authority = authority.clone();
        let mut processor = AuthorityProcessor::new(&channel).unwrap();
        tokio::spawn(async move {
            processor
                .process(move |method, payload| {
                    let outcome = authority.answer(&method, payload);
                    async move { outcome }
                })
                .await;
        });
    }

    let bridge = Arc::new(WebViewBridge::new(&settings, channel, collaborators(&settings)));
    let replayer = Replayer::new(bridge, Arc::new(RecordingScriptHost::new(true)), RECV_TIMEOUT).unwrap();

    let events = script.events.clone();
    let records = tokio::task::spawn_blocking(move || replayer.run(&events))
        .await
        .unwrap();

    let decisions: Vec<&str> = records.iter().map(|r| r.decision.as_str()).collect();
    assert_eq!(
        decisions,
        vec![
            "Intercepted",
            "proceed as user",
            "cancel",
            "back to safety (report: false)",
            "notified",
        ]
    );
    assert_eq!(records[1].event, "http_auth");

    // Calls that were answered have necessarily reached the authority.
    let methods: Vec<String> = authority.received().into_iter().map(|(m, _)| m).collect();
    assert!(methods.contains(&"onReceivedHttpAuthRequest".to_string()));
    assert!(methods.contains(&"onSafeBrowsingHit".to_string()));
}
