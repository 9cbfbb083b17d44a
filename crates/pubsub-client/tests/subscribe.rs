use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pubsub_client::{
    Client, Config, ConnectionState, HttpRequest, HttpResponse, Listener, Message, PresenceAction,
    PresenceEvent, ReconnectionPolicy, Status, StatusCategory, Transport, TransportError,
};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

enum Reply {
    Status(u16, String),
    NetworkError,
}

/// Answers subscribe requests from a script; once the script is exhausted
/// the long poll hangs like an idle server. Presence requests answer with
/// `presence_status`.
struct ScriptedTransport {
    requests: Mutex<Vec<HttpRequest>>,
    subscribe: Mutex<VecDeque<Reply>>,
    presence_status: AtomicU16,
}

impl ScriptedTransport {
    fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            subscribe: Mutex::new(script.into()),
            presence_status: AtomicU16::new(200),
        })
    }

    fn push(&self, reply: Reply) {
        self.subscribe.lock().unwrap().push_back(reply);
    }

    fn urls_containing(&self, fragment: &str) -> Vec<url::Url> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .map(|r| url::Url::parse(&r.url).unwrap())
            .collect()
    }

    fn subscribe_urls(&self) -> Vec<url::Url> {
        self.urls_containing("/v2/subscribe/")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let is_subscribe = request.url.contains("/v2/subscribe/");
        self.requests.lock().unwrap().push(request);

        if !is_subscribe {
            let status = self.presence_status.load(Ordering::SeqCst);
            return Ok(HttpResponse {
                status,
                body: br#"{"status":200,"message":"OK","service":"Presence"}"#.to_vec(),
            });
        }

        let next = self.subscribe.lock().unwrap().pop_front();
        match next {
            Some(Reply::Status(status, body)) => Ok(HttpResponse {
                status,
                body: body.into_bytes(),
            }),
            Some(Reply::NetworkError) => Err(TransportError {
                message: "connection reset".into(),
                timed_out: false,
            }),
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ok(body: &str) -> Reply {
    Reply::Status(200, body.to_string())
}

fn handshake(timetoken: &str) -> Reply {
    ok(&format!(r#"{{"t":{{"t":"{timetoken}","r":1}},"m":[]}}"#))
}

fn config(uuid: &str) -> Config {
    let mut config = Config::new("pub", "sub", uuid);
    config.heartbeat_interval = Some(Duration::ZERO);
    config
}

fn client(config: Config, transport: &Arc<ScriptedTransport>) -> Client {
    Client::with_transport(config, transport.clone()).unwrap()
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(600), fut)
        .await
        .expect("timed out waiting for event")
}

async fn next_status(listener: &mut Listener) -> Status {
    within(listener.status().recv()).await.unwrap()
}

async fn next_message(listener: &mut Listener) -> Message {
    within(listener.messages().recv()).await.unwrap()
}

async fn next_presence(listener: &mut Listener) -> PresenceEvent {
    within(listener.presence().recv()).await.unwrap()
}

/// Wait until `cond` holds, letting the paused clock advance.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

fn query(url: &url::Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn channel_segment(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.nth(3))
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Handshake, delivery and cursor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn handshake_then_message() {
    let transport = ScriptedTransport::new(vec![
        handshake("17"),
        ok(r#"{"t":{"t":"172","r":1},"m":[
            {"a":"1","f":0,"i":"publisher","p":{"t":"171","r":1},"k":"sub","c":"ch","d":"hi"}
        ]}"#),
    ]);
    let client = client(config("me"), &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::Connected);
    assert_eq!(status.affected_channels, vec!["ch"]);

    let message = next_message(&mut listener).await;
    assert_eq!(message.payload, serde_json::json!("hi"));
    assert_eq!(message.timetoken, 171);
    assert_eq!(message.channel, "ch");
    assert_eq!(message.publisher.as_deref(), Some("publisher"));

    wait_until(|| transport.subscribe_urls().len() >= 3).await;
    let urls = transport.subscribe_urls();
    assert_eq!(query(&urls[0], "tt").as_deref(), Some("0"));
    assert_eq!(query(&urls[0], "tr").as_deref(), Some("0"));
    assert_eq!(query(&urls[1], "tt").as_deref(), Some("17"));
    assert_eq!(query(&urls[1], "tr").as_deref(), Some("1"));
    assert_eq!(query(&urls[2], "tt").as_deref(), Some("172"));
    assert_eq!(query(&urls[0], "uuid").as_deref(), Some("me"));
    assert_eq!(query(&urls[0], "heartbeat").as_deref(), Some("300"));

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.cursor().timetoken, 172);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_sets_union_and_presence_flags_or() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = client(config("me"), &transport);

    client.subscribe().channels(["a"]).with_presence(true).execute().unwrap();
    client.subscribe().channels(["b"]).execute().unwrap();
    client
        .subscribe()
        .channels(["a"])
        .channel_groups(["g"])
        .execute()
        .unwrap();

    wait_until(|| client.subscribed_groups() == ["g"]).await;
    assert_eq!(client.subscribed_channels(), vec!["a", "b"]);

    // Queued commands collapse into a single handshake for the final set.
    wait_until(|| !transport.subscribe_urls().is_empty()).await;
    let last = transport.subscribe_urls().pop().unwrap();
    assert_eq!(channel_segment(&last), "a,a-pnpres,b");
    assert_eq!(query(&last, "channel-group").as_deref(), Some("g"));
    assert_eq!(query(&last, "tt").as_deref(), Some("0"));
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn catch_up_subscribe_skips_handshake() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = client(config("me"), &transport);
    client
        .subscribe()
        .channels(["ch"])
        .timetoken(15_000_000_000_000_000)
        .execute()
        .unwrap();

    wait_until(|| !transport.subscribe_urls().is_empty()).await;
    let first = &transport.subscribe_urls()[0];
    assert_eq!(query(first, "tt").as_deref(), Some("15000000000000000"));
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_envelope_does_not_stop_the_loop() {
    let transport = ScriptedTransport::new(vec![
        handshake("17"),
        ok(r#"{"t":{"t":"172","r":1},"m":[
            {"p":{"t":"171","r":1},"c":"ch","d":"good"},
            {"p":{"t":"not-a-number","r":1},"c":"ch","d":"bad"}
        ]}"#),
        ok(r#"{"t":{"t":"174","r":1},"m":[
            {"p":{"t":"173","r":1},"c":"ch","d":"next"}
        ]}"#),
    ]);
    let client = client(config("me"), &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::DecryptionError);
    assert_eq!(status.affected_channels, vec!["ch"]);
    assert_eq!(next_message(&mut listener).await.payload, serde_json::json!("good"));
    assert_eq!(next_message(&mut listener).await.payload, serde_json::json!("next"));

    wait_until(|| transport.subscribe_urls().len() >= 4).await;
    let urls = transport.subscribe_urls();
    assert_eq!(query(&urls[2], "tt").as_deref(), Some("172"));
    assert_eq!(query(&urls[3], "tt").as_deref(), Some("174"));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn unreadable_body_is_retried() {
    let transport = ScriptedTransport::new(vec![
        handshake("17"),
        ok("<html>gateway says hi</html>"),
        ok(r#"{"t":{"t":"18","r":1},"m":[]}"#),
    ]);
    let mut config = config("me");
    config.reconnection_policy = ReconnectionPolicy::Linear;
    let client = client(config, &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::UnexpectedDisconnect);
    assert_eq!(status.retry_delay, Some(Duration::from_secs(3)));

    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Reconnected);
    let urls = transport.subscribe_urls();
    assert_eq!(query(&urls[2], "tt").as_deref(), Some("17"));
    client.destroy().await;
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exponential_backoff_then_reconnected() {
    let transport = ScriptedTransport::new(vec![
        Reply::Status(500, String::new()),
        Reply::Status(502, String::new()),
        Reply::NetworkError,
        handshake("17"),
    ]);
    let mut config = config("me");
    config.reconnection_policy = ReconnectionPolicy::Exponential;
    config.maximum_reconnection_retries = -1;
    let client = client(config, &transport);
    let mut listener = client.add_listener();

    let started = tokio::time::Instant::now();
    client.subscribe().channels(["ch"]).execute().unwrap();

    let mut total = Duration::ZERO;
    for (attempt, base_secs) in [(1u32, 1u64), (2, 2), (3, 4)] {
        let status = next_status(&mut listener).await;
        assert_eq!(status.category, StatusCategory::UnexpectedDisconnect);
        assert_eq!(status.retry_count, attempt);
        let delay = status.retry_delay.unwrap();
        let base = Duration::from_secs(base_secs);
        assert!(delay >= base - Duration::from_millis(500), "delay {delay:?}");
        assert!(delay <= base + Duration::from_millis(500), "delay {delay:?}");
        total += delay;
    }

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::Reconnected);
    assert!(started.elapsed() >= total);
    assert_eq!(transport.subscribe_urls().len(), 4);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_until_reconnect() {
    let transport = ScriptedTransport::new(vec![
        Reply::NetworkError,
        Reply::NetworkError,
    ]);
    let mut config = config("me");
    config.reconnection_policy = ReconnectionPolicy::Linear;
    config.maximum_reconnection_retries = 1;
    let client = client(config, &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::UnexpectedDisconnect);
    assert_eq!(status.retry_delay, Some(Duration::from_secs(3)));

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::ReconnectionAttemptsExhausted);
    wait_until(|| client.connection_state() == ConnectionState::Disconnected).await;

    transport.push(handshake("20"));
    client.reconnect().unwrap();
    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::Connected);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn access_denied_is_not_retried() {
    let transport = ScriptedTransport::new(vec![Reply::Status(
        403,
        r#"{"status":403,"error":true,"message":"Forbidden","service":"Access Manager"}"#.into(),
    )]);
    let client = client(config("me"), &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::AccessDenied);
    assert_eq!(status.status_code, 403);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.subscribe_urls().len(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    client.destroy().await;
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn presence_join_and_leave_between_two_clients() {
    let a_transport = ScriptedTransport::new(vec![
        handshake("17"),
        ok(r#"{"t":{"t":"18","r":1},"m":[
            {"a":"1","f":0,"p":{"t":"18","r":1},"k":"sub","c":"ch-pnpres","b":"ch-pnpres",
             "d":{"action":"join","uuid":"client-b","timestamp":1,"occupancy":2}}
        ]}"#),
        ok(r#"{"t":{"t":"19","r":1},"m":[
            {"a":"1","f":0,"p":{"t":"19","r":1},"k":"sub","c":"ch-pnpres","b":"ch-pnpres",
             "d":{"action":"leave","uuid":"client-b","timestamp":2,"occupancy":1}}
        ]}"#),
    ]);
    let b_transport = ScriptedTransport::new(vec![handshake("17")]);

    let a = client(config("client-a"), &a_transport);
    let b = client(config("client-b"), &b_transport);
    let mut a_listener = a.add_listener();
    let mut b_listener = b.add_listener();

    a.subscribe().channels(["ch"]).with_presence(true).execute().unwrap();
    assert_eq!(next_status(&mut a_listener).await.category, StatusCategory::Connected);
    assert_eq!(channel_segment(&a_transport.subscribe_urls()[0]), "ch,ch-pnpres");

    b.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut b_listener).await.category, StatusCategory::Connected);

    let join = next_presence(&mut a_listener).await;
    assert_eq!(join.event, PresenceAction::Join);
    assert_eq!(join.uuid.as_deref(), Some("client-b"));
    assert!(join.occupancy >= 2);
    assert_eq!(join.channel, "ch");

    b.unsubscribe(["ch"], Vec::<String>::new()).unwrap();
    let status = next_status(&mut b_listener).await;
    assert_eq!(status.category, StatusCategory::Disconnected);
    let leaves = b_transport.urls_containing("/leave");
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].path(), "/v2/presence/sub-key/sub/channel/ch/leave");
    assert_eq!(query(&leaves[0], "uuid").as_deref(), Some("client-b"));

    let leave = next_presence(&mut a_listener).await;
    assert_eq!(leave.event, PresenceAction::Leave);
    assert_eq!(leave.uuid.as_deref(), Some("client-b"));

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn suppressed_leave_sends_nothing() {
    let transport = ScriptedTransport::new(vec![handshake("17")]);
    let mut config = config("me");
    config.suppress_leave_events = true;
    let client = client(config, &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);

    client.unsubscribe_all().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Disconnected);
    assert!(transport.urls_containing("/leave").is_empty());
    assert!(client.subscribed_channels().is_empty());
    client.destroy().await;
    assert!(transport.urls_containing("/leave").is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubscribe_restores_presence_state() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = client(config("me"), &transport);
    client
        .presence_state()
        .set("a", serde_json::json!({"mood": "ok"}));

    client.subscribe().channels(["a", "b"]).execute().unwrap();
    wait_until(|| transport.subscribe_urls().len() == 1).await;
    client.unsubscribe(["a"], Vec::<String>::new()).unwrap();
    wait_until(|| transport.subscribe_urls().len() == 2).await;
    client.subscribe().channels(["a"]).execute().unwrap();
    wait_until(|| transport.subscribe_urls().len() == 3).await;

    let urls = transport.subscribe_urls();
    assert_eq!(query(&urls[0], "state").as_deref(), Some(r#"{"a":{"mood":"ok"}}"#));
    assert_eq!(channel_segment(&urls[1]), "b");
    assert_eq!(query(&urls[1], "state"), None);
    assert_eq!(channel_segment(&urls[2]), "a,b");
    assert_eq!(query(&urls[2], "state").as_deref(), Some(r#"{"a":{"mood":"ok"}}"#));
    assert_eq!(client.subscribed_channels(), vec!["a", "b"]);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_failures_are_announced() {
    let transport = ScriptedTransport::new(Vec::new());
    transport.presence_status.store(500, Ordering::SeqCst);
    let mut config = config("me");
    config.heartbeat_interval = Some(Duration::from_secs(30));
    let client = client(config, &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).channel_groups(["g"]).execute().unwrap();

    let status = next_status(&mut listener).await;
    assert_eq!(status.category, StatusCategory::HeartbeatFailed);
    assert_eq!(status.status_code, 500);

    let beats = transport.urls_containing("/heartbeat");
    assert_eq!(beats[0].path(), "/v2/presence/sub-key/sub/channel/ch/heartbeat");
    assert_eq!(query(&beats[0], "heartbeat").as_deref(), Some("300"));
    assert_eq!(query(&beats[0], "channel-group").as_deref(), Some("g"));
    client.destroy().await;
}

// ---------------------------------------------------------------------------
// Disconnect and destroy
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_holds_state_and_reconnect_resumes() {
    let transport = ScriptedTransport::new(vec![handshake("17")]);
    let client = client(config("me"), &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);

    client.disconnect().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Disconnected);
    assert_eq!(client.subscribed_channels(), vec!["ch"]);

    transport.push(handshake("30"));
    client.reconnect().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn destroy_sends_leave_and_ends_listeners() {
    let transport = ScriptedTransport::new(vec![handshake("17")]);
    let client = client(config("me"), &transport);
    let mut listener = client.add_listener();
    client.subscribe().channels(["ch"]).execute().unwrap();
    assert_eq!(next_status(&mut listener).await.category, StatusCategory::Connected);

    client.destroy().await;
    assert_eq!(transport.urls_containing("/leave").len(), 1);
    assert!(within(listener.next()).await.is_none());
    assert!(client.subscribe().channels(["ch"]).execute().is_err());
}
