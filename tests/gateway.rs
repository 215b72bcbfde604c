//! End-to-end tests: the real gateway against a scripted mock
//! homeserver, driven by a raw TCP IRC client.
//!
//! The mock serves login, a queue of canned /sync responses (then idles),
//! message sends, and room joins. Assertions happen on the IRC side and
//! on what the mock recorded.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use matrix_irc_gateway::config::ServerConfig;
use matrix_irc_gateway::server::Server;

// ── Mock homeserver ────────────────────────────────────────────────────

#[derive(Default)]
struct MockHomeserver {
    sync_batches: Mutex<VecDeque<Value>>,
    /// (room_id, body) for every message send the gateway performed.
    sent: Mutex<Vec<(String, Value)>>,
    joined: Mutex<Vec<String>>,
    /// When true, /sync answers 401 once the canned batches are drained.
    fail_when_drained: bool,
}

impl MockHomeserver {
    fn with_batches(batches: Vec<Value>, fail_when_drained: bool) -> Arc<Self> {
        Arc::new(MockHomeserver {
            sync_batches: Mutex::new(batches.into()),
            fail_when_drained,
            ..Default::default()
        })
    }
}

async fn login(Json(body): Json<Value>) -> Response {
    if body["password"].as_str() != Some("hunter2") {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"errcode": "M_FORBIDDEN", "error": "Invalid password"})),
        )
            .into_response();
    }
    Json(json!({
        "user_id": "@alice:example.org",
        "access_token": "syt_test_token",
        "device_id": "GATEWAY",
    }))
    .into_response()
}

async fn sync(State(mock): State<Arc<MockHomeserver>>) -> Response {
    let batch = mock.sync_batches.lock().unwrap().pop_front();
    match batch {
        Some(value) => Json(value).into_response(),
        None if mock.fail_when_drained => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"errcode": "M_UNKNOWN_TOKEN", "error": "Access token revoked"})),
        )
            .into_response(),
        None => {
            // Idle long poll.
            tokio::time::sleep(Duration::from_millis(200)).await;
            Json(json!({"next_batch": "s-idle", "rooms": {"join": {}}})).into_response()
        }
    }
}

async fn send_message(
    State(mock): State<Arc<MockHomeserver>>,
    Path((room_id, _txn)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let count = {
        let mut sent = mock.sent.lock().unwrap();
        sent.push((room_id, body));
        sent.len()
    };
    Json(json!({"event_id": format!("$sent{count}")}))
}

async fn join_room(
    State(mock): State<Arc<MockHomeserver>>,
    Path(room): Path<String>,
) -> Json<Value> {
    mock.joined.lock().unwrap().push(room);
    Json(json!({"room_id": "!joined:example.org"}))
}

async fn set_topic(
    Path((_room_id, _event_type)): Path<(String, String)>,
    Json(_body): Json<Value>,
) -> Json<Value> {
    Json(json!({"event_id": "$topic"}))
}

async fn start_mock(mock: Arc<MockHomeserver>) -> SocketAddr {
    let app = Router::new()
        .route("/_matrix/client/r0/login", post(login))
        .route("/_matrix/client/r0/sync", get(sync))
        .route(
            "/_matrix/client/r0/rooms/:room_id/send/m.room.message/:txn",
            put(send_message),
        )
        .route("/_matrix/client/r0/rooms/:room_id/state/:event_type", put(set_topic))
        .route("/_matrix/client/r0/join/:room", post(join_room))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Start the gateway against a mock homeserver; returns the IRC address.
async fn start_gateway(mock: Arc<MockHomeserver>) -> SocketAddr {
    let homeserver = start_mock(mock).await;
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        homeserver_url: Some(format!("http://{homeserver}")),
        sync_timeout_ms: 1000,
        ..Default::default()
    };
    let (addr, _handle) = Server::new(config).start().await.unwrap();
    addr
}

// ── IRC test client ────────────────────────────────────────────────────

struct IrcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IrcClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        IrcClient {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// One line, CR-LF stripped. `None` on EOF.
    async fn recv(&mut self) -> Option<String> {
        let mut buf = String::new();
        match self.reader.read_line(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(buf.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    /// Read until a line matches, with a timeout. Panics with
    /// `description` on timeout or disconnect.
    async fn expect(&mut self, description: &str, pred: impl Fn(&str) -> bool) -> String {
        let fut = async {
            loop {
                match self.recv().await {
                    Some(line) if pred(&line) => return line,
                    Some(_) => continue,
                    None => panic!("Disconnected while waiting for: {description}"),
                }
            }
        };
        timeout(Duration::from_secs(5), fut)
            .await
            .unwrap_or_else(|_| panic!("Timeout waiting for: {description}"))
    }

    /// Collect lines until one matches `stop`, inclusive.
    async fn collect_until(
        &mut self,
        description: &str,
        stop: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let fut = async {
            let mut lines = Vec::new();
            loop {
                match self.recv().await {
                    Some(line) => {
                        let done = stop(&line);
                        lines.push(line);
                        if done {
                            return lines;
                        }
                    }
                    None => panic!("Disconnected while collecting: {description}"),
                }
            }
        };
        timeout(Duration::from_secs(5), fut)
            .await
            .unwrap_or_else(|_| panic!("Timeout collecting: {description}"))
    }

    async fn register(&mut self) {
        self.send("PASS hunter2").await;
        self.send("NICK alice:example.org").await;
        self.send("USER alice 0 * :Alice").await;
        self.expect("end of MOTD", |l| l.contains(" 376 ")).await;
    }

    /// LIST until the given channel shows up (the sync loop races
    /// registration), returning all 322 rows from that attempt.
    async fn list_until_contains(&mut self, channel: &str) -> Vec<String> {
        for _ in 0..50 {
            self.send("LIST").await;
            let lines = self
                .collect_until("LIST reply", |l| l.contains(" 323 "))
                .await;
            let rows: Vec<String> = lines
                .into_iter()
                .filter(|l| l.contains(" 322 "))
                .collect();
            if rows.iter().any(|l| l.contains(channel)) {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("LIST never showed {channel}");
    }
}

// ── Canned sync payloads ───────────────────────────────────────────────

fn member_event(user: &str) -> Value {
    json!({
        "type": "m.room.member",
        "event_id": format!("$member-{user}"),
        "sender": user,
        "state_key": user,
        "content": {"membership": "join"},
    })
}

fn text_message(event_id: &str, sender: &str, body: &str) -> Value {
    json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "origin_server_ts": 1_700_000_000_000i64,
        "content": {"msgtype": "m.text", "body": body},
    })
}

/// One room with an alias, a name, two members, three backlogged
/// messages and a live topic change; plus a space that LIST must hide.
fn seeded_batch() -> Value {
    json!({
        "next_batch": "s1",
        "rooms": {"join": {
            "!room1:example.org": {
                "state": {"events": [
                    {"type": "m.room.canonical_alias", "event_id": "$alias",
                     "sender": "@bob:example.org", "state_key": "",
                     "content": {"alias": "#general:example.org"}},
                    {"type": "m.room.name", "event_id": "$name",
                     "sender": "@bob:example.org", "state_key": "",
                     "content": {"name": "General"}},
                    member_event("@alice:example.org"),
                    member_event("@bob:example.org"),
                ]},
                "timeline": {"events": [
                    text_message("$m1", "@bob:example.org", "first"),
                    text_message("$m2", "@bob:example.org", "second"),
                    text_message("$m3", "@bob:example.org", "third"),
                    {"type": "m.room.topic", "event_id": "$topic",
                     "sender": "@bob:example.org", "state_key": "",
                     "origin_server_ts": 1_700_000_001_000i64,
                     "content": {"topic": "all things general"}},
                ]},
            },
            "!space:example.org": {
                "state": {"events": [
                    {"type": "m.room.create", "event_id": "$create-space",
                     "sender": "@bob:example.org", "state_key": "",
                     "content": {"type": "m.space"}},
                    {"type": "m.room.canonical_alias", "event_id": "$alias-space",
                     "sender": "@bob:example.org", "state_key": "",
                     "content": {"alias": "#space:example.org"}},
                ]},
                "timeline": {"events": []},
            },
        }},
    })
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn registration_list_join_and_replay() {
    let mock = MockHomeserver::with_batches(vec![seeded_batch()], false);
    let addr = start_gateway(mock).await;
    let mut irc = IrcClient::connect(addr).await;
    irc.register().await;

    // LIST shows the room, hides the space.
    let rows = irc.list_until_contains("#general:example.org").await;
    assert!(rows.iter().all(|row| !row.contains("#space:example.org")));
    let row = rows
        .iter()
        .find(|row| row.contains("#general:example.org"))
        .unwrap();
    assert!(row.contains(" 2 "), "expected member count 2 in {row}");

    // JOIN: announce first, then the backlog in order, topic dropped.
    irc.send("JOIN #general:example.org").await;
    let lines = irc
        .collect_until("replayed backlog", |l| l.contains(":third"))
        .await;

    assert!(lines[0].starts_with(":alice:example.org!alice@example.org JOIN"));
    let topic_numeric = lines.iter().find(|l| l.contains(" 332 ")).unwrap();
    assert!(
        topic_numeric.contains("[General] all things general"),
        "unexpected topic line: {topic_numeric}"
    );
    let names = lines.iter().find(|l| l.contains(" 353 ")).unwrap();
    assert!(names.contains("@alice:example.org!@alice@example.org"));
    assert!(names.contains("@bob:example.org!@bob@example.org"));

    let interesting: Vec<&String> = lines
        .iter()
        .filter(|l| l.contains("PRIVMSG") || l.contains("TOPIC "))
        .collect();
    assert_eq!(interesting.len(), 3, "got: {interesting:?}");
    assert!(interesting[0].contains(":first"));
    assert!(interesting[1].contains(":second"));
    assert!(interesting[2].contains(":third"));
    let ends_of_names = lines.iter().position(|l| l.contains(" 366 ")).unwrap();
    let first_msg = lines.iter().position(|l| l.contains(":first")).unwrap();
    assert!(ends_of_names < first_msg, "names must precede the replay");
}

#[tokio::test]
async fn privmsg_and_action_reach_matrix() {
    let mock = MockHomeserver::with_batches(vec![seeded_batch()], false);
    let addr = start_gateway(mock.clone()).await;
    let mut irc = IrcClient::connect(addr).await;
    irc.register().await;
    irc.list_until_contains("#general:example.org").await;
    irc.send("JOIN #general:example.org").await;
    irc.expect("end of names", |l| l.contains(" 366 ")).await;

    irc.send("PRIVMSG #general:example.org :hello there").await;
    irc.send("PRIVMSG #general:example.org :\u{1}ACTION waves\u{1}")
        .await;

    let sent = wait_for(|| {
        let sent = mock.sent.lock().unwrap();
        (sent.len() >= 2).then(|| sent.clone())
    })
    .await;
    assert_eq!(sent[0].0, "!room1:example.org");
    assert_eq!(sent[0].1["msgtype"], "m.text");
    assert_eq!(sent[0].1["body"], "hello there");
    assert_eq!(sent[1].1["msgtype"], "m.emote");
    assert_eq!(sent[1].1["body"], "waves");
}

#[tokio::test]
async fn echo_message_capability_reflects_own_messages() {
    let mock = MockHomeserver::with_batches(vec![seeded_batch()], false);
    let addr = start_gateway(mock).await;
    let mut irc = IrcClient::connect(addr).await;

    irc.send("CAP LS 302").await;
    irc.expect("CAP LS", |l| l.contains("CAP") && l.contains("echo-message"))
        .await;
    irc.send("CAP REQ :message-tags echo-message").await;
    irc.expect("CAP ACK", |l| l.contains("ACK")).await;
    irc.send("CAP END").await;
    irc.register().await;

    irc.list_until_contains("#general:example.org").await;
    irc.send("JOIN #general:example.org").await;
    irc.expect("end of names", |l| l.contains(" 366 ")).await;

    irc.send("PRIVMSG #general:example.org :echoed").await;
    let echo = irc
        .expect("echoed PRIVMSG", |l| {
            l.contains("PRIVMSG") && l.contains(":echoed")
        })
        .await;
    assert!(echo.contains("msgid="), "echo must carry msgid: {echo}");
    assert!(
        echo.contains(":alice:example.org!alice@example.org PRIVMSG"),
        "echo must come from the user: {echo}"
    );
}

#[tokio::test]
async fn mjoin_joins_on_matrix_side_only() {
    let mock = MockHomeserver::with_batches(vec![seeded_batch()], false);
    let addr = start_gateway(mock.clone()).await;
    let mut irc = IrcClient::connect(addr).await;
    irc.register().await;

    irc.send("MJOIN #elsewhere:example.org").await;
    irc.expect("MJOIN notice", |l| {
        l.contains("NOTICE") && l.contains("!joined:example.org")
    })
    .await;
    let joined = wait_for(|| {
        let joined = mock.joined.lock().unwrap();
        (!joined.is_empty()).then(|| joined.clone())
    })
    .await;
    assert_eq!(joined[0], "#elsewhere:example.org");
}

#[tokio::test]
async fn revoked_token_ends_the_connection() {
    let mock = MockHomeserver::with_batches(vec![seeded_batch()], true);
    let addr = start_gateway(mock).await;
    let mut irc = IrcClient::connect(addr).await;
    irc.register().await;

    irc.expect("session-ended ERROR", |l| l.starts_with("ERROR"))
        .await;
    assert!(irc.recv().await.is_none(), "server must close the socket");
}

#[tokio::test]
async fn wrong_password_is_rejected_with_464() {
    let mock = MockHomeserver::with_batches(vec![], false);
    let addr = start_gateway(mock).await;
    let mut irc = IrcClient::connect(addr).await;

    irc.send("PASS wrong").await;
    irc.send("NICK alice:example.org").await;
    irc.send("USER alice 0 * :Alice").await;
    irc.expect("password mismatch", |l| l.contains(" 464 ")).await;
}

/// Poll a condition every 50 ms for up to 5 s.
async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..100 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Condition not reached in time");
}
