//! Minimal Matrix Client-Server API client.
//!
//! Wraps the handful of r0 endpoints the gateway needs: password login,
//! the `/sync` long poll, joining rooms, sending messages, and setting
//! topics. One client exists per IRC connection and carries that
//! session's access token.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::matrix::events::SyncResponse;

/// Errors from the homeserver, split by how the caller should react.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// Transport-level failure (DNS, refused, timeout). Retryable.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// 401/403: the session is dead. Retrying cannot help.
    #[error("homeserver rejected the request ({status}): {message}")]
    Denied { status: u16, message: String },
    /// 429 or 5xx: the homeserver is struggling. Retryable.
    #[error("homeserver error ({status}): {message}")]
    Server { status: u16, message: String },
    /// Any other non-success status.
    #[error("unexpected homeserver response ({status}): {message}")]
    Api { status: u16, message: String },
}

impl MatrixError {
    /// True when the Matrix session must end and the client be told.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MatrixError::Denied { .. })
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

/// A logged-in Matrix session.
pub struct MatrixClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    pub user_id: String,
    txn_seed: i64,
    txn_counter: AtomicU64,
}

impl MatrixClient {
    /// Log in with `m.login.password` and return a ready client.
    pub async fn login(
        homeserver_url: &str,
        user_id: &str,
        password: &str,
    ) -> Result<Self, MatrixError> {
        let http = reqwest::Client::new();
        let base_url = homeserver_url.trim_end_matches('/').to_string();
        let body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": user_id},
            "password": password,
            "initial_device_display_name": "matrix-irc-gateway",
        });
        let resp = http
            .post(format!("{base_url}/_matrix/client/r0/login"))
            .json(&body)
            .send()
            .await?;
        let login: LoginResponse = check(resp).await?.json().await?;
        tracing::info!(user_id = %login.user_id, "Logged in to homeserver");
        Ok(MatrixClient {
            http,
            base_url,
            access_token: login.access_token,
            user_id: login.user_id,
            txn_seed: chrono::Utc::now().timestamp_millis(),
            txn_counter: AtomicU64::new(0),
        })
    }

    /// One `/sync` long poll. `since` is absent on the first call.
    pub async fn sync(
        &self,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> Result<SyncResponse, MatrixError> {
        let mut req = self
            .http
            .get(format!("{}/_matrix/client/r0/sync", self.base_url))
            .bearer_auth(&self.access_token)
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }
        let resp = req.send().await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Join a room by id or alias. Returns the resolved room id.
    pub async fn join_room(&self, room: &str) -> Result<String, MatrixError> {
        let resp = self
            .http
            .post(format!(
                "{}/_matrix/client/r0/join/{}",
                self.base_url,
                path_escape(room)
            ))
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await?;
        let join: JoinResponse = check(resp).await?.json().await?;
        Ok(join.room_id)
    }

    /// Send an `m.room.message` event. Returns the new event id.
    pub async fn send_message(
        &self,
        room_id: &str,
        msgtype: &str,
        body: &str,
    ) -> Result<String, MatrixError> {
        let txn = self.next_txn_id();
        let resp = self
            .http
            .put(format!(
                "{}/_matrix/client/r0/rooms/{}/send/m.room.message/{}",
                self.base_url,
                path_escape(room_id),
                txn
            ))
            .bearer_auth(&self.access_token)
            .json(&json!({"msgtype": msgtype, "body": body}))
            .send()
            .await?;
        let sent: SendResponse = check(resp).await?.json().await?;
        Ok(sent.event_id)
    }

    /// Replace the room topic via an `m.room.topic` state event.
    pub async fn set_topic(&self, room_id: &str, topic: &str) -> Result<(), MatrixError> {
        let resp = self
            .http
            .put(format!(
                "{}/_matrix/client/r0/rooms/{}/state/m.room.topic",
                self.base_url,
                path_escape(room_id)
            ))
            .bearer_auth(&self.access_token)
            .json(&json!({"topic": topic}))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("irc{}x{n}", self.txn_seed)
    }
}

/// Map non-success statuses onto [`MatrixError`], pulling the homeserver's
/// human-readable `error` field out of the body when there is one.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, MatrixError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(match code {
        401 | 403 => MatrixError::Denied {
            status: code,
            message,
        },
        429 | 500..=599 => MatrixError::Server {
            status: code,
            message,
        },
        _ => MatrixError::Api {
            status: code,
            message,
        },
    })
}

/// Percent-encode a room id or alias for use as a path segment. Room
/// aliases start with `#`, which must not reach the URL fragment parser.
fn path_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
