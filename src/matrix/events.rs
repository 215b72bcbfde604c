//! Serde models for the slice of the Matrix Client-Server API the
//! gateway consumes.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Response to `GET /_matrix/client/r0/sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: EventList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A single event, state or timeline. Content stays raw JSON until a
/// handler picks a typed view with [`Event::content`].
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Event {
    /// Deserialize the content into a typed view, falling back to the
    /// type's default on malformed payloads. Homeservers forward
    /// arbitrary client content; a bad payload must not kill the batch.
    pub fn content<T: DeserializeOwned + Default>(&self) -> T {
        serde_json::from_value(self.content.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberContent {
    #[serde(default)]
    pub membership: String,
    #[serde(default)]
    pub displayname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameContent {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopicContent {
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CanonicalAliasContent {
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateContent {
    #[serde(rename = "type", default)]
    pub room_type: Option<String>,
}
