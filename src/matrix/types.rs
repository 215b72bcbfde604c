//! Data model for cached Matrix room state.

use std::collections::HashMap;

use serde::Deserialize;

/// A member of a Matrix room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomMember {
    pub display_name: Option<String>,
    pub power_level: i64,
}

/// A room topic with attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTopic {
    pub text: String,
    /// Matrix user id of whoever set the topic.
    pub set_by: String,
    /// Milliseconds since the epoch, from `origin_server_ts`.
    pub set_at_ms: i64,
}

/// Bridge metadata from an `m.bridge` state event: the room mirrors a
/// conversation on a foreign network (Discord, Google Chat, ...).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeInfo {
    #[serde(default)]
    pub protocol: Option<BridgeRef>,
    #[serde(default)]
    pub network: Option<BridgeRef>,
    #[serde(default)]
    pub channel: Option<BridgeRef>,
}

/// One `{id, name}` pair inside an `m.bridge` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Cached state for a single Matrix room.
///
/// A room exists in the store iff the homeserver has reported it in at
/// least one sync response; every field reflects the last-applied event
/// in sync order.
#[derive(Debug, Clone, Default)]
pub struct Room {
    /// Authoritative `#name:server` handle, when the room has one.
    pub canonical_alias: Option<String>,
    /// Display name, when set.
    pub name: Option<String>,
    pub topic: Option<RoomTopic>,
    /// Room type from `m.room.create`; `"m.space"` rooms are hidden from
    /// listings.
    pub room_type: Option<String>,
    pub members: HashMap<String, RoomMember>,
    pub bridge_info: Option<BridgeInfo>,
    /// True once the initial state sync for the room has been applied.
    /// Monotonic within a session.
    pub synced: bool,
}
