//! Per-connection cache of Matrix room state.
//!
//! One store exists per IRC connection and dies with it. Every operation
//! takes the store's single lock, so check-then-update compounds are
//! atomic without caller-side locking. Channel-sync callbacks popped by
//! an update run as the final action of that operation, after the guard
//! drops; they must not call back into the store that fired them.
//!
//! Lock order across stores: room store first, then IRC client state,
//! never the reverse.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::channel_name::channel_name;
use crate::matrix::types::{BridgeInfo, Room, RoomMember, RoomTopic};

/// One-shot action fired when a room's initial state sync completes.
/// Receives the room id and a snapshot of the room at firing time.
pub type SyncCallback = Box<dyn FnOnce(&str, &Room) + Send + 'static>;

#[derive(Default)]
struct StoreInner {
    rooms: HashMap<String, Room>,
    /// Callbacks awaiting a channel's first complete sync, keyed by
    /// channel name or room id.
    callbacks: HashMap<String, Vec<SyncCallback>>,
    /// Opaque `since` token for the next `/sync` request.
    since: Option<String>,
    /// Event ids dispatched during the current `since` window, per room.
    handled: HashMap<String, HashSet<String>>,
}

impl StoreInner {
    fn find_room(&self, name: &str) -> Option<(&String, &Room)> {
        self.rooms.iter().find(|(id, room)| {
            room.canonical_alias.as_deref() == Some(name)
                || id.as_str() == name
                || channel_name(id, room) == name
        })
    }
}

/// In-memory cache of the rooms one Matrix session can see.
#[derive(Default)]
pub struct RoomStore {
    inner: Mutex<StoreInner>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to the room, creating a zero-valued room if unseen.
    pub fn update_room(&self, room_id: &str, f: impl FnOnce(&mut Room)) {
        let mut inner = self.inner.lock().unwrap();
        f(inner.rooms.entry(room_id.to_string()).or_default());
    }

    /// Snapshot of a room, if the server has reported it.
    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.inner.lock().unwrap().rooms.get(room_id).cloned()
    }

    /// Replace the canonical alias, returning the previous one.
    ///
    /// If the room is already synced, callbacks parked under the new
    /// alias are drained and fired in the same step.
    pub fn set_canonical_alias(
        &self,
        room_id: &str,
        alias: Option<String>,
    ) -> Option<String> {
        let (previous, fired, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            let room = inner.rooms.entry(room_id.to_string()).or_default();
            let previous = std::mem::replace(&mut room.canonical_alias, alias.clone());
            let synced = room.synced;
            let snapshot = room.clone();
            let fired = match (synced, alias) {
                (true, Some(alias)) => inner.callbacks.remove(&alias).unwrap_or_default(),
                _ => Vec::new(),
            };
            (previous, fired, snapshot)
        };
        for cb in fired {
            cb(room_id, &snapshot);
        }
        previous
    }

    pub fn set_bridge_info(&self, room_id: &str, info: Option<BridgeInfo>) {
        self.update_room(room_id, |room| room.bridge_info = info);
    }

    pub fn set_name(&self, room_id: &str, name: Option<String>) {
        self.update_room(room_id, |room| room.name = name);
    }

    pub fn set_topic(&self, room_id: &str, topic: Option<RoomTopic>) {
        self.update_room(room_id, |room| room.topic = topic);
    }

    pub fn set_type(&self, room_id: &str, room_type: Option<String>) {
        self.update_room(room_id, |room| room.room_type = room_type);
    }

    /// Insert a member if absent. Returns whether it was already present.
    pub fn room_member_add(&self, room_id: &str, user_id: &str, member: RoomMember) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        match room.members.entry(user_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => true,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(member);
                false
            }
        }
    }

    /// Remove a member if present. Returns whether it was present.
    pub fn room_member_del(&self, room_id: &str, user_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner
            .rooms
            .get_mut(room_id)
            .is_some_and(|room| room.members.remove(user_id).is_some())
    }

    pub fn room_members(&self, room_id: &str) -> HashMap<String, RoomMember> {
        let inner = self.inner.lock().unwrap();
        inner
            .rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    pub fn room_member(&self, room_id: &str, user_id: &str) -> Option<RoomMember> {
        let inner = self.inner.lock().unwrap();
        inner
            .rooms
            .get(room_id)
            .and_then(|room| room.members.get(user_id).cloned())
    }

    pub fn room_name(&self, room_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .and_then(|room| room.name.clone())
    }

    pub fn room_topic(&self, room_id: &str) -> Option<RoomTopic> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .and_then(|room| room.topic.clone())
    }

    pub fn room_type(&self, room_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .and_then(|room| room.room_type.clone())
    }

    pub fn room_canonical_alias(&self, room_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .and_then(|room| room.canonical_alias.clone())
    }

    /// Rows for the LIST reply: channel name, member count, topic text.
    /// `m.space` rooms are skipped. Iteration order is unspecified.
    pub fn list_rooms(&self) -> Vec<(String, String, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .rooms
            .iter()
            .filter(|(_, room)| room.room_type.as_deref() != Some("m.space"))
            .map(|(id, room)| {
                (
                    channel_name(id, room),
                    room.members.len().to_string(),
                    room.topic
                        .as_ref()
                        .map(|t| t.text.clone())
                        .unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Resolve an IRC channel name to its room.
    ///
    /// Matches the canonical alias, the room id, or the derived channel
    /// name; the first match in iteration order wins.
    pub fn room_from_irc_channel(&self, name: &str) -> Option<(String, Room)> {
        let inner = self.inner.lock().unwrap();
        inner
            .find_room(name)
            .map(|(id, room)| (id.clone(), room.clone()))
    }

    /// Run `cb` once the named channel's room has completed its initial
    /// sync. Fires immediately (and synchronously) if it already has;
    /// otherwise the callback is parked under `name`, which may be a
    /// channel name or a room id.
    pub fn queue_on_channel_sync(&self, name: &str, cb: SyncCallback) {
        let mut inner = self.inner.lock().unwrap();
        let synced_room = match inner.find_room(name) {
            Some((id, room)) if room.synced => Some((id.clone(), room.clone())),
            _ => None,
        };
        match synced_room {
            Some((room_id, room)) => {
                drop(inner);
                cb(&room_id, &room);
            }
            None => {
                inner
                    .callbacks
                    .entry(name.to_string())
                    .or_default()
                    .push(cb);
            }
        }
    }

    /// Flag a room's initial sync as complete and fire everything parked
    /// under its room id or current canonical alias. Callbacks fired here
    /// never observe `synced == false`.
    pub fn mark_synced(&self, room_id: &str) {
        let (fired, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            let room = inner.rooms.entry(room_id.to_string()).or_default();
            room.synced = true;
            let alias = room.canonical_alias.clone();
            let snapshot = room.clone();
            let mut fired = inner.callbacks.remove(room_id).unwrap_or_default();
            if let Some(alias) = alias {
                if alias != room_id {
                    fired.extend(inner.callbacks.remove(&alias).unwrap_or_default());
                }
            }
            (fired, snapshot)
        };
        for cb in fired {
            cb(room_id, &snapshot);
        }
    }

    /// The `since` token to use for the next `/sync` request.
    pub fn poll_since_marker(&self) -> Option<String> {
        self.inner.lock().unwrap().since.clone()
    }

    /// Advance the sync cursor. Clears the handled-events set: dedup only
    /// spans a single `since` window.
    pub fn update_poll_since_marker(&self, marker: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.since = Some(marker);
        inner.handled.clear();
    }

    /// Event ids already dispatched for a room in the current window.
    pub fn handled_events(&self, room_id: &str) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .handled
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record an event id as dispatched. Idempotent; a missing event id
    /// is a no-op. Returns whether the id was newly recorded.
    pub fn mark_handled_event(&self, room_id: &str, event_id: Option<&str>) -> bool {
        let Some(event_id) = event_id else {
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        inner
            .handled
            .entry(room_id.to_string())
            .or_default()
            .insert(event_id.to_string())
    }
}
