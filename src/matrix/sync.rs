//! The `/sync` long-poll loop and the dispatcher that turns Matrix
//! events into room-store updates and IRC traffic.
//!
//! One loop runs per connection, spawned after login. Transient
//! homeserver failures are absorbed with exponential backoff; a 401/403
//! ends the Matrix session and asks the connection to close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::channel_name::channel_name;
use crate::connection::ClientWriter;
use crate::irc::Message;
use crate::matrix::client::{MatrixClient, MatrixError};
use crate::matrix::events::{
    CanonicalAliasContent, CreateContent, Event, MemberContent, MessageContent, NameContent,
    SyncResponse, TopicContent,
};
use crate::matrix::store::RoomStore;
use crate::matrix::types::{RoomMember, RoomTopic};
use crate::state::{user_id_hostmask, ClientState};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Drive `/sync` until the connection dies or the session is rejected.
pub async fn run_sync_loop(
    client: Arc<MatrixClient>,
    rooms: Arc<RoomStore>,
    state: Arc<Mutex<ClientState>>,
    writer: ClientWriter,
    shutdown: mpsc::Sender<String>,
    timeout_ms: u64,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut warned = false;
    loop {
        let since = rooms.poll_since_marker();
        match client.sync(since.as_deref(), timeout_ms).await {
            Ok(resp) => {
                if warned {
                    let nick = state.lock().unwrap().nick_or_star();
                    writer.notice(&nick, "Reconnected to the homeserver");
                    warned = false;
                }
                backoff = INITIAL_BACKOFF;
                dispatch_batch(&rooms, &state, &writer, &resp);
                rooms.update_poll_since_marker(resp.next_batch);
            }
            Err(err) if err.is_fatal() => {
                tracing::warn!(user_id = %client.user_id, "Matrix session ended: {err}");
                let nick = state.lock().unwrap().nick_or_star();
                writer.notice(&nick, &format!("Matrix session ended: {err}"));
                let _ = shutdown.send("Matrix session ended".to_string()).await;
                return;
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %client.user_id,
                    "Sync failed, retrying in {backoff:?}: {err}"
                );
                if !warned && backoff >= Duration::from_secs(4) {
                    let nick = state.lock().unwrap().nick_or_star();
                    writer.notice(
                        &nick,
                        "Temporarily disconnected from the homeserver; retrying",
                    );
                    warned = true;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Apply one sync response. Per room: state events first, then the
/// synced flag flips (firing parked joins), then the timeline. Order is
/// preserved within a room; across rooms it is unspecified.
pub fn dispatch_batch(
    rooms: &RoomStore,
    state: &Mutex<ClientState>,
    writer: &ClientWriter,
    resp: &SyncResponse,
) {
    for (room_id, joined_room) in &resp.rooms.join {
        for event in &joined_room.state.events {
            dispatch_event(rooms, state, writer, room_id, event, false);
        }
        rooms.mark_synced(room_id);
        for event in &joined_room.timeline.events {
            dispatch_event(rooms, state, writer, room_id, event, true);
        }
    }
}

/// Apply one event. `live` is false for the initial-state section, whose
/// changes are folded silently into the cache rather than echoed as IRC
/// traffic; the announce sequence presents that snapshot at join time.
fn dispatch_event(
    rooms: &RoomStore,
    state: &Mutex<ClientState>,
    writer: &ClientWriter,
    room_id: &str,
    event: &Event,
    live: bool,
) {
    if let Some(event_id) = event.event_id.as_deref() {
        if rooms.handled_events(room_id).contains(event_id) {
            return;
        }
        rooms.mark_handled_event(room_id, Some(event_id));
    }

    match event.kind.as_str() {
        "m.room.canonical_alias" => {
            let content: CanonicalAliasContent = event.content();
            rename_aware(rooms, state, writer, room_id, |rooms| {
                rooms.set_canonical_alias(room_id, content.alias);
            });
        }
        "m.room.name" => {
            let content: NameContent = event.content();
            rename_aware(rooms, state, writer, room_id, |rooms| {
                rooms.set_name(room_id, content.name);
            });
        }
        "m.bridge" | "uk.half-shot.bridge" => {
            rename_aware(rooms, state, writer, room_id, |rooms| {
                rooms.set_bridge_info(room_id, Some(event.content()));
            });
        }
        "m.room.create" => {
            let content: CreateContent = event.content();
            rooms.set_type(room_id, content.room_type);
        }
        "m.room.topic" => {
            let content: TopicContent = event.content();
            let topic = content.topic.map(|text| RoomTopic {
                text,
                set_by: event.sender.clone().unwrap_or_default(),
                set_at_ms: event.origin_server_ts.unwrap_or_default(),
            });
            rooms.set_topic(room_id, topic.clone());
            if live {
                if let Some(topic) = topic {
                    let chan = current_channel_name(rooms, room_id);
                    let msg = Message::with_source(
                        &user_id_hostmask(&topic.set_by),
                        "TOPIC",
                        vec![&chan, &topic.text],
                    );
                    state.lock().unwrap().send_to_channel(&chan, msg, writer);
                }
            }
        }
        "m.room.member" => dispatch_member_event(rooms, state, writer, room_id, event, live),
        "m.room.message" => {
            if live {
                deliver_message(rooms, state, writer, room_id, event);
            }
        }
        _ => {}
    }
}

fn dispatch_member_event(
    rooms: &RoomStore,
    state: &Mutex<ClientState>,
    writer: &ClientWriter,
    room_id: &str,
    event: &Event,
    live: bool,
) {
    let Some(user_id) = event.state_key.as_deref() else {
        return;
    };
    let content: MemberContent = event.content();
    let own = state
        .lock()
        .unwrap()
        .nick()
        .map(|nick| nick.user_id())
        .unwrap_or_default();

    match content.membership.as_str() {
        "join" => {
            let member = RoomMember {
                display_name: content.displayname,
                power_level: 0,
            };
            let already = rooms.room_member_add(room_id, user_id, member);
            if live && !already && user_id != own {
                let chan = current_channel_name(rooms, room_id);
                let msg =
                    Message::with_source(&user_id_hostmask(user_id), "JOIN", vec![&chan]);
                state.lock().unwrap().send_to_channel(&chan, msg, writer);
            }
        }
        "leave" | "ban" => {
            let was_member = rooms.room_member_del(room_id, user_id);
            if !live {
                return;
            }
            let chan = current_channel_name(rooms, room_id);
            if user_id == own {
                // The user left the room from another client; the
                // channel has nothing left to show.
                state.lock().unwrap().delete_channel(&chan, writer);
            } else if was_member {
                let msg =
                    Message::with_source(&user_id_hostmask(user_id), "PART", vec![&chan]);
                state.lock().unwrap().send_to_channel(&chan, msg, writer);
            }
        }
        _ => {}
    }
}

/// Forward an `m.room.message` to the client, materializing the channel
/// as pending on first contact so the replay queue can collect it.
fn deliver_message(
    rooms: &RoomStore,
    state: &Mutex<ClientState>,
    writer: &ClientWriter,
    room_id: &str,
    event: &Event,
) {
    let content: MessageContent = event.content();
    if content.body.is_empty() {
        return;
    }
    let room = rooms.room(room_id).unwrap_or_default();
    let chan = channel_name(room_id, &room);
    let sender = event.sender.clone().unwrap_or_default();

    let (command, body) = match content.msgtype.as_str() {
        "m.notice" => ("NOTICE", content.body),
        "m.emote" => ("PRIVMSG", format!("\u{1}ACTION {}\u{1}", content.body)),
        // Everything else (m.text, media fallbacks) degrades to its
        // plain-text body.
        _ => ("PRIVMSG", content.body),
    };

    let mut state = state.lock().unwrap();
    if state.channel(&chan).is_none() {
        state.create_channel(&chan, room_id);
    }
    for (i, line) in body.split('\n').filter(|l| !l.is_empty()).enumerate() {
        let mut msg =
            Message::with_source(&user_id_hostmask(&sender), command, vec![&chan, line])
                .with_tag("account", &sender);
        // The event id names the first line only; continuations are ours.
        if i == 0 {
            if let Some(event_id) = event.event_id.as_deref() {
                msg = msg.with_tag("msgid", event_id);
            }
        }
        if let Some(ts) = event.origin_server_ts {
            if let Some(time) = server_time_tag(ts) {
                msg = msg.with_tag("time", &time);
            }
        }
        state.send_to_channel(&chan, msg, writer);
    }
}

/// The channel name a room currently materializes as.
fn current_channel_name(rooms: &RoomStore, room_id: &str) -> String {
    channel_name(room_id, &rooms.room(room_id).unwrap_or_default())
}

/// RFC 3339 UTC with millisecond precision, per the `server-time` spec.
fn server_time_tag(origin_server_ts: i64) -> Option<String> {
    Utc.timestamp_millis_opt(origin_server_ts)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Apply a store mutation that may change a room's derived channel name,
/// rekeying the channel table when it does.
fn rename_aware(
    rooms: &RoomStore,
    state: &Mutex<ClientState>,
    writer: &ClientWriter,
    room_id: &str,
    apply: impl FnOnce(&RoomStore),
) {
    let before = rooms
        .room(room_id)
        .map(|room| channel_name(room_id, &room));
    apply(rooms);
    let after_room = rooms.room(room_id).unwrap_or_default();
    let after = channel_name(room_id, &after_room);
    if let Some(before) = before {
        if before != after {
            state
                .lock()
                .unwrap()
                .rename_channel(&before, &after, &after_room, writer);
        }
    }
}
