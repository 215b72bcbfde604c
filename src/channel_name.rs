//! Derives stable, human-readable IRC channel names from Matrix rooms.
//!
//! Precedence: canonical alias, then `m.bridge` metadata, then the raw
//! room id. Bridged names look like `#general:My-Guild.discord`; a
//! leading `@` marks a bridged direct message.

use crate::matrix::types::{BridgeInfo, Room};

/// Remote protocol ids that read better under a shorter label.
const PROTOCOL_ALIASES: &[(&str, &str)] = &[
    ("discordgo", "discord"),
    ("googlechat", "gchat"),
];

/// Remote network ids with preferred labels. None shipped at present;
/// lookup misses fall through to the network's display name.
const NETWORK_ALIASES: &[(&str, &str)] = &[];

/// Derive the IRC channel name for a room.
///
/// Pure in its inputs: identical room state yields identical names.
/// Distinctness across rooms is not guaranteed; the store breaks ties by
/// iteration order on reverse lookup.
pub fn channel_name(room_id: &str, room: &Room) -> String {
    if let Some(alias) = &room.canonical_alias {
        return alias.clone();
    }
    if let Some(bridge) = &room.bridge_info {
        if let Some(name) = bridged_name(room_id, room, bridge) {
            return name;
        }
    }
    room_id.to_string()
}

/// `localpart:remotepart` for a bridged room, or `None` when the bridge
/// payload names no protocol at all.
fn bridged_name(room_id: &str, room: &Room, bridge: &BridgeInfo) -> Option<String> {
    let protocol = bridge.protocol.as_ref()?;
    let protocol_label = protocol
        .id
        .as_deref()
        .and_then(|id| alias_lookup(PROTOCOL_ALIASES, id))
        .or(protocol.name.as_deref())
        .or(protocol.id.as_deref())?;

    let network_label = bridge.network.as_ref().and_then(|network| {
        network
            .id
            .as_deref()
            .and_then(|id| alias_lookup(NETWORK_ALIASES, id))
            .or(network.name.as_deref())
    });

    let remote = match network_label {
        Some(network) => format!(
            "{}.{}",
            sanitize_component(network),
            sanitize_component(protocol_label)
        ),
        None => sanitize_component(protocol_label),
    };

    // Local side: prefer the remote channel's own name, then the room's
    // display name, then the room id truncated at its server part.
    let source = bridge
        .channel
        .as_ref()
        .and_then(|c| c.name.clone())
        .or_else(|| room.name.clone())
        .unwrap_or_else(|| {
            room_id
                .split(':')
                .next()
                .unwrap_or(room_id)
                .to_string()
        });
    let mut local: String = source
        .chars()
        .map(|c| if matches!(c, '@' | ' ' | ':') { '-' } else { c })
        .collect();
    if !local.starts_with(['#', '!', '&', '@']) {
        local.insert(0, '@');
    }

    Some(format!("{local}:{remote}"))
}

fn alias_lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table
        .iter()
        .find_map(|(id, label)| (*id == key).then_some(*label))
}

/// Collapse runs of characters outside `[A-Za-z0-9_-]` into single `-`.
fn sanitize_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}
