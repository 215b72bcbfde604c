//! IRC channel lifecycle: materialization, replay queues, and the
//! join/part/rename choreography toward the client.
//!
//! A channel becomes known to a connection as soon as its Matrix room
//! produces traffic, but nothing is delivered until the client JOINs it.
//! Conversational messages seen in between wait in a bounded queue and
//! are replayed, in order, as part of the join. Metadata (topic changes,
//! membership) is not queued: the announce sequence rebuilds a consistent
//! snapshot from room state at join time.

use std::collections::VecDeque;

use crate::connection::ClientWriter;
use crate::irc::{self, Message, MAX_LINE_LEN};
use crate::matrix::types::Room;
use crate::state::{user_id_hostmask, Capability, ClientState};

/// Maximum number of messages a pending channel keeps for replay.
pub const MAX_QUEUED: usize = 256;

/// A channel the connection has observed, keyed in the channel table by
/// its current derived name.
#[derive(Debug, Default)]
pub struct Channel {
    pub room_id: String,
    /// False while pending: the room exists but the client has not JOINed.
    pub joined: bool,
    queue: VecDeque<Message>,
}

impl Channel {
    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl ClientState {
    /// Install a pending channel if absent.
    pub fn create_channel(&mut self, name: &str, room_id: &str) {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Channel {
                room_id: room_id.to_string(),
                ..Default::default()
            });
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Remove a channel, parting the client first if it had joined.
    pub fn delete_channel(&mut self, name: &str, w: &ClientWriter) {
        if let Some(channel) = self.channels.remove(name) {
            if channel.joined {
                self.send_part(name, "Channel deleted by server", w);
            }
        }
    }

    /// Handle a client JOIN.
    ///
    /// Unknown channels get a 403. A duplicate join is acknowledged and
    /// otherwise ignored. A pending channel is announced, then its queue
    /// is replayed in insertion order and the channel becomes joined.
    pub fn join_channel(&mut self, name: &str, room: &Room, w: &ClientWriter) {
        let nick = self.nick_or_star();
        let Some(channel) = self.channels.get_mut(name) else {
            w.send(Message::from_server(
                irc::ERR_NOSUCHCHANNEL,
                vec![&nick, name, "No such channel"],
            ));
            return;
        };
        if channel.joined {
            w.send(Message::from_server("ACK", vec![]));
            return;
        }
        channel.joined = true;
        let queued: Vec<Message> = channel.queue.drain(..).collect();

        self.announce(name, room, w);
        for msg in queued {
            w.send(msg);
        }
    }

    /// Handle a client PART: emit PART and drop back to pending.
    pub fn part_channel(&mut self, name: &str, reason: &str, w: &ClientWriter) {
        let nick = self.nick_or_star();
        match self.channels.get_mut(name) {
            None => {
                w.send(Message::from_server(
                    irc::ERR_NOSUCHCHANNEL,
                    vec![&nick, name, "No such channel"],
                ));
            }
            Some(channel) if !channel.joined => {
                w.send(Message::from_server(
                    irc::ERR_NOTONCHANNEL,
                    vec![&nick, name, "You can't part a channel you aren't in"],
                ));
            }
            Some(channel) => {
                channel.joined = false;
                self.send_part(name, reason, w);
            }
        }
    }

    /// Rekey a channel after its derived name changed, preserving its
    /// room id and queue.
    ///
    /// Silent while the channel is pending. For a joined channel, clients
    /// with `draft/channel-rename` get a single RENAME; everyone else
    /// gets the new channel announced, the old one parted, and a NOTICE
    /// documenting the old name.
    pub fn rename_channel(&mut self, old: &str, new: &str, room: &Room, w: &ClientWriter) {
        if old == new || !self.channels.contains_key(old) {
            return;
        }
        if self.channels.contains_key(new) {
            // Already materialized under the new name; drop the old key.
            self.channels.remove(old);
            return;
        }
        let channel = self.channels.remove(old).expect("checked above");
        let joined = channel.joined;
        self.channels.insert(new.to_string(), channel);
        if !joined {
            return;
        }

        if self.has_capability(Capability::ChannelRename) {
            w.send(Message::from_server(
                "RENAME",
                vec![old, new, "Channel renamed"],
            ));
        } else {
            self.announce(new, room, w);
            self.send_part(old, &format!("Channel renamed to {new}"), w);
            w.send(Message::from_server(
                "NOTICE",
                vec![new, &format!("Channel renamed from {old}")],
            ));
        }
    }

    /// Deliver a message addressed to `name`.
    ///
    /// Unknown names pass straight through (the message is addressed to
    /// the user, not a channel), as does anything on a joined channel. On
    /// a pending channel, conversational commands are queued with the
    /// oldest dropped past [`MAX_QUEUED`]; everything else is dropped.
    pub fn send_to_channel(&mut self, name: &str, msg: Message, w: &ClientWriter) {
        match self.channels.get_mut(name) {
            None => w.send(msg),
            Some(channel) if channel.joined => w.send(msg),
            Some(channel) => {
                if matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE") {
                    if channel.queue.len() >= MAX_QUEUED {
                        channel.queue.pop_front();
                    }
                    channel.queue.push_back(msg);
                }
            }
        }
    }

    /// Announce a channel to the client: JOIN as the user, topic
    /// numerics, then the member list unless `draft/no-implicit-names`.
    pub fn announce(&self, name: &str, room: &Room, w: &ClientWriter) {
        let nick = self.nick_or_star();
        w.send(
            Message::with_source(&self.own_hostmask(), "JOIN", vec![name])
                .with_tag("account", &nick),
        );
        self.send_topic(name, room, w);
        if !self.has_capability(Capability::NoImplicitNames) {
            self.send_names(name, room, w);
        }
    }

    /// Topic numerics for a channel: 331 when the room has neither name
    /// nor topic, else 332 with `[room name] topic text` and, when the
    /// topic carries attribution, 333 with setter and epoch seconds.
    pub fn send_topic(&self, name: &str, room: &Room, w: &ClientWriter) {
        let nick = self.nick_or_star();
        let topic_text = room.topic.as_ref().map(|t| t.text.as_str());
        let composite = match (room.name.as_deref(), topic_text) {
            (Some(room_name), Some(text)) => format!("[{room_name}] {text}"),
            (Some(room_name), None) => format!("[{room_name}]"),
            (None, Some(text)) => text.to_string(),
            (None, None) => {
                w.send(Message::from_server(
                    irc::RPL_NOTOPIC,
                    vec![&nick, name, "No topic is set"],
                ));
                return;
            }
        };
        w.send(Message::from_server(
            irc::RPL_TOPIC,
            vec![&nick, name, &composite],
        ));
        if let Some(topic) = &room.topic {
            w.send(Message::from_server(
                irc::RPL_TOPICWHOTIME,
                vec![
                    &nick,
                    name,
                    &topic.set_by,
                    &(topic.set_at_ms / 1000).to_string(),
                ],
            ));
        }
    }

    /// 353/366 for a channel: members rendered as `user_id!local@server`,
    /// sorted, packed so every numeric fits the 512-byte line budget.
    pub fn send_names(&self, name: &str, room: &Room, w: &ClientWriter) {
        let nick = self.nick_or_star();
        let mut user_ids: Vec<&String> = room.members.keys().collect();
        user_ids.sort();
        let rendered: Vec<String> = user_ids
            .iter()
            .map(|id| user_id_hostmask(id).replace(' ', "\\s"))
            .collect();

        let overhead = Message::from_server(irc::RPL_NAMREPLY, vec![&nick, "=", name, ""])
            .to_string()
            .len()
            + 2;
        let budget = MAX_LINE_LEN.saturating_sub(overhead);
        for line in irc::wrap_words(&rendered, budget) {
            w.send(Message::from_server(
                irc::RPL_NAMREPLY,
                vec![&nick, "=", name, &line],
            ));
        }
        w.send(Message::from_server(
            irc::RPL_ENDOFNAMES,
            vec![&nick, name, "End of /NAMES list"],
        ));
    }

    fn send_part(&self, name: &str, reason: &str, w: &ClientWriter) {
        w.send(Message::with_source(
            &self.own_hostmask(),
            "PART",
            vec![name, reason],
        ));
    }
}
