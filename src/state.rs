//! Per-connection IRC-side state: registration, nickname, enabled
//! capabilities, the channel table, and client-initiated batch buffers.

use std::collections::HashMap;

use crate::channels::Channel;
use crate::irc::Message;

/// IRCv3 capabilities the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    MessageTags,
    Batch,
    AccountTag,
    EchoMessage,
    LabeledResponse,
    ServerTime,
    Sasl,
    Multiline,
    /// Local: suppress the 353/366 burst when announcing a channel.
    NoImplicitNames,
    /// Local: the client understands the draft RENAME command.
    ChannelRename,
}

impl Capability {
    /// Every capability advertised in `CAP LS`.
    pub const ALL: &'static [Capability] = &[
        Capability::MessageTags,
        Capability::Batch,
        Capability::AccountTag,
        Capability::EchoMessage,
        Capability::LabeledResponse,
        Capability::ServerTime,
        Capability::Sasl,
        Capability::Multiline,
        Capability::NoImplicitNames,
        Capability::ChannelRename,
    ];

    /// Wire token for CAP negotiation.
    pub fn token(self) -> &'static str {
        match self {
            Capability::MessageTags => "message-tags",
            Capability::Batch => "batch",
            Capability::AccountTag => "account-tag",
            Capability::EchoMessage => "echo-message",
            Capability::LabeledResponse => "labeled-response",
            Capability::ServerTime => "server-time",
            Capability::Sasl => "sasl",
            Capability::Multiline => "draft/multiline",
            Capability::NoImplicitNames => "draft/no-implicit-names",
            Capability::ChannelRename => "draft/channel-rename",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.iter().find(|cap| cap.token() == token).copied()
    }
}

/// The nickname of a gateway user: Matrix localpart plus homeserver.
///
/// Clients must pick `localpart:homeserver` so the gateway knows which
/// homeserver to log into and which user the session stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nick {
    pub local: String,
    pub server: String,
}

impl Nick {
    /// Parse `localpart:homeserver`. A leading `@` is tolerated.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('@').unwrap_or(s);
        let (local, server) = s.split_once(':')?;
        if local.is_empty() || server.is_empty() {
            return None;
        }
        Some(Nick {
            local: local.to_string(),
            server: server.to_string(),
        })
    }

    /// The nick as presented on IRC.
    pub fn full(&self) -> String {
        format!("{}:{}", self.local, self.server)
    }

    /// The Matrix user id this nick stands for.
    pub fn user_id(&self) -> String {
        format!("@{}:{}", self.local, self.server)
    }
}

/// Render a Matrix user id as an IRC `nick!user@host` source: the full id
/// is the nick, the id split on its first `:` supplies user and host.
/// `@alice:example.org` becomes `@alice:example.org!@alice@example.org`.
pub fn user_id_hostmask(user_id: &str) -> String {
    match user_id.split_once(':') {
        Some((local, server)) => format!("{user_id}!{local}@{server}"),
        None => user_id.to_string(),
    }
}

/// A client-initiated IRCv3 batch buffered until its close marker.
#[derive(Debug)]
pub struct Batch {
    pub opening: Message,
    commands: Vec<Message>,
}

/// Mutable IRC-side session state.
///
/// Shared between the command dispatcher and the sync dispatcher behind a
/// mutex; lock it after the room store, never before.
#[derive(Default)]
pub struct ClientState {
    registered: bool,
    nick: Option<Nick>,
    gecos: Option<String>,
    capabilities: Vec<Capability>,
    pub(crate) channels: HashMap<String, Channel>,
    batches: HashMap<String, Batch>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> bool {
        self.registered
    }

    pub fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    pub fn nick(&self) -> Option<&Nick> {
        self.nick.as_ref()
    }

    pub fn set_nick(&mut self, nick: Nick) {
        self.nick = Some(nick);
    }

    /// The nick for numeric replies, `*` before one is known.
    pub fn nick_or_star(&self) -> String {
        self.nick
            .as_ref()
            .map(Nick::full)
            .unwrap_or_else(|| "*".to_string())
    }

    /// `nick!user@host` for messages sent on the user's behalf.
    pub fn own_hostmask(&self) -> String {
        user_id_hostmask(&self.nick_or_star())
    }

    pub fn gecos(&self) -> Option<&str> {
        self.gecos.as_deref()
    }

    pub fn set_gecos(&mut self, gecos: String) {
        self.gecos = Some(gecos);
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Enable capabilities. New entries go to the front; duplicates are
    /// permitted and harmless.
    pub fn add_capabilities(&mut self, caps: &[Capability]) {
        for cap in caps.iter().rev() {
            self.capabilities.insert(0, *cap);
        }
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Open a batch buffer under `reference`.
    pub fn create_batch(&mut self, reference: &str, opening: Message) {
        self.batches.insert(
            reference.to_string(),
            Batch {
                opening,
                commands: Vec::new(),
            },
        );
    }

    /// Buffer a command into an open batch. Returns whether the batch
    /// reference was known.
    pub fn add_batch_command(&mut self, reference: &str, command: Message) -> bool {
        match self.batches.get_mut(reference) {
            Some(batch) => {
                batch.commands.push(command);
                true
            }
            None => false,
        }
    }

    /// Close a batch, yielding its opening command and the buffered
    /// commands in insertion order.
    pub fn pop_batch(&mut self, reference: &str) -> Option<(Message, Vec<Message>)> {
        self.batches
            .remove(reference)
            .map(|batch| (batch.opening, batch.commands))
    }
}
