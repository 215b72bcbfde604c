//! IRC message parsing and formatting.
//!
//! Implements the RFC 1459 / RFC 2812 message format plus IRCv3 message
//! tags. Tags are kept in a `BTreeMap` so they serialize in sorted key
//! order, making a parse/serialize round trip canonical.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Maximum length of a serialized IRC line, including the trailing CR-LF.
pub const MAX_LINE_LEN: usize = 512;

/// Source prefix for messages originated by the gateway itself.
pub const SERVER_SOURCE: &str = "server.";

/// Errors produced by [`Message::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    /// The line was empty after stripping CR-LF. Skipped, not an offence.
    #[error("empty line")]
    Empty,
    /// The line could not be parsed as an IRC message.
    #[error("malformed line: {0}")]
    Malformed(String),
}

/// A parsed IRC message with optional IRCv3 tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, sorted by key. Values are stored unescaped.
    pub tags: BTreeMap<String, String>,
    /// Optional message prefix (server or user origin), without the `:`.
    pub prefix: Option<String>,
    /// The IRC command (e.g. "NICK", "PRIVMSG", "001"), uppercased.
    pub command: String,
    /// Command parameters. The trailing parameter, if any, is kept
    /// verbatim and may contain spaces; it is never re-split.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line, including optional tags and source prefix.
    pub fn parse(line: &str) -> Result<Self, LineError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(LineError::Empty);
        }

        let mut rest = line;

        // Tags: @key=value;key2=value2
        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let Some((tag_str, after)) = tagged.split_once(' ') else {
                return Err(LineError::Malformed(line.to_string()));
            };
            rest = after;
            parse_tags(tag_str).ok_or_else(|| LineError::Malformed(line.to_string()))?
        } else {
            BTreeMap::new()
        };

        // Split off the trailing parameter: the first `:` preceded by a
        // space. Everything after it is one parameter, spaces included.
        let bytes = rest.as_bytes();
        let trailing_at = (1..bytes.len())
            .find(|&i| bytes[i] == b':' && bytes[i - 1] == b' ');
        let (main, trailing) = match trailing_at {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };

        let mut words = main.split_ascii_whitespace();
        let mut prefix = None;
        let mut first = words.next();
        if let Some(token) = first {
            if let Some(source) = token.strip_prefix(':') {
                prefix = Some(source.to_string());
                first = words.next();
            }
        }
        let Some(command) = first else {
            return Err(LineError::Malformed(line.to_string()));
        };

        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Create a new message with no prefix.
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Message {
            tags: BTreeMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a new message originated by the gateway (`server.` prefix).
    pub fn from_server(command: &str, params: Vec<&str>) -> Self {
        Self::with_source(SERVER_SOURCE, command, params)
    }

    /// Create a new message with an explicit source prefix.
    pub fn with_source(source: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            tags: BTreeMap::new(),
            prefix: Some(source.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Attach a tag, builder-style.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Serialized form with tags omitted, for clients that did not enable
    /// `message-tags`.
    pub fn untagged(&self) -> String {
        let mut out = String::new();
        self.write_body(&mut out).expect("string formatting");
        out
    }

    fn write_body(&self, f: &mut impl fmt::Write) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    write!(f, ";")?;
                }
                first = false;
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }
        self.write_body(f)
    }
}

/// Parse an IRCv3 tag string: `key=value;key2=value2`.
///
/// Keys are restricted to `[A-Za-z0-9/+-]`; anything else makes the whole
/// line malformed. Missing values normalize to the empty string.
fn parse_tags(tag_str: &str) -> Option<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for item in tag_str.split(';') {
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => (key, unescape_tag_value(value)),
            None => (item, String::new()),
        };
        if key.is_empty() || !key.bytes().all(is_tag_key_byte) {
            return None;
        }
        tags.insert(key.to_string(), value);
    }
    Some(tags)
}

fn is_tag_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'+' | b'-')
}

/// Unescape IRCv3 tag values.
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Escape a value for IRCv3 tag encoding.
fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Pack words into lines of at most `budget` bytes, single-space joined.
///
/// Used to pre-split long NAMES payloads so each numeric fits the
/// 512-byte line limit. A word longer than the budget gets a line of its
/// own rather than being truncated.
pub fn wrap_words<I, S>(words: I, budget: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in words {
        let word = word.as_ref();
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= budget {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

// Registration numerics
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";
pub const RPL_ISUPPORT: &str = "005";

// MOTD
pub const RPL_MOTDSTART: &str = "375";
pub const RPL_MOTD: &str = "372";
pub const RPL_ENDOFMOTD: &str = "376";

// Channel numerics
pub const RPL_LIST: &str = "322";
pub const RPL_LISTEND: &str = "323";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_TOPICWHOTIME: &str = "333";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_PASSWDMISMATCH: &str = "464";

// SASL numerics
pub const RPL_LOGGEDIN: &str = "900";
pub const RPL_SASLSUCCESS: &str = "903";
pub const ERR_SASLFAIL: &str = "904";
pub const ERR_SASLABORTED: &str = "906";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_command() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.tags.is_empty());
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_with_prefix() {
        let msg = Message::parse(":server 001 alice :Welcome").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("server"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["alice", "Welcome"]);
    }

    #[test]
    fn parse_with_tags_and_source() {
        let msg =
            Message::parse("@msgid=foo :nick!user@host PRIVMSG #chan :hello\r\n").unwrap();
        assert_eq!(msg.tags.get("msgid").unwrap(), "foo");
        assert_eq!(msg.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello"]);
    }

    #[test]
    fn parse_valueless_tag_normalizes_to_empty() {
        let msg = Message::parse("@batch PING :x").unwrap();
        assert_eq!(msg.tags.get("batch").unwrap(), "");
    }

    #[test]
    fn parse_lowercases_nothing_but_command() {
        let msg = Message::parse("privmsg #Chan :Hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#Chan", "Hi"]);
    }

    #[test]
    fn parse_trailing_keeps_spaces() {
        let msg = Message::parse("TOPIC #chan :one  two   three").unwrap();
        assert_eq!(msg.params, vec!["#chan", "one  two   three"]);
    }

    #[test]
    fn parse_collapses_space_runs_between_params() {
        let msg = Message::parse("USER u   0  * :real name").unwrap();
        assert_eq!(msg.params, vec!["u", "0", "*", "real name"]);
    }

    #[test]
    fn parse_empty_line() {
        assert_eq!(Message::parse("\r\n"), Err(LineError::Empty));
    }

    #[test]
    fn parse_missing_command_is_malformed() {
        assert!(matches!(
            Message::parse(":prefix.only"),
            Err(LineError::Malformed(_))
        ));
        assert!(matches!(
            Message::parse("@tag=1 "),
            Err(LineError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_tag_key() {
        assert!(matches!(
            Message::parse("@b~d=1 PING"),
            Err(LineError::Malformed(_))
        ));
        assert!(matches!(
            Message::parse("@=1 PING"),
            Err(LineError::Malformed(_))
        ));
    }

    #[test]
    fn serialize_uses_trailing_when_needed() {
        let msg = Message::from_server("001", vec!["alice", "Welcome to IRC"]);
        assert_eq!(msg.to_string(), ":server. 001 alice :Welcome to IRC");

        let empty = Message::new("PONG", vec![""]);
        assert_eq!(empty.to_string(), "PONG :");

        let colon = Message::new("PRIVMSG", vec!["#c", ":)"]);
        assert_eq!(colon.to_string(), "PRIVMSG #c ::)");
    }

    #[test]
    fn round_trip_canonical_lines() {
        for line in [
            "PING token",
            ":nick!user@host PRIVMSG #chan :hello world",
            "@account=alice;msgid=foo :nick!user@host PRIVMSG #chan :hi",
            "@a=b\\sc PRIVMSG #chan :x",
            ":server. 353 nick = #chan :a b c",
        ] {
            let msg = Message::parse(line).unwrap();
            assert_eq!(msg.to_string(), line, "round trip failed for {line:?}");
        }
    }

    #[test]
    fn tags_serialize_sorted() {
        let msg = Message::new("PING", vec!["x"])
            .with_tag("zeta", "1")
            .with_tag("alpha", "2");
        assert_eq!(msg.to_string(), "@alpha=2;zeta=1 PING x");
    }

    #[test]
    fn tag_escaping_round_trip() {
        let original = "hello world;test\\x";
        let escaped = escape_tag_value(original);
        assert_eq!(escaped, "hello\\sworld\\:test\\\\x");
        assert_eq!(unescape_tag_value(&escaped), original);
    }

    #[test]
    fn untagged_drops_tags_only() {
        let msg = Message::with_source("n!u@h", "PRIVMSG", vec!["#c", "hi"])
            .with_tag("msgid", "e1");
        assert_eq!(msg.untagged(), ":n!u@h PRIVMSG #c hi");
    }

    #[test]
    fn wrap_words_respects_budget() {
        let lines = wrap_words(["aaaa", "bbbb", "cccc", "dddd"], 9);
        assert_eq!(lines, vec!["aaaa bbbb", "cccc dddd"]);

        let lines = wrap_words(["a", "waytoolongword"], 5);
        assert_eq!(lines, vec!["a", "waytoolongword"]);

        assert!(wrap_words(Vec::<&str>::new(), 10).is_empty());
    }
}
