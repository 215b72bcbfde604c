//! IRCv3 gateway to the Matrix Client-Server API.
//!
//! Each accepted IRC connection owns an independent Matrix session: its
//! own login, sync loop, room cache, and channel table. Nothing is shared
//! across connections and nothing is persisted across restarts.

pub mod channel_name;
pub mod channels;
pub mod config;
pub mod connection;
pub mod irc;
pub mod matrix;
pub mod server;
pub mod state;
