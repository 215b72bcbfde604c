//! Per-client connection handling.
//!
//! Each TCP connection gets a Session that manages:
//! - IRC registration (NICK/USER)
//! - CAP capability negotiation and SASL PLAIN
//! - Matrix login and the per-connection sync loop
//! - Command dispatch post-registration
//!
//! Three tasks serve a connection: this reader/dispatch loop, a writer
//! task draining a channel to the socket, and (after login) the sync
//! poller. Everything a session owns dies with the socket.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel_name::channel_name;
use crate::config::ServerConfig;
use crate::irc::{self, LineError, Message, MAX_LINE_LEN};
use crate::matrix::client::MatrixClient;
use crate::matrix::store::RoomStore;
use crate::matrix::sync;
use crate::state::{Capability, ClientState, Nick};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handle for queueing messages to the client writer task.
#[derive(Clone)]
pub struct ClientWriter {
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientWriter {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a message for the client. A send error means the connection
    /// is already gone; there is nobody left to tell.
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    /// Server NOTICE to the given target.
    pub fn notice(&self, target: &str, text: &str) {
        self.send(Message::from_server("NOTICE", vec![target, text]));
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, config: Arc<ServerConfig>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = format!("{peer}");
    tracing::info!(%session_id, "New connection (plain)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, config).await
}

/// Handle a generic async stream (TLS or other wrappers).
pub async fn handle_generic<S>(stream: S, config: Arc<ServerConfig>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let session_id = format!("stream-{id}");
    tracing::info!(%session_id, "New connection (stream)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, config).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer_half: W,
    session_id: String,
    config: Arc<ServerConfig>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(Mutex::new(ClientState::new()));
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = ClientWriter::new(tx);

    // Writer task: renders per the session's capabilities. Tags are
    // stripped for clients that never enabled message-tags.
    let writer_state = state.clone();
    let writer_session_id = session_id.clone();
    let mut write_half = writer_half;
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let (with_tags, batched) = {
                let st = writer_state.lock().unwrap();
                (
                    st.has_capability(Capability::MessageTags),
                    st.has_capability(Capability::Batch),
                )
            };
            let mut line = if with_tags {
                msg.to_string()
            } else {
                msg.untagged()
            };
            if line.len() + 2 > MAX_LINE_LEN && !batched {
                tracing::warn!(
                    session_id = %writer_session_id,
                    "Oversized line ({} bytes) for client without batch",
                    line.len()
                );
            }
            line.push_str("\r\n");
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<String>(1);
    let mut session = Session {
        session_id: session_id.clone(),
        config,
        state,
        rooms: Arc::new(RoomStore::new()),
        writer,
        matrix: None,
        pending_nick: None,
        user: None,
        password: None,
        cap_negotiating: false,
        sasl_in_progress: false,
        sync_task: None,
        shutdown_tx,
    };

    let keepalive_period = Duration::from_secs(90);
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + keepalive_period,
        keepalive_period,
    );
    let mut awaiting_pong = false;
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        tokio::select! {
            read = reader.read_line(&mut line_buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                awaiting_pong = false;
                tracing::debug!(%session_id, "<- {}", line_buf.trim_end());
                match Message::parse(&line_buf) {
                    Ok(msg) => {
                        if session.dispatch(msg).await.is_break() {
                            break;
                        }
                    }
                    Err(LineError::Empty) => {}
                    Err(err) => {
                        if session.is_registered() {
                            let nick = session.nick_or_star();
                            session.writer.notice(&nick, &format!("{err}"));
                        } else {
                            session.writer.send(Message::new(
                                "ERROR",
                                vec!["Unparseable line before registration"],
                            ));
                            break;
                        }
                    }
                }
            }
            Some(reason) = shutdown_rx.recv() => {
                session.writer.send(Message::new("ERROR", vec![&reason]));
                break;
            }
            _ = keepalive.tick() => {
                if awaiting_pong {
                    tracing::info!(%session_id, "Ping timeout");
                    break;
                }
                session.writer.send(Message::from_server("PING", vec!["gateway"]));
                awaiting_pong = true;
            }
        }
    }

    tracing::info!(%session_id, "Connection closed");
    if let Some(task) = session.sync_task.take() {
        task.abort();
    }
    // Dropping the session releases the last writer handles (parked
    // callbacks included, via the room store), which ends the writer
    // task once its queue drains.
    drop(session);
    if tokio::time::timeout(Duration::from_secs(5), write_handle)
        .await
        .is_err()
    {
        tracing::warn!(%session_id, "Writer task did not drain in time");
    }
    Ok(())
}

/// State and handlers for one IRC session.
struct Session {
    session_id: String,
    config: Arc<ServerConfig>,
    state: Arc<Mutex<ClientState>>,
    rooms: Arc<RoomStore>,
    writer: ClientWriter,
    matrix: Option<Arc<MatrixClient>>,
    /// NICK argument, validated at registration time.
    pending_nick: Option<String>,
    /// USER ident, present once USER has been seen.
    user: Option<String>,
    password: Option<String>,
    cap_negotiating: bool,
    sasl_in_progress: bool,
    sync_task: Option<JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<String>,
}

impl Session {
    fn is_registered(&self) -> bool {
        self.state.lock().unwrap().registered()
    }

    fn nick_or_star(&self) -> String {
        self.state.lock().unwrap().nick_or_star()
    }

    fn numeric(&self, code: &str, params: Vec<&str>) {
        let nick = self.nick_or_star();
        let mut full: Vec<&str> = vec![&nick];
        full.extend(params);
        self.writer.send(Message::from_server(code, full));
    }

    async fn dispatch(&mut self, msg: Message) -> ControlFlow<()> {
        // Commands tagged into an open client batch are buffered, not
        // executed; the dispatcher replays them when the batch closes.
        if msg.command != "BATCH" {
            if let Some(reference) = msg.tags.get("batch").cloned() {
                let buffered = self
                    .state
                    .lock()
                    .unwrap()
                    .add_batch_command(&reference, msg.clone());
                if buffered {
                    return ControlFlow::Continue(());
                }
            }
        }

        match msg.command.as_str() {
            "CAP" => self.handle_cap(&msg).await,
            "AUTHENTICATE" => self.handle_authenticate(&msg).await,
            "PASS" => {
                self.password = msg.params.first().cloned();
            }
            "NICK" => self.handle_nick(&msg).await,
            "USER" => self.handle_user(&msg).await,
            "PING" => {
                let token = msg.params.first().map(String::as_str).unwrap_or("");
                self.writer
                    .send(Message::from_server("PONG", vec![irc::SERVER_SOURCE, token]));
            }
            "PONG" => {}
            "QUIT" => {
                self.writer.send(Message::new("ERROR", vec!["Bye"]));
                return ControlFlow::Break(());
            }
            _ if !self.is_registered() => {
                self.numeric(irc::ERR_NOTREGISTERED, vec!["You have not registered"]);
            }
            "JOIN" => self.handle_join(&msg),
            "PART" => self.handle_part(&msg),
            "NAMES" => self.handle_names(&msg),
            "TOPIC" => self.handle_topic(&msg).await,
            "PRIVMSG" | "NOTICE" => self.handle_privmsg(&msg).await,
            "LIST" => self.handle_list(),
            "MJOIN" => self.handle_mjoin(&msg).await,
            "BATCH" => self.handle_batch(&msg).await,
            "MODE" => self.handle_mode(&msg),
            other => {
                let text = format!("Unknown command {other}");
                self.numeric(irc::ERR_UNKNOWNCOMMAND, vec![other, &text]);
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_cap(&mut self, msg: &Message) {
        let subcmd = msg.params.first().map(|s| s.to_ascii_uppercase());
        match subcmd.as_deref() {
            Some("LS") => {
                if !self.is_registered() {
                    self.cap_negotiating = true;
                }
                let tokens: Vec<&str> =
                    Capability::ALL.iter().map(|cap| cap.token()).collect();
                let caps = tokens.join(" ");
                let nick = self.nick_or_star();
                self.writer
                    .send(Message::from_server("CAP", vec![&nick, "LS", &caps]));
            }
            Some("LIST") => {
                let enabled = {
                    let st = self.state.lock().unwrap();
                    st.capabilities()
                        .iter()
                        .map(|cap| cap.token())
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                let nick = self.nick_or_star();
                self.writer
                    .send(Message::from_server("CAP", vec![&nick, "LIST", &enabled]));
            }
            Some("REQ") => {
                let requested = msg.params.get(1).cloned().unwrap_or_default();
                let parsed: Option<Vec<Capability>> = requested
                    .split_whitespace()
                    .map(Capability::from_token)
                    .collect();
                let nick = self.nick_or_star();
                match parsed {
                    Some(caps) if !caps.is_empty() => {
                        self.state.lock().unwrap().add_capabilities(&caps);
                        self.writer.send(Message::from_server(
                            "CAP",
                            vec![&nick, "ACK", &requested],
                        ));
                    }
                    _ => {
                        self.writer.send(Message::from_server(
                            "CAP",
                            vec![&nick, "NAK", &requested],
                        ));
                    }
                }
            }
            Some("END") => {
                self.cap_negotiating = false;
                self.try_complete_registration().await;
            }
            _ => {}
        }
    }

    /// SASL PLAIN: the authcid is the Matrix user (`localpart:homeserver`)
    /// and the password is the account password. The login round trip to
    /// the homeserver happens right here, so 903/904 are truthful.
    async fn handle_authenticate(&mut self, msg: &Message) {
        let param = msg.params.first().map(String::as_str).unwrap_or("");
        match param {
            "PLAIN" => {
                self.sasl_in_progress = true;
                self.writer.send(Message::new("AUTHENTICATE", vec!["+"]));
            }
            "*" => {
                self.sasl_in_progress = false;
                self.numeric(irc::ERR_SASLABORTED, vec!["SASL authentication aborted"]);
            }
            payload => {
                if !self.sasl_in_progress {
                    self.numeric(irc::ERR_SASLFAIL, vec!["SASL authentication failed"]);
                    return;
                }
                self.sasl_in_progress = false;
                let Some((nick, password)) = decode_sasl_plain(payload) else {
                    self.numeric(irc::ERR_SASLFAIL, vec!["SASL authentication failed"]);
                    return;
                };
                match self.login(&nick, &password).await {
                    Ok(()) => {
                        self.pending_nick = Some(nick.full());
                        self.password = Some(password);
                        let account = nick.user_id();
                        let text = format!("You are now logged in as {account}");
                        self.numeric(
                            irc::RPL_LOGGEDIN,
                            vec![&crate::state::user_id_hostmask(&nick.full()), &account, &text],
                        );
                        self.numeric(
                            irc::RPL_SASLSUCCESS,
                            vec!["SASL authentication successful"],
                        );
                        self.try_complete_registration().await;
                    }
                    Err(text) => {
                        self.numeric(irc::ERR_SASLFAIL, vec![&text]);
                    }
                }
            }
        }
    }

    async fn handle_nick(&mut self, msg: &Message) {
        let Some(nick) = msg.params.first() else {
            return;
        };
        if self.is_registered() {
            let nick_now = self.nick_or_star();
            self.writer
                .notice(&nick_now, "Nick changes are not supported");
            return;
        }
        self.pending_nick = Some(nick.clone());
        self.try_complete_registration().await;
    }

    async fn handle_user(&mut self, msg: &Message) {
        if msg.params.len() >= 4 {
            self.user = Some(msg.params[0].clone());
            self.state
                .lock()
                .unwrap()
                .set_gecos(msg.params[3].clone());
            self.try_complete_registration().await;
        }
    }

    /// Log into the homeserver for `nick` unless already logged in.
    async fn login(&mut self, nick: &Nick, password: &str) -> Result<(), String> {
        if self.matrix.is_some() {
            return Ok(());
        }
        let url = self
            .config
            .homeserver_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", nick.server));
        match MatrixClient::login(&url, &nick.user_id(), password).await {
            Ok(client) => {
                self.matrix = Some(Arc::new(client));
                Ok(())
            }
            Err(err) => {
                tracing::info!(session_id = %self.session_id, "Login failed: {err}");
                Err(format!("Login failed: {err}"))
            }
        }
    }

    async fn try_complete_registration(&mut self) {
        if self.is_registered() || self.cap_negotiating || self.sasl_in_progress {
            return;
        }
        if self.user.is_none() {
            return;
        }
        let Some(pending) = self.pending_nick.clone() else {
            return;
        };
        let Some(nick) = Nick::parse(&pending) else {
            self.numeric(
                irc::ERR_ERRONEUSNICKNAME,
                vec![
                    &pending,
                    "Your nickname must be your Matrix user: localpart:homeserver",
                ],
            );
            return;
        };

        if self.matrix.is_none() {
            let Some(password) = self.password.clone() else {
                self.writer.notice(
                    &pending,
                    "Authenticate with PASS <matrix password> or SASL PLAIN",
                );
                self.numeric(irc::ERR_PASSWDMISMATCH, vec!["Password required"]);
                return;
            };
            if let Err(text) = self.login(&nick, &password).await {
                self.password = None;
                self.numeric(irc::ERR_PASSWDMISMATCH, vec![&text]);
                return;
            }
        }

        {
            let mut st = self.state.lock().unwrap();
            st.set_nick(nick.clone());
            st.set_registered(true);
        }
        self.send_welcome(&nick);

        let client = self.matrix.clone().expect("logged in above");
        tracing::info!(
            session_id = %self.session_id,
            user_id = %client.user_id,
            "Registered, starting sync"
        );
        self.sync_task = Some(tokio::spawn(sync::run_sync_loop(
            client,
            self.rooms.clone(),
            self.state.clone(),
            self.writer.clone(),
            self.shutdown_tx.clone(),
            self.config.sync_timeout_ms,
        )));
    }

    fn send_welcome(&self, nick: &Nick) {
        let full = nick.full();
        let version = format!("matrix-irc-gateway-{VERSION}");
        self.numeric(
            irc::RPL_WELCOME,
            vec![&format!("Welcome to the Matrix IRC gateway, {full}")],
        );
        self.numeric(
            irc::RPL_YOURHOST,
            vec![&format!(
                "Your host is {}, running {version}",
                irc::SERVER_SOURCE
            )],
        );
        self.numeric(
            irc::RPL_CREATED,
            vec!["This server was created for this connection"],
        );
        self.numeric(
            irc::RPL_MYINFO,
            vec![irc::SERVER_SOURCE, &version, "i", "nt"],
        );
        self.numeric(
            irc::RPL_ISUPPORT,
            vec![
                "CASEMAPPING=ascii",
                "CHANTYPES=#!&@",
                "CHANLIMIT=",
                "NETWORK=Matrix",
                "TARGMAX=JOIN:1,PART:1",
                "are supported by this server",
            ],
        );
        self.numeric(
            irc::RPL_MOTDSTART,
            vec![&format!("- {} Message of the day", irc::SERVER_SOURCE)],
        );
        self.numeric(
            irc::RPL_MOTD,
            vec!["- This gateway relays your Matrix rooms over IRC."],
        );
        self.numeric(irc::RPL_ENDOFMOTD, vec!["End of /MOTD command"]);
        if let Some(client) = &self.matrix {
            let text = format!("You are now logged in as {}", client.user_id);
            self.numeric(
                irc::RPL_LOGGEDIN,
                vec![
                    &crate::state::user_id_hostmask(&full),
                    &client.user_id,
                    &text,
                ],
            );
        }
    }

    /// JOIN: park the join on the room's sync state; a synced room joins
    /// immediately, an unsynced one as soon as its initial state lands.
    fn handle_join(&mut self, msg: &Message) {
        let Some(channels) = msg.params.first() else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["JOIN", "Not enough parameters"]);
            return;
        };
        for chan in channels.split(',') {
            let Some((room_id, _)) = self.rooms.room_from_irc_channel(chan) else {
                self.numeric(irc::ERR_NOSUCHCHANNEL, vec![chan, "No such channel"]);
                continue;
            };
            let state = self.state.clone();
            let writer = self.writer.clone();
            self.rooms.queue_on_channel_sync(
                &room_id,
                Box::new(move |room_id, room| {
                    let name = channel_name(room_id, room);
                    let mut st = state.lock().unwrap();
                    st.create_channel(&name, room_id);
                    st.join_channel(&name, room, &writer);
                }),
            );
        }
    }

    fn handle_part(&mut self, msg: &Message) {
        let Some(channels) = msg.params.first() else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["PART", "Not enough parameters"]);
            return;
        };
        let reason = msg.params.get(1).map(String::as_str).unwrap_or("Leaving");
        let mut st = self.state.lock().unwrap();
        for chan in channels.split(',') {
            st.part_channel(chan, reason, &self.writer);
        }
    }

    fn handle_names(&mut self, msg: &Message) {
        let Some(chan) = msg.params.first() else {
            return;
        };
        let room = self.rooms.room_from_irc_channel(chan).map(|(_, room)| room);
        let st = self.state.lock().unwrap();
        match room {
            Some(room) if st.channel(chan).is_some_and(|c| c.joined) => {
                st.send_names(chan, &room, &self.writer);
            }
            _ => {
                let nick = st.nick_or_star();
                self.writer.send(Message::from_server(
                    irc::RPL_ENDOFNAMES,
                    vec![&nick, chan, "End of /NAMES list"],
                ));
            }
        }
    }

    async fn handle_topic(&mut self, msg: &Message) {
        let Some(chan) = msg.params.first().cloned() else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["TOPIC", "Not enough parameters"]);
            return;
        };
        let Some((room_id, room)) = self.rooms.room_from_irc_channel(&chan) else {
            self.numeric(irc::ERR_NOSUCHCHANNEL, vec![&chan, "No such channel"]);
            return;
        };
        match msg.params.get(1) {
            None => {
                let st = self.state.lock().unwrap();
                st.send_topic(&chan, &room, &self.writer);
            }
            Some(text) => {
                let client = self.matrix.clone().expect("registered");
                if let Err(err) = client.set_topic(&room_id, text).await {
                    let nick = self.nick_or_star();
                    self.writer
                        .notice(&nick, &format!("Topic not set: {err}"));
                }
                // The homeserver echoes the new topic back through sync.
            }
        }
    }

    async fn handle_privmsg(&mut self, msg: &Message) {
        if msg.params.len() < 2 {
            self.numeric(
                irc::ERR_NEEDMOREPARAMS,
                vec![&msg.command, "Not enough parameters"],
            );
            return;
        }
        let target = msg.params[0].clone();
        let text = msg.params[1].clone();
        let Some((room_id, _)) = self.rooms.room_from_irc_channel(&target) else {
            self.numeric(irc::ERR_NOSUCHNICK, vec![&target, "No such nick/channel"]);
            return;
        };

        let notice = msg.command == "NOTICE";
        let (msgtype, body) = matrix_message_type(&text, notice);
        let Some(event_id) = self.send_to_matrix(&room_id, msgtype, &body).await else {
            return;
        };

        // With echo-message the reflection is produced locally; either
        // way the sync loop must not deliver our own event again.
        let mut st = self.state.lock().unwrap();
        if st.has_capability(Capability::EchoMessage) {
            let mut echo = Message::with_source(
                &st.own_hostmask(),
                &msg.command,
                vec![&target, &text],
            )
            .with_tag("msgid", &event_id);
            if let Some(label) = msg.tags.get("label") {
                echo = echo.with_tag("label", label);
            }
            st.send_to_channel(&target, echo, &self.writer);
        }
    }

    /// Send a message event, marking it handled so sync skips the echo.
    /// Returns the event id, or `None` after noticing the user.
    async fn send_to_matrix(
        &mut self,
        room_id: &str,
        msgtype: &str,
        body: &str,
    ) -> Option<String> {
        let client = self.matrix.clone().expect("registered");
        match client.send_message(room_id, msgtype, body).await {
            Ok(event_id) => {
                self.rooms.mark_handled_event(room_id, Some(&event_id));
                Some(event_id)
            }
            Err(err) => {
                let nick = self.nick_or_star();
                self.writer
                    .notice(&nick, &format!("Message not delivered: {err}"));
                None
            }
        }
    }

    fn handle_list(&mut self) {
        let nick = self.nick_or_star();
        for (name, members, topic) in self.rooms.list_rooms() {
            self.writer.send(Message::from_server(
                irc::RPL_LIST,
                vec![&nick, &name, &members, &topic],
            ));
        }
        self.writer.send(Message::from_server(
            irc::RPL_LISTEND,
            vec![&nick, "End of /LIST"],
        ));
    }

    /// MJOIN: join a room on the Matrix side only. Nothing materializes
    /// on IRC until the room syncs and the user also JOINs it.
    async fn handle_mjoin(&mut self, msg: &Message) {
        let Some(target) = msg.params.first().cloned() else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["MJOIN", "Not enough parameters"]);
            return;
        };
        let client = self.matrix.clone().expect("registered");
        let nick = self.nick_or_star();
        match client.join_room(&target).await {
            Ok(room_id) => {
                self.writer.notice(
                    &nick,
                    &format!("Joined {room_id} on Matrix; JOIN it here to attach"),
                );
            }
            Err(err) => {
                self.writer
                    .notice(&nick, &format!("Could not join {target}: {err}"));
            }
        }
    }

    /// Client batches: only `draft/multiline` is understood. The buffered
    /// PRIVMSG/NOTICE lines collapse into a single Matrix event when the
    /// batch closes.
    async fn handle_batch(&mut self, msg: &Message) {
        let Some(arg) = msg.params.first() else {
            return;
        };
        if let Some(reference) = arg.strip_prefix('+') {
            let batch_type = msg.params.get(1).map(String::as_str);
            if batch_type == Some("draft/multiline") && msg.params.len() >= 3 {
                self.state
                    .lock()
                    .unwrap()
                    .create_batch(reference, msg.clone());
            } else {
                let nick = self.nick_or_star();
                self.writer.notice(&nick, "Unsupported batch type");
            }
        } else if let Some(reference) = arg.strip_prefix('-') {
            let popped = self.state.lock().unwrap().pop_batch(reference);
            let Some((opening, commands)) = popped else {
                return;
            };
            let target = opening.params[2].clone();
            let Some((room_id, _)) = self.rooms.room_from_irc_channel(&target) else {
                self.numeric(irc::ERR_NOSUCHNICK, vec![&target, "No such nick/channel"]);
                return;
            };

            let mut body = String::new();
            let mut notice = false;
            for command in &commands {
                if !matches!(command.command.as_str(), "PRIVMSG" | "NOTICE") {
                    continue;
                }
                let Some(text) = command.params.get(1) else {
                    continue;
                };
                notice = command.command == "NOTICE";
                if body.is_empty() {
                    body.push_str(text);
                } else if command.tags.contains_key("draft/multiline-concat") {
                    body.push_str(text);
                } else {
                    body.push('\n');
                    body.push_str(text);
                }
            }
            if body.is_empty() {
                return;
            }
            let msgtype = if notice { "m.notice" } else { "m.text" };
            self.send_to_matrix(&room_id, msgtype, &body).await;
        }
    }

    fn handle_mode(&mut self, msg: &Message) {
        let Some(target) = msg.params.first() else {
            return;
        };
        if target.starts_with(['#', '!', '&', '@']) {
            self.numeric("324", vec![target, "+nt"]);
        } else {
            self.numeric("221", vec!["+"]);
        }
    }
}

/// Decode a SASL PLAIN payload: base64 of `authzid \0 authcid \0 passwd`.
fn decode_sasl_plain(payload: &str) -> Option<(Nick, String)> {
    let raw = BASE64.decode(payload).ok()?;
    let decoded = String::from_utf8(raw).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    let nick = Nick::parse(authcid)?;
    Some((nick, password.to_string()))
}

/// Map an IRC message body onto a Matrix msgtype, unwrapping CTCP ACTION
/// into `m.emote`.
fn matrix_message_type(text: &str, notice: bool) -> (&'static str, String) {
    if let Some(action) = text
        .strip_prefix("\u{1}ACTION ")
        .and_then(|rest| rest.strip_suffix('\u{1}'))
    {
        return ("m.emote", action.to_string());
    }
    if notice {
        ("m.notice", text.to_string())
    } else {
        ("m.text", text.to_string())
    }
}
