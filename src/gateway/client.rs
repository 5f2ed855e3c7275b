//! TeamTalk 5 gateway implementation.
//!
//! A single actor task owns the TCP connection; gateway methods send
//! requests over a channel and await the bracketed reply. Commands are
//! therefore serialized on the wire, which is all the serialization the
//! protocol needs. The actor reconnects with exponential backoff and
//! answers requests with `Unavailable` while the link is down, so a dead
//! server surfaces as a retryable error instead of a hang.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::config::{BotAccount, ServerProfile};

use super::protocol::{parse_line, Command, ServerLine};
use super::{DirectoryGateway, GatewayError, NewAccount, ServerEvent};

/// Login rejected: unknown username or wrong password.
pub const CMDERR_INVALID_ACCOUNT: u32 = 2006;
/// `newaccount` targeting a username that already exists.
pub const CMDERR_ACCOUNT_ALREADY_EXISTS: u32 = 3010;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Request {
    command: String,
    reply: oneshot::Sender<Result<Vec<ServerLine>, GatewayError>>,
}

/// Production [`DirectoryGateway`] speaking the TeamTalk 5 protocol.
pub struct TeamTalkGateway {
    req_tx: mpsc::Sender<Request>,
    events: broadcast::Sender<ServerEvent>,
    /// userid -> username for currently online sessions.
    online: Arc<DashMap<u32, String>>,
    /// channel path -> channel id.
    channels: Arc<DashMap<String, u32>>,
}

impl TeamTalkGateway {
    /// Spawn the connection actor. Returns immediately; the actor connects
    /// (and keeps reconnecting) in the background.
    pub fn spawn(server: ServerProfile, account: BotAccount) -> Arc<Self> {
        let (req_tx, req_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(64);
        let online = Arc::new(DashMap::new());
        let channels = Arc::new(DashMap::new());

        let actor = Actor {
            server,
            account,
            req_rx,
            events: events.clone(),
            online: online.clone(),
            channels: channels.clone(),
            next_id: AtomicI64::new(1),
        };
        tokio::spawn(actor.run());

        Arc::new(TeamTalkGateway { req_tx, events, online, channels })
    }

    async fn request(&self, command: Command) -> Result<Vec<ServerLine>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.req_tx
            .send(Request { command: command.encode(), reply: tx })
            .await
            .map_err(|_| GatewayError::Unavailable("gateway task stopped".to_string()))?;
        rx.await
            .map_err(|_| GatewayError::Unavailable("connection lost mid-command".to_string()))?
    }
}

#[async_trait]
impl DirectoryGateway for TeamTalkGateway {
    async fn username_exists(&self, username: &str) -> Result<bool, GatewayError> {
        let lines = self.request(Command::new("listaccounts")).await?;
        let wanted = username.trim();
        Ok(lines.iter().any(|line| {
            line.command == "useraccount"
                && line
                    .params
                    .get_str("username")
                    .is_some_and(|u| u.trim().eq_ignore_ascii_case(wanted))
        }))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<(), GatewayError> {
        let cmd = Command::new("newaccount")
            .str("username", &account.username)
            .str("password", &account.password)
            .int("usertype", 1) // USERTYPE_DEFAULT
            .int("userrights", i64::from(account.rights))
            .opt_str("initchan", account.initial_channel.as_deref());
        self.request(cmd).await?;
        log::info!("Created server account '{}'", account.username);
        Ok(())
    }

    async fn announce(&self, message: &str) -> Result<(), GatewayError> {
        // MSGTYPE_BROADCAST = 3
        let cmd = Command::new("message").int("type", 3).str("content", message);
        self.request(cmd).await?;
        Ok(())
    }

    async fn join_default_channel(
        &self,
        username: &str,
        channel: &str,
        _channel_password: &str,
    ) -> Result<(), GatewayError> {
        let Some(user_id) = self
            .online
            .iter()
            .find(|e| e.value().eq_ignore_ascii_case(username))
            .map(|e| *e.key())
        else {
            log::debug!("join_default_channel: '{username}' is not online, nothing to do");
            return Ok(());
        };
        let Some(channel_id) = self.channels.get(channel).map(|e| *e.value()) else {
            log::debug!("join_default_channel: channel '{channel}' unknown to the server");
            return Ok(());
        };
        let cmd = Command::new("moveuser")
            .int("userid", i64::from(user_id))
            .int("chanid", i64::from(channel_id));
        self.request(cmd).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

struct Actor {
    server: ServerProfile,
    account: BotAccount,
    req_rx: mpsc::Receiver<Request>,
    events: broadcast::Sender<ServerEvent>,
    online: Arc<DashMap<u32, String>>,
    channels: Arc<DashMap<String, u32>>,
    next_id: AtomicI64,
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Actor {
    async fn run(mut self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect_and_login().await {
                Ok(conn) => {
                    backoff = Duration::from_secs(1);
                    let _ = self.events.send(ServerEvent::Connected);
                    log::info!(
                        "Connected to TeamTalk server {}:{}",
                        self.server.host,
                        self.server.tcp_port
                    );
                    let closed = self.serve(conn).await;
                    self.online.clear();
                    self.channels.clear();
                    let _ = self.events.send(ServerEvent::Disconnected);
                    if closed {
                        return;
                    }
                    log::warn!("Lost connection to TeamTalk server, reconnecting");
                }
                Err(e) => {
                    log::warn!(
                        "Cannot reach TeamTalk server {}:{}: {e}, retrying in {backoff:?}",
                        self.server.host,
                        self.server.tcp_port
                    );
                }
            }
            if self.reject_requests_for(backoff).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// While disconnected, answer incoming requests with `Unavailable`
    /// instead of letting them queue behind a dead link.
    /// Returns true once the request channel is closed.
    async fn reject_requests_for(&mut self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                req = self.req_rx.recv() => match req {
                    Some(req) => {
                        let _ = req.reply.send(Err(GatewayError::Unavailable(
                            "not connected to the server".to_string(),
                        )));
                    }
                    None => return true,
                },
            }
        }
    }

    async fn connect_and_login(&mut self) -> Result<Conn, GatewayError> {
        let addr = (self.server.host.as_str(), self.server.tcp_port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| GatewayError::Unavailable("connect timeout".to_string()))??;
        let (read_half, writer) = stream.into_split();
        let mut conn = Conn { reader: BufReader::new(read_half), writer };

        // Server greets with a `teamtalk` welcome line.
        let greeting = read_parsed_line(&mut conn.reader).await?;
        if greeting.command != "teamtalk" {
            return Err(GatewayError::Protocol(format!(
                "unexpected greeting '{}'",
                greeting.command
            )));
        }

        let login = Command::new("login")
            .str("username", &self.account.username)
            .str("password", self.account.password.expose_secret())
            .str("nickname", &self.account.nickname)
            .str("clientname", &self.account.client_name)
            .str("protocol", "5.0");
        let lines = self.roundtrip(&mut conn, login.encode()).await?;
        if !lines.iter().any(|l| l.command == "accepted") {
            return Err(GatewayError::Unavailable("server did not accept login".to_string()));
        }
        Ok(conn)
    }

    /// Main loop on a live connection; returns true when the request
    /// channel is closed (shutdown), false on connection loss.
    async fn serve(&mut self, mut conn: Conn) -> bool {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        loop {
            let mut line = String::new();
            tokio::select! {
                req = self.req_rx.recv() => {
                    let Some(req) = req else { return true };
                    let result = self.roundtrip(&mut conn, req.command).await;
                    let dropped = matches!(&result, Err(GatewayError::Io(_)) | Err(GatewayError::Unavailable(_)));
                    let _ = req.reply.send(result);
                    if dropped {
                        return false;
                    }
                }
                read = conn.reader.read_line(&mut line) => {
                    match read {
                        Ok(0) => return false,
                        Ok(_) => self.handle_push_line(&line),
                        Err(e) => {
                            log::warn!("Read error on TeamTalk connection: {e}");
                            return false;
                        }
                    }
                }
                _ = ping.tick() => {
                    if conn.writer.write_all(b"ping\r\n").await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Send one command and collect its bracketed reply.
    ///
    /// Data lines inside the bracket are returned to the caller; pushed
    /// event lines seen while waiting are dispatched as usual.
    async fn roundtrip(&mut self, conn: &mut Conn, command: String) -> Result<Vec<ServerLine>, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wire = format!("{command} id={id}\r\n");
        conn.writer.write_all(wire.as_bytes()).await?;

        let mut in_bracket = false;
        let mut data = Vec::new();
        let mut outcome: Result<(), GatewayError> = Ok(());
        loop {
            let line = read_parsed_line(&mut conn.reader).await?;
            match line.command.as_str() {
                "begin" if line.params.get_int("id") == Some(id) => in_bracket = true,
                "end" if line.params.get_int("id") == Some(id) => {
                    return outcome.map(|()| data);
                }
                "ok" if in_bracket => {}
                "error" if in_bracket => {
                    let number = line.params.get_u32("number").unwrap_or(0);
                    let message = line.params.get_str("message").unwrap_or_default().to_string();
                    outcome = Err(map_command_error(number, message));
                }
                "pong" => {}
                _ if in_bracket => {
                    // Command payload (e.g. `useraccount` rows); still feed
                    // state-bearing lines into the session maps.
                    self.track_state(&line);
                    data.push(line);
                }
                _ => self.dispatch_event(&line),
            }
        }
    }

    fn handle_push_line(&self, raw: &str) {
        match parse_line(raw) {
            Ok(Some(line)) => self.dispatch_event(&line),
            Ok(None) => {}
            Err(e) => log::debug!("Ignoring unparsable server line: {e}"),
        }
    }

    fn dispatch_event(&self, line: &ServerLine) {
        self.track_state(line);
        let event = match line.command.as_str() {
            "loggedin" => {
                let (Some(id), Some(name)) =
                    (line.params.get_u32("userid"), line.params.get_str("username"))
                else {
                    return;
                };
                ServerEvent::UserLoggedIn { user_id: id, username: name.to_string() }
            }
            "loggedout" => match line.params.get_u32("userid") {
                Some(id) => ServerEvent::UserLoggedOut { user_id: id },
                None => return,
            },
            "addchannel" => {
                let (Some(id), Some(path)) =
                    (line.params.get_u32("chanid"), line.params.get_str("channel"))
                else {
                    return;
                };
                ServerEvent::ChannelAdded { channel_id: id, path: path.to_string() }
            }
            "removechannel" => match line.params.get_u32("chanid") {
                Some(id) => ServerEvent::ChannelRemoved { channel_id: id },
                None => return,
            },
            _ => return,
        };
        let _ = self.events.send(event);
    }

    /// Keep the online-user and channel maps current.
    fn track_state(&self, line: &ServerLine) {
        match line.command.as_str() {
            "loggedin" => {
                if let (Some(id), Some(name)) =
                    (line.params.get_u32("userid"), line.params.get_str("username"))
                {
                    self.online.insert(id, name.to_string());
                }
            }
            "loggedout" => {
                if let Some(id) = line.params.get_u32("userid") {
                    self.online.remove(&id);
                }
            }
            "addchannel" => {
                if let (Some(id), Some(path)) =
                    (line.params.get_u32("chanid"), line.params.get_str("channel"))
                {
                    self.channels.insert(path.to_string(), id);
                }
            }
            "removechannel" => {
                if let Some(id) = line.params.get_u32("chanid") {
                    self.channels.retain(|_, v| *v != id);
                }
            }
            _ => {}
        }
    }
}

fn map_command_error(number: u32, message: String) -> GatewayError {
    if number == CMDERR_ACCOUNT_ALREADY_EXISTS || message.to_lowercase().contains("already exists") {
        return GatewayError::UsernameTaken;
    }
    GatewayError::Rejected { number, message }
}

async fn read_parsed_line(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<ServerLine, GatewayError> {
    loop {
        let mut raw = String::new();
        let n = reader.read_line(&mut raw).await?;
        if n == 0 {
            return Err(GatewayError::Unavailable("server closed the connection".to_string()));
        }
        if let Some(line) = parse_line(&raw)? {
            return Ok(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_account_error_maps_to_username_taken() {
        assert!(matches!(
            map_command_error(CMDERR_ACCOUNT_ALREADY_EXISTS, String::new()),
            GatewayError::UsernameTaken
        ));
        assert!(matches!(
            map_command_error(0, "account already exists".to_string()),
            GatewayError::UsernameTaken
        ));
    }

    #[test]
    fn other_errors_stay_rejections() {
        let err = map_command_error(CMDERR_INVALID_ACCOUNT, "invalid account".to_string());
        assert!(matches!(err, GatewayError::Rejected { number: CMDERR_INVALID_ACCOUNT, .. }));
    }
}
