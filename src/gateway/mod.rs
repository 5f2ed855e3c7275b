//! Remote directory gateway — the only component that talks to the
//! TeamTalk server.
//!
//! The orchestrator sees the [`DirectoryGateway`] trait; the production
//! implementation ([`TeamTalkGateway`]) speaks the TeamTalk 5 text protocol
//! over a single TCP connection. The gateway's job is to map raw wire
//! responses onto a closed error taxonomy and leave the fatal-vs-cosmetic
//! decision to the caller.

pub mod client;
pub mod protocol;
pub mod rights;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use client::TeamTalkGateway;
pub use rights::rights_from_names;

/// Errors produced at the wire boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No live connection to the server, or the connection died mid-call.
    /// Surfaced to users as a retryable "try again later".
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// `newaccount` lost a race: the username exists. Must be handled even
    /// after a prior `username_exists` returned false (TOCTOU is inherent).
    #[error("username already exists on the server")]
    UsernameTaken,

    /// The server rejected a command for some other reason.
    #[error("command rejected by server ({number}): {message}")]
    Rejected { number: u32, message: String },

    /// Malformed or unexpected data on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for a new server account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    /// TeamTalk user-right bits, see [`rights`].
    pub rights: u32,
    /// Channel path the account should land in on login, if any.
    pub initial_channel: Option<String>,
}

/// Server-pushed events the gateway observes on its connection.
///
/// Decouples interested parties from the transport: subscribe instead of
/// poking at the protocol stream.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    UserLoggedIn { user_id: u32, username: String },
    UserLoggedOut { user_id: u32 },
    ChannelAdded { channel_id: u32, path: String },
    ChannelRemoved { channel_id: u32 },
    Disconnected,
    Connected,
}

/// Account-management capability of the remote voice server.
#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    /// Whether a username already exists in the server's account directory.
    /// Comparison is case-insensitive, matching server behavior.
    async fn username_exists(&self, username: &str) -> Result<bool, GatewayError>;

    /// Create an account. Fails with [`GatewayError::UsernameTaken`] when a
    /// concurrent creation won the race.
    async fn create_account(&self, account: &NewAccount) -> Result<(), GatewayError>;

    /// Best-effort broadcast to everyone on the server. Callers must not
    /// fail a completed registration when this errors.
    async fn announce(&self, message: &str) -> Result<(), GatewayError>;

    /// Best-effort: if the named user is currently online, move them into
    /// the given channel. Same failure policy as [`announce`].
    ///
    /// [`announce`]: DirectoryGateway::announce
    async fn join_default_channel(
        &self,
        username: &str,
        channel: &str,
        channel_password: &str,
    ) -> Result<(), GatewayError>;

    /// Subscribe to server-pushed events.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}
