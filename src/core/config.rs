//! Environment-driven configuration.
//!
//! All settings come from environment variables (optionally via a `.env`
//! file loaded in `main`). Parsed once at startup into a [`Config`] that is
//! passed by `Arc` into every component — no module-level mutable globals.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use secrecy::SecretString;

/// Default TTL for generated connection files (seconds).
pub const DEFAULT_ARTIFACT_TTL_SECS: u64 = 600;

/// Default TTL for registrations stuck in AWAITING_APPROVAL (seconds).
/// Approvals have no user-visible timeout; this only bounds how long the
/// periodic sweep keeps abandoned rows around.
pub const DEFAULT_PENDING_TTL_SECS: u64 = 24 * 60 * 60;

/// Interval between periodic cleanup cycles (seconds).
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Default account rights granted to self-registered users, as TeamTalk
/// right names. Matches a plain non-admin account that can talk, share
/// files and message people.
pub const DEFAULT_USER_RIGHTS: &str = "MULTI_LOGIN,VIEW_ALL_USERS,CREATE_TEMPORARY_CHANNEL,\
UPLOAD_FILES,DOWNLOAD_FILES,TRANSMIT_VOICE,TRANSMIT_VIDEOCAPTURE,TRANSMIT_DESKTOP,\
TRANSMIT_DESKTOPINPUT,TRANSMIT_MEDIAFILE,TEXTMESSAGE_USER,TEXTMESSAGE_CHANNEL";

/// Connection coordinates of the TeamTalk server, as embedded into
/// generated `.tt` files and `tt://` links.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Display name shown in the client's server list.
    pub name: String,
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub encrypted: bool,
}

/// Credentials the bot itself uses to log into the TeamTalk server.
#[derive(Clone)]
pub struct BotAccount {
    pub username: String,
    pub password: SecretString,
    pub nickname: String,
    pub client_name: String,
}

impl std::fmt::Debug for BotAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("nickname", &self.nickname)
            .field("client_name", &self.client_name)
            .finish()
    }
}

/// Web front-end settings (present only when WEB_REGISTRATION_ENABLED=1).
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Base URL used when rendering download links into Telegram messages.
    pub public_url: Option<String>,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (TG_BOT_TOKEN).
    pub bot_token: SecretString,
    /// Telegram ids allowed to approve/deny and manage registrations.
    pub admin_ids: Vec<i64>,
    /// Language used for admin-facing notifications and broadcasts.
    pub admin_lang: String,

    pub server: ServerProfile,
    pub bot_account: BotAccount,

    /// When true, every request suspends in AWAITING_APPROVAL until an
    /// admin decides (VERIFY_REGISTRATION).
    pub verify_registration: bool,
    /// Right names granted to newly created accounts.
    pub default_rights: Vec<String>,
    /// Whether to broadcast a server-wide message after each registration.
    pub broadcast_enabled: bool,
    /// Channel newly registered users should land in, if any.
    pub default_channel: Option<String>,
    pub default_channel_password: String,

    /// TTL for generated artifacts.
    pub artifact_ttl: Duration,
    /// Sweep TTL for abandoned pending approvals.
    pub pending_ttl: Duration,
    /// Directory holding a portable client tree with Client/TeamTalk5.ini
    /// inside; enables the pre-configured ZIP download when set.
    pub client_template_dir: Option<PathBuf>,

    pub web: Option<WebConfig>,

    /// SQLite database path for the identity ledger.
    pub database_path: String,
    /// Scratch directory for generated artifacts.
    pub artifact_dir: PathBuf,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_opt(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        Some(_) | None => default,
    }
}

impl Config {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Config> {
        let bot_token =
            SecretString::from(env_opt("TG_BOT_TOKEN").context("TG_BOT_TOKEN is not set")?);

        let admin_ids = env_opt("ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().parse::<i64>().context("ADMIN_IDS must be comma-separated integers"))
            .collect::<Result<Vec<_>>>()?;

        let host = env_opt("HOST_NAME").context("HOST_NAME is not set")?;
        let tcp_port: u16 = env_opt("PORT")
            .context("PORT is not set")?
            .parse()
            .context("PORT must be a number")?;
        // UDP defaults to the TCP port, like stock TeamTalk servers.
        let udp_port: u16 = match env_opt("UDP_PORT") {
            Some(v) => v.parse().context("UDP_PORT must be a number")?,
            None => tcp_port,
        };

        let server = ServerProfile {
            name: env_opt("SERVER_NAME").unwrap_or_else(|| "TeamTalk Server".to_string()),
            host,
            tcp_port,
            udp_port,
            encrypted: env_flag("ENCRYPTED", false),
        };

        let bot_account = BotAccount {
            username: env_opt("USER_NAME").context("USER_NAME is not set")?,
            password: SecretString::from(env_opt("PASSWORD").context("PASSWORD is not set")?),
            nickname: env_opt("NICK_NAME").unwrap_or_else(|| "RegisterBot".to_string()),
            client_name: env_opt("CLIENT_NAME").unwrap_or_else(|| "talkreg".to_string()),
        };

        let default_rights: Vec<String> = env_opt("TEAMTALK_DEFAULT_USER_RIGHTS")
            .unwrap_or_else(|| DEFAULT_USER_RIGHTS.to_string())
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if default_rights.is_empty() {
            bail!("TEAMTALK_DEFAULT_USER_RIGHTS resolved to an empty rights list");
        }

        let artifact_ttl = Duration::from_secs(
            env_opt("GENERATED_FILE_TTL_SECONDS")
                .and_then(|v| match v.parse::<u64>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        log::warn!(
                            "Invalid GENERATED_FILE_TTL_SECONDS '{}', using default {}s",
                            v,
                            DEFAULT_ARTIFACT_TTL_SECS
                        );
                        None
                    }
                })
                .unwrap_or(DEFAULT_ARTIFACT_TTL_SECS),
        );

        let pending_ttl = Duration::from_secs(
            env_opt("PENDING_REGISTRATION_TTL_SECONDS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_PENDING_TTL_SECS),
        );

        let web = if env_flag("WEB_REGISTRATION_ENABLED", false) {
            Some(WebConfig {
                host: env_opt("WEB_APP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: env_opt("WEB_APP_PORT")
                    .context("WEB_APP_PORT is required when WEB_REGISTRATION_ENABLED=1")?
                    .parse()
                    .context("WEB_APP_PORT must be a number")?,
                public_url: env_opt("WEB_PUBLIC_URL"),
            })
        } else {
            None
        };

        Ok(Config {
            bot_token,
            admin_ids,
            admin_lang: env_opt("LANG_ADMIN").unwrap_or_else(|| "en".to_string()),
            server,
            bot_account,
            verify_registration: env_flag("VERIFY_REGISTRATION", false),
            default_rights,
            broadcast_enabled: env_flag("TEAMTALK_REGISTRATION_BROADCAST_ENABLED", true),
            default_channel: env_opt("DEFAULT_CHANNEL"),
            default_channel_password: env_opt("DEFAULT_CHANNEL_PASSWORD").unwrap_or_default(),
            artifact_ttl,
            pending_ttl,
            client_template_dir: env_opt("TEAMTALK_CLIENT_TEMPLATE_DIR").map(PathBuf::from),
            web,
            database_path: env_opt("TALKREG_DB").unwrap_or_else(|| "talkreg.sqlite".to_string()),
            artifact_dir: env_opt("TALKREG_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("talkreg-artifacts")),
        })
    }

    /// Whether the given Telegram id belongs to an administrator.
    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.admin_ids.contains(&telegram_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rights_parse_to_nonempty_list() {
        let rights: Vec<&str> = DEFAULT_USER_RIGHTS.split(',').collect();
        assert!(rights.len() >= 10);
        assert!(rights.contains(&"TRANSMIT_VOICE"));
    }

    // check-config prints the whole Config with Debug; no secret may
    // survive into that output.
    #[test]
    fn debug_output_redacts_all_secrets() {
        let config = Config {
            bot_token: SecretString::from("123456:tg-secret-token".to_string()),
            admin_ids: vec![1],
            admin_lang: "en".to_string(),
            server: ServerProfile {
                name: "S".to_string(),
                host: "h".to_string(),
                tcp_port: 10333,
                udp_port: 10333,
                encrypted: false,
            },
            bot_account: BotAccount {
                username: "bot".to_string(),
                password: SecretString::from("bot-secret-pw".to_string()),
                nickname: "bot".to_string(),
                client_name: "talkreg".to_string(),
            },
            verify_registration: false,
            default_rights: vec!["TRANSMIT_VOICE".to_string()],
            broadcast_enabled: false,
            default_channel: None,
            default_channel_password: String::new(),
            artifact_ttl: Duration::from_secs(600),
            pending_ttl: Duration::from_secs(600),
            client_template_dir: None,
            web: None,
            database_path: ":memory:".to_string(),
            artifact_dir: std::env::temp_dir(),
        };
        let printed = format!("{config:#?}");
        assert!(!printed.contains("tg-secret-token"));
        assert!(!printed.contains("bot-secret-pw"));
    }
}
