//! Telegram update handling — the conversational registration flow.
//!
//! The bot side only collects input and renders outcomes; all registration
//! policy lives in the orchestrator. Passwords typed into the chat are
//! deleted right after they are read.

use std::sync::Arc;

use dashmap::DashMap;
use fluent_templates::fluent_bundle::FluentArgs;
use secrecy::SecretString;
use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{ChatKind, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message};
use unic_langid::LanguageIdentifier;
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::validation;
use crate::custodian::Custodian;
use crate::i18n;
use crate::orchestrator::{
    CompletedRegistration, Decision, Identity, Registrar, RegistrationOutcome,
    RegistrationRequest, ResolutionOutcome,
};
use crate::storage::{self, db};
use crate::telegram::bot::Command;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Where a chat currently is in the registration conversation.
#[derive(Debug, Clone)]
pub enum RegisterStep {
    AwaitingUsername,
    AwaitingPassword { username: String },
}

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub config: Arc<Config>,
    pub registrar: Arc<Registrar>,
    pub custodian: Arc<Custodian>,
    pub db_pool: Arc<storage::DbPool>,
    /// Per-chat conversation state.
    pub sessions: Arc<DashMap<i64, RegisterStep>>,
    /// Per-chat language override set via /language.
    pub langs: Arc<DashMap<i64, String>>,
}

impl HandlerDeps {
    pub fn new(
        config: Arc<Config>,
        registrar: Arc<Registrar>,
        custodian: Arc<Custodian>,
        db_pool: Arc<storage::DbPool>,
    ) -> Self {
        HandlerDeps {
            config,
            registrar,
            custodian,
            db_pool,
            sessions: Arc::new(DashMap::new()),
            langs: Arc::new(DashMap::new()),
        }
    }
}

/// Language code for a chat: explicit /language choice first, then the
/// Telegram client locale, then the default.
fn lang_code(deps: &HandlerDeps, chat_id: i64, telegram_code: Option<&str>) -> String {
    if let Some(code) = deps.langs.get(&chat_id) {
        return code.clone();
    }
    telegram_code.and_then(i18n::is_language_supported).unwrap_or("en").to_string()
}

fn lang_of(deps: &HandlerDeps, msg: &Message) -> LanguageIdentifier {
    let telegram_code = msg.from.as_ref().and_then(|u| u.language_code.as_deref());
    i18n::lang_from_code(&lang_code(deps, msg.chat.id.0, telegram_code))
}

/// Creates the main dispatcher schema for the Telegram bot. The same
/// schema is reused by integration tests.
pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_commands = deps.clone();
    let deps_messages = deps.clone();
    let deps_callbacks = deps;

    dptree::entry()
        .branch(Update::filter_message().filter_command::<Command>().endpoint(
            move |bot: Bot, msg: Message, cmd: Command| {
                let deps = deps_commands.clone();
                async move { handle_command(bot, msg, cmd, deps).await }
            },
        ))
        .branch(Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
            let deps = deps_messages.clone();
            async move { handle_message(bot, msg, deps).await }
        }))
        .branch(Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
            let deps = deps_callbacks.clone();
            async move { handle_callback(bot, q, deps).await }
        }))
}

fn is_admin(deps: &HandlerDeps, msg: &Message) -> bool {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(msg.chat.id.0);
    deps.config.is_admin(user_id)
}

/// Admin commands accept either a full identity key (`tg:123`, `web:1.2.3.4`)
/// or a bare Telegram id.
fn identity_key_for(target: &str) -> String {
    if target.parse::<i64>().is_ok() {
        format!("tg:{target}")
    } else {
        target.to_string()
    }
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    deps: HandlerDeps,
) -> Result<(), HandlerError> {
    let lang = lang_of(&deps, &msg);
    let chat_id = msg.chat.id;

    match cmd {
        Command::Start => {
            let mut args = FluentArgs::new();
            args.set("server", deps.config.server.name.clone());
            bot.send_message(chat_id, i18n::t_args(&lang, "start-welcome", &args)).await?;
        }
        Command::Register => {
            deps.sessions.insert(chat_id.0, RegisterStep::AwaitingUsername);
            bot.send_message(chat_id, i18n::t(&lang, "ask-username")).await?;
        }
        Command::Cancel => {
            let key = if deps.sessions.remove(&chat_id.0).is_some() {
                "cancel-done"
            } else {
                "cancel-nothing"
            };
            bot.send_message(chat_id, i18n::t(&lang, key)).await?;
        }
        Command::Language => {
            let rows: Vec<Vec<InlineKeyboardButton>> = i18n::SUPPORTED_LANGS
                .iter()
                .map(|(code, name)| {
                    vec![InlineKeyboardButton::callback(name.to_string(), format!("lang:{code}"))]
                })
                .collect();
            bot.send_message(chat_id, i18n::t(&lang, "language-choose"))
                .reply_markup(InlineKeyboardMarkup::new(rows))
                .await?;
        }
        Command::Registrations => {
            if !is_admin(&deps, &msg) {
                bot.send_message(chat_id, i18n::t(&lang, "admin-only")).await?;
                return Ok(());
            }
            let conn = storage::get_connection(&deps.db_pool)?;
            let records = db::list_registrations(&conn)?;
            if records.is_empty() {
                bot.send_message(chat_id, i18n::t(&lang, "admin-registrations-empty")).await?;
            } else {
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| format!("{} — {} ({})", r.identity, r.username, r.created_at))
                    .collect();
                bot.send_message(chat_id, lines.join("\n")).await?;
            }
        }
        Command::Unregister(target) => {
            if !is_admin(&deps, &msg) {
                bot.send_message(chat_id, i18n::t(&lang, "admin-only")).await?;
                return Ok(());
            }
            let target = target.trim().to_string();
            if target.is_empty() {
                bot.send_message(chat_id, i18n::t(&lang, "admin-unregister-usage")).await?;
                return Ok(());
            }
            let conn = storage::get_connection(&deps.db_pool)?;
            let key = if db::remove_registration(&conn, &target)? {
                "admin-unregister-done"
            } else {
                "admin-unregister-not-found"
            };
            let mut args = FluentArgs::new();
            args.set("target", target);
            bot.send_message(chat_id, i18n::t_args(&lang, key, &args)).await?;
        }
        Command::Ban(rest) => {
            if !is_admin(&deps, &msg) {
                bot.send_message(chat_id, i18n::t(&lang, "admin-only")).await?;
                return Ok(());
            }
            let rest = rest.trim();
            let mut parts = rest.splitn(2, char::is_whitespace);
            let target = parts.next().unwrap_or("").trim();
            if target.is_empty() {
                bot.send_message(chat_id, i18n::t(&lang, "admin-ban-usage")).await?;
                return Ok(());
            }
            let reason = parts.next().map(str::trim).filter(|r| !r.is_empty());
            let banned_by = msg
                .from
                .as_ref()
                .map(|u| u.full_name())
                .unwrap_or_else(|| format!("chat {}", chat_id.0));
            let identity = identity_key_for(target);
            let conn = storage::get_connection(&deps.db_pool)?;
            db::ban_identity(&conn, &identity, reason, &banned_by)?;
            let mut args = FluentArgs::new();
            args.set("target", identity);
            bot.send_message(chat_id, i18n::t_args(&lang, "admin-ban-done", &args)).await?;
        }
        Command::Unban(target) => {
            if !is_admin(&deps, &msg) {
                bot.send_message(chat_id, i18n::t(&lang, "admin-only")).await?;
                return Ok(());
            }
            let target = target.trim();
            if target.is_empty() {
                bot.send_message(chat_id, i18n::t(&lang, "admin-ban-usage")).await?;
                return Ok(());
            }
            let identity = identity_key_for(target);
            let conn = storage::get_connection(&deps.db_pool)?;
            let key = if db::unban_identity(&conn, &identity)? {
                "admin-unban-done"
            } else {
                "admin-unban-not-found"
            };
            let mut args = FluentArgs::new();
            args.set("target", identity);
            bot.send_message(chat_id, i18n::t_args(&lang, key, &args)).await?;
        }
        Command::Banned => {
            if !is_admin(&deps, &msg) {
                bot.send_message(chat_id, i18n::t(&lang, "admin-only")).await?;
                return Ok(());
            }
            let conn = storage::get_connection(&deps.db_pool)?;
            let bans = db::list_bans(&conn)?;
            if bans.is_empty() {
                bot.send_message(chat_id, i18n::t(&lang, "admin-banned-empty")).await?;
            } else {
                let lines: Vec<String> = bans
                    .iter()
                    .map(|b| match &b.reason {
                        Some(reason) => format!("{} — {} ({})", b.identity, reason, b.banned_at),
                        None => format!("{} ({})", b.identity, b.banned_at),
                    })
                    .collect();
                bot.send_message(chat_id, lines.join("\n")).await?;
            }
        }
    }
    Ok(())
}

/// Non-command messages advance the registration conversation, if any.
async fn handle_message(bot: Bot, msg: Message, deps: HandlerDeps) -> Result<(), HandlerError> {
    if !matches!(msg.chat.kind, ChatKind::Private(_)) {
        return Ok(());
    }
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let Some(step) = deps.sessions.get(&chat_id.0).map(|s| s.clone()) else {
        return Ok(());
    };
    let lang = lang_of(&deps, &msg);

    match step {
        RegisterStep::AwaitingUsername => {
            if let Err(e) = validation::validate_username(&text) {
                bot.send_message(chat_id, i18n::t(&lang, e.reason_key())).await?;
                return Ok(());
            }
            deps.sessions.insert(chat_id.0, RegisterStep::AwaitingPassword { username: text });
            bot.send_message(chat_id, i18n::t(&lang, "ask-password")).await?;
        }
        RegisterStep::AwaitingPassword { username } => {
            // Get the plaintext out of the chat history as soon as possible.
            if let Err(e) = bot.delete_message(chat_id, msg.id).await {
                log::warn!("Could not delete password message in chat {chat_id}: {e}");
            }
            if let Err(e) = validation::validate_password(&text) {
                bot.send_message(chat_id, i18n::t(&lang, e.reason_key())).await?;
                return Ok(());
            }
            deps.sessions.remove(&chat_id.0);

            let from = msg.from.as_ref();
            let identity =
                Identity::Telegram(from.map(|u| u.id.0 as i64).unwrap_or(chat_id.0));
            let source = match from {
                Some(u) => format!("{} (id {})", u.full_name(), u.id.0),
                None => format!("chat {}", chat_id.0),
            };
            let telegram_code = from.and_then(|u| u.language_code.as_deref());
            let request = RegistrationRequest {
                identity,
                username,
                password: SecretString::from(text),
                nickname: from.map(|u| u.full_name()),
                channel: None,
                lang: lang_code(&deps, chat_id.0, telegram_code),
                source,
            };

            match deps.registrar.submit(request).await {
                Ok(RegistrationOutcome::Completed(completed)) => {
                    send_completed(&bot, chat_id, &lang, &deps, &completed).await?;
                }
                Ok(RegistrationOutcome::AwaitingApproval { .. }) => {
                    bot.send_message(chat_id, i18n::t(&lang, "awaiting-approval")).await?;
                }
                Err(e) => {
                    bot.send_message(chat_id, i18n::t(&lang, e.reason_key())).await?;
                }
            }
        }
    }
    Ok(())
}

/// Deliver the artifacts of a finished registration into a chat.
pub async fn send_completed(
    bot: &Bot,
    chat_id: ChatId,
    lang: &LanguageIdentifier,
    deps: &HandlerDeps,
    completed: &CompletedRegistration,
) -> Result<(), HandlerError> {
    let mut args = FluentArgs::new();
    args.set("username", completed.username.clone());
    args.set("link", completed.quick_connect_link.clone());
    bot.send_message(chat_id, i18n::t_args(lang, "reg-success", &args)).await?;

    let minutes = (completed.artifact_ttl_secs / 60).max(1);
    let mut args = FluentArgs::new();
    args.set("minutes", minutes);
    bot.send_message(chat_id, i18n::t_args(lang, "reg-files-expire", &args)).await?;

    match deps.custodian.retrieve(&completed.descriptor_token) {
        Ok(artifact) => {
            let file = InputFile::memory(artifact.bytes).file_name(artifact.filename);
            bot.send_document(chat_id, file)
                .caption(i18n::t(lang, "descriptor-caption"))
                .await?;
        }
        Err(e) => log::error!("Descriptor retrieval failed right after creation: {e}"),
    }

    if let Some(token) = &completed.archive_token {
        match deps.custodian.retrieve(token) {
            Ok(artifact) => {
                let file = InputFile::memory(artifact.bytes).file_name(artifact.filename);
                bot.send_document(chat_id, file)
                    .caption(i18n::t(lang, "archive-caption"))
                    .await?;
            }
            Err(e) => {
                log::warn!("Archive retrieval failed: {e}");
                bot.send_message(chat_id, i18n::t(lang, "archive-unavailable")).await?;
            }
        }
    }
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, deps: HandlerDeps) -> Result<(), HandlerError> {
    let Some(data) = q.data.clone() else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    if let Some(code) = data.strip_prefix("lang:") {
        if let Some(code) = i18n::is_language_supported(code) {
            if let Some(m) = &q.message {
                deps.langs.insert(m.chat().id.0, code.to_string());
                let lang = i18n::lang_from_code(code);
                let mut args = FluentArgs::new();
                args.set("language", i18n::language_name(code));
                bot.edit_message_text(m.chat().id, m.id(), i18n::t_args(&lang, "language-set", &args))
                    .await?;
            }
        }
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    }

    let decision = match data.split_once(':') {
        Some(("apr", id)) => Some((id, Decision::Approve)),
        Some(("den", id)) => Some((id, Decision::Deny)),
        _ => None,
    };
    if let Some((raw_id, decision)) = decision {
        handle_decision_callback(&bot, &q, &deps, raw_id, decision).await?;
    }
    bot.answer_callback_query(q.id.clone()).await?;
    Ok(())
}

/// An admin pressed approve or deny under an approval request.
async fn handle_decision_callback(
    bot: &Bot,
    q: &CallbackQuery,
    deps: &HandlerDeps,
    raw_id: &str,
    decision: Decision,
) -> Result<(), HandlerError> {
    let admin_lang = i18n::lang_from_code(&deps.config.admin_lang);
    if !deps.config.is_admin(q.from.id.0 as i64) {
        log::warn!("Non-admin {} pressed an approval button", q.from.id);
        return Ok(());
    }
    let Ok(request_id) = Uuid::parse_str(raw_id) else {
        log::warn!("Malformed approval callback data: {data}", data = raw_id);
        return Ok(());
    };

    let decided_by = q.from.full_name();
    let resolution = match deps.registrar.resolve(request_id, decision, &decided_by).await {
        Ok(r) => r,
        Err(e) => {
            // Usually a second admin racing on the same request.
            if let Some(m) = &q.message {
                bot.send_message(m.chat().id, i18n::t(&admin_lang, e.reason_key())).await?;
            }
            return Ok(());
        }
    };

    // Update the admin's message in place with the verdict.
    let mut args = FluentArgs::new();
    args.set("username", resolution.username.clone());
    let verdict = match &resolution.outcome {
        ResolutionOutcome::Completed(_) => i18n::t_args(&admin_lang, "admin-approved", &args),
        ResolutionOutcome::Denied => i18n::t_args(&admin_lang, "admin-denied", &args),
        ResolutionOutcome::Failed(e) => {
            args.set("reason", i18n::t(&admin_lang, e.reason_key()));
            i18n::t_args(&admin_lang, "admin-decision-failed", &args)
        }
    };
    if let Some(m) = &q.message {
        if let Err(e) = bot.edit_message_text(m.chat().id, m.id(), verdict).await {
            log::warn!("Could not edit approval message: {e}");
        }
    }

    // Push the outcome to the requester when they came from Telegram; web
    // requesters poll their pending page instead.
    if let Identity::Telegram(user_id) = resolution.identity {
        let chat_id = ChatId(user_id);
        let lang = i18n::lang_from_code(&resolution.lang);
        match &resolution.outcome {
            ResolutionOutcome::Completed(completed) => {
                send_completed(bot, chat_id, &lang, deps, completed).await?;
            }
            ResolutionOutcome::Denied => {
                bot.send_message(chat_id, i18n::t(&lang, "registration-denied")).await?;
            }
            ResolutionOutcome::Failed(e) => {
                bot.send_message(chat_id, i18n::t(&lang, e.reason_key())).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_prefixes_parse() {
        let id = Uuid::new_v4();
        let data = format!("apr:{id}");
        assert_eq!(data.strip_prefix("apr:"), Some(id.to_string().as_str()));
        assert!(Uuid::parse_str(data.strip_prefix("apr:").unwrap()).is_ok());
    }

    #[test]
    fn ban_targets_normalize_to_identity_keys() {
        assert_eq!(identity_key_for("123456"), "tg:123456");
        assert_eq!(identity_key_for("tg:123456"), "tg:123456");
        assert_eq!(identity_key_for("web:203.0.113.7"), "web:203.0.113.7");
    }

    #[test]
    fn lang_code_prefers_explicit_choice() {
        let sessions = Arc::new(DashMap::new());
        let langs: Arc<DashMap<i64, String>> = Arc::new(DashMap::new());
        langs.insert(7, "ru".to_string());

        // Only the maps matter for this helper.
        let deps = HandlerDeps {
            config: test_config(),
            registrar: test_registrar(),
            custodian: test_custodian(),
            db_pool: test_pool(),
            sessions,
            langs,
        };
        assert_eq!(lang_code(&deps, 7, Some("en")), "ru");
        assert_eq!(lang_code(&deps, 8, Some("ru-RU")), "ru");
        assert_eq!(lang_code(&deps, 9, Some("es")), "en");
        assert_eq!(lang_code(&deps, 9, None), "en");
    }

    fn test_config() -> Arc<Config> {
        use crate::core::config::{BotAccount, ServerProfile};
        use std::time::Duration;
        Arc::new(Config {
            bot_token: SecretString::from("token".to_string()),
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
                password: SecretString::from("pw".to_string()),
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
        })
    }

    fn test_pool() -> Arc<storage::DbPool> {
        Arc::new(storage::create_pool(":memory:").unwrap())
    }

    fn test_custodian() -> Arc<Custodian> {
        let dir = tempfile::tempdir().unwrap();
        Custodian::new(dir.into_path(), std::time::Duration::from_secs(60)).unwrap()
    }

    fn test_registrar() -> Arc<Registrar> {
        use crate::gateway::{DirectoryGateway, GatewayError, NewAccount, ServerEvent};
        use tokio::sync::broadcast;

        struct NullGateway(broadcast::Sender<ServerEvent>);

        #[async_trait::async_trait]
        impl DirectoryGateway for NullGateway {
            async fn username_exists(&self, _username: &str) -> Result<bool, GatewayError> {
                Ok(false)
            }
            async fn create_account(&self, _account: &NewAccount) -> Result<(), GatewayError> {
                Ok(())
            }
            async fn announce(&self, _message: &str) -> Result<(), GatewayError> {
                Ok(())
            }
            async fn join_default_channel(
                &self,
                _username: &str,
                _channel: &str,
                _channel_password: &str,
            ) -> Result<(), GatewayError> {
                Ok(())
            }
            fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
                self.0.subscribe()
            }
        }

        let (tx, _) = broadcast::channel(4);
        Registrar::new(test_config(), test_pool(), Arc::new(NullGateway(tx)), test_custodian())
    }
}
