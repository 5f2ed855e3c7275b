//! Admin-facing notifications.
//!
//! Implements the orchestrator's notification hook on top of the bot, so
//! approval requests reach administrators no matter which front-end the
//! registration came from.

use std::sync::Arc;

use fluent_templates::fluent_bundle::FluentArgs;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::core::config::Config;
use crate::i18n;
use crate::orchestrator::{AdminNotifier, PendingApproval};

pub struct TelegramNotifier {
    bot: Bot,
    config: Arc<Config>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, config: Arc<Config>) -> Arc<Self> {
        Arc::new(TelegramNotifier { bot, config })
    }

    async fn broadcast(&self, text: &str, keyboard: Option<InlineKeyboardMarkup>) {
        if self.config.admin_ids.is_empty() {
            log::warn!("No ADMIN_IDS configured; admin notification dropped");
            return;
        }
        for admin_id in &self.config.admin_ids {
            let mut request = self.bot.send_message(ChatId(*admin_id), text);
            if let Some(kb) = keyboard.clone() {
                request = request.reply_markup(kb);
            }
            if let Err(e) = request.await {
                log::error!("Failed to notify admin {admin_id}: {e}");
            }
        }
    }
}

#[async_trait::async_trait]
impl AdminNotifier for TelegramNotifier {
    async fn notify_admins(&self, message: String) {
        self.broadcast(&message, None).await;
    }

    async fn request_approval(&self, pending: &PendingApproval) {
        let lang = i18n::lang_from_code(&self.config.admin_lang);
        let mut args = FluentArgs::new();
        args.set("username", pending.request.username.clone());
        args.set("source", pending.request.source.clone());
        args.set("lang", pending.request.lang.clone());
        let text = i18n::t_args(&lang, "admin-approval-request", &args);

        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback(
                i18n::t(&lang, "admin-approve-button"),
                format!("apr:{}", pending.request_id),
            ),
            InlineKeyboardButton::callback(
                i18n::t(&lang, "admin-deny-button"),
                format!("den:{}", pending.request_id),
            ),
        ]]);
        self.broadcast(&text, Some(keyboard)).await;
    }
}
