//! Telegram front-end: bot setup, update handlers, admin notifications.

pub mod bot;
pub mod handlers;
pub mod notifications;

pub use bot::{create_bot, setup_bot_commands, Command};
pub use handlers::{schema, HandlerDeps};
pub use notifications::TelegramNotifier;
