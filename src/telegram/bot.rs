//! Bot initialization and command definitions.

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "welcome and usage")]
    Start,
    #[command(description = "register a new account")]
    Register,
    #[command(description = "cancel the current registration")]
    Cancel,
    #[command(description = "choose your language")]
    Language,
    #[command(description = "list registrations (admins only)")]
    Registrations,
    #[command(description = "remove a registration record (admins only)")]
    Unregister(String),
    #[command(description = "ban an identity from registering (admins only)")]
    Ban(String),
    #[command(description = "lift a registration ban (admins only)")]
    Unban(String),
    #[command(description = "list banned identities (admins only)")]
    Banned,
}

/// Creates a Bot instance from the configured token.
pub fn create_bot(token: &str) -> Bot {
    Bot::new(token)
}

/// Sets up bot commands in Telegram UI. Admin-only commands are left out
/// of the public menu.
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    use teloxide::types::BotCommand;

    bot.set_my_commands(vec![
        BotCommand::new("start", "welcome and usage"),
        BotCommand::new("register", "register a new account"),
        BotCommand::new("cancel", "cancel the current registration"),
        BotCommand::new("language", "choose your language"),
    ])
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_descriptions_cover_registration() {
        let commands = format!("{}", Command::descriptions());
        assert!(commands.contains("register"));
        assert!(commands.contains("cancel"));
        assert!(commands.contains("language"));
    }
}
