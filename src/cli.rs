use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "talkreg")]
#[command(author, version, about = "Self-registration portal for TeamTalk 5 servers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot (and the web form, when enabled)
    Run,

    /// Print the loaded configuration with secrets redacted and exit
    CheckConfig,

    /// List recorded registrations and exit
    Registrations,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
