use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;
use secrecy::ExposeSecret;
use teloxide::prelude::*;
use tokio::time::interval;

use talkreg::cli::{Cli, Commands};
use talkreg::core::config::{Config, CLEANUP_INTERVAL_SECS};
use talkreg::core::init_logger;
use talkreg::custodian::Custodian;
use talkreg::gateway::{DirectoryGateway, TeamTalkGateway};
use talkreg::orchestrator::Registrar;
use talkreg::storage::db;
use talkreg::storage::{create_pool, get_connection};
use talkreg::telegram::{create_bot, schema, setup_bot_commands, HandlerDeps, TelegramNotifier};
use talkreg::web::{run_web_server, WebState};

/// Main entry point for the registration portal.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Load environment variables from .env if present, before the logger
    // so RUST_LOG from the file is honored.
    let _ = dotenv();
    init_logger()?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            let config = Config::from_env()?;
            println!("{config:#?}");
            Ok(())
        }
        Some(Commands::Registrations) => list_registrations(),
        Some(Commands::Run) | None => run_portal().await,
    }
}

fn list_registrations() -> Result<()> {
    let config = Config::from_env()?;
    let pool = create_pool(&config.database_path)?;
    let conn = get_connection(&pool)?;
    let records = db::list_registrations(&conn)?;
    if records.is_empty() {
        println!("No registrations recorded.");
    } else {
        for r in records {
            println!("{}\t{}\t{}", r.identity, r.username, r.created_at);
        }
    }
    Ok(())
}

async fn run_portal() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    log::info!(
        "Starting registration portal for '{}' ({}:{})",
        config.server.name,
        config.server.host,
        config.server.tcp_port
    );

    let pool = Arc::new(create_pool(&config.database_path)?);
    let custodian = Custodian::new(config.artifact_dir.clone(), config.artifact_ttl)?;
    let gateway = TeamTalkGateway::spawn(config.server.clone(), config.bot_account.clone());
    let registrar = Registrar::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&gateway) as Arc<dyn DirectoryGateway>,
        Arc::clone(&custodian),
    );

    let bot = create_bot(config.bot_token.expose_secret());
    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Could not register bot commands: {e}");
    }
    registrar.set_notifier(TelegramNotifier::new(bot.clone(), Arc::clone(&config)));

    // Periodic cleanup: expired artifacts and abandoned approvals.
    {
        let custodian = Arc::clone(&custodian);
        let registrar = Arc::clone(&registrar);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                custodian.sweep();
                registrar.sweep();
            }
        });
    }

    if let Some(web) = config.web.clone() {
        let state = Arc::new(WebState {
            config: Arc::clone(&config),
            registrar: Arc::clone(&registrar),
            custodian: Arc::clone(&custodian),
        });
        tokio::spawn(async move {
            if let Err(e) = run_web_server(&web.host, web.port, state).await {
                log::error!("Web server terminated: {e}");
            }
        });
    }

    let deps = HandlerDeps::new(
        Arc::clone(&config),
        Arc::clone(&registrar),
        Arc::clone(&custodian),
        Arc::clone(&pool),
    );

    log::info!("Starting Telegram dispatcher");
    Dispatcher::builder(bot, schema(deps))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("Dispatcher shutdown gracefully");
    Ok(())
}
