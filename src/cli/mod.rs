//! CLI commands for QueueKing using clap.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use teloxide::Bot;

use crate::announce::{Announcer, OfflineAnnouncer};
use crate::config::{load_settings_or_default, save_settings, Settings};
use crate::core::{ordering, view, ExpireOutcome, QueueService};
use crate::storage::{QueueStore, SqliteStore};
use crate::telegram::{run_telegram_daemon, DaemonOptions, TelegramAnnouncer};

/// QueueKing - Telegram bot for fair waiting lines.
#[derive(Parser)]
#[command(name = "queueking")]
#[command(version = "0.1.0")]
#[command(about = "QueueKing - waiting lines for Telegram chats", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the bot until Ctrl-C
    Run {
        /// Bot token (overrides settings.json)
        #[arg(long, env = "QUEUEKING_BOT_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// List persisted queues with their members
    List,

    /// Delete a queue right away
    Expire {
        /// Queue id
        id: i64,
    },

    /// Write the settings file
    Setup {
        /// Bot token from @BotFather
        #[arg(long)]
        token: String,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Run { token } => cmd_run(token.as_deref()).await,
            Command::List => cmd_list(),
            Command::Expire { id } => cmd_expire(*id).await,
            Command::Setup { token } => cmd_setup(token),
        }
    }
}

/// Token from the command line or environment wins over the settings file.
fn resolve_token(cli_token: Option<&str>, settings: &Settings) -> Option<String> {
    cli_token
        .map(str::to_string)
        .or_else(|| settings.telegram.bot_token.clone())
        .filter(|t| !t.trim().is_empty())
}

fn open_store(settings: &Settings) -> Result<Arc<SqliteStore>> {
    let path = settings.storage.resolve_database_path()?;
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    tracing::info!("Using database {}", path.display());
    Ok(Arc::new(store))
}

async fn cmd_run(cli_token: Option<&str>) -> Result<()> {
    let settings = load_settings_or_default();
    let token = resolve_token(cli_token, &settings)
        .context("No bot token configured. Run 'queueking setup --token <TOKEN>' or pass --token")?;

    let store = open_store(&settings)?;
    let bot = Bot::new(token);
    let announcer = Arc::new(TelegramAnnouncer::new(bot.clone()));
    let service = QueueService::new(store, announcer, settings.service_options());

    service.hydrate()?;

    let options = DaemonOptions {
        drop_pending_updates: settings.telegram.drop_pending_updates,
    };
    run_telegram_daemon(bot, service, options).await?;
    Ok(())
}

fn cmd_list() -> Result<()> {
    let settings = load_settings_or_default();
    let store = open_store(&settings)?;

    let queues = store.list_queues()?;
    if queues.is_empty() {
        println!("No queues.");
        return Ok(());
    }

    for queue in queues {
        let members = ordering::ranked(&store.load_members(queue.id)?);
        println!(
            "#{} {} (chat {}, expires {}, {} members)",
            queue.id,
            queue.name,
            queue.chat_id,
            view::format_deadline(queue.expires_at),
            members.len()
        );
        for (rank, member) in members.iter().enumerate() {
            println!("    {}. {} [{}]", rank + 1, member.display_name, member.user_id);
        }
    }
    Ok(())
}

async fn cmd_expire(id: i64) -> Result<()> {
    let settings = load_settings_or_default();
    let store = open_store(&settings)?;

    let announcer: Arc<dyn Announcer> = match resolve_token(None, &settings) {
        Some(token) => Arc::new(TelegramAnnouncer::new(Bot::new(token))),
        None => Arc::new(OfflineAnnouncer),
    };
    let service = QueueService::new(store, announcer, settings.service_options());

    match service.expire_now(id).await? {
        ExpireOutcome::Expired(queue) => println!("Expired queue #{} {}", queue.id, queue.name),
        _ => println!("Queue #{} does not exist", id),
    }
    Ok(())
}

fn cmd_setup(token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Bot token must not be empty");
    }

    let mut settings = load_settings_or_default();
    settings.telegram.bot_token = Some(token.to_string());
    let path = save_settings(&settings)?;

    println!("Settings written to {}", path.display());
    println!("Start the bot with: queueking run");
    Ok(())
}
