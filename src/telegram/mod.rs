//! Telegram bot integration.

pub mod announcer;
pub mod client;
pub mod commands;

pub use announcer::TelegramAnnouncer;
pub use client::{run_telegram_daemon, DaemonOptions};
