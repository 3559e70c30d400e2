//! QueueKing library root.

pub mod announce;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod expiry;
pub mod logging;
pub mod storage;
pub mod telegram;

pub use announce::{Announcer, RenderError};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{Member, Queue, QueueId, QueueService};
pub use error::{Error, Result};
pub use storage::{QueueStore, SqliteStore};
pub use telegram::run_telegram_daemon;
