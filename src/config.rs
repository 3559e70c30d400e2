//! Configuration loading for QueueKing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::ServiceOptions;
use crate::error::{Error, Result};

/// Get the QueueKing home directory (~/.queueking).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".queueking"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.queueking/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'queueking setup' first.",
            path.display()
        )));
    }

    let settings = load_settings_from(&path)?;
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Parse and validate a settings file.
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Write settings to ~/.queueking/settings.json, creating the directory.
pub fn save_settings(settings: &Settings) -> Result<PathBuf> {
    let path = get_settings_path()?;
    save_settings_to(settings, &path)?;
    Ok(path)
}

pub fn save_settings_to(settings: &Settings, path: &std::path::Path) -> Result<()> {
    validate_settings(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    tracing::info!("Saved settings to {}", path.display());
    Ok(())
}

/// Longest default lifetime a queue may be given.
pub const MAX_EXPIRY_DAYS: i64 = 3650;

fn validate_settings(settings: &Settings) -> Result<()> {
    if !(1..=MAX_EXPIRY_DAYS).contains(&settings.queues.default_expiry_days) {
        return Err(Error::Config(format!(
            "queues.default_expiry_days must be between 1 and {}",
            MAX_EXPIRY_DAYS
        )));
    }
    if settings.queues.max_name_length < 1 {
        return Err(Error::Config(
            "queues.max_name_length must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Telegram configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,

    /// Skip updates that arrived while the bot was offline
    #[serde(default = "default_drop_pending_updates")]
    pub drop_pending_updates: bool,
}

fn default_drop_pending_updates() -> bool {
    true
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            drop_pending_updates: default_drop_pending_updates(),
        }
    }
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    /// Defaults to ~/.queueking/queues.db
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("queues.db")),
        }
    }
}

/// Queue defaults.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueuesConfig {
    #[serde(default = "default_expiry_days")]
    pub default_expiry_days: i64,

    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

fn default_expiry_days() -> i64 {
    7
}

fn default_max_name_length() -> usize {
    128
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            default_expiry_days: default_expiry_days(),
            max_name_length: default_max_name_length(),
        }
    }
}

/// QueueKing settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queues: QueuesConfig,
}

impl Settings {
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            default_ttl: chrono::Duration::try_days(
                self.queues.default_expiry_days.clamp(1, MAX_EXPIRY_DAYS),
            )
            .unwrap_or_else(|| chrono::Duration::days(default_expiry_days())),
            max_name_length: self.queues.max_name_length,
        }
    }
}
