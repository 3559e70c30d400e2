//! Announcement collaborator: publishes and updates the chat message that
//! shows a queue.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::MessageHandle;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The chat or message is gone. Never fatal for queue state.
    #[error("Announcement target not found")]
    TargetNotFound,

    #[error("API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// A button attached to an announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub label: String,
    pub data: String,
}

/// Render/notify side of the bot.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Post a new announcement with buttons.
    async fn publish(&self, chat_id: i64, text: &str, actions: &[Action]) -> Result<MessageHandle>;

    /// Rewrite an announcement. `None` removes all buttons.
    async fn update(
        &self,
        handle: MessageHandle,
        text: &str,
        actions: Option<&[Action]>,
    ) -> Result<()>;

    /// Reply to an existing announcement, pointing people at it.
    async fn reply(&self, handle: MessageHandle, text: &str) -> Result<()>;

    /// Plain message to a chat or user.
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Announcer for maintenance runs without a bot token. Every call fails, so
/// state changes go through and rendering is skipped with a warning.
pub struct OfflineAnnouncer;

#[async_trait]
impl Announcer for OfflineAnnouncer {
    async fn publish(&self, _chat_id: i64, _text: &str, _actions: &[Action]) -> Result<MessageHandle> {
        Err(offline())
    }

    async fn update(
        &self,
        _handle: MessageHandle,
        _text: &str,
        _actions: Option<&[Action]>,
    ) -> Result<()> {
        Err(offline())
    }

    async fn reply(&self, _handle: MessageHandle, _text: &str) -> Result<()> {
        Err(offline())
    }

    async fn notify(&self, _chat_id: i64, _text: &str) -> Result<()> {
        Err(offline())
    }
}

fn offline() -> RenderError {
    RenderError::Api("no bot token configured".to_string())
}
