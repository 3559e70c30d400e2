//! Announcer backed by the Telegram Bot API.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ReplyParameters,
};
use teloxide::{ApiError, RequestError};

use crate::announce::{self, Action, Announcer, RenderError};
use crate::core::MessageHandle;

pub struct TelegramAnnouncer {
    bot: Bot,
}

impl TelegramAnnouncer {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// One button per row.
fn keyboard(actions: &[Action]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(
        actions
            .iter()
            .map(|a| vec![InlineKeyboardButton::callback(a.label.clone(), a.data.clone())]),
    )
}

fn map_error(e: RequestError) -> RenderError {
    match e {
        RequestError::Api(
            ApiError::MessageToEditNotFound
            | ApiError::MessageIdInvalid
            | ApiError::MessageToReplyNotFound
            | ApiError::ChatNotFound
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup,
        ) => RenderError::TargetNotFound,
        other => RenderError::Api(other.to_string()),
    }
}

#[async_trait]
impl Announcer for TelegramAnnouncer {
    async fn publish(&self, chat_id: i64, text: &str, actions: &[Action]) -> announce::Result<MessageHandle> {
        let sent = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard(actions))
            .await
            .map_err(map_error)?;

        Ok(MessageHandle {
            chat_id,
            message_id: sent.id.0,
        })
    }

    async fn update(
        &self,
        handle: MessageHandle,
        text: &str,
        actions: Option<&[Action]>,
    ) -> announce::Result<()> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(handle.chat_id), MessageId(handle.message_id), text)
            .parse_mode(ParseMode::Html);
        // Leaving the markup out drops the buttons
        if let Some(actions) = actions {
            request = request.reply_markup(keyboard(actions));
        }

        match request.await {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn reply(&self, handle: MessageHandle, text: &str) -> announce::Result<()> {
        self.bot
            .send_message(ChatId(handle.chat_id), text)
            .reply_parameters(ReplyParameters::new(MessageId(handle.message_id)))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn notify(&self, chat_id: i64, text: &str) -> announce::Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map_err(map_error)?;
        Ok(())
    }
}
