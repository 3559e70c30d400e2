//! Telegram bot client: long-polling dispatcher for commands and buttons.

use std::sync::Arc;

use chrono::Local;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use teloxide::RequestError;

use crate::core::view::QueueAction;
use crate::core::{ordering, ExpireOutcome, MessageHandle, QueueService, Target};
use crate::error::{Error, Result};

use super::commands::{self, BotCommand, USAGE_TEXT};

/// Options for the polling loop.
#[derive(Clone, Debug)]
pub struct DaemonOptions {
    pub drop_pending_updates: bool,
}

/// Register commands and dispatch updates until Ctrl-C.
pub async fn run_telegram_daemon(
    bot: Bot,
    service: Arc<QueueService>,
    options: DaemonOptions,
) -> Result<()> {
    tracing::info!("Starting Telegram bot...");

    // Set up commands
    if let Err(e) = bot
        .set_my_commands(vec![
            teloxide::types::BotCommand::new("createqueue", "Create a queue"),
            teloxide::types::BotCommand::new("showallqueues", "Show queues of this chat"),
            teloxide::types::BotCommand::new("showmyqueues", "Show your queues"),
            teloxide::types::BotCommand::new("expirequeue", "Delete a queue now"),
            teloxide::types::BotCommand::new("usage", "Show help"),
        ])
        .await
    {
        tracing::warn!("Failed to set commands: {}", e);
    }

    if options.drop_pending_updates {
        bot.delete_webhook()
            .drop_pending_updates(true)
            .await
            .map_err(|e| Error::Telegram(e.to_string()))?;
        tracing::debug!("Dropped pending updates");
    }

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![service])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("Telegram bot stopped");
    Ok(())
}

/// Handle incoming messages.
async fn handle_message(
    bot: Bot,
    msg: Message,
    service: Arc<QueueService>,
) -> std::result::Result<(), RequestError> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    let command = match BotCommand::parse(text) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(()),
        Err(e) => {
            bot.send_message(chat_id, e.to_string()).await?;
            return Ok(());
        }
    };
    tracing::debug!("Command {:?} in chat {}", command, chat_id);

    let result = match command {
        BotCommand::CreateQueue { name, deadline } => {
            cmd_create_queue(&bot, &msg, &service, &name, deadline).await
        }
        BotCommand::ShowAllQueues => service.show_all(chat_id.0).await.map(|_| ()),
        BotCommand::ShowMyQueues => cmd_show_my_queues(&bot, &msg, &service).await,
        BotCommand::ExpireQueue(queue_id) => cmd_expire_queue(&bot, &msg, &service, queue_id).await,
        BotCommand::Usage => {
            bot.send_message(chat_id, USAGE_TEXT).await?;
            Ok(())
        }
        BotCommand::Unknown(_) => {
            bot.send_message(chat_id, "Unknown command. /usage for available commands.")
                .await?;
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(Error::Telegram(e)) => {
            tracing::warn!("Telegram request failed in chat {}: {}", chat_id, e);
        }
        Err(e) if e.is_validation() => {
            bot.send_message(chat_id, e.to_string()).await?;
        }
        Err(e) => {
            tracing::error!("Command failed in chat {}: {}", chat_id, e);
            bot.send_message(chat_id, "Something went wrong, please try again later.")
                .await?;
        }
    }
    Ok(())
}

async fn cmd_create_queue(
    bot: &Bot,
    msg: &Message,
    service: &QueueService,
    name: &str,
    deadline: Option<commands::DeadlineSpec>,
) -> Result<()> {
    let deadline = deadline.map(|d| d.resolve(Local::now())).transpose()?;
    let queue = service.create(name, msg.chat.id.0, deadline).await?;

    if !queue.is_published() {
        bot.send_message(
            msg.chat.id,
            format!(
                "Queue {} was created but could not be shown. Try /showallqueues.",
                queue.name
            ),
        )
        .await
        .map_err(|e| Error::Telegram(e.to_string()))?;
    }
    Ok(())
}

async fn cmd_show_my_queues(bot: &Bot, msg: &Message, service: &QueueService) -> Result<()> {
    let chat_id = msg.chat.id;
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    let send = |text: String| async move {
        bot.send_message(chat_id, text)
            .await
            .map(|_| ())
            .map_err(|e| Error::Telegram(e.to_string()))
    };

    if !msg.chat.is_private() {
        return send("This command only works in a private chat with me.".to_string()).await;
    }

    let user_id = user.id.0 as i64;
    let queues = service.queues_for_user(user_id)?;
    if queues.is_empty() {
        return send("You are not in any queue.".to_string()).await;
    }

    for queue in queues {
        let rank = match service.snapshot(queue.id).await? {
            Some((_, members)) => ordering::rank_of(&members, user_id),
            None => continue,
        };
        send(commands::my_queue_line(&queue, rank)).await?;

        if let Some(handle) = queue.announcement {
            if let Err(e) = bot
                .forward_message(chat_id, ChatId(handle.chat_id), MessageId(handle.message_id))
                .await
            {
                tracing::warn!("Could not forward announcement of queue {}: {}", queue.id, e);
            }
        }
    }
    Ok(())
}

async fn cmd_expire_queue(
    bot: &Bot,
    msg: &Message,
    service: &QueueService,
    queue_id: i64,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let in_this_chat = service
        .queue(queue_id)?
        .map_or(false, |q| q.chat_id == chat_id.0);

    let reply = if !in_this_chat {
        format!("Queue {} not found in this chat.", queue_id)
    } else {
        match service.expire_now(queue_id).await? {
            ExpireOutcome::Expired(queue) => format!("Queue {} expired.", queue.name),
            _ => format!("Queue {} not found in this chat.", queue_id),
        }
    };

    bot.send_message(chat_id, reply)
        .await
        .map_err(|e| Error::Telegram(e.to_string()))?;
    Ok(())
}

/// Handle button presses on announcements.
async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    service: Arc<QueueService>,
) -> std::result::Result<(), RequestError> {
    let Some((action, queue_id)) = q.data.as_deref().and_then(QueueAction::parse) else {
        tracing::debug!("Ignoring callback data {:?}", q.data);
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    // Only the message currently announcing the queue may act on it
    let Some(origin) = q.message.as_ref().map(|m| MessageHandle {
        chat_id: m.chat().id.0,
        message_id: m.id().0,
    }) else {
        bot.answer_callback_query(q.id.clone())
            .text(commands::QUEUE_GONE)
            .await?;
        return Ok(());
    };
    let target = Target::via(queue_id, origin);

    let user_id = q.from.id.0 as i64;
    let queue_name = match service.queue(queue_id) {
        Ok(Some(queue)) => queue.name,
        Ok(None) => String::new(),
        Err(e) => {
            tracing::error!("Could not load queue {}: {}", queue_id, e);
            String::new()
        }
    };

    let toast = match action {
        QueueAction::Join => service
            .join(target, user_id, &q.from.full_name())
            .await
            .map(|o| commands::join_toast(&o, &queue_name)),
        QueueAction::Leave => service
            .leave(target, user_id)
            .await
            .map(|o| commands::leave_toast(&o, &queue_name)),
        QueueAction::Advance => service
            .advance(target, user_id)
            .await
            .map(|o| commands::advance_toast(&o, &queue_name)),
    };

    let toast = toast.unwrap_or_else(|e| {
        tracing::error!("{:?} on queue {} failed: {}", action, queue_id, e);
        "Something went wrong, please try again later.".to_string()
    });

    bot.answer_callback_query(q.id.clone()).text(toast).await?;
    Ok(())
}
