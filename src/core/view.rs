//! Announcement text and buttons for a queue.

use chrono::{DateTime, Local, Utc};
use teloxide::utils::html;

use crate::announce::Action;

use super::ordering;
use super::queue::{Member, Queue, QueueId};

/// Button kinds attached to a live announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueAction {
    Join,
    Leave,
    Advance,
}

impl QueueAction {
    pub const ALL: [QueueAction; 3] = [QueueAction::Join, QueueAction::Leave, QueueAction::Advance];

    fn prefix(self) -> &'static str {
        match self {
            QueueAction::Join => "QueueEnter",
            QueueAction::Leave => "QueueLeave",
            QueueAction::Advance => "QueueLet",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QueueAction::Join => "Enter queue",
            QueueAction::Leave => "Leave queue",
            QueueAction::Advance => "Let ahead",
        }
    }

    /// Callback payload, e.g. `QueueEnter:12`.
    pub fn callback_data(self, queue_id: QueueId) -> String {
        format!("{}:{}", self.prefix(), queue_id)
    }

    /// Parse a callback payload back into an action and queue id.
    pub fn parse(data: &str) -> Option<(QueueAction, QueueId)> {
        let (prefix, id) = data.split_once(':')?;
        let action = Self::ALL.into_iter().find(|a| a.prefix() == prefix)?;
        let queue_id = id.trim().parse().ok()?;
        Some((action, queue_id))
    }
}

/// Buttons for a live queue, one per row.
pub fn actions(queue_id: QueueId) -> Vec<Action> {
    QueueAction::ALL
        .into_iter()
        .map(|a| Action {
            label: a.label().to_string(),
            data: a.callback_data(queue_id),
        })
        .collect()
}

pub fn format_deadline(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string()
}

/// HTML announcement body.
pub fn render(queue: &Queue, members: &[Member], now: DateTime<Utc>) -> String {
    let mut out = format!("Queue: <b>{}</b>\n", html::escape(&queue.name));

    if queue.is_expired_at(now) {
        out.push_str("Expired\n\n");
    } else {
        out.push_str(&format!("Expires: {}\n\n", format_deadline(queue.expires_at)));
    }

    if members.is_empty() {
        out.push_str("<i>Queue is empty</i>");
        return out;
    }

    for (rank, member) in ordering::ranked(members).iter().enumerate() {
        out.push_str(&format!("{}. {}\n", rank + 1, html::escape(&member.display_name)));
    }
    out
}
