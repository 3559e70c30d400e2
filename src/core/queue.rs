//! Queue and membership records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue identifier, allocated as current maximum + 1.
pub type QueueId = i64;

/// Opaque reference to a rendered announcement message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i32,
}

/// A named waiting line scoped to one chat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Queue {
    /// Unique queue id
    pub id: QueueId,

    /// Display name (never empty after trimming)
    pub name: String,

    /// Owning chat
    pub chat_id: i64,

    /// Absolute expiry moment
    pub expires_at: DateTime<Utc>,

    /// Rendered announcement, `None` until published
    pub announcement: Option<MessageHandle>,

    /// Highest position ever handed out in this queue
    pub last_position: i64,
}

impl Queue {
    /// Create an unpublished queue with no members.
    pub fn new(id: QueueId, name: &str, chat_id: i64, expires_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.to_string(),
            chat_id,
            expires_at,
            announcement: None,
            last_position: 0,
        }
    }

    /// Only published queues accept join/leave/advance.
    pub fn is_published(&self) -> bool {
        self.announcement.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A user's membership and rank token within one queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub queue_id: QueueId,
    pub user_id: i64,

    /// Name snapshot taken at join time
    pub display_name: String,

    /// Strictly positive, unique within the queue, not necessarily contiguous
    pub position: i64,
}
