//! Persistence for queues and their members.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::core::{Member, Queue, QueueId};
use crate::error::Result;

/// Durable, immediately consistent queue storage.
///
/// Implementations must make `save_members` and `delete_queue` atomic: the
/// service relies on the former for the position exchange of an advance and
/// on the latter to never leave members behind a deleted queue.
pub trait QueueStore: Send + Sync {
    /// Current maximum queue id + 1, or 0 when no queue exists.
    fn next_queue_id(&self) -> Result<QueueId>;

    fn load_queue(&self, id: QueueId) -> Result<Option<Queue>>;

    /// Members of a queue, in no particular order.
    fn load_members(&self, id: QueueId) -> Result<Vec<Member>>;

    fn list_queues(&self) -> Result<Vec<Queue>>;

    fn queues_in_chat(&self, chat_id: i64) -> Result<Vec<Queue>>;

    /// Queues the user currently holds a membership in.
    fn queues_for_user(&self, user_id: i64) -> Result<Vec<Queue>>;

    /// Insert or replace a queue record.
    fn save_queue(&self, queue: &Queue) -> Result<()>;

    /// Insert or update all given members in one transaction.
    fn save_members(&self, members: &[Member]) -> Result<()>;

    /// Returns whether a membership was removed.
    fn remove_member(&self, queue_id: QueueId, user_id: i64) -> Result<bool>;

    /// Remove a queue and every member sharing its id. Returns whether the
    /// queue existed.
    fn delete_queue(&self, id: QueueId) -> Result<bool>;
}
