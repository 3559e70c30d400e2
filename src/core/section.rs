//! Per-queue exclusive sections.
//!
//! One async mutex per queue id, created on first use and dropped again as
//! soon as nobody holds or waits for it. Operations on different queues never
//! contend; operations on the same queue run one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::queue::QueueId;

type Slots = HashMap<QueueId, Arc<AsyncMutex<()>>>;

/// Registry of queue-keyed sections.
#[derive(Debug, Default)]
pub struct QueueSections {
    slots: Arc<Mutex<Slots>>,
}

// The map lock is never held across an await or a panic-prone call, so a
// poisoned map is still consistent.
fn lock_slots(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueSections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait (without spinning) until the section for `queue_id` is free and
    /// take it. Released when the returned guard is dropped.
    pub async fn acquire(&self, queue_id: QueueId) -> SectionGuard {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            slots
                .entry(queue_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = slot.lock_owned().await;
        tracing::debug!("Acquired section for queue {}", queue_id);

        SectionGuard {
            queue_id,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of queue ids that currently have a live section.
    pub fn live(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

/// Exclusive access to one queue - releases when dropped.
#[derive(Debug)]
pub struct SectionGuard {
    queue_id: QueueId,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<Slots>>,
}

impl SectionGuard {
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Waiters clone the slot under the map lock before awaiting it, so a
        // count of one means the map holds the only reference.
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get(&self.queue_id) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.queue_id);
            }
        }
        tracing::debug!("Released section for queue {}", self.queue_id);
    }
}
