//! Deadline timers for queue expiry.
//!
//! Each armed queue owns one tokio task that sleeps until the deadline and
//! then reports the queue id, tagged with the arming generation, on the fire
//! channel. Whoever drains the channel performs the deletion, so the timer
//! itself never touches queue state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::QueueId;

/// Time left until `deadline`, zero when it has already passed.
pub fn delay_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// A timer that reached its deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fired {
    pub queue_id: QueueId,
    pub generation: u64,
}

#[derive(Debug)]
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owner of all armed expiry timers.
#[derive(Debug)]
pub struct ExpiryScheduler {
    fire_tx: mpsc::UnboundedSender<Fired>,
    timers: Mutex<HashMap<QueueId, Timer>>,
    next_generation: AtomicU64,
}

impl ExpiryScheduler {
    /// Create a scheduler and the receiving end of its fire channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            fire_tx,
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        };
        (scheduler, fire_rx)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<QueueId, Timer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm (or re-arm) the timer for `queue_id`. A deadline already in the
    /// past fires right away.
    pub fn arm(&self, queue_id: QueueId, deadline: DateTime<Utc>) {
        let delay = delay_until(deadline, Utc::now());
        tracing::debug!("Waiting {:?} to expire queue {}", delay, queue_id);
        self.arm_after(queue_id, delay);
    }

    /// Arm the timer for `queue_id` to fire after `delay`.
    pub fn arm_after(&self, queue_id: QueueId, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fire_tx = self.fire_tx.clone();
        // Held across the spawn so a settle for this generation sees the entry
        let mut timers = self.timers();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if fire_tx.send(Fired { queue_id, generation }).is_err() {
                tracing::debug!("Expiry for queue {} dropped: fire loop stopped", queue_id);
            }
        });

        if let Some(previous) = timers.insert(queue_id, Timer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort the armed timer, if any. Returns whether one was still pending.
    pub fn cancel(&self, queue_id: QueueId) -> bool {
        match self.timers().remove(&queue_id) {
            Some(Timer { handle, .. }) => {
                let pending = !handle.is_finished();
                handle.abort();
                if pending {
                    tracing::debug!("Cancelled expiry timer for queue {}", queue_id);
                }
                pending
            }
            None => false,
        }
    }

    /// Forget the timer that produced `fired`. A timer re-armed since then
    /// carries a newer generation and is left alone. Returns whether an
    /// entry was removed.
    pub fn settle(&self, fired: Fired) -> bool {
        let mut timers = self.timers();
        match timers.get(&fired.queue_id) {
            Some(timer) if timer.generation == fired.generation => {
                timers.remove(&fired.queue_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, queue_id: QueueId) -> bool {
        self.timers()
            .get(&queue_id)
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// Number of timers still waiting.
    pub fn armed(&self) -> usize {
        self.timers().values().filter(|t| !t.handle.is_finished()).count()
    }

    /// Number of timers the scheduler still tracks, fired or not.
    pub fn tracked(&self) -> usize {
        self.timers().len()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_delay_is_clamped_to_zero() {
        let now = Utc::now();
        assert_eq!(delay_until(now - ChronoDuration::seconds(30), now), Duration::ZERO);
        assert_eq!(
            delay_until(now + ChronoDuration::seconds(90), now),
            Duration::from_secs(90)
        );
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm(4, Utc::now() - ChronoDuration::seconds(1));

        let fire = tokio::time::timeout(Duration::from_secs(1), fired.recv())
            .await
            .unwrap();
        assert_eq!(fire.map(|f| f.queue_id), Some(4));
    }

    #[tokio::test]
    async fn test_future_deadline_waits() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm(1, Utc::now() + ChronoDuration::milliseconds(150));
        assert!(scheduler.is_armed(1));

        let early = tokio::time::timeout(Duration::from_millis(50), fired.recv()).await;
        assert!(early.is_err());

        let fire = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .unwrap();
        assert_eq!(fire.map(|f| f.queue_id), Some(1));
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm_after(2, Duration::from_millis(50));
        assert!(scheduler.cancel(2));
        assert!(!scheduler.cancel(2));

        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test]
    async fn test_rearm_replaces_previous_timer() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm_after(3, Duration::from_millis(30));
        scheduler.arm_after(3, Duration::from_secs(60));

        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err());
        assert_eq!(scheduler.armed(), 1);
    }

    #[tokio::test]
    async fn test_settle_forgets_fired_timer_right_away() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm_after(5, Duration::ZERO);
        let fire = fired.recv().await.unwrap();

        // No waiting for the timer task to wind down
        assert!(scheduler.settle(fire));
        assert_eq!(scheduler.tracked(), 0);
        assert!(!scheduler.is_armed(5));
        assert!(!scheduler.cancel(5));
    }

    #[tokio::test]
    async fn test_settle_keeps_rearmed_timer() {
        let (scheduler, mut fired) = ExpiryScheduler::new();

        scheduler.arm_after(6, Duration::ZERO);
        let stale = fired.recv().await.unwrap();
        scheduler.arm_after(6, Duration::from_secs(60));

        assert!(!scheduler.settle(stale));
        assert_eq!(scheduler.tracked(), 1);
        assert!(scheduler.is_armed(6));
    }
}
