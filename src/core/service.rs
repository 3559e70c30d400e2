//! Queue lifecycle: create, join, leave, advance and expire.
//!
//! Every mutating entry point takes the queue's section before it reads
//! membership and holds it until it returns, so per queue the effects of
//! concurrent button presses, commands and timer fires form a total order.
//! Persistence failures propagate; announcement failures are logged and
//! never undo a committed change.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::announce::{Announcer, RenderError};
use crate::error::{Error, Result};
use crate::expiry::{ExpiryScheduler, Fired};
use crate::storage::QueueStore;

use super::ordering;
use super::queue::{Member, MessageHandle, Queue, QueueId};
use super::section::QueueSections;
use super::view;

/// Delay before retrying an expiry that failed on storage.
const EXPIRY_RETRY: Duration = Duration::from_secs(60);

/// Timers may wake a little before the stored deadline by the wall clock.
const FIRE_SLACK_MS: i64 = 1_000;

/// The queue a join, leave or advance is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub queue_id: QueueId,

    /// Announcement the request came from. When set it must still be the
    /// queue's current announcement, so buttons left on a message of an
    /// expired queue cannot act on a newer queue that reuses the id.
    pub origin: Option<MessageHandle>,
}

impl Target {
    pub fn via(queue_id: QueueId, origin: MessageHandle) -> Self {
        Self {
            queue_id,
            origin: Some(origin),
        }
    }
}

impl From<QueueId> for Target {
    fn from(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Joined(Member),
    /// The user was already in line; nothing changed.
    AlreadyMember(Member),
    QueueNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaveOutcome {
    Left(Member),
    NotMember,
    QueueNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Both members after the exchange: `caller` now holds the later position.
    Advanced { caller: Member, successor: Member },
    NotMember,
    NoSuccessor,
    QueueNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpireOutcome {
    Expired(Queue),
    AlreadyDeleted,
    /// A timer fired ahead of the stored deadline and was re-armed.
    NotDue,
}

/// Tunables taken from settings.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub default_ttl: chrono::Duration,
    pub max_name_length: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_ttl: chrono::Duration::days(7),
            max_name_length: 128,
        }
    }
}

/// Entry points for everything that changes a queue.
pub struct QueueService {
    store: Arc<dyn QueueStore>,
    announcer: Arc<dyn Announcer>,
    sections: QueueSections,
    scheduler: ExpiryScheduler,
    create_lock: Mutex<()>,
    options: ServiceOptions,
}

impl QueueService {
    /// Build the service and start draining its expiry timers. Must be
    /// called from within a tokio runtime.
    pub fn new(
        store: Arc<dyn QueueStore>,
        announcer: Arc<dyn Announcer>,
        options: ServiceOptions,
    ) -> Arc<Self> {
        let (scheduler, fired) = ExpiryScheduler::new();
        let service = Arc::new(Self {
            store,
            announcer,
            sections: QueueSections::new(),
            scheduler,
            create_lock: Mutex::new(()),
            options,
        });
        tokio::spawn(run_fire_loop(Arc::downgrade(&service), fired));
        service
    }

    /// Re-arm one timer per persisted queue. Deadlines that passed while the
    /// process was down fire immediately.
    pub fn hydrate(&self) -> Result<usize> {
        let queues = self.store.list_queues()?;
        for queue in &queues {
            self.scheduler.arm(queue.id, queue.expires_at);
        }
        tracing::info!("Re-armed {} expiry timers", queues.len());
        Ok(queues.len())
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        &self.scheduler
    }

    /// Create and publish a queue. `deadline` defaults to now + the
    /// configured lifetime.
    pub async fn create(
        &self,
        name: &str,
        chat_id: i64,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Queue> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("queue name is empty".to_string()));
        }
        if name.chars().count() > self.options.max_name_length {
            return Err(Error::InvalidArgument(format!(
                "queue name is longer than {} characters",
                self.options.max_name_length
            )));
        }

        let now = Utc::now();
        let expires_at = match deadline {
            Some(at) if at <= now => return Err(Error::DeadlineInPast),
            Some(at) => at,
            None => now
                .checked_add_signed(self.options.default_ttl)
                .ok_or_else(|| Error::Config("default queue lifetime is out of range".to_string()))?,
        };

        let (mut queue, _section) = {
            let _alloc = self.create_lock.lock().await;
            let id = self.store.next_queue_id()?;
            let section = self.sections.acquire(id).await;
            let queue = Queue::new(id, name, chat_id, expires_at);
            self.store.save_queue(&queue)?;
            (queue, section)
        };
        self.scheduler.arm(queue.id, queue.expires_at);

        let text = view::render(&queue, &[], now);
        match self
            .announcer
            .publish(chat_id, &text, &view::actions(queue.id))
            .await
        {
            Ok(handle) => {
                queue.announcement = Some(handle);
                self.store.save_queue(&queue)?;
            }
            Err(e) => {
                tracing::warn!("Queue {} created but not published: {}", queue.id, e);
            }
        }

        tracing::info!(
            "Created queue \"{}\":{} in chat {}, expires {}",
            queue.name,
            queue.id,
            chat_id,
            queue.expires_at
        );
        Ok(queue)
    }

    /// Put the user at the tail of the queue.
    pub async fn join(
        &self,
        target: impl Into<Target>,
        user_id: i64,
        display_name: &str,
    ) -> Result<JoinOutcome> {
        let Target { queue_id, origin } = target.into();
        let _section = self.sections.acquire(queue_id).await;

        let Some(mut queue) = self.live_queue(queue_id, origin)? else {
            return Ok(JoinOutcome::QueueNotFound);
        };
        let mut members = self.store.load_members(queue_id)?;

        if let Some(existing) = ordering::find(&members, user_id) {
            tracing::debug!("User {} already in queue {}", user_id, queue_id);
            return Ok(JoinOutcome::AlreadyMember(existing.clone()));
        }

        let member = ordering::append(&mut queue, &members, user_id, display_name);
        // Mark first: a crash between the two writes leaves a gap, never a reused position.
        self.store.save_queue(&queue)?;
        self.store.save_members(std::slice::from_ref(&member))?;
        members.push(member.clone());

        tracing::info!(
            "User {} joined queue {} at position {}",
            user_id,
            queue_id,
            member.position
        );
        self.refresh(&queue, &members).await;
        Ok(JoinOutcome::Joined(member))
    }

    /// Remove the user's membership. Remaining positions are untouched.
    pub async fn leave(&self, target: impl Into<Target>, user_id: i64) -> Result<LeaveOutcome> {
        let Target { queue_id, origin } = target.into();
        let _section = self.sections.acquire(queue_id).await;

        let Some(queue) = self.live_queue(queue_id, origin)? else {
            return Ok(LeaveOutcome::QueueNotFound);
        };
        let mut members = self.store.load_members(queue_id)?;

        let Some(member) = ordering::find(&members, user_id).cloned() else {
            return Ok(LeaveOutcome::NotMember);
        };

        self.store.remove_member(queue_id, user_id)?;
        members.retain(|m| m.user_id != user_id);

        tracing::info!("User {} left queue {}", user_id, queue_id);
        self.refresh(&queue, &members).await;
        Ok(LeaveOutcome::Left(member))
    }

    /// Let the next person go ahead: exchange positions with the immediate
    /// successor in rank.
    pub async fn advance(&self, target: impl Into<Target>, user_id: i64) -> Result<AdvanceOutcome> {
        let Target { queue_id, origin } = target.into();
        let _section = self.sections.acquire(queue_id).await;

        let Some(queue) = self.live_queue(queue_id, origin)? else {
            return Ok(AdvanceOutcome::QueueNotFound);
        };
        let mut members = self.store.load_members(queue_id)?;

        let Some(mut caller) = ordering::find(&members, user_id).cloned() else {
            return Ok(AdvanceOutcome::NotMember);
        };
        let Some(mut successor) = ordering::successor(&members, caller.position).cloned() else {
            return Ok(AdvanceOutcome::NoSuccessor);
        };

        ordering::swap_positions(&mut caller, &mut successor);
        self.store
            .save_members(&[caller.clone(), successor.clone()])?;

        for m in members.iter_mut() {
            if m.user_id == caller.user_id {
                m.position = caller.position;
            } else if m.user_id == successor.user_id {
                m.position = successor.position;
            }
        }

        tracing::info!(
            "User {} let {} ahead in queue {}",
            caller.user_id,
            successor.user_id,
            queue_id
        );
        self.refresh(&queue, &members).await;
        Ok(AdvanceOutcome::Advanced { caller, successor })
    }

    /// Delete a queue and all its members right away. Idempotent.
    pub async fn expire_now(&self, queue_id: QueueId) -> Result<ExpireOutcome> {
        let _section = self.sections.acquire(queue_id).await;

        let Some(queue) = self.store.load_queue(queue_id)? else {
            tracing::debug!("Queue {} already deleted", queue_id);
            return Ok(ExpireOutcome::AlreadyDeleted);
        };

        let outcome = self.delete_locked(queue).await?;
        self.scheduler.cancel(queue_id);
        Ok(outcome)
    }

    /// Timer path: delete the queue if its stored deadline has been reached.
    pub async fn expire_due(&self, queue_id: QueueId) -> Result<ExpireOutcome> {
        let _section = self.sections.acquire(queue_id).await;

        let Some(queue) = self.store.load_queue(queue_id)? else {
            tracing::debug!("Expiry fired for deleted queue {}", queue_id);
            return Ok(ExpireOutcome::AlreadyDeleted);
        };

        if queue.expires_at > Utc::now() + chrono::Duration::milliseconds(FIRE_SLACK_MS) {
            tracing::debug!("Queue {} not due yet, re-arming", queue_id);
            self.scheduler.arm(queue_id, queue.expires_at);
            return Ok(ExpireOutcome::NotDue);
        }

        self.delete_locked(queue).await
    }

    async fn delete_locked(&self, queue: Queue) -> Result<ExpireOutcome> {
        let members = self.store.load_members(queue.id)?;
        if !self.store.delete_queue(queue.id)? {
            return Ok(ExpireOutcome::AlreadyDeleted);
        }
        tracing::info!(
            "Deleted queue \"{}\":{} with {} members",
            queue.name,
            queue.id,
            members.len()
        );

        if let Some(handle) = queue.announcement {
            let now = Utc::now();
            let mut finished = queue.clone();
            finished.expires_at = finished.expires_at.min(now);
            let text = view::render(&finished, &members, now);
            if let Err(e) = self.announcer.update(handle, &text, None).await {
                tracing::warn!("Could not finalize announcement of queue {}: {}", queue.id, e);
            }
        }
        Ok(ExpireOutcome::Expired(queue))
    }

    /// Point the chat at each of its queues, republishing announcements that
    /// are gone. Returns how many queues the chat has.
    pub async fn show_all(&self, chat_id: i64) -> Result<usize> {
        let queues = self.store.queues_in_chat(chat_id)?;
        if queues.is_empty() {
            if let Err(e) = self
                .announcer
                .notify(chat_id, "There are no queues in this chat.")
                .await
            {
                tracing::warn!("Could not answer chat {}: {}", chat_id, e);
            }
            return Ok(0);
        }

        for queue in &queues {
            let pointed = match queue.announcement {
                Some(handle) => {
                    self.announcer
                        .reply(handle, &format!("Here is queue {}", queue.name))
                        .await
                }
                None => Err(RenderError::TargetNotFound),
            };
            match pointed {
                Ok(()) => {}
                Err(RenderError::TargetNotFound) => {
                    self.republish(queue.id).await?;
                }
                Err(e) => {
                    tracing::warn!("Could not point at queue {}: {}", queue.id, e);
                }
            }
        }
        Ok(queues.len())
    }

    /// Post a fresh announcement for a queue and remember its handle.
    pub async fn republish(&self, queue_id: QueueId) -> Result<Option<MessageHandle>> {
        let _section = self.sections.acquire(queue_id).await;

        let Some(mut queue) = self.store.load_queue(queue_id)? else {
            return Ok(None);
        };
        let members = self.store.load_members(queue_id)?;

        let text = view::render(&queue, &members, Utc::now());
        match self
            .announcer
            .publish(queue.chat_id, &text, &view::actions(queue_id))
            .await
        {
            Ok(handle) => {
                queue.announcement = Some(handle);
                self.store.save_queue(&queue)?;
                tracing::info!("Republished queue {} as message {}", queue_id, handle.message_id);
                Ok(Some(handle))
            }
            Err(e) => {
                tracing::warn!("Could not republish queue {}: {}", queue_id, e);
                Ok(None)
            }
        }
    }

    /// Consistent view of a queue and its members in service order.
    pub async fn snapshot(&self, queue_id: QueueId) -> Result<Option<(Queue, Vec<Member>)>> {
        let _section = self.sections.acquire(queue_id).await;
        let Some(queue) = self.store.load_queue(queue_id)? else {
            return Ok(None);
        };
        let members = ordering::ranked(&self.store.load_members(queue_id)?);
        Ok(Some((queue, members)))
    }

    pub fn queues_for_user(&self, user_id: i64) -> Result<Vec<Queue>> {
        self.store.queues_for_user(user_id)
    }

    pub fn queue(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        self.store.load_queue(queue_id)
    }

    /// Queue that may be joined, left or advanced in.
    fn live_queue(&self, queue_id: QueueId, origin: Option<MessageHandle>) -> Result<Option<Queue>> {
        let queue = self.store.load_queue(queue_id)?.filter(Queue::is_published);
        Ok(queue.filter(|q| match origin {
            Some(origin) if q.announcement != Some(origin) => {
                tracing::debug!(
                    "Message {} in chat {} is not the announcement of queue {}",
                    origin.message_id,
                    origin.chat_id,
                    queue_id
                );
                false
            }
            _ => true,
        }))
    }

    async fn refresh(&self, queue: &Queue, members: &[Member]) {
        let Some(handle) = queue.announcement else {
            return;
        };
        let text = view::render(queue, members, Utc::now());
        let actions = view::actions(queue.id);
        match self.announcer.update(handle, &text, Some(&actions)).await {
            Ok(()) => {}
            Err(RenderError::TargetNotFound) => {
                tracing::warn!("Announcement of queue {} is gone", queue.id);
            }
            Err(e) => {
                tracing::warn!("Could not update announcement of queue {}: {}", queue.id, e);
            }
        }
    }
}

/// Drain timer fires and expire each queue through its section.
async fn run_fire_loop(service: Weak<QueueService>, mut fired: mpsc::UnboundedReceiver<Fired>) {
    while let Some(fire) = fired.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.scheduler.settle(fire);
        let queue_id = fire.queue_id;
        tokio::spawn(async move {
            tracing::debug!("Expiry fired for queue {}", queue_id);
            if let Err(e) = service.expire_due(queue_id).await {
                tracing::error!("Failed to expire queue {}: {}", queue_id, e);
                service.scheduler.arm_after(queue_id, EXPIRY_RETRY);
            }
        });
    }
    tracing::debug!("Expiry fire loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::testing::{RecordingAnnouncer, Rendered};
    use crate::storage::SqliteStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CHAT: i64 = -100_200;

    fn service() -> (Arc<QueueService>, Arc<SqliteStore>, Arc<RecordingAnnouncer>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let announcer = Arc::new(RecordingAnnouncer::new());
        let service = QueueService::new(store.clone(), announcer.clone(), ServiceOptions::default());
        (service, store, announcer)
    }

    async fn positions(service: &QueueService, queue_id: QueueId) -> Vec<(i64, i64)> {
        let (_, members) = service.snapshot(queue_id).await.unwrap().unwrap();
        members.iter().map(|m| (m.user_id, m.position)).collect()
    }

    async fn join(service: &QueueService, queue_id: QueueId, user_id: i64) -> JoinOutcome {
        service
            .join(queue_id, user_id, &format!("user{}", user_id))
            .await
            .unwrap()
    }

    async fn wait_deleted(store: &SqliteStore, queue_id: QueueId) -> bool {
        for _ in 0..100 {
            if store.load_queue(queue_id).unwrap().is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_defaults_and_publishes() {
        let (service, store, announcer) = service();
        let before = Utc::now();

        let queue = service.create("  Coffee  ", CHAT, None).await.unwrap();

        assert_eq!(queue.id, 0);
        assert_eq!(queue.name, "Coffee");
        assert!(queue.is_published());
        assert!(queue.expires_at >= before + chrono::Duration::days(7));
        assert!(queue.expires_at <= Utc::now() + chrono::Duration::days(7));
        assert!(service.scheduler().is_armed(0));

        let stored = store.load_queue(0).unwrap().unwrap();
        assert_eq!(stored.announcement, queue.announcement);
        assert!(matches!(announcer.events()[0], Rendered::Published { .. }));

        let second = service.create("Tea", CHAT, None).await.unwrap();
        assert_eq!(second.id, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input_without_side_effects() {
        let (service, store, announcer) = service();

        let empty = service.create("   ", CHAT, None).await;
        assert!(matches!(empty, Err(Error::InvalidArgument(_))));

        let past = service
            .create("Late", CHAT, Some(Utc::now() - chrono::Duration::seconds(5)))
            .await;
        assert!(matches!(past, Err(Error::DeadlineInPast)));

        let long = "x".repeat(129);
        assert!(service.create(&long, CHAT, None).await.unwrap_err().is_validation());

        assert!(store.list_queues().unwrap().is_empty());
        assert!(announcer.events().is_empty());
    }

    #[tokio::test]
    async fn test_coffee_scenario() {
        let (service, _, _) = service();
        let queue = service.create("Coffee", CHAT, None).await.unwrap();
        let id = queue.id;

        for user in [1, 2, 3] {
            assert!(matches!(join(&service, id, user).await, JoinOutcome::Joined(_)));
        }
        assert_eq!(positions(&service, id).await, vec![(1, 1), (2, 2), (3, 3)]);

        assert!(matches!(
            service.leave(id, 2).await.unwrap(),
            LeaveOutcome::Left(_)
        ));
        assert_eq!(positions(&service, id).await, vec![(1, 1), (3, 3)]);

        match join(&service, id, 4).await {
            JoinOutcome::Joined(m) => assert_eq!(m.position, 4),
            other => panic!("unexpected {:?}", other),
        }

        match service.advance(id, 1).await.unwrap() {
            AdvanceOutcome::Advanced { caller, successor } => {
                assert_eq!((caller.user_id, caller.position), (1, 3));
                assert_eq!((successor.user_id, successor.position), (3, 1));
            }
            other => panic!("unexpected {:?}", other),
        }

        let order: Vec<i64> = positions(&service, id).await.iter().map(|p| p.0).collect();
        assert_eq!(order, vec![3, 1, 4]);
        assert_eq!(positions(&service, id).await, vec![(3, 1), (1, 3), (4, 4)]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (service, _, _) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;

        let first = join(&service, id, 7).await;
        let second = join(&service, id, 7).await;

        let JoinOutcome::Joined(member) = first else {
            panic!("first join should succeed");
        };
        assert_eq!(second, JoinOutcome::AlreadyMember(member));
        assert_eq!(positions(&service, id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_gets_fresh_position() {
        let (service, _, _) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;

        join(&service, id, 1).await;
        join(&service, id, 2).await;
        service.leave(id, 2).await.unwrap();

        match join(&service, id, 2).await {
            JoinOutcome::Joined(m) => assert_eq!(m.position, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_business_outcomes() {
        let (service, _, _) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;

        assert_eq!(service.leave(id, 1).await.unwrap(), LeaveOutcome::NotMember);
        assert_eq!(service.advance(id, 1).await.unwrap(), AdvanceOutcome::NotMember);

        join(&service, id, 1).await;
        join(&service, id, 2).await;
        let before = positions(&service, id).await;
        assert_eq!(service.advance(id, 2).await.unwrap(), AdvanceOutcome::NoSuccessor);
        assert_eq!(positions(&service, id).await, before);

        let missing: QueueId = 99;
        assert_eq!(join(&service, missing, 1).await, JoinOutcome::QueueNotFound);
        assert_eq!(service.leave(missing, 1).await.unwrap(), LeaveOutcome::QueueNotFound);
        assert_eq!(service.advance(missing, 1).await.unwrap(), AdvanceOutcome::QueueNotFound);
    }

    #[tokio::test]
    async fn test_stale_announcement_cannot_touch_reused_id() {
        let (service, store, announcer) = service();
        let old = service.create("Old", CHAT, None).await.unwrap();
        let old_handle = old.announcement.unwrap();

        // Finalizing fails, so the old message keeps its buttons
        announcer.fail_updates(true);
        service.expire_now(old.id).await.unwrap();
        announcer.fail_updates(false);

        let other_chat = CHAT - 1;
        let new = service.create("New", other_chat, None).await.unwrap();
        assert_eq!(new.id, old.id);

        let pressed = Target::via(old.id, old_handle);
        assert_eq!(
            service.join(pressed, 1, "user1").await.unwrap(),
            JoinOutcome::QueueNotFound
        );
        assert_eq!(service.leave(pressed, 1).await.unwrap(), LeaveOutcome::QueueNotFound);
        assert_eq!(service.advance(pressed, 1).await.unwrap(), AdvanceOutcome::QueueNotFound);
        assert!(store.load_members(new.id).unwrap().is_empty());

        let current = Target::via(new.id, new.announcement.unwrap());
        assert!(matches!(
            service.join(current, 1, "user1").await.unwrap(),
            JoinOutcome::Joined(_)
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_default_lifetime_is_rejected() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let options = ServiceOptions {
            default_ttl: chrono::Duration::try_days(1_000_000_000).unwrap(),
            ..ServiceOptions::default()
        };
        let service = QueueService::new(store.clone(), Arc::new(RecordingAnnouncer::new()), options);

        let result = service.create("Forever", CHAT, None).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(store.list_queues().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unpublished_queue_is_not_joinable() {
        let (service, store, announcer) = service();
        announcer.fail_publish(true);

        let queue = service.create("Hidden", CHAT, None).await.unwrap();
        assert!(!queue.is_published());
        assert!(store.load_queue(queue.id).unwrap().is_some());
        assert!(service.scheduler().is_armed(queue.id));

        assert_eq!(join(&service, queue.id, 1).await, JoinOutcome::QueueNotFound);
    }

    #[tokio::test]
    async fn test_render_failure_keeps_membership() {
        let (service, store, announcer) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;
        announcer.fail_updates(true);

        assert!(matches!(join(&service, id, 1).await, JoinOutcome::Joined(_)));
        assert_eq!(store.load_members(id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_announcement_tracks_changes() {
        let (service, _, announcer) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;

        join(&service, id, 1).await;
        let (text, has_actions) = announcer.last_update().unwrap();
        assert!(text.ends_with("1. user1\n"));
        assert!(has_actions);

        service.expire_now(id).await.unwrap();
        let (text, has_actions) = announcer.last_update().unwrap();
        assert!(text.contains("Expired"));
        assert!(!has_actions);
    }

    #[tokio::test]
    async fn test_expire_now_is_idempotent() {
        let (service, store, announcer) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;
        join(&service, id, 1).await;

        assert!(matches!(
            service.expire_now(id).await.unwrap(),
            ExpireOutcome::Expired(_)
        ));
        assert!(store.load_queue(id).unwrap().is_none());
        assert!(store.load_members(id).unwrap().is_empty());
        assert!(!service.scheduler().is_armed(id));

        let events = announcer.events().len();
        assert_eq!(service.expire_now(id).await.unwrap(), ExpireOutcome::AlreadyDeleted);
        assert_eq!(announcer.events().len(), events);
        assert_eq!(join(&service, id, 2).await, JoinOutcome::QueueNotFound);
    }

    #[tokio::test]
    async fn test_expiry_survives_announcement_failure() {
        let (service, store, announcer) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;
        announcer.fail_updates(true);

        assert!(matches!(
            service.expire_now(id).await.unwrap(),
            ExpireOutcome::Expired(_)
        ));
        assert!(store.load_queue(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timer_deletes_at_deadline() {
        let (service, store, _) = service();
        let deadline = Utc::now() + chrono::Duration::milliseconds(300);
        let id = service.create("Short", CHAT, Some(deadline)).await.unwrap().id;
        join(&service, id, 1).await;

        assert!(store.load_queue(id).unwrap().is_some());
        assert!(wait_deleted(&store, id).await);
        assert!(store.load_members(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_early_fire_is_rearmed() {
        let (service, store, _) = service();
        let id = service.create("Later", CHAT, None).await.unwrap().id;

        assert_eq!(service.expire_due(id).await.unwrap(), ExpireOutcome::NotDue);
        assert!(store.load_queue(id).unwrap().is_some());
        assert!(service.scheduler().is_armed(id));
    }

    #[tokio::test]
    async fn test_hydrate_expires_overdue_queue() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queues.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut queue = Queue::new(0, "Stale", CHAT, Utc::now() - chrono::Duration::seconds(1));
            queue.announcement = Some(MessageHandle {
                chat_id: CHAT,
                message_id: 10,
            });
            store.save_queue(&queue).unwrap();
            let mut fresh = Queue::new(1, "Fresh", CHAT, Utc::now() + chrono::Duration::days(1));
            fresh.announcement = queue.announcement;
            store.save_queue(&fresh).unwrap();
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let announcer = Arc::new(RecordingAnnouncer::new());
        let service = QueueService::new(store.clone(), announcer.clone(), ServiceOptions::default());

        assert_eq!(service.hydrate().unwrap(), 2);
        assert!(wait_deleted(&store, 0).await);
        assert!(store.load_queue(1).unwrap().is_some());
        assert!(service.scheduler().is_armed(1));
        // The fired timer of queue 0 is no longer tracked
        assert_eq!(service.scheduler().tracked(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_get_unique_positions() {
        let (service, _, _) = service();
        let id = service.create("Rush", CHAT, None).await.unwrap().id;

        let mut tasks = Vec::new();
        for user in 0..24 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.join(id, user, "racer").await.unwrap()
            }));
        }
        for task in tasks {
            assert!(matches!(task.await.unwrap(), JoinOutcome::Joined(_)));
        }

        let mut seen: Vec<i64> = positions(&service, id).await.iter().map(|p| p.1).collect();
        seen.sort();
        assert_eq!(seen, (1..=24).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mixed_operations_keep_positions_unique() {
        let (service, _, _) = service();
        let id = service.create("Busy", CHAT, None).await.unwrap().id;
        for user in 0..8 {
            join(&service, id, user).await;
        }

        let mut tasks = Vec::new();
        for user in 0..8 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.advance(id, user).await.unwrap();
                if user % 2 == 0 {
                    service.leave(id, user).await.unwrap();
                    service.join(id, user, "again").await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let members = positions(&service, id).await;
        let mut seen: Vec<i64> = members.iter().map(|p| p.1).collect();
        seen.dedup();
        assert_eq!(members.len(), 8);
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn test_show_all_republishes_missing_announcement() {
        let (service, store, announcer) = service();
        let id = service.create("Lab", CHAT, None).await.unwrap().id;
        let original = store.load_queue(id).unwrap().unwrap().announcement;

        assert_eq!(service.show_all(CHAT).await.unwrap(), 1);
        assert!(announcer
            .events()
            .iter()
            .any(|e| matches!(e, Rendered::Replied { .. })));

        announcer.fail_replies(true);
        service.show_all(CHAT).await.unwrap();
        let republished = store.load_queue(id).unwrap().unwrap().announcement;
        assert!(republished.is_some());
        assert_ne!(republished, original);
    }

    #[tokio::test]
    async fn test_show_all_in_empty_chat() {
        let (service, _, announcer) = service();

        assert_eq!(service.show_all(CHAT).await.unwrap(), 0);
        assert_eq!(
            announcer.events(),
            vec![Rendered::Notified {
                chat_id: CHAT,
                text: "There are no queues in this chat.".to_string()
            }]
        );
    }

    /// Store wrapper whose member writes can be switched off.
    struct FlakyStore {
        inner: SqliteStore,
        down: AtomicBool,
    }

    impl QueueStore for FlakyStore {
        fn next_queue_id(&self) -> Result<QueueId> {
            self.inner.next_queue_id()
        }
        fn load_queue(&self, id: QueueId) -> Result<Option<Queue>> {
            self.inner.load_queue(id)
        }
        fn load_members(&self, id: QueueId) -> Result<Vec<Member>> {
            self.inner.load_members(id)
        }
        fn list_queues(&self) -> Result<Vec<Queue>> {
            self.inner.list_queues()
        }
        fn queues_in_chat(&self, chat_id: i64) -> Result<Vec<Queue>> {
            self.inner.queues_in_chat(chat_id)
        }
        fn queues_for_user(&self, user_id: i64) -> Result<Vec<Queue>> {
            self.inner.queues_for_user(user_id)
        }
        fn save_queue(&self, queue: &Queue) -> Result<()> {
            self.inner.save_queue(queue)
        }
        fn save_members(&self, members: &[Member]) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Storage("database unavailable".to_string()));
            }
            self.inner.save_members(members)
        }
        fn remove_member(&self, queue_id: QueueId, user_id: i64) -> Result<bool> {
            self.inner.remove_member(queue_id, user_id)
        }
        fn delete_queue(&self, id: QueueId) -> Result<bool> {
            self.inner.delete_queue(id)
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_without_partial_membership() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            down: AtomicBool::new(false),
        });
        let service = QueueService::new(
            store.clone(),
            Arc::new(RecordingAnnouncer::new()),
            ServiceOptions::default(),
        );
        let id = service.create("Lab", CHAT, None).await.unwrap().id;
        join(&service, id, 1).await;
        join(&service, id, 2).await;

        store.down.store(true, Ordering::SeqCst);
        let result = service.advance(id, 1).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        let failed_join = service.join(id, 3, "user3").await;
        assert!(matches!(failed_join, Err(Error::Storage(_))));

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(positions(&service, id).await, vec![(1, 1), (2, 2)]);
    }
}
