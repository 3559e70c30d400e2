//! Core module - queues, ordering, and the lifecycle service.
//!
//! This module contains the heart of QueueKing:
//! - Queue and member records
//! - Position ordering rules
//! - Per-queue critical sections
//! - Announcement rendering
//! - The service every adapter calls into

pub mod ordering;
pub mod queue;
pub mod section;
pub mod service;
pub mod view;

pub use queue::{Member, MessageHandle, Queue, QueueId};
pub use section::{QueueSections, SectionGuard};
pub use service::{
    AdvanceOutcome, ExpireOutcome, JoinOutcome, LeaveOutcome, QueueService, ServiceOptions,
    Target,
};
