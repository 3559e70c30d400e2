//! Position rules for a single queue's membership.
//!
//! Positions are rank tokens: assigned on join, exchanged on advance, never
//! renumbered. Display order is ascending position, so gaps left by leaves
//! are invisible to anyone looking at the queue.

use super::queue::{Member, Queue};

/// Position the next joiner receives.
///
/// Takes the queue's high-water mark into account so a position freed by a
/// departing tail member is never handed out again.
pub fn next_position(queue: &Queue, members: &[Member]) -> i64 {
    let max_member = members.iter().map(|m| m.position).max().unwrap_or(0);
    queue.last_position.max(max_member) + 1
}

/// Build the tail membership for `user_id` and bump the queue's mark.
pub fn append(queue: &mut Queue, members: &[Member], user_id: i64, display_name: &str) -> Member {
    let position = next_position(queue, members);
    queue.last_position = position;

    Member {
        queue_id: queue.id,
        user_id,
        display_name: display_name.to_string(),
        position,
    }
}

pub fn find(members: &[Member], user_id: i64) -> Option<&Member> {
    members.iter().find(|m| m.user_id == user_id)
}

/// The member holding the smallest position strictly greater than `position`.
pub fn successor(members: &[Member], position: i64) -> Option<&Member> {
    members
        .iter()
        .filter(|m| m.position > position)
        .min_by_key(|m| m.position)
}

/// Exchange rank tokens between two members. Nothing else changes.
pub fn swap_positions(a: &mut Member, b: &mut Member) {
    std::mem::swap(&mut a.position, &mut b.position);
}

/// Members in service order.
pub fn ranked(members: &[Member]) -> Vec<Member> {
    let mut out = members.to_vec();
    out.sort_by_key(|m| m.position);
    out
}

/// 1-based rank of `user_id`, derived from the ordering.
pub fn rank_of(members: &[Member], user_id: i64) -> Option<usize> {
    ranked(members)
        .iter()
        .position(|m| m.user_id == user_id)
        .map(|i| i + 1)
}
