//! Pure list reconciliation used by the sync cycle.
//!
//! Nothing here touches storage or the network; every function takes the
//! lists it needs and returns new ones.

use std::collections::{BTreeSet, HashSet};

use chrono::{Days, NaiveDate};

use crate::model::{Message, MessageId};

/// Cursor for the next delta fetch: the stored cursor, or the largest cached
/// id when that is higher. Zero only when the tenant has never received a
/// message. Deleting messages never moves it.
pub fn high_water_mark(cached: &[Message], cursor: MessageId) -> MessageId {
    cached.iter().map(|m| m.id).fold(cursor, MessageId::max)
}

/// Cursor after a delta was applied. Covers every fetched id, including rows
/// that were then suppressed, expired or truncated.
pub fn advance_cursor(cursor: MessageId, fetched: &[Message]) -> MessageId {
    fetched.iter().map(|m| m.id).fold(cursor, MessageId::max)
}

/// `fetched ++ cached`, keeping the first copy of each id.
pub fn merge_fetched(fetched: Vec<Message>, cached: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(fetched.len() + cached.len());
    fetched
        .into_iter()
        .chain(cached.iter().cloned())
        .filter(|m| seen.insert(m.id))
        .collect()
}

/// Removes deleted ids. Returns the number removed.
pub fn suppress_tombstoned(messages: &mut Vec<Message>, tombstones: &BTreeSet<MessageId>) -> usize {
    if tombstones.is_empty() {
        return 0;
    }
    let before = messages.len();
    messages.retain(|m| !tombstones.contains(&m.id));
    before - messages.len()
}

/// First day still inside a `days`-long trailing window ending at `today`.
pub fn retention_cutoff(today: NaiveDate, days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

/// A message without a parseable date is never retained.
pub fn is_retained(message: &Message, cutoff: NaiveDate) -> bool {
    message.date().is_some_and(|day| day >= cutoff)
}

/// Drops messages dated before `cutoff`. Returns the number dropped.
pub fn apply_retention(messages: &mut Vec<Message>, cutoff: NaiveDate) -> usize {
    let before = messages.len();
    messages.retain(|m| is_retained(m, cutoff));
    before - messages.len()
}

pub fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| b.id.cmp(&a.id));
}

/// Bounds the deletion record, forgetting the lowest ids first.
///
/// Only ids at or below `cursor` are forgotten: the feed never serves them
/// again, so their tombstones no longer suppress anything. Returns the number
/// forgotten. The set may stay above `max` while it holds ids past the cursor.
pub fn cap_tombstones(
    tombstones: &mut BTreeSet<MessageId>,
    max: usize,
    cursor: MessageId,
) -> usize {
    let mut forgotten = 0;
    while tombstones.len() > max {
        match tombstones.first() {
            Some(&lowest) if lowest <= cursor => {
                tombstones.pop_first();
                forgotten += 1;
            }
            _ => break,
        }
    }
    forgotten
}

/// Scheduled messages that survived the merge, one per id, in feed order.
pub fn due_notifications<'a>(merged: &[Message], scheduled: &'a [Message]) -> Vec<&'a Message> {
    let present: HashSet<MessageId> = merged.iter().map(|m| m.id).collect();
    let mut emitted = HashSet::new();
    scheduled
        .iter()
        .filter(|m| present.contains(&m.id) && emitted.insert(m.id))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub messages: Vec<Message>,
    pub added: usize,
    pub expired: usize,
    pub suppressed: usize,
    pub truncated: usize,
}

/// Full merge step of a sync cycle: union, tombstone filter, retention,
/// ordering and size cap.
pub fn reconcile(
    cached: &[Message],
    fetched: Vec<Message>,
    tombstones: &BTreeSet<MessageId>,
    cutoff: NaiveDate,
    max_messages: usize,
) -> Reconciled {
    let mut messages = merge_fetched(fetched, cached);
    let suppressed = suppress_tombstoned(&mut messages, tombstones);
    let expired = apply_retention(&mut messages, cutoff);
    sort_newest_first(&mut messages);

    let truncated = messages.len().saturating_sub(max_messages);
    messages.truncate(max_messages);

    let known: HashSet<MessageId> = cached.iter().map(|m| m.id).collect();
    let added = messages.iter().filter(|m| !known.contains(&m.id)).count();

    Reconciled {
        messages,
        added,
        expired,
        suppressed,
        truncated,
    }
}
