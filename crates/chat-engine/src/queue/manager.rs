//! # Conversation Queue Implementation
//!
//! The per-tenant ordered backlog of conversations awaiting an agent.
//! Ordering is strict FIFO by enqueue time within a priority class;
//! higher classes jump ahead. The queue itself is a plain data structure —
//! it always lives inside the tenant state lock, so a dequeue paired with an
//! assignment is one atomic step and the same entry can never be popped
//! twice by concurrent accepts.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::ConversationId;
use crate::conversation::PriorityClass;
use crate::error::{ChatEngineError, Result};

/// One waiting conversation's position in the tenant backlog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Conversation waiting for an agent
    pub conversation_id: ConversationId,

    /// Priority class at the time of (re-)insertion
    pub priority: PriorityClass,

    /// Original enqueue time; preserved across re-insertions so waiting
    /// time is measured from first contact
    pub enqueued_at: DateTime<Utc>,
}

/// Tenant-scoped ordered backlog of Waiting conversations
///
/// # Ordering
///
/// - Entries are FIFO by `enqueued_at` within one priority class.
/// - `High` and `Escalated` entries are served before `Normal` ones.
/// - [`requeue_front`](ConversationQueue::requeue_front) places an entry
///   ahead of its whole class — used when an owner vanished and the
///   conversation must not lose its place again.
///
/// # Examples
///
/// ```
/// use livedesk_chat_engine::queue::{ConversationQueue, QueueEntry};
/// use livedesk_chat_engine::conversation::PriorityClass;
/// use livedesk_chat_engine::ConversationId;
/// use chrono::Utc;
///
/// # fn example() -> livedesk_chat_engine::Result<()> {
/// let mut queue = ConversationQueue::new(50);
///
/// let pos = queue.enqueue(QueueEntry {
///     conversation_id: ConversationId::from("conv-1"),
///     priority: PriorityClass::Normal,
///     enqueued_at: Utc::now(),
/// })?;
/// assert_eq!(pos, 0);
///
/// // An escalated entry jumps ahead of the normal one.
/// let pos = queue.enqueue(QueueEntry {
///     conversation_id: ConversationId::from("conv-2"),
///     priority: PriorityClass::Escalated,
///     enqueued_at: Utc::now(),
/// })?;
/// assert_eq!(pos, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConversationQueue {
    entries: VecDeque<QueueEntry>,
    max_size: usize,
}

impl ConversationQueue {
    /// Create an empty queue bounded at `max_size` entries
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
        }
    }

    /// Number of waiting conversations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the backlog is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a conversation is already queued
    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.entries
            .iter()
            .any(|e| &e.conversation_id == conversation_id)
    }

    /// Current 0-based position of a conversation, if queued
    pub fn position_of(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.conversation_id == conversation_id)
    }

    /// Add a conversation to the backlog
    ///
    /// Inserts after every entry of the same or higher priority class,
    /// keeping FIFO order within the class. Returns the 0-based position
    /// the entry landed at. Duplicate conversations are not re-queued.
    ///
    /// # Errors
    ///
    /// `ChatEngineError::QueueFull` when the tenant backlog is at capacity.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<usize> {
        if self.contains(&entry.conversation_id) {
            warn!(
                "📋 Conversation {} already queued, not re-queuing",
                entry.conversation_id
            );
            // Position is still meaningful to the caller.
            return Ok(self.position_of(&entry.conversation_id).unwrap_or(0));
        }
        if self.entries.len() >= self.max_size {
            return Err(ChatEngineError::queue_full(format!(
                "queue is at capacity ({})",
                self.max_size
            )));
        }

        let rank = entry.priority.rank();
        let position = self
            .entries
            .iter()
            .position(|existing| existing.priority.rank() < rank)
            .unwrap_or(self.entries.len());

        debug!(
            "📋 Enqueued conversation {} at position {} (priority {:?})",
            entry.conversation_id, position, entry.priority
        );
        self.entries.insert(position, entry);
        Ok(position)
    }

    /// Re-insert a conversation at the front of its priority class
    ///
    /// Used for conversations orphaned by a silent disconnect or a failed
    /// transfer: they go back ahead of everything at the same or lower
    /// priority, never to the back of the queue. Capacity is not enforced
    /// here — an orphaned conversation must never be dropped.
    pub fn requeue_front(&mut self, entry: QueueEntry) -> usize {
        if let Some(existing) = self.position_of(&entry.conversation_id) {
            warn!(
                "📋 Conversation {} already queued at {}, not re-inserting",
                entry.conversation_id, existing
            );
            return existing;
        }

        let rank = entry.priority.rank();
        let position = self
            .entries
            .iter()
            .position(|existing| existing.priority.rank() <= rank)
            .unwrap_or(self.entries.len());

        debug!(
            "📋 Front-requeued conversation {} at position {}",
            entry.conversation_id, position
        );
        self.entries.insert(position, entry);
        position
    }

    /// Pop the next waiting conversation
    ///
    /// Atomic with respect to assignment because the caller holds the
    /// tenant lock for both steps.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front();
        if let Some(entry) = &entry {
            debug!(
                "📤 Dequeued conversation {} ({} remaining)",
                entry.conversation_id,
                self.entries.len()
            );
        }
        entry
    }

    /// Remove a specific conversation (cancellation)
    ///
    /// Returns the removed entry, or `None` if the conversation was not
    /// queued — which is how an in-flight assignment that already popped
    /// the entry is detected.
    pub fn remove(&mut self, conversation_id: &ConversationId) -> Option<QueueEntry> {
        let position = self.position_of(conversation_id)?;
        self.entries.remove(position)
    }

    /// Iterate waiting entries in service order
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Conversations that have waited longer than `max_wait`
    ///
    /// The sweep abandons these (ticket → Ended). Waiting time is measured
    /// from the original enqueue, surviving front re-insertions.
    pub fn expired(&self, max_wait: chrono::Duration) -> Vec<ConversationId> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| now.signed_duration_since(e.enqueued_at) > max_wait)
            .map(|e| e.conversation_id.clone())
            .collect()
    }

    /// Snapshot of queue health for monitoring
    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let waits: Vec<i64> = self
            .entries
            .iter()
            .map(|e| now.signed_duration_since(e.enqueued_at).num_seconds().max(0))
            .collect();
        let longest = waits.iter().max().copied().unwrap_or(0);
        let average = if waits.is_empty() {
            0
        } else {
            waits.iter().sum::<i64>() / waits.len() as i64
        };
        QueueStats {
            waiting: self.entries.len(),
            average_wait_seconds: average as u64,
            longest_wait_seconds: longest as u64,
        }
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Conversations currently waiting
    pub waiting: usize,

    /// Mean waiting time of the current backlog
    pub average_wait_seconds: u64,

    /// Longest current wait
    pub longest_wait_seconds: u64,
}
