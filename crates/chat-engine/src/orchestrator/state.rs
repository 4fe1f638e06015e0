//! # Per-Tenant Routing State
//!
//! The serialization domain for everything routing mutates on behalf of one
//! tenant: the ticket table and the waiting queue. A [`TenantState`] is only
//! ever reached through its `tokio::sync::Mutex`, so every ticket mutation,
//! queue move, and version bump for a tenant happens in a single-writer
//! critical section — which is what makes dequeue-plus-assign atomic and
//! `assignment_version` strictly monotonic.

use std::collections::HashMap;

use crate::agent::{ConversationId, TenantId};
use crate::conversation::ConversationTicket;
use crate::error::{ChatEngineError, Result};
use crate::queue::{ConversationQueue, QueueEntry};

/// Ticket table and waiting queue of one tenant
#[derive(Debug)]
pub struct TenantState {
    /// Owning tenant
    pub tenant_id: TenantId,

    /// Every live (non-discarded) ticket of this tenant
    pub tickets: HashMap<ConversationId, ConversationTicket>,

    /// Ordered backlog of Waiting tickets
    pub queue: ConversationQueue,
}

impl TenantState {
    /// Create empty state for a tenant
    pub fn new(tenant_id: TenantId, max_queue_size: usize) -> Self {
        Self {
            tenant_id,
            tickets: HashMap::new(),
            queue: ConversationQueue::new(max_queue_size),
        }
    }

    /// Immutable ticket lookup
    pub fn ticket(&self, conversation: &ConversationId) -> Result<&ConversationTicket> {
        self.tickets
            .get(conversation)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown conversation {}", conversation)))
    }

    /// Mutable ticket lookup
    pub fn ticket_mut(&mut self, conversation: &ConversationId) -> Result<&mut ConversationTicket> {
        self.tickets
            .get_mut(conversation)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown conversation {}", conversation)))
    }

    /// Queue entry for a ticket, preserving its original enqueue time
    pub fn entry_for(&self, ticket: &ConversationTicket) -> QueueEntry {
        QueueEntry {
            conversation_id: ticket.conversation_id.clone(),
            priority: ticket.priority,
            enqueued_at: ticket.enqueued_at,
        }
    }

    /// Drop tickets that reached a terminal state
    ///
    /// Ended tickets are kept until the sweep discards them so that late
    /// readers get `InvalidTransition` rather than `NotFound`.
    pub fn discard_ended(&mut self) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, t| !t.state.is_terminal());
        before - self.tickets.len()
    }
}
