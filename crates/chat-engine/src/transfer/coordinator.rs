//! # Transfer Coordinator Implementation
//!
//! Ownership moves are the most delicate operations in the engine: the
//! current owner releases the ticket and *something* must pick it up in the
//! same breath. Every path through this module pairs the release with
//! either a new owner or a front-of-queue re-insertion inside one tenant
//! critical section, so an external observer never witnesses a window where
//! a live ticket has no owner and no queue position.
//!
//! Transfers whose target turns out to be unreachable mid-operation fall
//! back to the queue rather than failing closed; escalations without a
//! direct target requeue at [`Escalated`](crate::conversation::PriorityClass::Escalated)
//! priority, which serves ahead of everything else.

use tracing::{info, warn};

use crate::agent::{AgentId, ConversationId};
use crate::conversation::{PriorityClass, TicketState};
use crate::error::{ChatEngineError, Result};
use crate::orchestrator::state::TenantState;
use crate::presence::PresenceRegistry;

/// How an ownership move concluded
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    /// The ticket landed on a new owner
    Completed {
        /// New owner
        to_agent: AgentId,
        /// Version after the move
        assignment_version: u64,
    },

    /// The ticket fell back to the queue (front of its priority class)
    Requeued {
        /// Priority it was requeued at
        priority: PriorityClass,
        /// 0-based queue position it landed at
        position: usize,
        /// Version after the release
        assignment_version: u64,
    },
}

/// Moves ownership between agents and tiers
pub struct TransferCoordinator;

impl TransferCoordinator {
    /// Create a coordinator
    pub fn new() -> Self {
        Self
    }

    /// Transfer a conversation from its current owner to another agent
    ///
    /// `from_agent` must be the current owner at `expected_version`. The
    /// target is validated up front (`NotFound` / `Unauthorized` /
    /// `CapacityExceeded` without mutating anything); if the target then
    /// becomes unreachable inside the operation — the race the up-front
    /// check cannot close, because presence changes outside the tenant
    /// lock — the ticket is requeued at the front instead of being lost.
    pub fn transfer(
        &self,
        state: &mut TenantState,
        presence: &PresenceRegistry,
        conversation_id: &ConversationId,
        from_agent: &AgentId,
        to_agent: &AgentId,
        expected_version: Option<u64>,
        reason: &str,
    ) -> Result<TransferOutcome> {
        if from_agent == to_agent {
            return Err(ChatEngineError::invalid_transition(
                "cannot transfer a conversation to its current owner".to_string(),
            ));
        }

        // Cheap target validation before any mutation: an obviously
        // ineligible target is the caller's problem, not a requeue.
        let target = presence
            .get_presence(to_agent)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", to_agent)))?;
        if target.tenant_id != state.tenant_id {
            return Err(ChatEngineError::unauthorized(format!(
                "agent {} does not belong to tenant {}",
                to_agent, state.tenant_id
            )));
        }
        if !target.has_capacity() {
            return Err(ChatEngineError::capacity(format!(
                "agent {} is at maximum load",
                to_agent
            )));
        }

        let ticket = state.ticket_mut(conversation_id)?;
        Self::check_ownership(ticket.assigned_agent.as_ref(), from_agent, conversation_id)?;
        ticket.check_version(expected_version)?;
        ticket.transition(TicketState::Transferring)?;

        match presence.try_claim(to_agent, conversation_id) {
            Ok(()) => {
                presence.release(from_agent, conversation_id);
                let ticket = state.ticket_mut(conversation_id)?;
                ticket.transition(TicketState::Assigned)?;
                ticket.claim(to_agent.clone());
                let assignment_version = ticket.assignment_version;
                info!(
                    "🔁 Conversation {} transferred {} -> {} (v{}, reason: {})",
                    conversation_id, from_agent, to_agent, assignment_version, reason
                );
                Ok(TransferOutcome::Completed {
                    to_agent: to_agent.clone(),
                    assignment_version,
                })
            }
            Err(claim_err) => {
                // Target became unreachable mid-operation. The ticket must
                // not be left ownerless: release and requeue in this same
                // critical section.
                warn!(
                    "🔁 Transfer target {} unreachable for conversation {} ({}), requeueing",
                    to_agent, conversation_id, claim_err
                );
                presence.release(from_agent, conversation_id);
                let ticket = state.ticket_mut(conversation_id)?;
                let priority = ticket.priority;
                ticket.release_to_queue(priority);
                let assignment_version = ticket.assignment_version;
                let entry = state.entry_for(state.ticket(conversation_id)?);
                let position = state.queue.requeue_front(entry);
                Ok(TransferOutcome::Requeued {
                    priority,
                    position,
                    assignment_version,
                })
            }
        }
    }

    /// Escalate a conversation to another tier
    ///
    /// With a reachable direct `target` the ticket moves straight to them;
    /// otherwise it is requeued at `Escalated` priority, jumping the whole
    /// backlog. Requeueing is the *normal* no-target path, not a failure.
    pub fn escalate(
        &self,
        state: &mut TenantState,
        presence: &PresenceRegistry,
        conversation_id: &ConversationId,
        from_agent: &AgentId,
        target: Option<&AgentId>,
        expected_version: Option<u64>,
        reason: &str,
    ) -> Result<TransferOutcome> {
        if let Some(target_id) = target {
            if target_id == from_agent {
                return Err(ChatEngineError::invalid_transition(
                    "cannot escalate a conversation to its current owner".to_string(),
                ));
            }
            if let Some(target_presence) = presence.get_presence(target_id) {
                if target_presence.tenant_id != state.tenant_id {
                    return Err(ChatEngineError::unauthorized(format!(
                        "agent {} does not belong to tenant {}",
                        target_id, state.tenant_id
                    )));
                }
            }
        }

        let ticket = state.ticket_mut(conversation_id)?;
        Self::check_ownership(ticket.assigned_agent.as_ref(), from_agent, conversation_id)?;
        ticket.check_version(expected_version)?;
        ticket.transition(TicketState::Escalated)?;

        let direct_claim = target.and_then(|target_id| {
            presence
                .try_claim(target_id, conversation_id)
                .ok()
                .map(|_| target_id.clone())
        });

        presence.release(from_agent, conversation_id);

        match direct_claim {
            Some(target_id) => {
                let ticket = state.ticket_mut(conversation_id)?;
                ticket.transition(TicketState::Assigned)?;
                ticket.claim(target_id.clone());
                let assignment_version = ticket.assignment_version;
                info!(
                    "⬆️ Conversation {} escalated {} -> {} (v{}, reason: {})",
                    conversation_id, from_agent, target_id, assignment_version, reason
                );
                Ok(TransferOutcome::Completed {
                    to_agent: target_id,
                    assignment_version,
                })
            }
            None => {
                let ticket = state.ticket_mut(conversation_id)?;
                ticket.release_to_queue(PriorityClass::Escalated);
                let assignment_version = ticket.assignment_version;
                let entry = state.entry_for(state.ticket(conversation_id)?);
                let position = state.queue.requeue_front(entry);
                info!(
                    "⬆️ Conversation {} escalated by {} into the queue at position {} (reason: {})",
                    conversation_id, from_agent, position, reason
                );
                Ok(TransferOutcome::Requeued {
                    priority: PriorityClass::Escalated,
                    position,
                    assignment_version,
                })
            }
        }
    }

    fn check_ownership(
        current: Option<&AgentId>,
        claimed: &AgentId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        match current {
            Some(owner) if owner == claimed => Ok(()),
            _ => Err(ChatEngineError::routing_conflict(format!(
                "agent {} is not the current owner of conversation {}",
                claimed, conversation_id
            ))),
        }
    }
}

impl Default for TransferCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
