//! # Routing Engine Implementation
//!
//! Decides which agent owns which conversation. Two entry points:
//!
//! - [`assign_to_agent`](RoutingEngine::assign_to_agent) — an explicit
//!   claim, typically an agent pressing *accept* on a queued conversation.
//!   When several agents race for the same ticket, exactly one wins; the
//!   others get [`RoutingConflict`](crate::ChatEngineError::RoutingConflict)
//!   so their clients can show "conversation already taken".
//! - [`auto_route`](RoutingEngine::auto_route) — drains the tenant backlog
//!   whenever capacity appears, matching each waiting conversation to the
//!   best eligible agent.
//!
//! Agent ranking for automatic routing, in order:
//!
//! 1. capability match (required skills are a hard filter when configured),
//! 2. longest idle since last assignment,
//! 3. fewest currently owned conversations,
//! 4. earliest presence join as the final tie-break.
//!
//! Every method here runs under the caller-held tenant lock, so the queue
//! pop, the ticket mutation, and the capacity claim are one atomic step —
//! a ticket can never be dequeued twice, and no failure path leaves a
//! non-terminal ticket both unowned and unqueued.

use tracing::{debug, info};

use crate::agent::{AgentId, ConversationId, TenantId};
use crate::config::RoutingConfig;
use crate::conversation::TicketState;
use crate::error::{ChatEngineError, Result};
use crate::orchestrator::state::TenantState;
use crate::presence::{AgentPresence, AvailabilityCriteria, PresenceRegistry};

/// A completed assignment, for event publication and session tracking
#[derive(Debug, Clone)]
pub struct AssignmentOutcome {
    /// Conversation that was bound
    pub conversation_id: ConversationId,

    /// New owner
    pub agent_id: AgentId,

    /// Version after the bump; clients reference this in later operations
    pub assignment_version: u64,
}

/// Assigns queued conversations to eligible agents
pub struct RoutingEngine {
    require_skill_match: bool,
}

impl RoutingEngine {
    /// Create a routing engine from configuration
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            require_skill_match: config.require_skill_match,
        }
    }

    /// Bind a Waiting conversation to a specific agent
    ///
    /// Validates, in order: the ticket exists and belongs to the agent's
    /// tenant, the caller's `expected_version` is current, the ticket is
    /// still Waiting, and the agent is Online with spare capacity. On
    /// success the ticket becomes Assigned, the version is bumped, and the
    /// queue entry disappears — all inside the caller's tenant critical
    /// section.
    ///
    /// # Errors
    ///
    /// - `NotFound` — unknown conversation or agent
    /// - `Unauthorized` — agent belongs to a different tenant
    /// - `RoutingConflict` — stale version, or the ticket is already owned
    ///   (the expected lost-race outcome; the conversation was taken)
    /// - `InvalidTransition` — ticket already Ended, or agent not Online
    /// - `CapacityExceeded` — agent at maximum load; queue order unaffected
    pub fn assign_to_agent(
        &self,
        state: &mut TenantState,
        presence: &PresenceRegistry,
        conversation_id: &ConversationId,
        agent_id: &AgentId,
        expected_version: Option<u64>,
    ) -> Result<AssignmentOutcome> {
        let agent_presence = presence
            .get_presence(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;
        if agent_presence.tenant_id != state.tenant_id {
            return Err(ChatEngineError::unauthorized(format!(
                "agent {} does not belong to tenant {}",
                agent_id, state.tenant_id
            )));
        }

        let ticket = state.ticket_mut(conversation_id)?;
        ticket.check_version(expected_version)?;

        match ticket.state {
            TicketState::Waiting => {}
            TicketState::Ended => {
                return Err(ChatEngineError::invalid_transition(format!(
                    "conversation {} has already ended",
                    conversation_id
                )));
            }
            _ => {
                // Someone else won the race between the client seeing the
                // queue and this call arriving.
                return Err(ChatEngineError::routing_conflict(format!(
                    "conversation {} was already taken",
                    conversation_id
                )));
            }
        }

        // Capacity claim before the ticket mutation: a refused claim must
        // leave the ticket Waiting and the queue untouched.
        presence.try_claim(agent_id, conversation_id)?;

        let ticket = match state.ticket_mut(conversation_id) {
            Ok(ticket) => ticket,
            Err(e) => {
                presence.release(agent_id, conversation_id);
                return Err(e);
            }
        };
        if let Err(e) = ticket.transition(TicketState::Assigned) {
            presence.release(agent_id, conversation_id);
            return Err(e);
        }
        ticket.claim(agent_id.clone());
        let assignment_version = ticket.assignment_version;

        state.queue.remove(conversation_id);

        info!(
            "🎯 Conversation {} assigned to agent {} (v{})",
            conversation_id, agent_id, assignment_version
        );
        Ok(AssignmentOutcome {
            conversation_id: conversation_id.clone(),
            agent_id: agent_id.clone(),
            assignment_version,
        })
    }

    /// Drain the tenant backlog onto eligible agents
    ///
    /// Walks waiting entries in service order and assigns each one for
    /// which a qualifying agent exists; entries with no qualifying agent
    /// stay queued without blocking later entries whose requirements a
    /// different agent can meet. Never double-assigns: each winner's
    /// capacity claim happens inside the same critical section.
    pub fn auto_route(
        &self,
        state: &mut TenantState,
        presence: &PresenceRegistry,
        tenant: &TenantId,
    ) -> Vec<AssignmentOutcome> {
        let mut outcomes = Vec::new();

        loop {
            // Re-snapshot each round: every assignment changes capacity.
            let waiting: Vec<ConversationId> = state
                .queue
                .iter()
                .map(|e| e.conversation_id.clone())
                .collect();

            let mut assigned_any = false;
            for conversation_id in waiting {
                let Ok(ticket) = state.ticket(&conversation_id) else {
                    continue;
                };
                let required = if self.require_skill_match {
                    ticket.required_skills.clone()
                } else {
                    Vec::new()
                };

                let candidates = presence.list_available(
                    tenant,
                    &AvailabilityCriteria {
                        required_skills: required,
                    },
                );
                let Some(best) = Self::pick_best(candidates) else {
                    debug!(
                        "🔍 No qualifying agent for conversation {} yet",
                        conversation_id
                    );
                    continue;
                };

                match self.assign_to_agent(state, presence, &conversation_id, &best, None) {
                    Ok(outcome) => {
                        outcomes.push(outcome);
                        assigned_any = true;
                    }
                    Err(e) => {
                        // Lost to a concurrent presence change; leave the
                        // entry queued and move on.
                        debug!(
                            "🔍 Auto-route skipped conversation {}: {}",
                            conversation_id, e
                        );
                    }
                }
            }

            if !assigned_any {
                break;
            }
        }

        outcomes
    }

    /// Best agent among `candidates` per the ranking rules
    fn pick_best(mut candidates: Vec<AgentPresence>) -> Option<AgentId> {
        candidates.sort_by(|a, b| {
            a.last_assigned_at
                .cmp(&b.last_assigned_at)
                .then_with(|| a.owned_conversations.len().cmp(&b.owned_conversations.len()))
                .then_with(|| a.joined_at.cmp(&b.joined_at))
        });
        candidates.into_iter().next().map(|p| p.agent_id)
    }
}
