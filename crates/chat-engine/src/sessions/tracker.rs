//! # Session Tracker Implementation
//!
//! Records the bounded interval an agent spends actively handling one
//! conversation. Sessions open on join, accumulate a message count, and on
//! leave emit a [`SessionFact`] (duration, message count, leave reason) to
//! the analytics sink before being dropped from live memory.
//!
//! Live sessions are held in a shared concurrent map rather than
//! per-connection process dictionaries, so any real-time server in a
//! horizontally scaled deployment can close a session another one opened.
//! A leave that arrives with no matching start (typically after a process
//! restart) is answered with a defensive zero-duration fact flagged
//! `recovered` instead of failing the leave operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::agent::{AgentId, ConversationId, SessionId};
use crate::error::{ChatEngineError, Result};
use crate::integration::AnalyticsSink;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Conversation was closed normally
    Closed,

    /// Ownership moved to another agent
    Transferred,

    /// Ownership moved to another tier or the escalation queue
    Escalated,

    /// Agent's presence was lost (explicit leave or heartbeat lapse)
    Disconnected,

    /// Conversation was abandoned before or during handling
    Abandoned,
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaveReason::Closed => "closed",
            LeaveReason::Transferred => "transferred",
            LeaveReason::Escalated => "escalated",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// One live handling interval
#[derive(Debug, Clone)]
pub struct AgentSession {
    /// Session identity
    pub session_id: SessionId,

    /// Handling agent
    pub agent_id: AgentId,

    /// Conversation being handled
    pub conversation_id: ConversationId,

    /// When the agent joined
    pub joined_at: DateTime<Utc>,

    /// When the agent left; `None` while live
    pub left_at: Option<DateTime<Utc>>,

    /// Messages the agent sent during this session
    pub message_count: u64,

    /// Whether this session was opened by a transfer or escalation
    pub is_transfer: bool,
}

/// Summarized fact emitted to analytics when a session closes
#[derive(Debug, Clone)]
pub struct SessionFact {
    /// Session identity
    pub session_id: SessionId,

    /// Handling agent; `None` only on recovered facts
    pub agent_id: Option<AgentId>,

    /// Conversation handled; `None` only on recovered facts
    pub conversation_id: Option<ConversationId>,

    /// Handling duration
    pub duration: chrono::Duration,

    /// Messages sent during the session
    pub message_count: u64,

    /// Why the session ended
    pub reason: LeaveReason,

    /// True when no matching start was found and a defensive default was
    /// recorded instead
    pub recovered: bool,
}

/// Tracker of live agent sessions
pub struct SessionTracker {
    sessions: DashMap<SessionId, AgentSession>,

    /// conversation -> live session reverse index
    by_conversation: DashMap<ConversationId, SessionId>,

    sink: Arc<dyn AnalyticsSink>,
}

impl SessionTracker {
    /// Create a tracker forwarding facts to `sink`
    pub fn new(sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_conversation: DashMap::new(),
            sink,
        }
    }

    /// Open a session for an agent joining a conversation
    pub fn start_session(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
        is_transfer: bool,
    ) -> SessionId {
        let session_id = SessionId::generate();
        let session = AgentSession {
            session_id: session_id.clone(),
            agent_id,
            conversation_id: conversation_id.clone(),
            joined_at: Utc::now(),
            left_at: None,
            message_count: 0,
            is_transfer,
        };
        debug!(
            "▶️ Session {} started (agent {} on conversation {})",
            session_id, session.agent_id, conversation_id
        );
        self.sessions.insert(session_id.clone(), session);
        self.by_conversation.insert(conversation_id, session_id.clone());
        session_id
    }

    /// Count one agent message on a live session
    pub fn record_message(&self, session_id: &SessionId) -> Result<u64> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown session {}", session_id)))?;
        session.message_count += 1;
        Ok(session.message_count)
    }

    /// Live session currently handling `conversation`, if any
    pub fn session_for_conversation(&self, conversation: &ConversationId) -> Option<SessionId> {
        self.by_conversation.get(conversation).map(|s| s.clone())
    }

    /// Snapshot of a live session
    pub fn get_session(&self, session_id: &SessionId) -> Option<AgentSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Close a session and forward its fact to analytics
    ///
    /// Never fails on a missing session: a defensive zero-duration fact
    /// flagged `recovered` is emitted instead, so a leave after a process
    /// restart still completes.
    pub async fn end_session(&self, session_id: &SessionId, reason: LeaveReason) -> SessionFact {
        let fact = match self.sessions.remove(session_id) {
            Some((_, mut session)) => {
                let now = Utc::now();
                session.left_at = Some(now);
                // A successor session may already be live on this
                // conversation; only clear the index if it is still ours.
                self.by_conversation
                    .remove_if(&session.conversation_id, |_, live| live == session_id);
                info!(
                    "⏹️ Session {} ended ({}, {} messages)",
                    session_id, reason, session.message_count
                );
                SessionFact {
                    session_id: session_id.clone(),
                    agent_id: Some(session.agent_id),
                    conversation_id: Some(session.conversation_id),
                    duration: now.signed_duration_since(session.joined_at),
                    message_count: session.message_count,
                    reason,
                    recovered: false,
                }
            }
            None => {
                warn!(
                    "⏹️ Session {} ended with no matching start, recording defensive default",
                    session_id
                );
                SessionFact {
                    session_id: session_id.clone(),
                    agent_id: None,
                    conversation_id: None,
                    duration: chrono::Duration::zero(),
                    message_count: 0,
                    reason,
                    recovered: true,
                }
            }
        };

        // Fire-and-forget: analytics failures never fail the leave.
        if let Err(e) = self.sink.publish(fact.clone()).await {
            warn!("📊 Analytics publish failed for session {}: {}", session_id, e);
        }
        fact
    }

    /// Close the live session on `conversation`, if one exists
    pub async fn end_session_for_conversation(
        &self,
        conversation: &ConversationId,
        reason: LeaveReason,
    ) -> Option<SessionFact> {
        let session_id = self.by_conversation.get(conversation).map(|s| s.clone())?;
        Some(self.end_session(&session_id, reason).await)
    }

    /// Number of live sessions
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}
