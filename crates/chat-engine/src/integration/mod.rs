//! # External Collaborator Contracts
//!
//! The engine treats durable conversation storage and the analytics
//! pipeline as external collaborators behind async traits. Production
//! deployments implement these against their own storage and event bus;
//! the in-memory implementations here back the tests and the recovery
//! path exercised in them.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, ConversationId, TenantId};
use crate::error::Result;
use crate::sessions::SessionFact;

/// Durable record of a conversation, as the store sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConversation {
    /// Conversation identity
    pub conversation_id: ConversationId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Opaque customer reference for display purposes
    pub customer_ref: Option<String>,

    /// Owner recorded by the last completed routing decision
    pub current_owner: Option<AgentId>,

    /// Version recorded with the owner
    pub owner_version: u64,

    /// Whether the conversation reached a terminal state
    pub ended: bool,
}

/// Durable conversation storage contract
///
/// The engine only reads conversations at recovery time and writes the
/// owner after each completed routing decision. Write failures are logged
/// by the caller and never roll back a completed decision.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch one conversation record
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<StoredConversation>>;

    /// Record the current owner (or `None` for a requeued conversation)
    async fn set_owner(
        &self,
        id: &ConversationId,
        owner: Option<&AgentId>,
        version: u64,
    ) -> Result<()>;

    /// Every conversation not yet in a terminal state
    ///
    /// Recovery scans this after a process restart to rebuild live
    /// routing state.
    async fn list_open_conversations(&self) -> Result<Vec<StoredConversation>>;
}

/// Analytics pipeline contract for closed-session facts
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Deliver one session fact; fire-and-forget at the engine boundary
    async fn publish(&self, fact: SessionFact) -> Result<()>;
}

/// In-memory conversation store
///
/// Used by tests and by deployments that keep durable storage entirely
/// outside the engine process.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<ConversationId, StoredConversation>,
}

impl InMemoryConversationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation record (test setup, recovery scenarios)
    pub fn insert(&self, conversation: StoredConversation) {
        self.conversations
            .insert(conversation.conversation_id.clone(), conversation);
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<StoredConversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn set_owner(
        &self,
        id: &ConversationId,
        owner: Option<&AgentId>,
        version: u64,
    ) -> Result<()> {
        if let Some(mut conversation) = self.conversations.get_mut(id) {
            conversation.current_owner = owner.cloned();
            conversation.owner_version = version;
        }
        Ok(())
    }

    async fn list_open_conversations(&self) -> Result<Vec<StoredConversation>> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| !c.ended)
            .map(|c| c.clone())
            .collect())
    }
}

/// Analytics sink that retains every fact in memory
///
/// Test helper: assertions read the collected facts back.
#[derive(Default)]
pub struct InMemoryAnalyticsSink {
    facts: Mutex<Vec<SessionFact>>,
}

impl InMemoryAnalyticsSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Facts received so far
    pub fn facts(&self) -> Vec<SessionFact> {
        self.facts.lock().clone()
    }
}

#[async_trait]
impl AnalyticsSink for InMemoryAnalyticsSink {
    async fn publish(&self, fact: SessionFact) -> Result<()> {
        self.facts.lock().push(fact);
        Ok(())
    }
}

/// Analytics sink that logs facts via `tracing`
///
/// Default wiring when no real pipeline is attached.
#[derive(Default)]
pub struct TracingAnalyticsSink;

#[async_trait]
impl AnalyticsSink for TracingAnalyticsSink {
    async fn publish(&self, fact: SessionFact) -> Result<()> {
        tracing::info!(
            "📊 Session {} closed: agent={:?} conversation={:?} duration={}s messages={} reason={}",
            fact.session_id,
            fact.agent_id,
            fact.conversation_id,
            fact.duration.num_seconds(),
            fact.message_count,
            fact.reason
        );
        Ok(())
    }
}
