//! Envelopes exchanged over the bus besides transcript messages

use serde::{Deserialize, Serialize};

use parley_core::{AgentId, ConversationId, CorrelationId, MessageDraft};

/// What an agent hands back to the orchestrator at the end of its turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub conversation_id: ConversationId,
    pub agent: AgentId,
    /// Correlation of the turn grant (or selection request) being answered
    pub correlation_id: CorrelationId,
    /// Drafts in emission order; the last one is the turn's message
    pub drafts: Vec<MessageDraft>,
}

impl Submission {
    pub fn new(
        conversation_id: ConversationId,
        agent: AgentId,
        correlation_id: CorrelationId,
        drafts: Vec<MessageDraft>,
    ) -> Self {
        Self {
            conversation_id,
            agent,
            correlation_id,
            drafts,
        }
    }
}

/// Why a delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailureReason {
    /// The inbox stayed full past the dispatch timeout
    Timeout,
    /// The agent dropped its inbox
    Closed,
    /// The agent has no inbox
    NotRegistered,
}

/// One recipient a publish could not reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub agent: AgentId,
    pub reason: DeliveryFailureReason,
}

/// Result of publishing one transcript message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub sequence: u64,
    pub delivered: Vec<AgentId>,
    pub failed: Vec<DeliveryFailure>,
}

impl PublishReport {
    /// Recipients whose inbox stayed full for the whole dispatch timeout
    pub fn timed_out(&self) -> impl Iterator<Item = &AgentId> {
        self.failed
            .iter()
            .filter(|f| f.reason == DeliveryFailureReason::Timeout)
            .map(|f| &f.agent)
    }
}
