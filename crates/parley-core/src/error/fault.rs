//! Faults raised while running a conversation.
//!
//! None of these abort a conversation on their own. They are recorded on the
//! conversation record and, where the transcript should show them, turned into
//! `control` messages.

use serde::{Deserialize, Serialize};

use super::tool::ToolError;
use crate::identifiers::{AgentId, ConversationId, ToolName};
use crate::message::ControlSignal;

/// Taxonomy of recoverable orchestration faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "fault")]
pub enum OrchestrationFault {
    /// The agent's reasoning failed during its turn.
    #[error("agent '{agent}' failed: {reason}")]
    AgentFault { agent: AgentId, reason: String },

    /// A tool call failed for good after the gateway's retries.
    #[error("tool '{tool}' failed for agent '{agent}': {error}")]
    ToolFailure {
        agent: AgentId,
        tool: ToolName,
        error: ToolError,
    },

    /// The speaker did not submit within its turn window; the turn was skipped.
    #[error("agent '{agent}' missed turn {turn} after {waited_ms}ms")]
    DeliveryTimeout {
        agent: AgentId,
        turn: u64,
        waited_ms: u64,
    },

    /// The agent was removed from the conversation's rotation.
    #[error("agent '{agent}' is unresponsive: {reason}")]
    UnresponsiveAgent { agent: AgentId, reason: String },

    /// No eligible speaker is left.
    #[error("conversation '{conversation}' has no eligible speaker")]
    OrchestratorDeadlock { conversation: ConversationId },
}

impl OrchestrationFault {
    /// The agent the fault is attributed to, if any
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            OrchestrationFault::AgentFault { agent, .. }
            | OrchestrationFault::ToolFailure { agent, .. }
            | OrchestrationFault::DeliveryTimeout { agent, .. }
            | OrchestrationFault::UnresponsiveAgent { agent, .. } => Some(agent),
            OrchestrationFault::OrchestratorDeadlock { .. } => None,
        }
    }

    /// Whether the fault ends the conversation
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationFault::OrchestratorDeadlock { .. })
    }

    /// Control signal recorded in the transcript for this fault, if any
    pub fn control_signal(&self) -> Option<ControlSignal> {
        match self {
            OrchestrationFault::DeliveryTimeout {
                agent,
                turn,
                waited_ms,
            } => Some(ControlSignal::DeliveryTimeout {
                agent: agent.clone(),
                turn: *turn,
                waited_ms: *waited_ms,
            }),
            OrchestrationFault::UnresponsiveAgent { agent, reason } => {
                Some(ControlSignal::Unresponsive {
                    agent: agent.clone(),
                    reason: reason.clone(),
                })
            }
            _ => None,
        }
    }
}
