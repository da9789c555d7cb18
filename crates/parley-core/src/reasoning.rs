//! Capability interfaces implemented by the language-model side.
//!
//! The runtime never looks inside a decision's content. It only needs to know
//! whether the agent wants to speak, call a tool or end the conversation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::{AgentId, ConversationId, IdempotencyKey, ToolName};
use crate::memory::MemorySnapshot;
use crate::message::{Message, MessageKind, Payload, Recipients};
use crate::tool::ToolCall;

/// Everything a reasoner sees when asked for a decision
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub agent: AgentId,
    pub conversation: ConversationId,
    pub turn: u64,
    /// Reasoning round within the current step, starting at 0
    pub round: u32,
    /// Recent transcript messages the agent has perceived, oldest first
    pub transcript: Vec<Message>,
    pub memory: MemorySnapshot,
    /// Tool calls resolved earlier in this step
    pub tool_results: Vec<ToolCall>,
}

impl ReasoningContext {
    /// The most recent perceived message
    pub fn last_message(&self) -> Option<&Message> {
        self.transcript.last()
    }

    /// The latest tool result of this step
    pub fn last_tool_result(&self) -> Option<&ToolCall> {
        self.tool_results.last()
    }
}

/// What an agent decided to do with its turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// Emit a message and end the turn
    Respond {
        payload: Payload,
        recipients: Recipients,
        kind: MessageKind,
    },
    /// Call a tool, then reason again with its result
    CallTool {
        tool: ToolName,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<IdempotencyKey>,
    },
    /// Declare the conversation finished
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl Decision {
    /// Broadcast a response
    pub fn respond(payload: impl Into<Payload>) -> Self {
        Decision::Respond {
            payload: payload.into(),
            recipients: Recipients::Broadcast,
            kind: MessageKind::Response,
        }
    }

    pub fn call_tool(tool: ToolName, arguments: Value) -> Self {
        Decision::CallTool {
            tool,
            arguments,
            idempotency_key: None,
        }
    }

    pub fn terminate(summary: impl Into<String>) -> Self {
        Decision::Terminate {
            summary: Some(summary.into()),
        }
    }
}

/// Errors from the reasoning capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReasoningError {
    /// The inference backend failed
    #[error("reasoning backend failed: {0}")]
    Backend(String),

    /// The backend answered with something the runtime cannot act on
    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    /// The capability is not available for this agent
    #[error("reasoning unavailable: {0}")]
    Unavailable(String),
}

/// Opaque inference capability: `infer(context) -> decision`
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn infer(&self, context: &ReasoningContext) -> Result<Decision, ReasoningError>;
}

/// Implemented by coordinator agents to drive dynamic turn policies
#[async_trait]
pub trait SpeakerSelector: Send + Sync {
    /// Pick the next speaker among `candidates`
    async fn select_next(
        &self,
        conversation: &ConversationId,
        candidates: &[AgentId],
        transcript: &[Message],
    ) -> Result<AgentId, ReasoningError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_helpers() {
        assert_eq!(
            Decision::respond("hi"),
            Decision::Respond {
                payload: Payload::Text("hi".into()),
                recipients: Recipients::Broadcast,
                kind: MessageKind::Response,
            }
        );
        match Decision::call_tool(ToolName::parse("calc").unwrap(), json!({"x": 1})) {
            Decision::CallTool {
                idempotency_key, ..
            } => assert!(idempotency_key.is_none()),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn decision_deserializes_from_tagged_json() {
        let decision: Decision = serde_json::from_value(json!({
            "decision": "call_tool",
            "tool": "search",
            "arguments": {"q": "rust"},
            "idempotency_key": "k1"
        }))
        .unwrap();
        assert!(matches!(decision, Decision::CallTool { idempotency_key: Some(_), .. }));
    }
}
