//! Agent identity, capabilities and lifecycle state.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::{AgentId, ConversationId};

/// Capability tag that allows an agent to pick speakers under a dynamic policy
pub const COORDINATOR_TAG: &str = "coordinator";

/// How long a registration lives
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "lifetime", content = "conversation")]
pub enum AgentLifetime {
    /// Until explicitly deregistered or the session ends
    #[default]
    Session,
    /// Until the given conversation is archived
    Conversation(ConversationId),
}

/// What the registry knows about an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    /// Higher speaks earlier under the priority policy
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub lifetime: AgentLifetime,
}

impl AgentDescriptor {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            capabilities: BTreeSet::new(),
            priority: 0,
            lifetime: AgentLifetime::Session,
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Release the agent when `conversation` is archived
    pub fn scoped_to(mut self, conversation: ConversationId) -> Self {
        self.lifetime = AgentLifetime::Conversation(conversation);
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    pub fn is_coordinator(&self) -> bool {
        self.has_capability(COORDINATOR_TAG)
    }
}

/// Phase of an agent runtime's step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Perceiving,
    Reasoning,
    AwaitingTool,
    Acting,
    Reflecting,
}

impl AgentState {
    /// Legal transitions of the perceive, reason, act, reflect loop.
    ///
    /// Any state may fall back to `Idle` when a step is abandoned.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Perceiving)
                | (Perceiving, Reasoning)
                | (Reasoning, AwaitingTool)
                | (AwaitingTool, Reasoning)
                | (Reasoning, Acting)
                | (Acting, Reflecting)
                | (Reflecting, Idle)
                | (_, Idle)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Perceiving => "perceiving",
            AgentState::Reasoning => "reasoning",
            AgentState::AwaitingTool => "awaiting_tool",
            AgentState::Acting => "acting",
            AgentState::Reflecting => "reflecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder() {
        let d = AgentDescriptor::new(AgentId::parse("lead").unwrap())
            .with_capability(COORDINATOR_TAG)
            .with_capability("planning")
            .with_priority(5);
        assert!(d.is_coordinator());
        assert!(d.has_capability("planning"));
        assert_eq!(d.priority, 5);
        assert_eq!(d.lifetime, AgentLifetime::Session);
    }

    #[test]
    fn state_machine_transitions() {
        use AgentState::*;
        assert!(Idle.can_transition_to(Perceiving));
        assert!(Reasoning.can_transition_to(AwaitingTool));
        assert!(AwaitingTool.can_transition_to(Reasoning));
        assert!(Acting.can_transition_to(Reflecting));
        assert!(Reasoning.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Acting));
        assert!(!Perceiving.can_transition_to(AwaitingTool));
        assert!(!Reflecting.can_transition_to(Reasoning));
    }
}
