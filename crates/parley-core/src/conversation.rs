//! Conversation configuration, lifecycle and the archived record.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, OrchestrationFault};
use crate::identifiers::{AgentId, ConversationId, CorrelationId};
use crate::message::MessageDraft;

/// Lifecycle of a conversation. Archived conversations are kept, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Created,
    Active,
    Terminating,
    Archived,
}

impl ConversationState {
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Terminating)
                | (Active, Terminating)
                | (Terminating, Archived)
        )
    }

    pub fn is_archived(self) -> bool {
        self == ConversationState::Archived
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Created => "created",
            ConversationState::Active => "active",
            ConversationState::Terminating => "terminating",
            ConversationState::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// How the next speaker is chosen
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum TurnPolicy {
    /// Participants speak in their listed order, cyclically
    #[default]
    RoundRobin,
    /// Highest priority first within each round
    Priority,
    /// A coordinator agent picks each speaker
    Dynamic { coordinator: AgentId },
}

/// Limits that end a conversation. `None` disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default)]
    pub max_turns: Option<u64>,
    /// Maximum transcript length
    #[serde(default)]
    pub max_messages: Option<u64>,
    /// Wall-clock budget measured from activation
    #[serde(default)]
    pub deadline: Option<Duration>,
}

/// Why a conversation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum TerminationReason {
    /// A participant declared the conversation finished
    Done {
        agent: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    MaxMessages,
    MaxTurns,
    Deadline,
    /// Terminated through the administrative surface
    External,
    /// No eligible speaker was left
    Deadlock,
    /// The conversation task hit a fatal error
    Aborted { error: String },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Done { agent, .. } => write!(f, "done ({})", agent),
            TerminationReason::MaxMessages => f.write_str("max_messages"),
            TerminationReason::MaxTurns => f.write_str("max_turns"),
            TerminationReason::Deadline => f.write_str("deadline"),
            TerminationReason::External => f.write_str("external"),
            TerminationReason::Deadlock => f.write_str("deadlock"),
            TerminationReason::Aborted { error } => write!(f, "aborted: {}", error),
        }
    }
}

/// Configuration a conversation is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSpec {
    /// Participants in turn order
    pub participants: Vec<AgentId>,
    #[serde(default)]
    pub policy: TurnPolicy,
    #[serde(default)]
    pub termination: TerminationConfig,
}

impl ConversationSpec {
    pub fn new(participants: Vec<AgentId>) -> Self {
        Self {
            participants,
            policy: TurnPolicy::RoundRobin,
            termination: TerminationConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: TurnPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u64) -> Self {
        self.termination.max_turns = Some(max_turns);
        self
    }

    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.termination.max_messages = Some(max_messages);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.termination.deadline = Some(deadline);
        self
    }

    /// Reject empty or duplicated participant lists and zero limits
    pub fn validate(&self) -> CoreResult<()> {
        if self.participants.is_empty() {
            return Err(CoreError::InvalidConversation(
                "a conversation needs at least one participant".into(),
            ));
        }
        let mut seen = HashSet::new();
        for p in &self.participants {
            if !seen.insert(p) {
                return Err(CoreError::InvalidConversation(format!(
                    "participant '{}' listed twice",
                    p
                )));
            }
        }
        if self.termination.max_turns == Some(0) || self.termination.max_messages == Some(0) {
            return Err(CoreError::InvalidConversation(
                "termination limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Why a submission was kept out of the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    /// The correlation does not match the outstanding turn
    StaleCorrelation,
    /// The conversation had already terminated
    AfterTermination,
}

/// A submission that was received but not appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub agent: AgentId,
    pub correlation_id: CorrelationId,
    pub reason: AuditReason,
    pub drafts: Vec<MessageDraft>,
}

/// Persistent state of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub spec: ConversationSpec,
    pub state: ConversationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminationReason>,
    /// Completed turns
    pub turns: u64,
    /// Transcript length
    pub messages: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// Participants removed from the rotation
    #[serde(default)]
    pub removed: Vec<AgentId>,
    #[serde(default)]
    pub faults: Vec<OrchestrationFault>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

impl ConversationRecord {
    pub fn new(id: ConversationId, spec: ConversationSpec) -> Self {
        Self {
            id,
            spec,
            state: ConversationState::Created,
            reason: None,
            turns: 0,
            messages: 0,
            created_at: Utc::now(),
            started_at: None,
            archived_at: None,
            removed: Vec::new(),
            faults: Vec::new(),
            audit: Vec::new(),
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: ConversationState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            ConversationState::Active => self.started_at = Some(now),
            ConversationState::Archived => self.archived_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Enter `Terminating` with `reason`. The first reason recorded wins.
    pub fn terminate(&mut self, reason: TerminationReason) -> CoreResult<()> {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        self.transition(ConversationState::Terminating)
    }

    /// Terminate and archive in one go, for conversations that never ran
    pub fn archive(&mut self, reason: TerminationReason) -> CoreResult<()> {
        if self.state != ConversationState::Terminating {
            self.terminate(reason)?;
        }
        self.transition(ConversationState::Archived)
    }
}
