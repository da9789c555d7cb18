//! Message types exchanged between agents and the orchestrator
//!
//! A [`MessageDraft`] is what an agent emits; it becomes an immutable
//! [`Message`] once the orchestrator stamps it with its conversation, sequence
//! number and timestamp and appends it to the transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifiers::{AgentId, ConversationId, CorrelationId};

/// Who emitted a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Sender {
    /// A registered agent
    Agent(AgentId),
    /// The conversation orchestrator itself
    Orchestrator,
}

impl Sender {
    /// The agent id, if an agent sent the message
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Sender::Agent(id) => Some(id),
            Sender::Orchestrator => None,
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sender::Agent(id) => write!(f, "{}", id),
            Sender::Orchestrator => f.write_str(AgentId::RESERVED),
        }
    }
}

/// Who a message is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "agents")]
pub enum Recipients {
    /// Every participant of the conversation
    Broadcast,
    /// An explicit set of agents
    Agents(Vec<AgentId>),
}

impl Recipients {
    /// Address a single agent
    pub fn one(agent: AgentId) -> Self {
        Recipients::Agents(vec![agent])
    }

    /// Whether `agent` is among the recipients
    pub fn includes(&self, agent: &AgentId) -> bool {
        match self {
            Recipients::Broadcast => true,
            Recipients::Agents(agents) => agents.contains(agent),
        }
    }
}

/// The kind of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    ToolCall,
    ToolResult,
    Control,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::ToolCall => "tool_call",
            MessageKind::ToolResult => "tool_result",
            MessageKind::Control => "control",
        };
        f.write_str(name)
    }
}

/// Runtime control signals carried by `control` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal")]
pub enum ControlSignal {
    /// The recipient may take its turn
    TurnGrant { turn: u64 },
    /// The recipient (a coordinator) must pick the next speaker
    SelectSpeaker { turn: u64, candidates: Vec<AgentId> },
    /// A coordinator's answer to [`ControlSignal::SelectSpeaker`]
    SpeakerSelected { agent: AgentId },
    /// The agent's reasoning failed; the turn is over
    AgentError { agent: AgentId, reason: String },
    /// The speaker did not answer within its turn window
    DeliveryTimeout {
        agent: AgentId,
        turn: u64,
        waited_ms: u64,
    },
    /// The agent was removed from the conversation's rotation
    Unresponsive { agent: AgentId, reason: String },
    /// The agent declares the conversation finished
    Done {
        agent: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl ControlSignal {
    /// Short stable name, used in logs and the CLI transcript view
    pub fn name(&self) -> &'static str {
        match self {
            ControlSignal::TurnGrant { .. } => "turn_grant",
            ControlSignal::SelectSpeaker { .. } => "select_speaker",
            ControlSignal::SpeakerSelected { .. } => "speaker_selected",
            ControlSignal::AgentError { .. } => "agent_error",
            ControlSignal::DeliveryTimeout { .. } => "delivery_timeout",
            ControlSignal::Unresponsive { .. } => "unresponsive",
            ControlSignal::Done { .. } => "done",
        }
    }

    /// Whether the signal travels between orchestrator and one agent only
    /// and never enters the transcript
    pub fn is_point_to_point(&self) -> bool {
        matches!(
            self,
            ControlSignal::TurnGrant { .. }
                | ControlSignal::SelectSpeaker { .. }
                | ControlSignal::SpeakerSelected { .. }
        )
    }
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Payload {
    /// Plain text
    Text(String),
    /// Arbitrary JSON
    Json(serde_json::Value),
    /// A runtime control signal
    Control(ControlSignal),
}

impl Payload {
    /// The control signal, if this is a control payload
    pub fn as_control(&self) -> Option<&ControlSignal> {
        match self {
            Payload::Control(signal) => Some(signal),
            _ => None,
        }
    }

    /// Render the payload as display text
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Json(value) => value.to_string(),
            Payload::Control(signal) => match serde_json::to_string(signal) {
                Ok(json) => json,
                Err(_) => signal.name().to_string(),
            },
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

impl From<ControlSignal> for Payload {
    fn from(signal: ControlSignal) -> Self {
        Payload::Control(signal)
    }
}

/// An unsequenced message, as emitted by an agent runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender: Sender,
    pub recipients: Recipients,
    pub kind: MessageKind,
    pub correlation_id: CorrelationId,
    pub payload: Payload,
}

impl MessageDraft {
    /// Draft a message from an agent to everyone
    pub fn from_agent(
        agent: AgentId,
        kind: MessageKind,
        correlation_id: CorrelationId,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            sender: Sender::Agent(agent),
            recipients: Recipients::Broadcast,
            kind,
            correlation_id,
            payload: payload.into(),
        }
    }

    /// Draft a control message from the orchestrator
    pub fn control(recipients: Recipients, correlation_id: CorrelationId, signal: ControlSignal) -> Self {
        Self {
            sender: Sender::Orchestrator,
            recipients,
            kind: MessageKind::Control,
            correlation_id,
            payload: Payload::Control(signal),
        }
    }

    /// Address the draft to a specific set of recipients
    pub fn to(mut self, recipients: Recipients) -> Self {
        self.recipients = recipients;
        self
    }

    /// Whether this draft carries a `Done` signal
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self.payload, Payload::Control(ControlSignal::Done { .. }))
    }

    /// Stamp the draft into an immutable message
    pub fn sequence(self, conversation_id: ConversationId, sequence: u64) -> Message {
        Message {
            conversation_id,
            sequence,
            sender: self.sender,
            recipients: self.recipients,
            kind: self.kind,
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            payload: self.payload,
        }
    }
}

/// A published, immutable message
///
/// Fields are public for reading and serialization; the transcript only ever
/// hands out clones, so a published message cannot be changed in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: ConversationId,
    /// Position in the conversation transcript, starting at 1.
    ///
    /// Point-to-point control messages that never enter the transcript
    /// (turn grants, speaker selection) carry the sequence of the last
    /// transcript entry at the time they were sent.
    pub sequence: u64,
    pub sender: Sender,
    pub recipients: Recipients,
    pub kind: MessageKind,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Message {
    /// Key consumers use to discard redelivered messages
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            conversation_id: self.conversation_id.clone(),
            sequence: self.sequence,
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// The control signal, if any
    pub fn control(&self) -> Option<&ControlSignal> {
        self.payload.as_control()
    }

    /// Turn grants and speaker-selection traffic
    pub fn is_point_to_point(&self) -> bool {
        self.control().is_some_and(ControlSignal::is_point_to_point)
    }

    /// The sending agent, if an agent sent it
    pub fn sender_agent(&self) -> Option<&AgentId> {
        self.sender.agent()
    }
}

/// `(conversation, sequence, correlation)` triple identifying a delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub conversation_id: ConversationId,
    pub sequence: u64,
    pub correlation_id: CorrelationId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    #[test]
    fn point_to_point_signals() {
        assert!(ControlSignal::TurnGrant { turn: 1 }.is_point_to_point());
        assert!(
            !ControlSignal::Done {
                agent: agent("a"),
                summary: None
            }
            .is_point_to_point()
        );
        let grant = MessageDraft::control(
            Recipients::one(agent("a")),
            CorrelationId::generate(),
            ControlSignal::TurnGrant { turn: 1 },
        )
        .sequence(ConversationId::generate(), 0);
        assert!(grant.is_point_to_point());
    }

    #[test]
    fn recipients_include() {
        let a = agent("a");
        let b = agent("b");
        assert!(Recipients::Broadcast.includes(&a));
        assert!(Recipients::one(a.clone()).includes(&a));
        assert!(!Recipients::one(a).includes(&b));
    }

    #[test]
    fn draft_sequencing_preserves_fields() {
        let corr = CorrelationId::generate();
        let draft = MessageDraft::from_agent(agent("a"), MessageKind::Response, corr.clone(), "hi");
        let conv = ConversationId::generate();
        let msg = draft.sequence(conv.clone(), 7);
        assert_eq!(msg.sequence, 7);
        assert_eq!(msg.conversation_id, conv);
        assert_eq!(msg.correlation_id, corr);
        assert_eq!(msg.sender_agent(), Some(&agent("a")));
        assert_eq!(msg.payload, Payload::Text("hi".into()));
    }

    #[test]
    fn message_serializes_with_kind_and_signal_names() {
        let draft = MessageDraft::control(
            Recipients::Broadcast,
            CorrelationId::generate(),
            ControlSignal::DeliveryTimeout {
                agent: agent("a"),
                turn: 2,
                waited_ms: 50,
            },
        );
        let msg = draft.sequence(ConversationId::generate(), 1);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "control");
        assert_eq!(json["sender"]["type"], "orchestrator");
        assert_eq!(json["payload"]["value"]["signal"], "delivery_timeout");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn terminal_signal_detection() {
        let done = MessageDraft::from_agent(
            agent("a"),
            MessageKind::Control,
            CorrelationId::generate(),
            ControlSignal::Done {
                agent: agent("a"),
                summary: None,
            },
        );
        assert!(done.is_terminal_signal());
        let plain = MessageDraft::from_agent(
            agent("a"),
            MessageKind::Response,
            CorrelationId::generate(),
            "text",
        );
        assert!(!plain.is_terminal_signal());
    }
}
