//! Termination predicate
//!
//! Evaluated after every transcript append and after every turn. The first
//! condition to hold wins; an explicit `Done` is always honored.

use std::time::Duration;

use parley_core::{ControlSignal, Message, TerminationConfig, TerminationReason};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TerminationPredicate {
    config: TerminationConfig,
    deadline: Option<Instant>,
}

impl TerminationPredicate {
    /// Start the clock for `config`'s deadline
    pub fn start(config: TerminationConfig) -> Self {
        let deadline = config.deadline.map(|budget| Instant::now() + budget);
        Self { config, deadline }
    }

    pub fn config(&self) -> &TerminationConfig {
        &self.config
    }

    /// Check after `message` became the transcript's `len`-th entry
    pub fn after_append(&self, message: &Message, len: u64) -> Option<TerminationReason> {
        if let Some(ControlSignal::Done { agent, summary }) = message.control() {
            // Only the agent itself may declare it is done.
            if message.sender_agent() == Some(agent) {
                return Some(TerminationReason::Done {
                    agent: agent.clone(),
                    summary: summary.clone(),
                });
            }
        }
        if self.config.max_messages.is_some_and(|max| len >= max) {
            return Some(TerminationReason::MaxMessages);
        }
        self.check_deadline()
    }

    /// Check after `turns` turns completed
    pub fn after_turn(&self, turns: u64) -> Option<TerminationReason> {
        if self.config.max_turns.is_some_and(|max| turns >= max) {
            return Some(TerminationReason::MaxTurns);
        }
        self.check_deadline()
    }

    pub fn check_deadline(&self) -> Option<TerminationReason> {
        self.deadline
            .filter(|deadline| Instant::now() >= *deadline)
            .map(|_| TerminationReason::Deadline)
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `wait` shortened so it never runs past the deadline
    pub fn bound(&self, wait: Duration) -> Duration {
        self.remaining().map_or(wait, |left| left.min(wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{
        AgentId, ConversationId, CorrelationId, MessageDraft, MessageKind, Recipients,
    };

    fn agent(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    fn text(from: &str) -> Message {
        MessageDraft::from_agent(agent(from), MessageKind::Response, CorrelationId::generate(), "hi")
            .sequence(ConversationId::generate(), 1)
    }

    fn done(from: &str, claimed: &str) -> Message {
        MessageDraft::from_agent(
            agent(from),
            MessageKind::Control,
            CorrelationId::generate(),
            ControlSignal::Done {
                agent: agent(claimed),
                summary: Some("finished".into()),
            },
        )
        .sequence(ConversationId::generate(), 1)
    }

    #[test]
    fn test_done_is_always_honored() {
        let predicate = TerminationPredicate::start(TerminationConfig::default());
        assert_eq!(
            predicate.after_append(&done("a", "a"), 1),
            Some(TerminationReason::Done {
                agent: agent("a"),
                summary: Some("finished".into())
            })
        );
        // an agent cannot end the conversation on another's behalf
        assert_eq!(predicate.after_append(&done("a", "b"), 1), None);
        // nor can an orchestrator-sent echo
        let echoed = MessageDraft::control(
            Recipients::Broadcast,
            CorrelationId::generate(),
            ControlSignal::Done {
                agent: agent("a"),
                summary: None,
            },
        )
        .sequence(ConversationId::generate(), 1);
        assert_eq!(predicate.after_append(&echoed, 1), None);
    }

    #[test]
    fn test_limits() {
        let predicate = TerminationPredicate::start(TerminationConfig {
            max_turns: Some(3),
            max_messages: Some(2),
            deadline: None,
        });
        assert_eq!(predicate.after_append(&text("a"), 1), None);
        assert_eq!(
            predicate.after_append(&text("a"), 2),
            Some(TerminationReason::MaxMessages)
        );
        assert_eq!(predicate.after_turn(2), None);
        assert_eq!(predicate.after_turn(3), Some(TerminationReason::MaxTurns));
        assert_eq!(predicate.remaining(), None);
        assert_eq!(predicate.bound(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_deadline() {
        let predicate = TerminationPredicate::start(TerminationConfig {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        });
        assert_eq!(predicate.check_deadline(), Some(TerminationReason::Deadline));
        assert_eq!(predicate.after_turn(0), Some(TerminationReason::Deadline));
        assert_eq!(predicate.bound(Duration::from_secs(5)), Duration::ZERO);
    }
}
