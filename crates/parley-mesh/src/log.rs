//! Per-conversation message log
//!
//! The log is the single source of order for a conversation: every
//! subscriber reads from it by sequence number, so all of them observe the
//! same total order and any of them can restart from any position.

use std::pin::Pin;

use futures::{Stream, stream};
use parley_core::{AgentId, ConversationId, Message};
use tokio::sync::{RwLock, mpsc, watch};

use crate::error::{MeshError, MeshResult};
use crate::types::Submission;

/// Stream of a conversation's messages in sequence order
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send + 'static>>;

/// How far a log has grown, and whether it accepts more messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogProgress {
    pub len: u64,
    pub sealed: bool,
}

pub(crate) struct ConversationLog {
    id: ConversationId,
    messages: RwLock<Vec<Message>>,
    participants: RwLock<Vec<AgentId>>,
    progress: watch::Sender<LogProgress>,
    submissions: mpsc::Sender<Submission>,
}

impl ConversationLog {
    pub(crate) fn new(
        id: ConversationId,
        participants: Vec<AgentId>,
        submission_capacity: usize,
    ) -> (Self, mpsc::Receiver<Submission>) {
        let (submissions, rx) = mpsc::channel(submission_capacity.max(1));
        let (progress, _) = watch::channel(LogProgress::default());
        let log = Self {
            id,
            messages: RwLock::new(Vec::new()),
            participants: RwLock::new(participants),
            progress,
            submissions,
        };
        (log, rx)
    }

    /// Append a message; its sequence must be exactly one past the last
    pub(crate) async fn append(&self, message: Message) -> MeshResult<()> {
        let mut messages = self.messages.write().await;
        if self.progress.borrow().sealed {
            return Err(MeshError::ConversationSealed(self.id.clone()));
        }
        let expected = messages.len() as u64 + 1;
        if message.sequence != expected {
            return Err(MeshError::SequenceGap {
                conversation: self.id.clone(),
                expected,
                found: message.sequence,
            });
        }
        messages.push(message);
        let len = messages.len() as u64;
        self.progress.send_modify(|p| p.len = len);
        Ok(())
    }

    pub(crate) async fn get(&self, sequence: u64) -> Option<Message> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.messages.read().await.get(index).cloned()
    }

    pub(crate) async fn history(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub(crate) async fn participants(&self) -> Vec<AgentId> {
        self.participants.read().await.clone()
    }

    pub(crate) async fn remove_participant(&self, agent: &AgentId) -> bool {
        let mut participants = self.participants.write().await;
        let before = participants.len();
        participants.retain(|p| p != agent);
        participants.len() != before
    }

    pub(crate) fn seal(&self) -> bool {
        self.progress.send_if_modified(|p| {
            let changed = !p.sealed;
            p.sealed = true;
            changed
        })
    }

    pub(crate) fn current(&self) -> LogProgress {
        *self.progress.borrow()
    }

    pub(crate) fn progress(&self) -> watch::Receiver<LogProgress> {
        self.progress.subscribe()
    }

    pub(crate) fn submissions(&self) -> mpsc::Sender<Submission> {
        self.submissions.clone()
    }
}

/// Stream the log from `from_sequence` on. The stream waits for new messages
/// while the log is open and ends once it is sealed and fully read.
pub(crate) fn stream_from(log: std::sync::Arc<ConversationLog>, from_sequence: u64) -> MessageStream {
    let progress = log.progress();
    let start = from_sequence.max(1);
    Box::pin(stream::unfold(
        (log, start, progress),
        |(log, next, mut progress)| async move {
            loop {
                let current = *progress.borrow_and_update();
                if next <= current.len {
                    let message = log.get(next).await?;
                    return Some((message, (log, next + 1, progress)));
                }
                if current.sealed {
                    return None;
                }
                progress.changed().await.ok()?;
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::{CorrelationId, MessageDraft, MessageKind};
    use std::sync::Arc;

    fn message(conv: &ConversationId, seq: u64) -> Message {
        MessageDraft::from_agent(
            AgentId::parse("a").unwrap(),
            MessageKind::Response,
            CorrelationId::generate(),
            format!("m{}", seq),
        )
        .sequence(conv.clone(), seq)
    }

    #[tokio::test]
    async fn test_append_enforces_order() {
        let conv = ConversationId::generate();
        let (log, _rx) = ConversationLog::new(conv.clone(), vec![], 4);
        log.append(message(&conv, 1)).await.unwrap();
        assert!(matches!(
            log.append(message(&conv, 3)).await,
            Err(MeshError::SequenceGap { expected: 2, found: 3, .. })
        ));
        log.seal();
        assert!(matches!(
            log.append(message(&conv, 2)).await,
            Err(MeshError::ConversationSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_restarts_and_ends_when_sealed() {
        let conv = ConversationId::generate();
        let (log, _rx) = ConversationLog::new(conv.clone(), vec![], 4);
        let log = Arc::new(log);
        for seq in 1..=3 {
            log.append(message(&conv, seq)).await.unwrap();
        }

        let mut tail = stream_from(Arc::clone(&log), 2);
        assert_eq!(tail.next().await.map(|m| m.sequence), Some(2));
        assert_eq!(tail.next().await.map(|m| m.sequence), Some(3));

        let writer = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            writer.append(message(&conv, 4)).await.unwrap();
            writer.seal();
        });
        assert_eq!(tail.next().await.map(|m| m.sequence), Some(4));
        assert!(tail.next().await.is_none());
        handle.await.unwrap();

        let replay: Vec<u64> = stream_from(log, 0).map(|m| m.sequence).collect().await;
        assert_eq!(replay, vec![1, 2, 3, 4]);
    }
}
