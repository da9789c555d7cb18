use dashmap::DashMap;

use parley_core::transcript::{Transcript, TranscriptError, TranscriptStore};
use parley_core::{ConversationId, ConversationRecord, Message};

/// Transcript store that keeps everything in process memory
#[derive(Default)]
pub struct InMemoryTranscriptStore {
    transcripts: DashMap<ConversationId, Vec<Message>>,
    records: DashMap<ConversationId, ConversationRecord>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranscriptStore for InMemoryTranscriptStore {
    fn append(&self, message: &Message) -> Result<(), TranscriptError> {
        let mut log = self
            .transcripts
            .entry(message.conversation_id.clone())
            .or_default();
        let expected = log.len() as u64 + 1;
        if message.sequence != expected {
            return Err(TranscriptError::SequenceGap {
                conversation: message.conversation_id.clone(),
                expected,
                found: message.sequence,
            });
        }
        log.push(message.clone());
        Ok(())
    }

    fn load(&self, conversation: &ConversationId) -> Result<Transcript, TranscriptError> {
        let mut transcript = Transcript::new(conversation.clone());
        match self.transcripts.get(conversation) {
            Some(log) => {
                for message in log.iter() {
                    transcript.push(message.clone())?;
                }
            }
            None if self.records.contains_key(conversation) => {}
            None => return Err(TranscriptError::NotFound(conversation.clone())),
        }
        Ok(transcript)
    }

    fn save_record(&self, record: &ConversationRecord) -> Result<(), TranscriptError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn load_record(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationRecord>, TranscriptError> {
        Ok(self.records.get(conversation).map(|r| r.value().clone()))
    }

    fn list(&self) -> Result<Vec<ConversationId>, TranscriptError> {
        let mut ids: Vec<ConversationId> = self
            .records
            .iter()
            .map(|r| r.key().clone())
            .chain(self.transcripts.iter().map(|t| t.key().clone()))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{AgentId, ConversationSpec, CorrelationId, MessageDraft, MessageKind};

    fn message(conv: &ConversationId, seq: u64) -> Message {
        MessageDraft::from_agent(
            AgentId::parse("a").unwrap(),
            MessageKind::Response,
            CorrelationId::generate(),
            format!("m{}", seq),
        )
        .sequence(conv.clone(), seq)
    }

    #[test]
    fn append_and_load() {
        let store = InMemoryTranscriptStore::new();
        let conv = ConversationId::generate();
        store.append(&message(&conv, 1)).unwrap();
        store.append(&message(&conv, 2)).unwrap();
        assert!(matches!(
            store.append(&message(&conv, 4)),
            Err(TranscriptError::SequenceGap { expected: 3, .. })
        ));
        let transcript = store.load(&conv).unwrap();
        assert_eq!(transcript.len(), 2);
        assert!(matches!(
            store.load(&ConversationId::generate()),
            Err(TranscriptError::NotFound(_))
        ));
    }

    #[test]
    fn records_and_listing() {
        let store = InMemoryTranscriptStore::new();
        let conv = ConversationId::generate();
        let record = ConversationRecord::new(
            conv.clone(),
            ConversationSpec::new(vec![AgentId::parse("a").unwrap()]),
        );
        store.save_record(&record).unwrap();
        store.append(&message(&conv, 1)).unwrap();

        assert_eq!(store.load_record(&conv).unwrap(), Some(record));
        assert_eq!(store.list().unwrap(), vec![conv]);
    }
}
