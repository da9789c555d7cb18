//! Dead Letter Queue for failed deliveries
//!
//! Stores messages that could not be delivered to an agent inbox, with TTL
//! and volume limits. Entries can be inspected or taken for redelivery.

use chrono::{DateTime, Duration, Utc};
use parley_core::{AgentId, Message};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::DeliveryFailureReason;

/// Configuration for the Dead Letter Queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqConfig {
    /// Maximum number of entries kept
    pub max_size: usize,
    /// Time to live for entries (seconds)
    pub ttl_secs: u64,
    /// Enable DLQ (if false, failed deliveries are dropped)
    pub enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl_secs: 86400, // 24 hours
            enabled: true,
        }
    }
}

/// An undelivered message with its intended recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub message: Message,
    pub recipient: AgentId,
    pub reason: DeliveryFailureReason,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Number of redelivery attempts so far
    pub redeliveries: u32,
}

impl DlqEntry {
    pub fn new(message: Message, recipient: AgentId, reason: DeliveryFailureReason, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            message,
            recipient,
            reason,
            added_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            redeliveries: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Statistics for the Dead Letter Queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    /// Entries currently held
    pub current_size: usize,
    /// Entries added (lifetime)
    pub total_added: u64,
    /// Entries taken for redelivery (lifetime)
    pub total_taken: u64,
    /// Entries that expired or were evicted by the size limit
    pub total_dropped: u64,
}

struct DlqState {
    queue: VecDeque<DlqEntry>,
    stats: DlqStats,
}

/// Dead Letter Queue for failed deliveries
pub struct DeadLetterQueue {
    config: DlqConfig,
    state: RwLock<DlqState>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            state: RwLock::new(DlqState {
                queue: VecDeque::new(),
                stats: DlqStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DlqConfig::default())
    }

    /// Record a failed delivery
    pub async fn add(&self, message: Message, recipient: AgentId, reason: DeliveryFailureReason) {
        if !self.config.enabled {
            debug!("DLQ disabled, dropping failed delivery");
            return;
        }

        let mut state = self.state.write().await;
        if state.queue.len() >= self.config.max_size {
            warn!("DLQ size limit reached, dropping oldest entry");
            state.queue.pop_front();
            state.stats.total_dropped += 1;
        }

        debug!(
            recipient = %recipient,
            conversation = %message.conversation_id,
            sequence = message.sequence,
            "Added failed delivery to DLQ"
        );
        state
            .queue
            .push_back(DlqEntry::new(message, recipient, reason, self.config.ttl_secs));
        state.stats.total_added += 1;
        state.stats.current_size = state.queue.len();
    }

    /// All entries, oldest first (for inspection)
    pub async fn list(&self) -> Vec<DlqEntry> {
        self.state.read().await.queue.iter().cloned().collect()
    }

    /// Remove and return the live entries addressed to `recipient`
    pub async fn take_for(&self, recipient: &AgentId) -> Vec<DlqEntry> {
        let mut state = self.state.write().await;
        let (taken, kept): (Vec<DlqEntry>, Vec<DlqEntry>) = state
            .queue
            .drain(..)
            .partition(|e| &e.recipient == recipient && !e.is_expired());
        state.queue = kept.into();
        state.stats.total_taken += taken.len() as u64;
        state.stats.current_size = state.queue.len();
        taken
    }

    /// Put an entry back after a failed redelivery
    pub async fn requeue(&self, mut entry: DlqEntry) {
        entry.redeliveries += 1;
        let mut state = self.state.write().await;
        state.queue.push_back(entry);
        state.stats.current_size = state.queue.len();
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.queue.len();
        state.queue.retain(|e| !e.is_expired());
        let removed = before - state.queue.len();
        state.stats.total_dropped += removed as u64;
        state.stats.current_size = state.queue.len();
        if removed > 0 {
            debug!("Purged {} expired DLQ entries", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> DlqStats {
        self.state.read().await.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ConversationId, CorrelationId, MessageDraft, MessageKind};

    fn message(seq: u64) -> Message {
        MessageDraft::from_agent(
            AgentId::parse("a").unwrap(),
            MessageKind::Response,
            CorrelationId::generate(),
            "hello",
        )
        .sequence(ConversationId::generate(), seq)
    }

    fn agent(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_dlq_add_and_take() {
        let dlq = DeadLetterQueue::with_defaults();
        dlq.add(message(1), agent("b"), DeliveryFailureReason::Timeout).await;
        dlq.add(message(2), agent("c"), DeliveryFailureReason::Closed).await;
        dlq.add(message(3), agent("b"), DeliveryFailureReason::Timeout).await;

        let taken = dlq.take_for(&agent("b")).await;
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].message.sequence, 1);
        assert_eq!(dlq.len().await, 1);

        let stats = dlq.stats().await;
        assert_eq!(stats.total_added, 3);
        assert_eq!(stats.total_taken, 2);
    }

    #[tokio::test]
    async fn test_dlq_size_limit() {
        let dlq = DeadLetterQueue::new(DlqConfig {
            max_size: 2,
            ..Default::default()
        });
        for seq in 1..=3 {
            dlq.add(message(seq), agent("b"), DeliveryFailureReason::Timeout).await;
        }
        let entries = dlq.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.sequence, 2);
        assert_eq!(dlq.stats().await.total_dropped, 1);
    }

    #[tokio::test]
    async fn test_dlq_disabled_and_expiry() {
        let disabled = DeadLetterQueue::new(DlqConfig {
            enabled: false,
            ..Default::default()
        });
        disabled.add(message(1), agent("b"), DeliveryFailureReason::Closed).await;
        assert!(disabled.is_empty().await);

        let dlq = DeadLetterQueue::with_defaults();
        let mut entry = DlqEntry::new(message(1), agent("b"), DeliveryFailureReason::Closed, 60);
        entry.expires_at = Utc::now() - Duration::seconds(1);
        dlq.requeue(entry).await;
        assert_eq!(dlq.purge_expired().await, 1);
        assert!(dlq.is_empty().await);
    }
}
