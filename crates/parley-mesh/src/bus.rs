//! The message bus trait and its in-process implementation

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parley_core::{AgentId, ConversationId, Message, Recipients};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backpressure::{BackpressureConfig, BackpressureMonitor, BackpressureSignal};
use crate::dlq::{DeadLetterQueue, DlqConfig};
use crate::error::{MeshError, MeshResult};
use crate::log::{ConversationLog, LogProgress, MessageStream, stream_from};
use crate::metrics::{BusMetrics, BusMetricsCollector};
use crate::types::{DeliveryFailure, DeliveryFailureReason, PublishReport, Submission};

/// An agent's inbox: every message addressed to it, across conversations
pub type AgentInbox = ReceiverStream<Message>;

/// Receiving end of a conversation's submission channel, held by its orchestrator
pub type SubmissionInbox = mpsc::Receiver<Submission>;

/// Bus configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusConfig {
    /// Bound of every agent inbox
    pub inbox_capacity: usize,
    /// How long a delivery may wait on a full inbox
    pub dispatch_timeout: Duration,
    /// Bound of each conversation's submission channel
    pub submission_capacity: usize,
    pub dlq: DlqConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 64,
            dispatch_timeout: Duration::from_secs(2),
            submission_capacity: 256,
            dlq: DlqConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.inbox_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "inbox_capacity must be at least 1".into(),
            ));
        }
        if self.submission_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "submission_capacity must be at least 1".into(),
            ));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(MeshError::InvalidConfig(
                "dispatch_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Ordered, addressed delivery between agent runtimes and orchestrators.
///
/// Transcript messages go through [`MessageBus::publish`], which appends them
/// to the conversation log before fanning them out to recipient inboxes.
/// Turn grants and other point-to-point control traffic go through
/// [`MessageBus::dispatch`] and are never logged.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Open a conversation log. The returned receiver yields the
    /// participants' submissions.
    async fn open_conversation(
        &self,
        conversation: &ConversationId,
        participants: Vec<AgentId>,
    ) -> MeshResult<SubmissionInbox>;

    /// Append `message` to its conversation log and deliver it to its
    /// recipients. Fails only if the log rejects the message; per-recipient
    /// failures are reported in the [`PublishReport`].
    async fn publish(&self, message: Message) -> MeshResult<PublishReport>;

    /// Deliver a message to one agent without logging it
    async fn dispatch(&self, agent: &AgentId, message: Message) -> MeshResult<()>;

    /// Hand an agent's turn output to the conversation's orchestrator
    async fn submit(&self, submission: Submission) -> MeshResult<()>;

    /// Every message of the conversation from `from_sequence` on, in order
    async fn subscribe_conversation(
        &self,
        conversation: &ConversationId,
        from_sequence: u64,
    ) -> MeshResult<MessageStream>;

    /// Create the agent's inbox, replacing any previous one
    async fn subscribe_agent(&self, agent: &AgentId) -> MeshResult<AgentInbox>;

    /// Drop the agent's inbox
    async fn unregister_agent(&self, agent: &AgentId) -> bool;

    /// Stop broadcasting the conversation's messages to `agent`
    async fn remove_participant(&self, conversation: &ConversationId, agent: &AgentId) -> MeshResult<()>;

    /// Seal the log: no more appends, and conversation streams end
    async fn seal_conversation(&self, conversation: &ConversationId) -> MeshResult<()>;

    /// Resolves once the conversation is sealed (immediately if unknown)
    async fn wait_sealed(&self, conversation: &ConversationId);

    async fn history(&self, conversation: &ConversationId) -> MeshResult<Vec<Message>>;
}

/// In-process bus backed by bounded tokio channels
pub struct LocalBus {
    config: BusConfig,
    inboxes: DashMap<AgentId, mpsc::Sender<Message>>,
    conversations: DashMap<ConversationId, Arc<ConversationLog>>,
    dlq: DeadLetterQueue,
    backpressure: BackpressureMonitor,
    metrics: BusMetricsCollector,
}

impl LocalBus {
    pub fn new(config: BusConfig) -> MeshResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inboxes: DashMap::new(),
            conversations: DashMap::new(),
            dlq: DeadLetterQueue::new(config.dlq),
            backpressure: BackpressureMonitor::new(config.backpressure),
            metrics: BusMetricsCollector::with_defaults(),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn backpressure(&self) -> &BackpressureMonitor {
        &self.backpressure
    }

    pub fn backpressure_signal(&self, agent: &AgentId) -> BackpressureSignal {
        self.backpressure.signal(agent)
    }

    pub async fn metrics(&self) -> BusMetrics {
        self.metrics.snapshot().await
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.inboxes.contains_key(agent)
    }

    /// Current progress of a conversation log
    pub fn progress(&self, conversation: &ConversationId) -> MeshResult<LogProgress> {
        Ok(self.log(conversation)?.current())
    }

    /// Retry dead-lettered deliveries addressed to `agent`, oldest first.
    ///
    /// Only transcript messages of conversations that are still open are
    /// retried; point-to-point control traffic and messages of sealed
    /// conversations are discarded. Returns how many were delivered; the
    /// others go back to the queue.
    pub async fn redeliver_dead_letters(&self, agent: &AgentId) -> usize {
        self.dlq.purge_expired().await;
        let mut delivered = 0;
        let mut discarded = 0;
        for entry in self.dlq.take_for(agent).await {
            let open = self
                .log(&entry.message.conversation_id)
                .is_ok_and(|log| !log.current().sealed);
            if !open || entry.message.is_point_to_point() {
                discarded += 1;
                continue;
            }
            match self.deliver(agent, entry.message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => self.dlq.requeue(entry).await,
            }
        }
        if delivered > 0 || discarded > 0 {
            info!(agent = %agent, delivered, discarded, "Redelivered dead letters");
        }
        delivered
    }

    fn log(&self, conversation: &ConversationId) -> MeshResult<Arc<ConversationLog>> {
        self.conversations
            .get(conversation)
            .map(|log| Arc::clone(log.value()))
            .ok_or_else(|| MeshError::ConversationNotFound(conversation.clone()))
    }

    /// Push one message into one inbox, waiting at most `dispatch_timeout`
    async fn deliver(&self, agent: &AgentId, message: Message) -> Result<(), DeliveryFailureReason> {
        let Some(inbox) = self.inboxes.get(agent).map(|tx| tx.value().clone()) else {
            return Err(DeliveryFailureReason::NotRegistered);
        };

        let started = Instant::now();
        let result = inbox.send_timeout(message, self.config.dispatch_timeout).await;
        let depth = inbox.max_capacity() - inbox.capacity();
        self.backpressure
            .update_depth(agent, depth, inbox.max_capacity());

        match result {
            Ok(()) => {
                self.metrics.record_delivery(started.elapsed()).await;
                Ok(())
            }
            Err(SendTimeoutError::Timeout(message)) => {
                warn!(
                    agent = %agent,
                    conversation = %message.conversation_id,
                    sequence = message.sequence,
                    waited = ?self.config.dispatch_timeout,
                    "Delivery timed out on full inbox"
                );
                Err(DeliveryFailureReason::Timeout)
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(agent = %agent, "Inbox closed, dropping it");
                self.inboxes.remove_if(agent, |_, tx| tx.is_closed());
                self.backpressure.forget(agent);
                Err(DeliveryFailureReason::Closed)
            }
        }
    }

    async fn record_failure(&self, agent: &AgentId, message: Message, reason: DeliveryFailureReason) {
        let dead_lettered = reason != DeliveryFailureReason::NotRegistered;
        if dead_lettered {
            self.dlq.add(message, agent.clone(), reason).await;
        }
        self.metrics.record_delivery_failure(dead_lettered).await;
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn open_conversation(
        &self,
        conversation: &ConversationId,
        participants: Vec<AgentId>,
    ) -> MeshResult<SubmissionInbox> {
        let rx = match self.conversations.entry(conversation.clone()) {
            Entry::Occupied(_) => return Err(MeshError::ConversationExists(conversation.clone())),
            Entry::Vacant(slot) => {
                let (log, rx) = ConversationLog::new(
                    conversation.clone(),
                    participants,
                    self.config.submission_capacity,
                );
                slot.insert(Arc::new(log));
                rx
            }
        };
        let open = self
            .conversations
            .iter()
            .filter(|log| !log.current().sealed)
            .count();
        self.metrics.set_conversations_open(open).await;
        debug!(conversation = %conversation, "Opened conversation log");
        Ok(rx)
    }

    async fn publish(&self, message: Message) -> MeshResult<PublishReport> {
        let log = self.log(&message.conversation_id)?;
        log.append(message.clone()).await?;
        self.metrics.record_publish().await;

        let targets: Vec<AgentId> = match &message.recipients {
            Recipients::Broadcast => log
                .participants()
                .await
                .into_iter()
                .filter(|p| Some(p) != message.sender_agent())
                .collect(),
            Recipients::Agents(agents) => agents.clone(),
        };
        debug!(
            conversation = %message.conversation_id,
            sequence = message.sequence,
            kind = %message.kind,
            recipients = targets.len(),
            "Publishing message"
        );

        let outcomes = join_all(targets.iter().map(|agent| {
            let message = message.clone();
            async move { (agent, self.deliver(agent, message).await) }
        }))
        .await;

        let mut report = PublishReport {
            sequence: message.sequence,
            ..Default::default()
        };
        for (agent, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered.push(agent.clone()),
                Err(reason) => {
                    self.record_failure(agent, message.clone(), reason).await;
                    report.failed.push(DeliveryFailure {
                        agent: agent.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn dispatch(&self, agent: &AgentId, message: Message) -> MeshResult<()> {
        self.metrics.record_dispatch().await;
        match self.deliver(agent, message.clone()).await {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.record_failure(agent, message, reason).await;
                Err(match reason {
                    DeliveryFailureReason::Timeout => MeshError::DeliveryTimeout {
                        agent: agent.clone(),
                        waited: self.config.dispatch_timeout,
                    },
                    DeliveryFailureReason::Closed => MeshError::InboxClosed(agent.clone()),
                    DeliveryFailureReason::NotRegistered => MeshError::AgentNotFound(agent.clone()),
                })
            }
        }
    }

    async fn submit(&self, submission: Submission) -> MeshResult<()> {
        let log = self.log(&submission.conversation_id)?;
        if log.current().sealed {
            return Err(MeshError::ConversationSealed(submission.conversation_id));
        }
        let conversation = submission.conversation_id.clone();
        log.submissions()
            .send_timeout(submission, self.config.dispatch_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => MeshError::ResourceExhausted(format!(
                    "submission channel of {} is full",
                    conversation
                )),
                SendTimeoutError::Closed(_) => MeshError::ConversationSealed(conversation.clone()),
            })?;
        self.metrics.record_submission().await;
        Ok(())
    }

    async fn subscribe_conversation(
        &self,
        conversation: &ConversationId,
        from_sequence: u64,
    ) -> MeshResult<MessageStream> {
        let log = self.log(conversation)?;
        Ok(stream_from(log, from_sequence))
    }

    async fn subscribe_agent(&self, agent: &AgentId) -> MeshResult<AgentInbox> {
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity);
        if self.inboxes.insert(agent.clone(), tx).is_some() {
            debug!(agent = %agent, "Replaced existing inbox");
        }
        self.backpressure.forget(agent);
        Ok(ReceiverStream::new(rx))
    }

    async fn unregister_agent(&self, agent: &AgentId) -> bool {
        self.backpressure.forget(agent);
        self.inboxes.remove(agent).is_some()
    }

    async fn remove_participant(&self, conversation: &ConversationId, agent: &AgentId) -> MeshResult<()> {
        let log = self.log(conversation)?;
        if log.remove_participant(agent).await {
            debug!(conversation = %conversation, agent = %agent, "Removed participant from fan-out");
        }
        Ok(())
    }

    async fn seal_conversation(&self, conversation: &ConversationId) -> MeshResult<()> {
        let log = self.log(conversation)?;
        if log.seal() {
            info!(conversation = %conversation, "Sealed conversation log");
        }
        let open = self
            .conversations
            .iter()
            .filter(|log| !log.current().sealed)
            .count();
        self.metrics.set_conversations_open(open).await;
        Ok(())
    }

    async fn wait_sealed(&self, conversation: &ConversationId) {
        let Ok(log) = self.log(conversation) else {
            return;
        };
        let mut progress = log.progress();
        // Err only if the log itself is gone, which also means sealed.
        let _ = progress.wait_for(|p| p.sealed).await;
    }

    async fn history(&self, conversation: &ConversationId) -> MeshResult<Vec<Message>> {
        Ok(self.log(conversation)?.history().await)
    }
}
