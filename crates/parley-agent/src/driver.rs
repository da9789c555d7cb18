//! Agent driver
//!
//! One task per spawned agent. It drains the agent's bus inbox, drops
//! duplicate deliveries, feeds transcript messages into the runtime and
//! answers turn grants and speaker-selection requests by submitting back to
//! the orchestrator. The runtime forgets a conversation's history once the
//! conversation is sealed.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parley_core::{
    AgentId, ControlSignal, ConversationId, Message, MessageDraft, MessageKind, SpeakerSelector,
};
use parley_mesh::{AgentInbox, DedupWindow, MeshError, MessageBus, Submission};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runtime::{AgentRuntime, Turn};

pub(crate) struct AgentDriver {
    runtime: AgentRuntime,
    selector: Option<Arc<dyn SpeakerSelector>>,
    bus: Arc<dyn MessageBus>,
    inbox: AgentInbox,
    dedup: DedupWindow,
    /// Conversations with perceived history, each watched until sealed
    watched: HashSet<ConversationId>,
}

impl AgentDriver {
    pub(crate) fn new(
        runtime: AgentRuntime,
        selector: Option<Arc<dyn SpeakerSelector>>,
        bus: Arc<dyn MessageBus>,
        inbox: AgentInbox,
        dedup_window: usize,
    ) -> Self {
        Self {
            runtime,
            selector,
            bus,
            inbox,
            dedup: DedupWindow::new(dedup_window),
            watched: HashSet::new(),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn id(&self) -> &AgentId {
        self.runtime.id()
    }

    async fn run(mut self) {
        self.drive().await;
    }

    async fn drive(&mut self) {
        match self.runtime.recover().await {
            Ok(Some(call)) => {
                info!(agent = %self.id(), call = %call.id, "Resumed interrupted tool call")
            }
            Ok(None) => {}
            Err(error) => {
                warn!(agent = %self.id(), error = %error, "Could not resume interrupted tool call")
            }
        }

        let mut sealed: FuturesUnordered<BoxFuture<'static, ConversationId>> =
            FuturesUnordered::new();
        loop {
            tokio::select! {
                message = self.inbox.next() => {
                    let Some(message) = message else { break };
                    if let Some(watch) = self.handle(message).await {
                        sealed.push(watch);
                    }
                }
                Some(conversation) = sealed.next(), if !sealed.is_empty() => {
                    self.watched.remove(&conversation);
                    self.runtime.forget(&conversation);
                    debug!(agent = %self.id(), conversation = %conversation, "Forgot history of sealed conversation");
                }
            }
        }
        info!(agent = %self.id(), "Agent inbox closed, driver stopped");
    }

    /// Handle one delivery. Returns a watch on the conversation's seal the
    /// first time its history is perceived.
    async fn handle(&mut self, message: Message) -> Option<BoxFuture<'static, ConversationId>> {
        if !self.dedup.insert(message.dedup_key()) {
            debug!(agent = %self.id(), sequence = message.sequence, "Dropped duplicate delivery");
            return None;
        }
        match message.control().cloned() {
            Some(ControlSignal::TurnGrant { turn }) => self.take_turn(&message, turn).await,
            Some(ControlSignal::SelectSpeaker { candidates, .. }) => {
                self.select_speaker(&message, &candidates).await
            }
            _ => {
                let conversation = message.conversation_id.clone();
                self.runtime.perceive(message);
                if self.watched.insert(conversation.clone()) {
                    let bus = Arc::clone(&self.bus);
                    return Some(
                        async move {
                            bus.wait_sealed(&conversation).await;
                            conversation
                        }
                        .boxed(),
                    );
                }
            }
        }
        None
    }

    async fn take_turn(&mut self, grant: &Message, number: u64) {
        let turn = Turn {
            conversation: grant.conversation_id.clone(),
            number,
            correlation: grant.correlation_id.clone(),
        };
        let bus = Arc::clone(&self.bus);
        let output = tokio::select! {
            output = self.runtime.step(&turn, None) => output,
            _ = bus.wait_sealed(&turn.conversation) => {
                info!(agent = %self.id(), conversation = %turn.conversation, turn = number, "Conversation closed, abandoning step");
                self.runtime.abandon(&turn.conversation);
                return;
            }
        };
        debug!(agent = %self.id(), turn = number, drafts = output.messages.len(), outcome = ?output.outcome, "Step finished");
        self.submit(&turn.conversation, grant, output.messages).await;
    }

    async fn select_speaker(&mut self, request: &Message, candidates: &[AgentId]) {
        let Some(selector) = self.selector.clone() else {
            debug!(agent = %self.id(), "Ignoring speaker selection request, agent has no selector");
            return;
        };
        let conversation = &request.conversation_id;
        let transcript = self.runtime.history(conversation);
        // An empty submission tells the orchestrator to retry or fall back.
        let drafts = match selector
            .select_next(conversation, candidates, &transcript)
            .await
        {
            Ok(agent) => vec![MessageDraft::from_agent(
                self.id().clone(),
                MessageKind::Control,
                request.correlation_id.clone(),
                ControlSignal::SpeakerSelected { agent },
            )],
            Err(error) => {
                warn!(agent = %self.id(), conversation = %conversation, error = %error, "Speaker selection failed");
                Vec::new()
            }
        };
        self.submit(conversation, request, drafts).await;
    }

    async fn submit(
        &self,
        conversation: &ConversationId,
        request: &Message,
        drafts: Vec<MessageDraft>,
    ) {
        let submission = Submission::new(
            conversation.clone(),
            self.id().clone(),
            request.correlation_id.clone(),
            drafts,
        );
        match self.bus.submit(submission).await {
            Ok(()) => {}
            Err(MeshError::ConversationSealed(_)) => {
                debug!(agent = %self.id(), conversation = %conversation, "Submission after conversation closed")
            }
            Err(error) => {
                warn!(agent = %self.id(), conversation = %conversation, error = %error, "Submission failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{
        AgentMemory, CorrelationId, Decision, Reasoner, ReasoningContext, ReasoningError,
    };
    use parley_memory::InMemoryStore;
    use parley_mesh::{BusConfig, LocalBus};
    use parley_tools::{GatewayConfig, ToolGateway, ToolRegistry};
    use std::time::Duration;

    use crate::runtime::RuntimeConfig;

    struct Quiet;

    #[async_trait]
    impl Reasoner for Quiet {
        async fn infer(&self, _context: &ReasoningContext) -> Result<Decision, ReasoningError> {
            Ok(Decision::respond("ok"))
        }
    }

    fn agent(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    fn message(conversation: &ConversationId, sequence: u64) -> Message {
        MessageDraft::from_agent(agent("a"), MessageKind::Response, CorrelationId::generate(), "hi")
            .sequence(conversation.clone(), sequence)
    }

    #[tokio::test]
    async fn test_sealed_conversation_history_is_forgotten() {
        let bus = Arc::new(LocalBus::new(BusConfig::default()).unwrap());
        let inbox = bus.subscribe_agent(&agent("b")).await.unwrap();
        let gateway = Arc::new(ToolGateway::new(
            Arc::new(ToolRegistry::new()),
            GatewayConfig::default(),
        ));
        let runtime = AgentRuntime::new(
            Arc::new(Quiet),
            AgentMemory::new(agent("b"), Arc::new(InMemoryStore::new())),
            gateway,
            RuntimeConfig::default(),
        );
        let mut driver = AgentDriver::new(
            runtime,
            None,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            inbox,
            16,
        );

        let (finished, open) = (ConversationId::generate(), ConversationId::generate());
        let mut submissions = Vec::new();
        for conversation in [&finished, &open] {
            submissions.push(
                bus.open_conversation(conversation, vec![agent("a"), agent("b")])
                    .await
                    .unwrap(),
            );
        }

        let feed = async {
            bus.publish(message(&finished, 1)).await.unwrap();
            bus.publish(message(&open, 1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            bus.seal_conversation(&finished).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            bus.unregister_agent(&agent("b")).await;
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(driver.drive(), feed)
        })
        .await
        .unwrap();

        assert!(driver.runtime.history(&finished).is_empty());
        assert_eq!(driver.runtime.history(&open).len(), 1);
        assert!(!driver.watched.contains(&finished));
    }
}
