//! # Session
//!
//! A [`Session`] owns every shared service of one orchestration process:
//! the agent registry, the memory store, the tool registry and gateway, the
//! message bus and the transcript store. Agents are spawned into it and
//! conversations are created against it; each agent and each conversation
//! runs as its own task.
//!
//! ```rust,ignore
//! let session = Session::new(ParleyConfig::default())?;
//! session.spawn_agent(AgentDescriptor::new(alice), reasoner).await?;
//! let id = session.create_conversation(ConversationSpec::new(vec![alice])).await?;
//! let record = session.wait(&id).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parley_core::{
    AgentDescriptor, AgentId, AgentMemory, COORDINATOR_TAG, ConversationId, ConversationRecord,
    ConversationSpec, MemoryScope, MemoryStore, Reasoner, SpeakerSelector, TerminationReason, Tool, ToolName,
    Transcript, TranscriptError, TranscriptStore, TurnPolicy,
};
use parley_memory::{InMemoryStore, InMemoryTranscriptStore};
use parley_mesh::{LocalBus, MessageBus};
use parley_tools::{ToolGateway, ToolRegistry};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ParleyConfig;
use crate::driver::AgentDriver;
use crate::error::{ParleyError, ParleyResult};
use crate::orchestrator::{ConversationHandle, Services, launch};
use crate::registry::{AgentRegistry, Registration};
use crate::runtime::AgentRuntime;

/// Scope owning agents, tools, stores and running conversations
pub struct Session {
    config: ParleyConfig,
    registry: Arc<AgentRegistry>,
    memory: Arc<dyn MemoryStore>,
    tools: Arc<ToolRegistry>,
    gateway: Arc<ToolGateway>,
    bus: Arc<LocalBus>,
    transcripts: Arc<dyn TranscriptStore>,
    drivers: DashMap<AgentId, JoinHandle<()>>,
    conversations: DashMap<ConversationId, (Arc<ConversationHandle>, JoinHandle<()>)>,
    closed: AtomicBool,
}

impl Session {
    /// Session backed by in-memory stores
    pub fn new(config: ParleyConfig) -> ParleyResult<Self> {
        Self::with_stores(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryTranscriptStore::new()),
        )
    }

    /// Session backed by the given memory and transcript stores
    pub fn with_stores(
        config: ParleyConfig,
        memory: Arc<dyn MemoryStore>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> ParleyResult<Self> {
        let bus = Arc::new(LocalBus::new(config.bus)?);
        let tools = Arc::new(ToolRegistry::new());
        let gateway = Arc::new(ToolGateway::new(Arc::clone(&tools), config.gateway));
        Ok(Self {
            config,
            registry: Arc::new(AgentRegistry::new()),
            memory,
            tools,
            gateway,
            bus,
            transcripts,
            drivers: DashMap::new(),
            conversations: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    pub fn transcripts(&self) -> &Arc<dyn TranscriptStore> {
        &self.transcripts
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> ParleyResult<ToolName> {
        Ok(self.tools.register(tool)?)
    }

    /// Start an agent and register it.
    ///
    /// Spawning an id that is already live restarts its task with the new
    /// reasoner and refreshes the registration.
    pub async fn spawn_agent(
        &self,
        descriptor: AgentDescriptor,
        reasoner: Arc<dyn Reasoner>,
    ) -> ParleyResult<Registration> {
        self.spawn(descriptor, reasoner, None).await
    }

    /// Start an agent that can also pick speakers for dynamic conversations
    pub async fn spawn_coordinator(
        &self,
        descriptor: AgentDescriptor,
        reasoner: Arc<dyn Reasoner>,
        selector: Arc<dyn SpeakerSelector>,
    ) -> ParleyResult<Registration> {
        let descriptor = if descriptor.is_coordinator() {
            descriptor
        } else {
            descriptor.with_capability(COORDINATOR_TAG)
        };
        self.spawn(descriptor, reasoner, Some(selector)).await
    }

    async fn spawn(
        &self,
        descriptor: AgentDescriptor,
        reasoner: Arc<dyn Reasoner>,
        selector: Option<Arc<dyn SpeakerSelector>>,
    ) -> ParleyResult<Registration> {
        self.ensure_open()?;
        let id = descriptor.id.clone();

        // The inbox must exist before the registry makes the agent eligible.
        let inbox = self.bus.subscribe_agent(&id).await?;
        let memory = AgentMemory::new(id.clone(), Arc::clone(&self.memory));
        let runtime = AgentRuntime::new(
            reasoner,
            memory,
            Arc::clone(&self.gateway),
            self.config.runtime,
        );
        let driver = AgentDriver::new(
            runtime,
            selector,
            self.shared_bus(),
            inbox,
            self.config.runtime.dedup_window,
        )
        .spawn();
        if let Some(previous) = self.drivers.insert(id.clone(), driver) {
            debug!(agent = %id, "Restarted agent task");
            previous.abort();
        }
        let registration = self.registry.register(descriptor);

        // Transcript messages it missed while its inbox was full or gone
        let redelivered = self.bus.redeliver_dead_letters(&id).await;
        if redelivered > 0 {
            debug!(agent = %id, redelivered, "Caught up on dead-lettered messages");
        }
        Ok(registration)
    }

    /// Stop an agent and remove it from the registry. Conversations it takes
    /// part in skip it from then on. Its private memory and the tool calls
    /// only it still waits on go with it.
    pub async fn deregister_agent(&self, id: &AgentId) -> ParleyResult<()> {
        self.registry
            .deregister(id)
            .ok_or_else(|| ParleyError::AgentNotFound(id.clone()))?;
        self.bus.unregister_agent(id).await;
        if let Some((_, driver)) = self.drivers.remove(id) {
            driver.abort();
        }
        self.gateway.cancel_requester(id);
        let dropped = self.memory.drop_scope(&MemoryScope::Private(id.clone()))?;
        debug!(agent = %id, dropped, "Dropped private memory scope");
        Ok(())
    }

    /// Create and start a conversation
    pub async fn create_conversation(&self, spec: ConversationSpec) -> ParleyResult<ConversationId> {
        self.create_conversation_with_id(ConversationId::generate(), spec)
            .await
    }

    pub async fn create_conversation_with_id(
        &self,
        id: ConversationId,
        spec: ConversationSpec,
    ) -> ParleyResult<ConversationId> {
        self.ensure_open()?;
        spec.validate()?;
        if let Some(missing) = spec
            .participants
            .iter()
            .find(|agent| !self.registry.contains(agent))
        {
            return Err(ParleyError::AgentNotFound(missing.clone()));
        }
        if let TurnPolicy::Dynamic { coordinator } = &spec.policy {
            let qualified = self
                .registry
                .get(coordinator)
                .is_some_and(|agent| agent.descriptor.is_coordinator());
            if !qualified {
                return Err(ParleyError::NotCoordinator(coordinator.clone()));
            }
        }

        let record = ConversationRecord::new(id.clone(), spec);
        let (handle, task) = launch(record, self.config.orchestrator, self.services()).await?;
        info!(conversation = %id, "Conversation created");
        self.conversations.insert(id.clone(), (handle, task));
        Ok(id)
    }

    /// Live handle of a conversation started by this session
    pub fn handle(&self, id: &ConversationId) -> Option<Arc<ConversationHandle>> {
        self.conversations
            .get(id)
            .map(|entry| Arc::clone(&entry.value().0))
    }

    /// Transcript of a live conversation, or of a stored one
    pub async fn transcript(&self, id: &ConversationId) -> ParleyResult<Transcript> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.transcript().await);
        }
        self.transcripts.load(id).map_err(|error| match error {
            TranscriptError::NotFound(id) => ParleyError::ConversationNotFound(id),
            other => other.into(),
        })
    }

    /// Record of a live conversation, or of a stored one
    pub async fn status(&self, id: &ConversationId) -> ParleyResult<ConversationRecord> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.record().await);
        }
        self.stored_record(id)
    }

    /// Terminate a conversation with reason `External`.
    ///
    /// A stored conversation left unfinished by an earlier process is
    /// archived in place.
    pub async fn terminate(&self, id: &ConversationId) -> ParleyResult<()> {
        if let Some(handle) = self.handle(id) {
            if !handle.terminate() && handle.is_finished() {
                return Err(ParleyError::ConversationArchived(id.clone()));
            }
            info!(conversation = %id, "Termination requested");
            return Ok(());
        }

        let mut record = self.stored_record(id)?;
        if record.state.is_archived() {
            return Err(ParleyError::ConversationArchived(id.clone()));
        }
        record.archive(TerminationReason::External)?;
        self.transcripts.save_record(&record)?;
        warn!(conversation = %id, "Archived conversation left unfinished by an earlier run");
        Ok(())
    }

    /// Wait until a conversation is archived and return its final record
    pub async fn wait(&self, id: &ConversationId) -> ParleyResult<ConversationRecord> {
        if let Some(handle) = self.handle(id) {
            return handle.wait().await;
        }
        let record = self.stored_record(id)?;
        if record.state.is_archived() {
            Ok(record)
        } else {
            Err(ParleyError::ConversationNotFound(id.clone()))
        }
    }

    /// Ids of every stored conversation
    pub fn list(&self) -> ParleyResult<Vec<ConversationId>> {
        Ok(self.transcripts.list()?)
    }

    /// Terminate every live conversation, wait for them to archive and stop
    /// all agent tasks
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<Arc<ConversationHandle>> = self
            .conversations
            .iter()
            .map(|entry| Arc::clone(&entry.value().0))
            .collect();
        for handle in &handles {
            handle.terminate();
        }
        for handle in handles {
            if let Err(error) = handle.wait().await {
                warn!(conversation = %handle.id(), error = %error, "Conversation ended with an error");
            }
        }
        for entry in self.drivers.iter() {
            entry.value().abort();
        }
        self.drivers.clear();

        let bus = self.bus.metrics().await;
        let tools = self.gateway.stats();
        info!(
            messages = bus.messages_published_total,
            delivery_failures = bus.delivery_failures_total,
            dead_lettered = bus.dead_lettered_total,
            dead_letters_left = self.bus.dead_letters().len().await,
            max_inbox_depth = self.bus.backpressure().stats().max_depth,
            tool_executions = tools.executions,
            tool_cache_hits = tools.cache_hits,
            tool_calls_cancelled = tools.cancelled,
            "Session shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ParleyResult<()> {
        if self.is_shut_down() {
            return Err(ParleyError::Shutdown);
        }
        Ok(())
    }

    fn stored_record(&self, id: &ConversationId) -> ParleyResult<ConversationRecord> {
        self.transcripts
            .load_record(id)?
            .ok_or_else(|| ParleyError::ConversationNotFound(id.clone()))
    }

    fn shared_bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus) as Arc<dyn MessageBus>
    }

    fn services(&self) -> Services {
        Services {
            registry: Arc::clone(&self.registry),
            bus: self.shared_bus(),
            memory: Arc::clone(&self.memory),
            transcripts: Arc::clone(&self.transcripts),
            gateway: Arc::clone(&self.gateway),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for entry in self.drivers.iter() {
            entry.value().abort();
        }
        for entry in self.conversations.iter() {
            entry.value().1.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("agents", &self.registry.len())
            .field("conversations", &self.conversations.len())
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
