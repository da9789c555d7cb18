//! Conversation orchestrator
//!
//! One task per conversation runs the `Created -> Active -> Terminating ->
//! Archived` state machine. Each turn it picks a speaker, dispatches a turn
//! grant over the bus, waits for the matching submission, and appends the
//! submitted drafts to the transcript one by one, checking the termination
//! predicate after every append.
//!
//! Turn grants and speaker-selection exchanges are point-to-point and never
//! enter the transcript. Missed turns and removals do, as `control` messages
//! sent by the orchestrator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_core::{
    AgentId, AuditEntry, AuditReason, ControlSignal, ConversationId, ConversationRecord,
    ConversationState, CorrelationId, MemoryScope, MemoryStore, Message, MessageDraft,
    MessageKind, OrchestrationFault, Payload, Recipients, TerminationReason, ToolError, ToolName,
    Transcript, TranscriptStore,
};
use parley_mesh::{MeshError, MessageBus, Submission, SubmissionInbox};
use parley_tools::ToolGateway;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::{ParleyError, ParleyResult};
use crate::policy::TurnScheduler;
use crate::registry::AgentRegistry;
use crate::termination::TerminationPredicate;

/// Orchestrator timing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// How long a speaker has to submit after its grant
    pub turn_timeout: Duration,
    /// How long a coordinator has to pick the next speaker
    pub selection_timeout: Duration,
    /// Missed turns in a row after which a speaker is removed from rotation
    pub max_consecutive_timeouts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            selection_timeout: Duration::from_secs(5),
            max_consecutive_timeouts: 2,
        }
    }
}

/// Session-wide services a conversation runs against
#[derive(Clone)]
pub(crate) struct Services {
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<dyn MessageBus>,
    pub memory: Arc<dyn MemoryStore>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub gateway: Arc<ToolGateway>,
}

/// Final state of a conversation task
#[derive(Debug, Clone)]
struct Completion {
    record: ConversationRecord,
    fatal: Option<String>,
}

/// Shared view of a running or finished conversation
#[derive(Debug)]
pub struct ConversationHandle {
    id: ConversationId,
    record: RwLock<ConversationRecord>,
    transcript: RwLock<Transcript>,
    stop: watch::Sender<bool>,
    finished: watch::Sender<Option<Completion>>,
}

impl ConversationHandle {
    fn new(record: ConversationRecord) -> Self {
        let (stop, _) = watch::channel(false);
        let (finished, _) = watch::channel(None);
        Self {
            id: record.id.clone(),
            transcript: RwLock::new(Transcript::new(record.id.clone())),
            record: RwLock::new(record),
            stop,
            finished,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Current record: state, counters, faults and audit log
    pub async fn record(&self) -> ConversationRecord {
        self.record.read().await.clone()
    }

    pub async fn transcript(&self) -> Transcript {
        self.transcript.read().await.clone()
    }

    /// Ask the conversation to terminate with reason `External`.
    ///
    /// Returns `false` if it already finished or was already asked.
    pub fn terminate(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        !self.stop.send_replace(true)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }

    /// Wait until the conversation is archived
    pub async fn wait(&self) -> ParleyResult<ConversationRecord> {
        let mut finished = self.finished.subscribe();
        let completion = finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ParleyError::Shutdown)?
            .clone();
        match completion {
            Some(Completion { fatal: None, record }) => Ok(record),
            Some(Completion {
                fatal: Some(error), ..
            }) => Err(ParleyError::Fatal(error)),
            None => Err(ParleyError::Shutdown),
        }
    }

    fn finish(&self, completion: Completion) {
        self.finished.send_replace(Some(completion));
    }
}

/// Open the conversation on the bus and start its task
pub(crate) async fn launch(
    record: ConversationRecord,
    config: OrchestratorConfig,
    services: Services,
) -> ParleyResult<(Arc<ConversationHandle>, JoinHandle<()>)> {
    let submissions = services
        .bus
        .open_conversation(&record.id, record.spec.participants.clone())
        .await?;
    let scheduler = TurnScheduler::new(record.spec.policy.clone(), record.spec.participants.clone());
    let predicate = TerminationPredicate::start(record.spec.termination.clone());
    let handle = Arc::new(ConversationHandle::new(record));

    let orchestrator = Orchestrator {
        id: handle.id().clone(),
        config,
        stop: handle.stop.subscribe(),
        handle: Arc::clone(&handle),
        services,
        submissions,
        scheduler,
        predicate,
        missed: HashMap::new(),
        removed: HashSet::new(),
    };
    let task = tokio::spawn(orchestrator.run());
    Ok((handle, task))
}

/// What came back while waiting for an agent
enum Reply {
    Matched(Submission),
    TimedOut,
    /// The agent was deregistered while we waited
    Departed,
    Stopped,
}

/// Result of one speaker-selection request
enum Selection {
    Chosen(AgentId),
    Invalid(String),
    Stopped,
}

struct Orchestrator {
    id: ConversationId,
    config: OrchestratorConfig,
    handle: Arc<ConversationHandle>,
    services: Services,
    submissions: SubmissionInbox,
    stop: watch::Receiver<bool>,
    scheduler: TurnScheduler,
    predicate: TerminationPredicate,
    /// Consecutive missed turns per speaker
    missed: HashMap<AgentId, u32>,
    /// Participants taken out of the rotation
    removed: HashSet<AgentId>,
}

impl Orchestrator {
    async fn run(mut self) {
        let (reason, mut fatal) = match self.drive().await {
            Ok(reason) => (reason, None),
            Err(error) => {
                let error = error.escalate();
                error!(conversation = %self.id, error = %error, code = error.error_code(), "Conversation aborted");
                (
                    TerminationReason::Aborted {
                        error: error.to_string(),
                    },
                    Some(error.to_string()),
                )
            }
        };
        if let Err(error) = self.archive(reason).await {
            error!(conversation = %self.id, error = %error, "Archiving failed");
            fatal.get_or_insert_with(|| error.to_string());
        }
        let record = self.handle.record().await;
        self.handle.finish(Completion { record, fatal });
    }

    async fn drive(&mut self) -> ParleyResult<TerminationReason> {
        self.activate().await?;
        loop {
            if *self.stop.borrow() {
                return Ok(TerminationReason::External);
            }
            if let Some(reason) = self.predicate.check_deadline() {
                return Ok(reason);
            }

            let eligible = self.eligible();
            if eligible.is_empty() {
                warn!(conversation = %self.id, "No eligible speaker left");
                self.record_fault(OrchestrationFault::OrchestratorDeadlock {
                    conversation: self.id.clone(),
                })
                .await;
                return Ok(TerminationReason::Deadlock);
            }

            let turn = self.handle.record.read().await.turns + 1;
            let Some(speaker) = self.select_speaker(turn, &eligible).await? else {
                return Ok(TerminationReason::External);
            };
            if let Some(reason) = self.run_turn(turn, &speaker).await? {
                self.handle.record.write().await.turns = turn;
                return Ok(reason);
            }
            self.handle.record.write().await.turns = turn;
            if let Some(reason) = self.predicate.after_turn(turn) {
                return Ok(reason);
            }
        }
    }

    async fn activate(&mut self) -> ParleyResult<()> {
        let mut record = self.handle.record.write().await;
        record.transition(ConversationState::Active)?;
        self.predicate = TerminationPredicate::start(record.spec.termination.clone());
        self.services.transcripts.save_record(&record)?;
        info!(
            conversation = %self.id,
            participants = record.spec.participants.len(),
            policy = ?record.spec.policy,
            "Conversation active"
        );
        Ok(())
    }

    fn eligible(&self) -> Vec<AgentId> {
        self.scheduler
            .eligible(|id| !self.removed.contains(id) && self.services.registry.contains(id))
    }

    async fn select_speaker(
        &mut self,
        turn: u64,
        eligible: &[AgentId],
    ) -> ParleyResult<Option<AgentId>> {
        let Some(coordinator) = self.scheduler.coordinator().cloned() else {
            let registry = Arc::clone(&self.services.registry);
            return Ok(self
                .scheduler
                .next_speaker(eligible, |id| registry.priority(id)));
        };

        let available =
            self.services.registry.contains(&coordinator) && !self.removed.contains(&coordinator);
        if available {
            for attempt in 1..=2 {
                match self.request_selection(&coordinator, turn, eligible).await? {
                    Selection::Chosen(speaker) => {
                        debug!(conversation = %self.id, turn, agent = %speaker, "Coordinator selected speaker");
                        self.scheduler.record(&speaker);
                        return Ok(Some(speaker));
                    }
                    Selection::Stopped => return Ok(None),
                    Selection::Invalid(why) => {
                        warn!(conversation = %self.id, turn, coordinator = %coordinator, attempt, reason = %why, "Speaker selection failed");
                    }
                }
            }
        }
        warn!(conversation = %self.id, turn, "Falling back to round-robin for this turn");
        Ok(self.scheduler.next_round_robin(eligible))
    }

    async fn request_selection(
        &mut self,
        coordinator: &AgentId,
        turn: u64,
        eligible: &[AgentId],
    ) -> ParleyResult<Selection> {
        let correlation = CorrelationId::generate();
        let request = MessageDraft::control(
            Recipients::one(coordinator.clone()),
            correlation.clone(),
            ControlSignal::SelectSpeaker {
                turn,
                candidates: eligible.to_vec(),
            },
        )
        .sequence(self.id.clone(), self.last_sequence().await);

        if let Err(error) = self.services.bus.dispatch(coordinator, request).await {
            if error.is_fatal() {
                return Err(error.into());
            }
            return Ok(Selection::Invalid(error.to_string()));
        }

        let wait = self.predicate.bound(self.config.selection_timeout);
        let selection = match self.await_reply(coordinator, &correlation, wait).await {
            Reply::Stopped => Selection::Stopped,
            Reply::TimedOut => Selection::Invalid(format!("no answer within {:?}", wait)),
            Reply::Departed => Selection::Invalid("coordinator was deregistered".into()),
            Reply::Matched(submission) => {
                match submission.drafts.last().and_then(|d| d.payload.as_control()) {
                    Some(ControlSignal::SpeakerSelected { agent }) if eligible.contains(agent) => {
                        Selection::Chosen(agent.clone())
                    }
                    Some(ControlSignal::SpeakerSelected { agent }) => {
                        Selection::Invalid(format!("'{}' is not an eligible candidate", agent))
                    }
                    _ => Selection::Invalid("reply carries no selection".into()),
                }
            }
        };
        Ok(selection)
    }

    /// Grant `speaker` the turn and append what it submits
    async fn run_turn(
        &mut self,
        turn: u64,
        speaker: &AgentId,
    ) -> ParleyResult<Option<TerminationReason>> {
        let correlation = CorrelationId::generate();
        let grant = MessageDraft::control(
            Recipients::one(speaker.clone()),
            correlation.clone(),
            ControlSignal::TurnGrant { turn },
        )
        .sequence(self.id.clone(), self.last_sequence().await);
        debug!(conversation = %self.id, agent = %speaker, turn, "Granting turn");

        let started = Instant::now();
        match self.services.bus.dispatch(speaker, grant).await {
            Ok(()) => {}
            Err(MeshError::DeliveryTimeout { .. }) => {
                let drafts = self
                    .remove_from_rotation(speaker, "inbox stayed full past the dispatch timeout")
                    .await?;
                return self.append_all(drafts).await;
            }
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => {
                if !self.services.registry.contains(speaker) {
                    debug!(conversation = %self.id, agent = %speaker, "Speaker deregistered, skipping turn");
                    return Ok(None);
                }
                debug!(conversation = %self.id, agent = %speaker, error = %error, "Turn grant undeliverable");
                return self.missed_turn(speaker, turn, 0).await;
            }
        }

        let wait = self.predicate.bound(self.config.turn_timeout);
        match self.await_reply(speaker, &correlation, wait).await {
            Reply::Stopped => Ok(Some(TerminationReason::External)),
            Reply::Departed => {
                debug!(conversation = %self.id, agent = %speaker, turn, "Speaker deregistered mid-turn, skipping turn");
                self.missed.remove(speaker);
                Ok(None)
            }
            Reply::TimedOut => {
                if let Some(reason) = self.predicate.check_deadline() {
                    return Ok(Some(reason));
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                self.missed_turn(speaker, turn, waited_ms).await
            }
            Reply::Matched(submission) => {
                self.missed.remove(speaker);
                self.append_all(submission.drafts).await
            }
        }
    }

    /// Wait for `from`'s reply to `correlation`, auditing anything else
    async fn await_reply(
        &mut self,
        from: &AgentId,
        correlation: &CorrelationId,
        wait: Duration,
    ) -> Reply {
        let deadline = Instant::now() + wait;
        let registry = Arc::clone(&self.services.registry);
        let mut departures = registry.departures();
        loop {
            let received = tokio::select! {
                _ = async { let _ = self.stop.wait_for(|stopped| *stopped).await; } => return Reply::Stopped,
                _ = sleep_until(deadline) => return Reply::TimedOut,
                _ = async { let _ = departures.wait_for(|_| !registry.contains(from)).await; } => return Reply::Departed,
                received = self.submissions.recv() => received,
            };
            // The bus keeps the sending half for as long as the log exists.
            let Some(submission) = received else {
                return Reply::Stopped;
            };
            if &submission.agent == from && &submission.correlation_id == correlation {
                return Reply::Matched(submission);
            }
            self.audit(submission, AuditReason::StaleCorrelation).await;
        }
    }

    async fn missed_turn(
        &mut self,
        speaker: &AgentId,
        turn: u64,
        waited_ms: u64,
    ) -> ParleyResult<Option<TerminationReason>> {
        let misses = {
            let count = self.missed.entry(speaker.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(conversation = %self.id, agent = %speaker, turn, waited_ms, misses, "Speaker missed its turn");

        let fault = OrchestrationFault::DeliveryTimeout {
            agent: speaker.clone(),
            turn,
            waited_ms,
        };
        let mut drafts: Vec<MessageDraft> = announce(&fault).into_iter().collect();
        self.record_fault(fault).await;

        if misses >= self.config.max_consecutive_timeouts {
            let reason = format!("missed {} consecutive turns", misses);
            drafts.extend(self.remove_from_rotation(speaker, reason).await?);
        }
        self.append_all(drafts).await
    }

    /// Take `agent` out of the rotation and fan-out, returning the
    /// announcement to append
    async fn remove_from_rotation(
        &mut self,
        agent: &AgentId,
        reason: impl Into<String>,
    ) -> ParleyResult<Vec<MessageDraft>> {
        let reason = reason.into();
        warn!(conversation = %self.id, agent = %agent, reason = %reason, "Removing unresponsive agent from rotation");
        self.removed.insert(agent.clone());
        self.missed.remove(agent);
        self.services.bus.remove_participant(&self.id, agent).await?;

        let fault = OrchestrationFault::UnresponsiveAgent {
            agent: agent.clone(),
            reason,
        };
        let drafts = announce(&fault).into_iter().collect();
        {
            let mut record = self.handle.record.write().await;
            record.removed.push(agent.clone());
            record.faults.push(fault);
        }
        Ok(drafts)
    }

    /// Append, persist and publish drafts in order until the predicate fires
    async fn append_all(
        &mut self,
        drafts: Vec<MessageDraft>,
    ) -> ParleyResult<Option<TerminationReason>> {
        let mut queue: VecDeque<MessageDraft> = drafts.into();
        while let Some(draft) = queue.pop_front() {
            let message = self.append(draft).await?;
            for fault in faults_in(&message) {
                warn!(conversation = %self.id, fault = %fault, "Agent fault");
                self.record_fault(fault).await;
            }
            let report = self.services.bus.publish(message.clone()).await?;

            if let Some(reason) = self.predicate.after_append(&message, message.sequence) {
                self.audit_leftovers(queue).await;
                return Ok(Some(reason));
            }

            let stalled: Vec<AgentId> = report
                .timed_out()
                .filter(|agent| {
                    self.scheduler.participants().contains(agent) && !self.removed.contains(agent)
                })
                .cloned()
                .collect();
            for agent in stalled {
                queue.extend(
                    self.remove_from_rotation(&agent, "inbox stayed full past the dispatch timeout")
                        .await?,
                );
            }
        }
        Ok(None)
    }

    async fn append(&mut self, draft: MessageDraft) -> ParleyResult<Message> {
        let message = self.handle.transcript.write().await.append(draft).clone();
        self.services.transcripts.append(&message)?;
        self.handle.record.write().await.messages = message.sequence;
        debug!(
            conversation = %self.id,
            sequence = message.sequence,
            kind = %message.kind,
            sender = %message.sender,
            "Appended message"
        );
        Ok(message)
    }

    async fn last_sequence(&self) -> u64 {
        self.handle.transcript.read().await.last_sequence()
    }

    async fn record_fault(&self, fault: OrchestrationFault) {
        self.handle.record.write().await.faults.push(fault);
    }

    async fn audit(&self, submission: Submission, reason: AuditReason) {
        debug!(
            conversation = %self.id,
            agent = %submission.agent,
            correlation = %submission.correlation_id,
            reason = ?reason,
            "Submission kept out of the transcript"
        );
        self.handle.record.write().await.audit.push(AuditEntry {
            at: Utc::now(),
            agent: submission.agent,
            correlation_id: submission.correlation_id,
            reason,
            drafts: submission.drafts,
        });
    }

    /// Drafts of a submission that were cut off by termination
    async fn audit_leftovers(&self, queue: VecDeque<MessageDraft>) {
        let Some(first) = queue.front() else {
            return;
        };
        let Some(agent) = first.sender.agent().cloned() else {
            return;
        };
        let correlation = first.correlation_id.clone();
        self.audit(
            Submission::new(self.id.clone(), agent, correlation, queue.into()),
            AuditReason::AfterTermination,
        )
        .await;
    }

    /// Terminate, tear down the conversation's resources and archive it
    async fn archive(&mut self, reason: TerminationReason) -> ParleyResult<()> {
        {
            let mut record = self.handle.record.write().await;
            if record.state != ConversationState::Terminating {
                record.terminate(reason)?;
            }
            info!(
                conversation = %self.id,
                reason = ?record.reason,
                turns = record.turns,
                messages = record.messages,
                "Conversation terminating"
            );
        }

        let mut first_error: Option<ParleyError> = None;
        if let Err(error) = self.services.bus.seal_conversation(&self.id).await {
            first_error.get_or_insert(error.into());
        }
        while let Ok(submission) = self.submissions.try_recv() {
            self.audit(submission, AuditReason::AfterTermination).await;
        }
        match self
            .services
            .memory
            .drop_scope(&MemoryScope::Shared(self.id.clone()))
        {
            Ok(dropped) => debug!(conversation = %self.id, dropped, "Dropped shared memory scope"),
            Err(error) => {
                warn!(conversation = %self.id, error = %error, "Could not drop shared memory scope");
                first_error.get_or_insert(error.into());
            }
        }
        let cancelled = self.services.gateway.cancel_conversation(&self.id);
        if cancelled > 0 {
            debug!(conversation = %self.id, cancelled, "Cancelled pending tool calls");
        }
        for agent in self.services.registry.release_scope(&self.id) {
            self.services.bus.unregister_agent(&agent).await;
            self.services.gateway.cancel_requester(&agent);
            if let Err(error) = self
                .services
                .memory
                .drop_scope(&MemoryScope::Private(agent.clone()))
            {
                warn!(conversation = %self.id, agent = %agent, error = %error, "Could not drop private memory scope");
                first_error.get_or_insert(error.into());
            }
        }

        {
            let mut record = self.handle.record.write().await;
            record.transition(ConversationState::Archived)?;
            self.services.transcripts.save_record(&record)?;
        }
        info!(conversation = %self.id, "Conversation archived");
        first_error.map_or(Ok(()), Err)
    }
}

/// Transcript announcement for a fault, if the fault has one
fn announce(fault: &OrchestrationFault) -> Option<MessageDraft> {
    fault.control_signal().map(|signal| {
        MessageDraft::control(Recipients::Broadcast, CorrelationId::generate(), signal)
    })
}

/// Faults an agent reported about itself in a transcript message
fn faults_in(message: &Message) -> Vec<OrchestrationFault> {
    let Some(sender) = message.sender_agent() else {
        return Vec::new();
    };
    match (&message.kind, &message.payload) {
        (MessageKind::Control, Payload::Control(ControlSignal::AgentError { agent, reason }))
            if agent == sender =>
        {
            vec![OrchestrationFault::AgentFault {
                agent: agent.clone(),
                reason: reason.clone(),
            }]
        }
        (MessageKind::ToolResult, Payload::Json(value))
            if value["result"]["status"] == "failure" =>
        {
            let tool = value["tool"].as_str().and_then(|t| ToolName::parse(t).ok());
            let error = serde_json::from_value::<ToolError>(value["result"]["value"].clone()).ok();
            match (tool, error) {
                (Some(tool), Some(error)) => vec![OrchestrationFault::ToolFailure {
                    agent: sender.clone(),
                    tool,
                    error,
                }],
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::{AgentDescriptor, ConversationSpec, MemoryKey, TurnPolicy};
    use parley_memory::{InMemoryStore, InMemoryTranscriptStore};
    use parley_mesh::{AgentInbox, BusConfig, LocalBus};
    use parley_tools::{GatewayConfig, ToolRegistry};
    use serde_json::json;

    fn agent(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    /// How a hand-driven test agent answers
    #[derive(Clone, Copy)]
    enum Style {
        Answer,
        StaleFirst,
        Silent,
    }

    struct Harness {
        bus: Arc<LocalBus>,
        services: Services,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Arc::new(LocalBus::new(BusConfig::default()).unwrap());
            let services = Services {
                registry: Arc::new(AgentRegistry::new()),
                bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
                memory: Arc::new(InMemoryStore::new()),
                transcripts: Arc::new(InMemoryTranscriptStore::new()),
                gateway: Arc::new(ToolGateway::new(
                    Arc::new(ToolRegistry::new()),
                    GatewayConfig::default(),
                )),
            };
            Self { bus, services }
        }

        async fn join(&self, descriptor: AgentDescriptor) -> AgentInbox {
            let inbox = self.bus.subscribe_agent(&descriptor.id).await.unwrap();
            self.services.registry.register(descriptor);
            inbox
        }

        /// Answer turn grants in `style`; answer selection requests with
        /// `pick` when given
        async fn spawn(&self, id: &str, style: Style, pick: Option<&str>) {
            let me = agent(id);
            let mut descriptor = AgentDescriptor::new(me.clone());
            if pick.is_some() {
                descriptor = descriptor.with_capability(parley_core::COORDINATOR_TAG);
            }
            let mut inbox = self.join(descriptor).await;
            let pick = pick.map(agent);
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move {
                while let Some(message) = inbox.next().await {
                    let reply = match message.control() {
                        Some(ControlSignal::TurnGrant { turn }) => MessageDraft::from_agent(
                            me.clone(),
                            MessageKind::Response,
                            message.correlation_id.clone(),
                            format!("{} on turn {}", me, turn),
                        ),
                        Some(ControlSignal::SelectSpeaker { .. }) => match &pick {
                            Some(choice) => MessageDraft::from_agent(
                                me.clone(),
                                MessageKind::Control,
                                message.correlation_id.clone(),
                                ControlSignal::SpeakerSelected {
                                    agent: choice.clone(),
                                },
                            ),
                            None => continue,
                        },
                        _ => continue,
                    };
                    let conv = message.conversation_id.clone();
                    match style {
                        Style::Silent => continue,
                        Style::StaleFirst => {
                            let stale = Submission::new(
                                conv.clone(),
                                me.clone(),
                                CorrelationId::generate(),
                                vec![reply.clone()],
                            );
                            let _ = bus.submit(stale).await;
                        }
                        Style::Answer => {}
                    }
                    let submission =
                        Submission::new(conv, me.clone(), message.correlation_id.clone(), vec![reply]);
                    let _ = bus.submit(submission).await;
                }
            });
        }

        async fn start(
            &self,
            spec: ConversationSpec,
            config: OrchestratorConfig,
        ) -> Arc<ConversationHandle> {
            let record = ConversationRecord::new(ConversationId::generate(), spec);
            let (handle, _task) = launch(record, config, self.services.clone()).await.unwrap();
            handle
        }
    }

    fn speakers(transcript: &Transcript) -> Vec<String> {
        transcript
            .messages()
            .iter()
            .map(|m| m.sender.to_string())
            .collect()
    }

    fn signals(transcript: &Transcript) -> Vec<&'static str> {
        transcript
            .messages()
            .iter()
            .filter_map(|m| m.control().map(ControlSignal::name))
            .collect()
    }

    fn fast() -> OrchestratorConfig {
        OrchestratorConfig {
            turn_timeout: Duration::from_millis(50),
            selection_timeout: Duration::from_millis(50),
            max_consecutive_timeouts: 2,
        }
    }

    #[tokio::test]
    async fn test_stale_submissions_are_audited() {
        let harness = Harness::new();
        harness.spawn("a", Style::StaleFirst, None).await;
        let spec = ConversationSpec::new(vec![agent("a")]).with_max_messages(2);
        let handle = harness.start(spec, OrchestratorConfig::default()).await;

        let record = handle.wait().await.unwrap();
        assert_eq!(record.state, ConversationState::Archived);
        assert_eq!(record.reason, Some(TerminationReason::MaxMessages));
        assert_eq!(handle.transcript().await.len(), 2);
        assert!(record.audit.len() >= 2);
        assert!(
            record
                .audit
                .iter()
                .all(|entry| entry.reason == AuditReason::StaleCorrelation)
        );
    }

    #[tokio::test]
    async fn test_silent_speaker_is_removed_then_deadlock() {
        let harness = Harness::new();
        harness.spawn("a", Style::Silent, None).await;
        let spec = ConversationSpec::new(vec![agent("a")]).with_max_turns(10);
        let handle = harness.start(spec, fast()).await;

        let record = handle.wait().await.unwrap();
        assert_eq!(record.reason, Some(TerminationReason::Deadlock));
        assert_eq!(record.removed, vec![agent("a")]);
        assert_eq!(record.turns, 2);
        let transcript = handle.transcript().await;
        assert_eq!(
            signals(&transcript),
            vec!["delivery_timeout", "delivery_timeout", "unresponsive"]
        );
        assert!(matches!(
            record.faults.last(),
            Some(OrchestrationFault::OrchestratorDeadlock { .. })
        ));
    }

    #[tokio::test]
    async fn test_external_terminate_interrupts_turn_wait() {
        let harness = Harness::new();
        harness.spawn("a", Style::Silent, None).await;
        let spec = ConversationSpec::new(vec![agent("a")]);
        let config = OrchestratorConfig {
            turn_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let handle = harness.start(spec, config).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.terminate());
        assert!(!handle.terminate());
        let record = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.reason, Some(TerminationReason::External));
        assert!(handle.transcript().await.is_empty());
        assert!(!handle.terminate());
    }

    #[tokio::test]
    async fn test_speaker_deregistered_mid_turn_is_skipped_at_once() {
        let harness = Harness::new();
        harness.spawn("a", Style::Silent, None).await;
        harness.spawn("b", Style::Answer, None).await;
        let spec = ConversationSpec::new(vec![agent("a"), agent("b")]).with_max_turns(2);
        let config = OrchestratorConfig {
            turn_timeout: Duration::from_secs(2),
            ..fast()
        };
        let handle = harness.start(spec, config).await;

        // a holds turn 1 and never answers
        tokio::time::sleep(Duration::from_millis(50)).await;
        let left = Instant::now();
        harness.services.registry.deregister(&agent("a")).unwrap();
        harness.bus.unregister_agent(&agent("a")).await;

        let record = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(left.elapsed() < Duration::from_secs(1));
        assert_eq!(record.reason, Some(TerminationReason::MaxTurns));
        assert_eq!(record.turns, 2);
        assert!(record.faults.is_empty());
        let transcript = handle.transcript().await;
        assert!(signals(&transcript).is_empty());
        assert_eq!(speakers(&transcript), vec!["b"]);
    }

    #[tokio::test]
    async fn test_dynamic_selection_honors_coordinator() {
        let harness = Harness::new();
        harness.spawn("lead", Style::Answer, Some("b")).await;
        harness.spawn("b", Style::Answer, None).await;
        let spec = ConversationSpec::new(vec![agent("lead"), agent("b")])
            .with_policy(TurnPolicy::Dynamic {
                coordinator: agent("lead"),
            })
            .with_max_turns(2);
        let handle = harness.start(spec, fast()).await;

        let record = handle.wait().await.unwrap();
        assert_eq!(record.reason, Some(TerminationReason::MaxTurns));
        let transcript = handle.transcript().await;
        assert_eq!(speakers(&transcript), vec!["b", "b"]);
        // selection exchanges stay out of the transcript
        assert!(signals(&transcript).is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_selection_falls_back_to_round_robin() {
        let harness = Harness::new();
        // a coordinator that never answers selection requests
        harness.spawn("lead", Style::Answer, None).await;
        harness
            .services
            .registry
            .register(AgentDescriptor::new(agent("lead")).with_capability(parley_core::COORDINATOR_TAG));
        harness.spawn("b", Style::Answer, None).await;
        let spec = ConversationSpec::new(vec![agent("lead"), agent("b")])
            .with_policy(TurnPolicy::Dynamic {
                coordinator: agent("lead"),
            })
            .with_max_turns(2);
        let handle = harness.start(spec, fast()).await;

        let record = handle.wait().await.unwrap();
        assert_eq!(speakers(&handle.transcript().await), vec!["lead", "b"]);
        assert!(record.faults.is_empty());
    }

    #[tokio::test]
    async fn test_archival_tears_down_scope() {
        let harness = Harness::new();
        harness.spawn("a", Style::Answer, None).await;
        let conv = ConversationId::generate();
        harness
            .services
            .registry
            .register(AgentDescriptor::new(agent("temp")).scoped_to(conv.clone()));
        let _temp_inbox = harness.bus.subscribe_agent(&agent("temp")).await.unwrap();
        harness
            .services
            .memory
            .write(&MemoryScope::Shared(conv.clone()), &MemoryKey::new("notes").unwrap(), json!(1), &agent("a"))
            .unwrap();
        for owner in ["temp", "a"] {
            harness
                .services
                .memory
                .write(&MemoryScope::Private(agent(owner)), &MemoryKey::new("scratch").unwrap(), json!(2), &agent(owner))
                .unwrap();
        }

        let record = ConversationRecord::new(conv.clone(), ConversationSpec::new(vec![agent("a")]).with_max_turns(1));
        let (handle, _task) = launch(record, OrchestratorConfig::default(), harness.services.clone())
            .await
            .unwrap();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.reason, Some(TerminationReason::MaxTurns));
        assert!(!harness.services.registry.contains(&agent("temp")));
        assert!(!harness.bus.is_registered(&agent("temp")));
        assert!(harness.services.registry.contains(&agent("a")));
        assert!(
            harness
                .services
                .memory
                .read(&MemoryScope::Shared(conv.clone()), &MemoryKey::new("notes").unwrap())
                .unwrap()
                .is_none()
        );
        // released agents lose their private scope, session agents keep theirs
        let scratch = MemoryKey::new("scratch").unwrap();
        let private = |owner: &str| {
            harness
                .services
                .memory
                .read(&MemoryScope::Private(agent(owner)), &scratch)
                .unwrap()
        };
        assert!(private("temp").is_none());
        assert!(private("a").is_some());
        let stored = harness.services.transcripts.load_record(&conv).unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::Archived);
        assert_eq!(harness.services.transcripts.load(&conv).unwrap().len(), 1);
        assert!(matches!(
            harness
                .bus
                .submit(Submission::new(conv, agent("a"), CorrelationId::generate(), vec![]))
                .await,
            Err(MeshError::ConversationSealed(_))
        ));
    }

    #[test]
    fn test_faults_from_agent_messages() {
        let conv = ConversationId::generate();
        let corr = CorrelationId::generate();
        let error = MessageDraft::from_agent(
            agent("a"),
            MessageKind::Control,
            corr.clone(),
            ControlSignal::AgentError {
                agent: agent("a"),
                reason: "backend down".into(),
            },
        )
        .sequence(conv.clone(), 1);
        assert!(matches!(
            faults_in(&error).as_slice(),
            [OrchestrationFault::AgentFault { reason, .. }] if reason == "backend down"
        ));

        let failed = MessageDraft::from_agent(
            agent("b"),
            MessageKind::ToolResult,
            corr.clone(),
            json!({
                "call_id": "call-1",
                "tool": "search",
                "result": {"status": "failure", "value": {"kind": "permanent", "message": "gone"}},
            }),
        )
        .sequence(conv.clone(), 2);
        assert!(matches!(
            faults_in(&failed).as_slice(),
            [OrchestrationFault::ToolFailure { error: ToolError::Permanent { .. }, .. }]
        ));

        let ok = MessageDraft::from_agent(
            agent("b"),
            MessageKind::ToolResult,
            corr,
            json!({"tool": "search", "result": {"status": "success", "value": 1}}),
        )
        .sequence(conv, 3);
        assert!(faults_in(&ok).is_empty());
    }
}
