//! Idempotent, bounded tool invocation.
//!
//! Executions are keyed by `(tool, idempotency key)`. The first caller for a
//! key starts an execution task; every caller, including that first one,
//! then waits on the task's outcome channel for at most `call_timeout`.
//! A caller that gives up does not cancel the execution: it still finishes,
//! fills the cache and lands in the ledger, so a retry with the same key picks
//! up the finished outcome instead of running the tool again.
//!
//! Each cache entry remembers the conversations and requesters that joined
//! it. Archiving a conversation aborts the executions it alone still waits
//! on and evicts its finished keys; finished entries also expire after
//! `cache_ttl`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep, timeout};

use parley_core::{
    AgentId, ConversationId, IdempotencyKey, Tool, ToolCall, ToolCallError, ToolCallId, ToolError,
    ToolName, ToolOutcome,
};

use crate::backoff::Backoff;
use crate::error::GatewayResult;
use crate::registry::ToolRegistry;

/// Gateway timing and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long a caller waits for an outcome
    pub call_timeout: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
    /// Bound on an execution including all retries
    pub execution_ceiling: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a finished execution answers its key, counted from its start
    pub cache_ttl: Duration,
    /// Ledger entries kept per requester, oldest dropped first
    pub ledger_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(5),
            execution_ceiling: Duration::from_secs(60),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(600),
            ledger_capacity: 256,
        }
    }
}

impl GatewayConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

/// Gateway counters
#[derive(Debug, Default)]
pub struct GatewayStats {
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    caller_timeouts: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    pub executions: u64,
    pub attempts: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub caller_timeouts: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub evicted: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            caller_timeouts: self.caller_timeouts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// A finished execution, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub call_id: ToolCallId,
    pub tool: ToolName,
    pub idempotency_key: IdempotencyKey,
    pub conversation: Option<ConversationId>,
    pub arguments: Value,
    pub outcome: Result<Value, ToolError>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type CacheKey = (ToolName, IdempotencyKey);

/// A caller that joined an execution
#[derive(Debug, Clone, PartialEq, Eq)]
struct Owner {
    conversation: Option<ConversationId>,
    requester: AgentId,
}

impl Owner {
    fn of(call: &ToolCall) -> Self {
        Self {
            conversation: call.conversation.clone(),
            requester: call.requester.clone(),
        }
    }
}

struct CacheEntry {
    /// Canonical JSON of the arguments the key was first used with
    fingerprint: String,
    outcome: watch::Receiver<Option<ToolOutcome>>,
    execution: AbortHandle,
    owners: Vec<Owner>,
    started: Instant,
}

impl CacheEntry {
    fn is_pending(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        !self.is_pending() && self.started.elapsed() >= ttl
    }

    fn join(&mut self, owner: Owner) {
        if !self.owners.contains(&owner) {
            self.owners.push(owner);
        }
    }
}

/// Tool invocation gateway shared by every agent runtime in a session
pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    config: GatewayConfig,
    cache: DashMap<CacheKey, CacheEntry>,
    ledger: Arc<DashMap<AgentId, VecDeque<LedgerEntry>>>,
    stats: Arc<GatewayStats>,
}

impl ToolGateway {
    pub fn new(registry: Arc<ToolRegistry>, config: GatewayConfig) -> Self {
        Self {
            registry,
            config,
            cache: DashMap::new(),
            ledger: Arc::new(DashMap::new()),
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Executions finished on behalf of `requester`, oldest first
    pub fn ledger(&self, requester: &AgentId) -> Vec<LedgerEntry> {
        self.ledger
            .get(requester)
            .map(|entries| entries.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of idempotency keys with a live or cached execution
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    /// Executions still running
    pub fn pending(&self) -> usize {
        self.cache.iter().filter(|entry| entry.is_pending()).count()
    }

    /// Resolve `call` through the gateway
    pub async fn invoke(&self, mut call: ToolCall) -> GatewayResult<ToolCall> {
        if call.is_resolved() {
            return Err(ToolCallError::AlreadyResolved(call.id).into());
        }
        let outcome = self.execute(&call).await;
        call.resolve(outcome)?;
        Ok(call)
    }

    /// Run (or join) the execution for `call` and wait for its outcome
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(tool) = self.registry.get(&call.tool) else {
            tracing::warn!(tool = %call.tool, agent = %call.requester, "Tool not found");
            return Err(ToolError::NotFound {
                tool: call.tool.clone(),
            });
        };

        let mut receiver = self.join_or_start(call, tool)?;

        let wait = self.config.call_timeout;
        match timeout(wait, receiver.wait_for(|outcome| outcome.is_some())).await {
            Ok(Ok(outcome)) => match outcome.as_ref() {
                Some(outcome) => outcome.clone(),
                None => Err(ToolError::permanent("execution finished without an outcome")),
            },
            Ok(Err(_)) => {
                tracing::debug!(tool = %call.tool, key = %call.idempotency_key, "Execution was cancelled");
                Err(ToolError::cancelled("execution aborted"))
            }
            Err(_) => {
                self.stats.caller_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tool = %call.tool,
                    agent = %call.requester,
                    key = %call.idempotency_key,
                    waited_ms = wait.as_millis() as u64,
                    "Tool call wait timed out, execution continues detached"
                );
                Err(ToolError::Timeout {
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Abort the executions only `conversation` still waits on and evict its
    /// finished keys. Executions another caller joined keep running for that
    /// caller. Returns the number of executions aborted.
    pub fn cancel_conversation(&self, conversation: &ConversationId) -> usize {
        let cancelled = self.release(|owner| owner.conversation.as_ref() == Some(conversation));
        self.evict_expired();
        if cancelled > 0 {
            tracing::info!(conversation = %conversation, cancelled, "Cancelled pending tool executions");
        }
        cancelled
    }

    /// Abort the executions only `requester` still waits on and evict its
    /// finished keys. Returns the number of executions aborted.
    pub fn cancel_requester(&self, requester: &AgentId) -> usize {
        let cancelled = self.release(|owner| &owner.requester == requester);
        if cancelled > 0 {
            tracing::info!(agent = %requester, cancelled, "Cancelled pending tool executions");
        }
        cancelled
    }

    /// Drop finished entries older than `cache_ttl`, returning how many
    pub fn evict_expired(&self) -> usize {
        let ttl = self.config.cache_ttl;
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.is_expired(ttl));
        let evicted = before.saturating_sub(self.cache.len());
        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "Evicted expired idempotency keys");
        }
        evicted
    }

    /// Remove matching owners from every entry. An entry left without owners
    /// is evicted, and aborted first if still running.
    fn release(&self, leaving: impl Fn(&Owner) -> bool) -> usize {
        let mut cancelled = 0;
        let mut evicted = 0;
        self.cache.retain(|(tool, key), entry| {
            let before = entry.owners.len();
            entry.owners.retain(|owner| !leaving(owner));
            if entry.owners.len() == before || !entry.owners.is_empty() {
                return true;
            }
            if entry.is_pending() {
                entry.execution.abort();
                cancelled += 1;
                tracing::debug!(tool = %tool, key = %key, "Aborted tool execution");
            }
            evicted += 1;
            false
        });
        self.stats
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        cancelled
    }

    fn join_or_start(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
    ) -> Result<watch::Receiver<Option<ToolOutcome>>, ToolError> {
        let fingerprint = call.arguments.to_string();
        let key = (call.tool.clone(), call.idempotency_key.clone());
        match self.cache.entry(key) {
            Entry::Occupied(mut entry) if !entry.get().is_expired(self.config.cache_ttl) => {
                if entry.get().fingerprint != fingerprint {
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tool = %call.tool,
                        key = %call.idempotency_key,
                        "Idempotency key reused with different arguments"
                    );
                    return Err(ToolError::IdempotencyConflict {
                        key: call.idempotency_key.clone(),
                    });
                }
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tool = %call.tool, key = %call.idempotency_key, "Joined existing execution");
                entry.get_mut().join(Owner::of(call));
                Ok(entry.get().outcome.clone())
            }
            Entry::Occupied(mut entry) => {
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tool = %call.tool, key = %call.idempotency_key, "Idempotency key expired, executing again");
                let (fresh, receiver) = self.start(call, tool, fingerprint);
                entry.insert(fresh);
                Ok(receiver)
            }
            Entry::Vacant(slot) => {
                let (fresh, receiver) = self.start(call, tool, fingerprint);
                slot.insert(fresh);
                Ok(receiver)
            }
        }
    }

    fn start(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
        fingerprint: String,
    ) -> (CacheEntry, watch::Receiver<Option<ToolOutcome>>) {
        let (sender, receiver) = watch::channel(None);
        let execution = self.spawn_execution(call, tool, sender);
        let entry = CacheEntry {
            fingerprint,
            outcome: receiver.clone(),
            execution,
            owners: vec![Owner::of(call)],
            started: Instant::now(),
        };
        (entry, receiver)
    }

    fn spawn_execution(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
        sender: watch::Sender<Option<ToolOutcome>>,
    ) -> AbortHandle {
        self.stats.executions.fetch_add(1, Ordering::Relaxed);
        let config = self.config;
        let stats = Arc::clone(&self.stats);
        let ledger = Arc::clone(&self.ledger);
        let call = call.clone();

        let task = tokio::spawn(async move {
            let started_at = Utc::now();
            let (outcome, attempts) = run_with_retries(tool.as_ref(), &call, &config, &stats).await;
            if outcome.is_err() {
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                tool = %call.tool,
                key = %call.idempotency_key,
                attempts,
                success = outcome.is_ok(),
                "Tool execution finished"
            );
            {
                let mut entries = ledger.entry(call.requester.clone()).or_default();
                entries.push_back(LedgerEntry {
                    call_id: call.id.clone(),
                    tool: call.tool.clone(),
                    idempotency_key: call.idempotency_key.clone(),
                    conversation: call.conversation.clone(),
                    arguments: call.arguments.clone(),
                    outcome: outcome.clone(),
                    attempts,
                    started_at,
                    finished_at: Utc::now(),
                });
                while entries.len() > config.ledger_capacity {
                    entries.pop_front();
                }
            }
            // Nobody may be waiting any more; the cache keeps its own receiver.
            let _ = sender.send(Some(outcome));
        });
        task.abort_handle()
    }
}

/// Attempt the tool until it succeeds, fails for good, or runs out of budget
async fn run_with_retries(
    tool: &dyn Tool,
    call: &ToolCall,
    config: &GatewayConfig,
    stats: &GatewayStats,
) -> (ToolOutcome, u32) {
    let deadline = Instant::now() + config.execution_ceiling;
    let backoff = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return (
                Err(ToolError::Timeout {
                    waited_ms: config.execution_ceiling.as_millis() as u64,
                }),
                attempt,
            );
        }
        let bound = config.attempt_timeout.min(remaining);
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        let result = match timeout(bound, tool.execute(&call.arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                waited_ms: bound.as_millis() as u64,
            }),
        };
        attempt += 1;

        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(error) if error.is_retryable() && attempt <= config.max_retries => {
                let delay = backoff
                    .delay(attempt - 1)
                    .min(deadline.saturating_duration_since(Instant::now()));
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tool = %call.tool,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying tool after transient failure"
                );
                sleep(delay).await;
            }
            Err(error) => return (Err(error), attempt),
        }
    }
}
