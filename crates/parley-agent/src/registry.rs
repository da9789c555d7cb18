//! Registry of live agents
//!
//! The registry owns agent descriptors; conversations refer to agents by id
//! only and ask the registry whether an id is still eligible. Every removal
//! bumps a departure counter that waiting conversations can watch.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_core::{AgentDescriptor, AgentId, AgentLifetime, ConversationId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// A registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub descriptor: AgentDescriptor,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegisteredAgent {
    pub fn id(&self) -> &AgentId {
        &self.descriptor.id
    }
}

/// Whether a registration created an entry or refreshed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
}

/// Concurrent agent registry with per-entry locking
#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, RegisteredAgent>,
    departures: watch::Sender<u64>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self {
            agents: DashMap::new(),
            departures: watch::channel(0).0,
        }
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter bumped after every deregistration or scope release
    pub fn departures(&self) -> watch::Receiver<u64> {
        self.departures.subscribe()
    }

    fn departed(&self) {
        self.departures.send_modify(|count| *count += 1);
    }

    /// Register an agent. Re-registering an id replaces its capabilities,
    /// priority and lifetime but keeps its registration time.
    pub fn register(&self, descriptor: AgentDescriptor) -> Registration {
        let now = Utc::now();
        match self.agents.entry(descriptor.id.clone()) {
            Entry::Occupied(mut entry) => {
                let agent = entry.get_mut();
                agent.descriptor = descriptor;
                agent.updated_at = now;
                debug!(agent = %agent.id(), "Refreshed agent registration");
                Registration::Updated
            }
            Entry::Vacant(slot) => {
                info!(agent = %descriptor.id, capabilities = ?descriptor.capabilities, "Registered agent");
                slot.insert(RegisteredAgent {
                    descriptor,
                    registered_at: now,
                    updated_at: now,
                });
                Registration::Created
            }
        }
    }

    pub fn deregister(&self, id: &AgentId) -> Option<RegisteredAgent> {
        let removed = self.agents.remove(id).map(|(_, agent)| agent);
        if removed.is_some() {
            info!(agent = %id, "Deregistered agent");
            self.departed();
        }
        removed
    }

    pub fn get(&self, id: &AgentId) -> Option<RegisteredAgent> {
        self.agents.get(id).map(|agent| agent.value().clone())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Priority used by the priority turn policy; unknown agents rank lowest
    pub fn priority(&self, id: &AgentId) -> i32 {
        self.agents
            .get(id)
            .map(|agent| agent.descriptor.priority)
            .unwrap_or(i32::MIN)
    }

    /// Ids of agents carrying capability `tag`
    pub fn find_by_capability(&self, tag: &str) -> BTreeSet<AgentId> {
        self.agents
            .iter()
            .filter(|agent| agent.descriptor.has_capability(tag))
            .map(|agent| agent.key().clone())
            .collect()
    }

    /// All registered agents, ordered by id
    pub fn list(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<RegisteredAgent> =
            self.agents.iter().map(|agent| agent.value().clone()).collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    /// Deregister every agent scoped to `conversation`, returning their ids
    pub fn release_scope(&self, conversation: &ConversationId) -> Vec<AgentId> {
        let scoped: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|agent| {
                matches!(&agent.descriptor.lifetime, AgentLifetime::Conversation(c) if c == conversation)
            })
            .map(|agent| agent.key().clone())
            .collect();
        let mut released = Vec::with_capacity(scoped.len());
        for id in scoped {
            // Re-check under the entry lock: the agent may have been re-registered
            // with another lifetime in between.
            let removed = self.agents.remove_if(&id, |_, agent| {
                matches!(&agent.descriptor.lifetime, AgentLifetime::Conversation(c) if c == conversation)
            });
            if removed.is_some() {
                released.push(id);
            }
        }
        if !released.is_empty() {
            info!(conversation = %conversation, released = released.len(), "Released conversation-scoped agents");
            self.departed();
        }
        released.sort();
        released
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor::new(AgentId::parse(id).unwrap())
    }

    #[test]
    fn test_registration_is_idempotent() {
        let registry = AgentRegistry::new();
        assert_eq!(
            registry.register(descriptor("a").with_capability("search")),
            Registration::Created
        );
        let first = registry.get(&AgentId::parse("a").unwrap()).unwrap();

        assert_eq!(
            registry.register(descriptor("a").with_capability("math").with_priority(5)),
            Registration::Updated
        );
        let second = registry.get(first.id()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.descriptor.priority, 5);
        assert!(second.descriptor.has_capability("math"));
        assert!(!second.descriptor.has_capability("search"));
    }

    #[test]
    fn test_find_by_capability_and_list() {
        let registry = AgentRegistry::new();
        registry.register(descriptor("c").with_capability("search"));
        registry.register(descriptor("a").with_capability("search"));
        registry.register(descriptor("b"));

        let found: Vec<String> = registry
            .find_by_capability("search")
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(found, vec!["a", "c"]);

        let listed: Vec<String> = registry.list().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(listed, vec!["a", "b", "c"]);
        assert_eq!(registry.priority(&AgentId::parse("zzz").unwrap()), i32::MIN);
    }

    #[test]
    fn test_release_scope() {
        let registry = AgentRegistry::new();
        let conv = ConversationId::generate();
        registry.register(descriptor("scoped").scoped_to(conv.clone()));
        registry.register(descriptor("other").scoped_to(ConversationId::generate()));
        registry.register(descriptor("session"));

        let released = registry.release_scope(&conv);
        assert_eq!(released, vec![AgentId::parse("scoped").unwrap()]);
        assert_eq!(registry.len(), 2);
        assert!(registry.release_scope(&conv).is_empty());
    }

    #[test]
    fn test_deregister() {
        let registry = AgentRegistry::new();
        let id = AgentId::parse("a").unwrap();
        registry.register(descriptor("a"));
        assert!(registry.deregister(&id).is_some());
        assert!(registry.deregister(&id).is_none());
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_departures_wake_watchers() {
        let registry = std::sync::Arc::new(AgentRegistry::new());
        registry.register(descriptor("a"));
        registry.register(descriptor("b"));
        let mut departures = registry.departures();

        let watcher = {
            let registry = std::sync::Arc::clone(&registry);
            let id = AgentId::parse("a").unwrap();
            tokio::spawn(async move {
                let seen = departures
                    .wait_for(|_| !registry.contains(&id))
                    .await
                    .map(|count| *count);
                seen
            })
        };
        registry.deregister(&AgentId::parse("b").unwrap());
        registry.deregister(&AgentId::parse("a").unwrap());
        let seen = tokio::time::timeout(std::time::Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(seen >= 1);

        // a repeated deregistration is not a departure
        let before = *registry.departures().borrow();
        registry.deregister(&AgentId::parse("a").unwrap());
        assert_eq!(*registry.departures().borrow(), before);
    }
}
