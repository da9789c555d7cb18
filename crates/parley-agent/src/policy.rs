//! Turn-taking policies
//!
//! The scheduler only decides among the participants the orchestrator marks
//! as eligible (registered and still in the rotation). Dynamic selection is
//! driven by the orchestrator over the bus; the scheduler supplies its
//! round-robin fallback and tracks the chosen speaker.

use std::collections::HashSet;

use parley_core::{AgentId, TurnPolicy};

/// Per-conversation speaker scheduler
#[derive(Debug, Clone)]
pub struct TurnScheduler {
    policy: TurnPolicy,
    participants: Vec<AgentId>,
    /// Index in `participants` where the next round-robin search starts
    cursor: usize,
    /// Speakers of the current priority round
    spoken: HashSet<AgentId>,
}

impl TurnScheduler {
    pub fn new(policy: TurnPolicy, participants: Vec<AgentId>) -> Self {
        Self {
            policy,
            participants,
            cursor: 0,
            spoken: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &TurnPolicy {
        &self.policy
    }

    pub fn participants(&self) -> &[AgentId] {
        &self.participants
    }

    /// The coordinator of a dynamic policy
    pub fn coordinator(&self) -> Option<&AgentId> {
        match &self.policy {
            TurnPolicy::Dynamic { coordinator } => Some(coordinator),
            _ => None,
        }
    }

    /// Eligible participants, in participant order
    pub fn eligible(&self, is_eligible: impl Fn(&AgentId) -> bool) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|p| is_eligible(p))
            .cloned()
            .collect()
    }

    /// Pick the next speaker among `eligible` under a round-robin or priority
    /// policy. A dynamic policy falls back to round-robin here.
    pub fn next_speaker(
        &mut self,
        eligible: &[AgentId],
        priority: impl Fn(&AgentId) -> i32,
    ) -> Option<AgentId> {
        match self.policy {
            TurnPolicy::Priority => self.next_by_priority(eligible, priority),
            TurnPolicy::RoundRobin | TurnPolicy::Dynamic { .. } => self.next_round_robin(eligible),
        }
    }

    /// Deterministic cyclic order over participants, skipping ineligible ones
    pub fn next_round_robin(&mut self, eligible: &[AgentId]) -> Option<AgentId> {
        let n = self.participants.len();
        let speaker = (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&i| eligible.contains(&self.participants[i]))
            .map(|i| self.participants[i].clone())?;
        self.record(&speaker);
        Some(speaker)
    }

    fn next_by_priority(
        &mut self,
        eligible: &[AgentId],
        priority: impl Fn(&AgentId) -> i32,
    ) -> Option<AgentId> {
        let mut pending: Vec<&AgentId> = self
            .participants
            .iter()
            .filter(|p| eligible.contains(p) && !self.spoken.contains(*p))
            .collect();
        if pending.is_empty() {
            self.spoken.clear();
            pending = self
                .participants
                .iter()
                .filter(|p| eligible.contains(p))
                .collect();
        }

        // Strictly greater keeps the earliest participant on ties.
        let mut best: Option<(&AgentId, i32)> = None;
        for candidate in pending {
            let rank = priority(candidate);
            if best.is_none_or(|(_, top)| rank > top) {
                best = Some((candidate, rank));
            }
        }
        let speaker = best.map(|(id, _)| id.clone())?;
        self.record(&speaker);
        Some(speaker)
    }

    /// Note that `speaker` takes the turn, however it was chosen
    pub fn record(&mut self, speaker: &AgentId) {
        if let Some(i) = self.participants.iter().position(|p| p == speaker) {
            self.cursor = (i + 1) % self.participants.len();
        }
        self.spoken.insert(speaker.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|n| AgentId::parse(n).unwrap()).collect()
    }

    fn names(speakers: &[AgentId]) -> Vec<String> {
        speakers.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let participants = ids(&["a", "b", "c"]);
        let mut scheduler = TurnScheduler::new(TurnPolicy::RoundRobin, participants.clone());
        let speakers: Vec<AgentId> = (0..7)
            .map(|_| scheduler.next_speaker(&participants, |_| 0).unwrap())
            .collect();
        assert_eq!(names(&speakers), vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_skips_ineligible() {
        let participants = ids(&["a", "b", "c"]);
        let mut scheduler = TurnScheduler::new(TurnPolicy::RoundRobin, participants);
        let without_b = ids(&["a", "c"]);
        let speakers: Vec<AgentId> = (0..4)
            .map(|_| scheduler.next_speaker(&without_b, |_| 0).unwrap())
            .collect();
        assert_eq!(names(&speakers), vec!["a", "c", "a", "c"]);
        assert!(scheduler.next_speaker(&[], |_| 0).is_none());
    }

    #[test]
    fn test_priority_rounds() {
        let participants = ids(&["low", "high", "mid", "high2"]);
        let priorities: HashMap<String, i32> = [("low", 0), ("high", 10), ("mid", 5), ("high2", 10)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let rank = |id: &AgentId| priorities[id.as_str()];
        let mut scheduler = TurnScheduler::new(TurnPolicy::Priority, participants.clone());

        let speakers: Vec<AgentId> = (0..5)
            .map(|_| scheduler.next_speaker(&participants, rank).unwrap())
            .collect();
        // Ties go to the earlier participant; a new round starts after all spoke.
        assert_eq!(names(&speakers), vec!["high", "high2", "mid", "low", "high"]);
    }

    #[test]
    fn test_dynamic_fallback_follows_recorded_speaker() {
        let participants = ids(&["coord", "a", "b"]);
        let mut scheduler = TurnScheduler::new(
            TurnPolicy::Dynamic {
                coordinator: participants[0].clone(),
            },
            participants.clone(),
        );
        assert_eq!(scheduler.coordinator(), Some(&participants[0]));

        scheduler.record(&participants[1]);
        assert_eq!(
            scheduler.next_speaker(&participants, |_| 0),
            Some(participants[2].clone())
        );
    }
}
