//! Backpressure tracking for agent inboxes
//!
//! Records inbox depth on every delivery and classifies each agent's inbox
//! as normal, warning or critical. Delivery itself is bounded by the inbox
//! capacity; the monitor only reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parley_core::AgentId;
use tracing::{debug, warn};

/// Backpressure configuration, as fractions of inbox capacity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureConfig {
    /// Fill ratio at which an inbox is reported as `Warning`
    pub warning_ratio: f64,
    /// Fill ratio at which an inbox is reported as `Critical`
    pub critical_ratio: f64,
    /// Enable backpressure monitoring
    pub enabled: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            warning_ratio: 0.75,
            critical_ratio: 1.0,
            enabled: true,
        }
    }
}

/// Backpressure signal for one inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureSignal {
    /// Normal operation
    Normal,
    /// Approaching capacity
    Warning,
    /// Full: deliveries to this agent block
    Critical,
}

/// Backpressure statistics
#[derive(Debug, Clone, Default)]
pub struct BackpressureStats {
    /// Deepest inbox observed
    pub max_depth: usize,
    /// Number of times the warning ratio was reached
    pub warning_count: u64,
    /// Number of times an inbox was found full
    pub critical_count: u64,
    /// Agents currently above the warning ratio
    pub pressured_agents: Vec<AgentId>,
}

#[derive(Debug, Clone, Copy)]
struct InboxPressure {
    depth: usize,
    signal: BackpressureSignal,
    checked_at: Instant,
}

/// Backpressure monitor for agent inboxes
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    inboxes: DashMap<AgentId, InboxPressure>,
    max_depth: AtomicU64,
    warning_count: AtomicU64,
    critical_count: AtomicU64,
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            inboxes: DashMap::new(),
            max_depth: AtomicU64::new(0),
            warning_count: AtomicU64::new(0),
            critical_count: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BackpressureConfig::default())
    }

    /// Update an inbox's depth and return its signal
    pub fn update_depth(&self, agent: &AgentId, depth: usize, capacity: usize) -> BackpressureSignal {
        if !self.config.enabled || capacity == 0 {
            return BackpressureSignal::Normal;
        }

        self.max_depth.fetch_max(depth as u64, Ordering::Relaxed);
        let ratio = depth as f64 / capacity as f64;
        let signal = if ratio >= self.config.critical_ratio {
            self.critical_count.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %agent, depth, capacity, "Backpressure CRITICAL: inbox full");
            BackpressureSignal::Critical
        } else if ratio >= self.config.warning_ratio {
            self.warning_count.fetch_add(1, Ordering::Relaxed);
            debug!(agent = %agent, depth, capacity, "Backpressure WARNING");
            BackpressureSignal::Warning
        } else {
            BackpressureSignal::Normal
        };

        self.inboxes.insert(
            agent.clone(),
            InboxPressure {
                depth,
                signal,
                checked_at: Instant::now(),
            },
        );
        signal
    }

    /// Last signal recorded for `agent`
    pub fn signal(&self, agent: &AgentId) -> BackpressureSignal {
        self.inboxes
            .get(agent)
            .map(|p| p.signal)
            .unwrap_or(BackpressureSignal::Normal)
    }

    /// Last recorded depth and how long ago it was measured
    pub fn depth(&self, agent: &AgentId) -> Option<(usize, std::time::Duration)> {
        self.inboxes
            .get(agent)
            .map(|p| (p.depth, p.checked_at.elapsed()))
    }

    /// Stop tracking an agent
    pub fn forget(&self, agent: &AgentId) {
        self.inboxes.remove(agent);
    }

    pub fn stats(&self) -> BackpressureStats {
        let mut pressured_agents: Vec<AgentId> = self
            .inboxes
            .iter()
            .filter(|p| p.signal != BackpressureSignal::Normal)
            .map(|p| p.key().clone())
            .collect();
        pressured_agents.sort();
        BackpressureStats {
            max_depth: self.max_depth.load(Ordering::Relaxed) as usize,
            warning_count: self.warning_count.load(Ordering::Relaxed),
            critical_count: self.critical_count.load(Ordering::Relaxed),
            pressured_agents,
        }
    }
}
