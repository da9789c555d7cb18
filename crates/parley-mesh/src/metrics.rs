//! Metrics collection for bus operations
//!
//! Counters are global to the bus; no per-agent or per-conversation labels
//! are kept.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Snapshot of bus metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusMetrics {
    /// Transcript messages appended to conversation logs
    pub messages_published_total: u64,
    /// Successful inbox deliveries (one per recipient)
    pub deliveries_total: u64,
    /// Failed inbox deliveries
    pub delivery_failures_total: u64,
    /// Point-to-point control messages sent outside any transcript
    pub dispatches_total: u64,
    /// Agent submissions handed to orchestrators
    pub submissions_total: u64,
    /// Deliveries parked in the dead letter queue
    pub dead_lettered_total: u64,
    /// Conversations whose log is open
    pub conversations_open: usize,
    /// Per-recipient delivery latency
    pub delivery_latency_ms: LatencyStats,
}

/// Latency statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Shared, cloneable metrics collector
#[derive(Clone)]
pub struct BusMetricsCollector {
    metrics: Arc<RwLock<BusMetrics>>,
    latency_samples: Arc<RwLock<Vec<u64>>>,
    max_samples: usize,
}

impl BusMetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(BusMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::new())),
            max_samples,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(1000)
    }

    pub async fn record_publish(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.messages_published_total = metrics.messages_published_total.saturating_add(1);
    }

    pub async fn record_delivery(&self, latency: Duration) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.deliveries_total = metrics.deliveries_total.saturating_add(1);
        }
        self.record_latency(latency.as_millis() as u64).await;
    }

    pub async fn record_delivery_failure(&self, dead_lettered: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.delivery_failures_total = metrics.delivery_failures_total.saturating_add(1);
        if dead_lettered {
            metrics.dead_lettered_total = metrics.dead_lettered_total.saturating_add(1);
        }
    }

    pub async fn record_dispatch(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.dispatches_total = metrics.dispatches_total.saturating_add(1);
    }

    pub async fn record_submission(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.submissions_total = metrics.submissions_total.saturating_add(1);
    }

    pub async fn set_conversations_open(&self, open: usize) {
        self.metrics.write().await.conversations_open = open;
    }

    async fn record_latency(&self, duration_ms: u64) {
        let mut samples = self.latency_samples.write().await;
        samples.push(duration_ms);
        if samples.len() > self.max_samples {
            let drain_count = samples.len() - self.max_samples;
            samples.drain(0..drain_count);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();
        let Some(&max) = sorted.last() else {
            return;
        };
        let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)] as f64;

        let mut metrics = self.metrics.write().await;
        metrics.delivery_latency_ms = LatencyStats {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: max as f64,
        };
    }

    pub async fn snapshot(&self) -> BusMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = BusMetrics::default();
        self.latency_samples.write().await.clear();
    }
}

impl Default for BusMetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}
