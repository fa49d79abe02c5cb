//! Metrics for the session-state store
//!
//! Provides Prometheus metrics for:
//! - Procedure calls by outcome and latency
//! - Retry backoffs by kind
//! - Connection pool churn and idle size
//! - Benign insert races

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector for the session-state store
#[derive(Clone)]
pub struct StoreMetrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Procedure calls
    /// Total procedure calls by procedure and outcome
    pub calls_total: CounterVec,
    /// Procedure call duration, including retries
    pub call_duration_seconds: HistogramVec,

    // Retry engine
    /// Backoffs taken, labeled short (conflict), medium (severe) or long (first severe)
    pub backoffs_total: CounterVec,
    /// Inserts that lost a race to a concurrent insert of the same id
    pub benign_races_total: IntCounter,

    // Connection pool
    /// Connections opened against the backing store
    pub connections_opened_total: IntCounter,
    /// Idle connections closed by the scavenger or a pool clear
    pub connections_evicted_total: IntCounter,
    /// Connections dropped on return because the pool was full
    pub pool_full_total: IntCounter,
    /// Idle connections currently pooled
    pub pool_idle_connections: Gauge,
}

impl StoreMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calls_total = CounterVec::new(
            Opts::new(
                "session_state_calls_total",
                "Total number of session-state procedure calls",
            ),
            &["procedure", "outcome"],
        )?;

        let call_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "session_state_call_duration_seconds",
                "Session-state procedure call duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
            ]),
            &["procedure"],
        )?;

        let backoffs_total = CounterVec::new(
            Opts::new(
                "session_state_backoffs_total",
                "Total number of retry backoffs taken",
            ),
            &["kind"],
        )?;

        let benign_races_total = IntCounter::new(
            "session_state_benign_races_total",
            "Inserts that found the session already created",
        )?;

        let connections_opened_total = IntCounter::new(
            "session_state_connections_opened_total",
            "Connections opened against the backing store",
        )?;

        let connections_evicted_total = IntCounter::new(
            "session_state_connections_evicted_total",
            "Idle connections closed by the scavenger or a pool clear",
        )?;

        let pool_full_total = IntCounter::new(
            "session_state_pool_full_total",
            "Connections dropped on return because the pool was full",
        )?;

        let pool_idle_connections = Gauge::with_opts(Opts::new(
            "session_state_pool_idle_connections",
            "Number of idle connections in the pool",
        ))?;

        // Register all metrics
        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(call_duration_seconds.clone()))?;
        registry.register(Box::new(backoffs_total.clone()))?;
        registry.register(Box::new(benign_races_total.clone()))?;
        registry.register(Box::new(connections_opened_total.clone()))?;
        registry.register(Box::new(connections_evicted_total.clone()))?;
        registry.register(Box::new(pool_full_total.clone()))?;
        registry.register(Box::new(pool_idle_connections.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            calls_total,
            call_duration_seconds,
            backoffs_total,
            benign_races_total,
            connections_opened_total,
            connections_evicted_total,
            pool_full_total,
            pool_idle_connections,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished procedure call
    pub fn record_call(&self, procedure: &str, outcome: &str, duration: Duration) {
        self.calls_total
            .with_label_values(&[procedure, outcome])
            .inc();
        self.call_duration_seconds
            .with_label_values(&[procedure])
            .observe(duration.as_secs_f64());
    }

    /// Record a backoff before the next attempt
    pub fn record_backoff(&self, kind: &str) {
        self.backoffs_total.with_label_values(&[kind]).inc();
    }

    pub fn record_benign_race(&self) {
        self.benign_races_total.inc();
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened_total.inc();
    }

    pub fn record_evictions(&self, count: usize) {
        self.connections_evicted_total.inc_by(count as u64);
    }

    pub fn record_pool_full(&self) {
        self.pool_full_total.inc();
    }

    /// Update the idle connection gauge
    pub fn set_idle_connections(&self, idle: usize) {
        self.pool_idle_connections.set(idle as f64);
    }
}
