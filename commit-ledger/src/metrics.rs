//! Metrics collection for observability
//!
//! Prometheus metrics on a registry owned by each ledger, so several ledgers
//! can live in one process.
//!
//! # Metrics
//!
//! - `ledger_mutations_accepted_total{operation}` - Committed mutations
//! - `ledger_mutations_rejected_total{operation}` - Rejected mutations
//! - `ledger_proofs_served_total` - Completed proofs returned to callers
//! - `ledger_rounds_committed_total` - Round commits
//! - `ledger_tree_build_duration_seconds` - Solvency tree build latency

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Committed mutations per operation
    pub mutations_accepted: IntCounterVec,

    /// Rejected mutations per operation
    pub mutations_rejected: IntCounterVec,

    /// Proofs served
    pub proofs_served: IntCounter,

    /// Round commits
    pub rounds_committed: IntCounter,

    /// Tree build duration histogram
    pub tree_build_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_accepted = IntCounterVec::new(
            Opts::new("ledger_mutations_accepted_total", "Committed ledger mutations"),
            &["operation"],
        )?;
        registry.register(Box::new(mutations_accepted.clone()))?;

        let mutations_rejected = IntCounterVec::new(
            Opts::new("ledger_mutations_rejected_total", "Rejected ledger mutations"),
            &["operation"],
        )?;
        registry.register(Box::new(mutations_rejected.clone()))?;

        let proofs_served = IntCounter::new("ledger_proofs_served_total", "Completed proofs served")?;
        registry.register(Box::new(proofs_served.clone()))?;

        let rounds_committed = IntCounter::new("ledger_rounds_committed_total", "Round commits")?;
        registry.register(Box::new(rounds_committed.clone()))?;

        let tree_build_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_tree_build_duration_seconds",
                "Histogram of solvency tree build latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(tree_build_duration.clone()))?;

        Ok(Self {
            mutations_accepted,
            mutations_rejected,
            proofs_served,
            rounds_committed,
            tree_build_duration,
            registry,
        })
    }

    /// Record the outcome of a mutation
    pub fn record_mutation(&self, operation: &str, accepted: bool) {
        let counter = if accepted {
            &self.mutations_accepted
        } else {
            &self.mutations_rejected
        };
        counter.with_label_values(&[operation]).inc();
    }

    /// Record a served proof
    pub fn record_proof_served(&self) {
        self.proofs_served.inc();
    }

    /// Record a round commit
    pub fn record_round_committed(&self) {
        self.rounds_committed.inc();
    }

    /// Record tree build duration
    pub fn record_tree_build(&self, duration_seconds: f64) {
        self.tree_build_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
