use feature_ledger_types::{FeatureType, PricingMode};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// How an execution request ended, as seen by the metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Fresh execution committed
    Completed,

    /// Served from the idempotency key cache
    CacheHitKey,

    /// Served from the parameter reaccess window
    CacheHitParams,

    /// Rejected before or during execution without any charge standing
    Failed,

    /// Charge was reversed by compensation
    Refunded,

    /// Same key seen while the earlier execution had not completed
    Conflict,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::CacheHitKey => "cache_hit_key",
            ExecutionOutcome::CacheHitParams => "cache_hit_params",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::Refunded => "refunded",
            ExecutionOutcome::Conflict => "conflict",
        }
    }
}

/// Metrics collector for the execution ledger
///
/// Every collector owns its own [`Registry`], so several managers (or
/// several tests) can run in one process without clashing on metric names.
pub struct MetricsCollector {
    registry: Registry,
    executions: IntCounterVec,
    execution_latency: HistogramVec,
    points_deducted: IntCounter,
    points_refunded: IntCounter,
    points_granted: IntCounter,
    wallet_conflicts: IntCounter,
    compensations: IntCounterVec,
    recovered_executions: IntCounter,
    errors: IntCounterVec,
}

impl MetricsCollector {
    /// Create a collector with a fresh registry
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector that registers into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let executions = IntCounterVec::new(
            Opts::new(
                "feature_ledger_executions_total",
                "Execution requests by feature, pricing mode and outcome",
            ),
            &["feature", "mode", "outcome"],
        )?;

        let execution_latency = HistogramVec::new(
            HistogramOpts::new(
                "feature_ledger_execution_latency_ms",
                "End-to-end latency of execution requests in milliseconds",
            )
            .buckets(vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0,
            ]),
            &["feature"],
        )?;

        let points_deducted = IntCounter::new(
            "feature_ledger_points_deducted_total",
            "Points deducted from wallets",
        )?;
        let points_refunded = IntCounter::new(
            "feature_ledger_points_refunded_total",
            "Points returned to wallets by compensation or recovery",
        )?;
        let points_granted = IntCounter::new(
            "feature_ledger_points_granted_total",
            "Points credited to wallets outside of executions",
        )?;
        let wallet_conflicts = IntCounter::new(
            "feature_ledger_wallet_conflicts_total",
            "Wallet writes rejected because the version moved",
        )?;
        let compensations = IntCounterVec::new(
            Opts::new(
                "feature_ledger_compensations_total",
                "Compensation runs by phase",
            ),
            &["phase"],
        )?;
        let recovered_executions = IntCounter::new(
            "feature_ledger_recovered_executions_total",
            "Stale pending executions finalized by recovery",
        )?;
        let errors = IntCounterVec::new(
            Opts::new("feature_ledger_errors_total", "Errors by error code"),
            &["code"],
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_latency.clone()))?;
        registry.register(Box::new(points_deducted.clone()))?;
        registry.register(Box::new(points_refunded.clone()))?;
        registry.register(Box::new(points_granted.clone()))?;
        registry.register(Box::new(wallet_conflicts.clone()))?;
        registry.register(Box::new(compensations.clone()))?;
        registry.register(Box::new(recovered_executions.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            executions,
            execution_latency,
            points_deducted,
            points_refunded,
            points_granted,
            wallet_conflicts,
            compensations,
            recovered_executions,
            errors,
        })
    }

    /// Get the underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXECUTION METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record how an execution request ended
    pub fn record_execution(
        &self,
        feature: FeatureType,
        mode: PricingMode,
        outcome: ExecutionOutcome,
    ) {
        self.executions
            .with_label_values(&[feature.as_str(), mode.as_str(), outcome.as_str()])
            .inc();
    }

    /// Record end-to-end latency of an execution request
    pub fn record_execution_latency(&self, feature: FeatureType, latency: Duration) {
        self.execution_latency
            .with_label_values(&[feature.as_str()])
            .observe(latency.as_secs_f64() * 1000.0);
    }

    /// Number of requests recorded with the given labels
    pub fn execution_count(
        &self,
        feature: FeatureType,
        mode: PricingMode,
        outcome: ExecutionOutcome,
    ) -> u64 {
        self.executions
            .with_label_values(&[feature.as_str(), mode.as_str(), outcome.as_str()])
            .get()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // WALLET METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn record_points_deducted(&self, amount: i64) {
        self.points_deducted.inc_by(amount.max(0) as u64);
    }

    pub fn record_points_refunded(&self, amount: i64) {
        self.points_refunded.inc_by(amount.max(0) as u64);
    }

    pub fn record_points_granted(&self, amount: i64) {
        self.points_granted.inc_by(amount.max(0) as u64);
    }

    /// Record a wallet write that lost the version race
    pub fn record_wallet_conflict(&self) {
        self.wallet_conflicts.inc();
    }

    pub fn wallet_conflicts(&self) -> u64 {
        self.wallet_conflicts.get()
    }

    pub fn points_refunded(&self) -> u64 {
        self.points_refunded.get()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COMPENSATION AND RECOVERY
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record a compensation run; `phase` is "pre_commit" or "post_commit"
    pub fn record_compensation(&self, phase: &str) {
        self.compensations.with_label_values(&[phase]).inc();
    }

    pub fn compensation_count(&self, phase: &str) -> u64 {
        self.compensations.with_label_values(&[phase]).get()
    }

    pub fn record_recovered_execution(&self) {
        self.recovered_executions.inc();
    }

    /// Record an error surfaced to a caller
    pub fn record_error(&self, code: &str) {
        self.errors.with_label_values(&[code]).inc();
    }

    pub fn error_count(&self, code: &str) -> u64 {
        self.errors.with_label_values(&[code]).get()
    }

    /// Export metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingError(e.to_string()))
    }
}

/// Metrics errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    RegistrationError(#[from] prometheus::Error),

    #[error("encoding error: {0}")]
    EncodingError(String),
}
