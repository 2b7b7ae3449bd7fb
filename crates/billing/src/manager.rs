use chrono::{DateTime, Duration, Utc};
use feature_ledger_config::LedgerConfig;
use feature_ledger_metrics::{ExecutionOutcome, ExecutionSpan, MetricsCollector};
use feature_ledger_types::{
    params_hash, BillingResult, ExecutionRecord, ExecutionTransition, FeatureResult, FeatureType,
    OutputEnvelope, PlanTier, PointTransaction, PricingMode, RemainingBalance,
    DEFAULT_REACCESS_WINDOW_HOURS,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::error::LedgerError;
use crate::executor::{FeatureExecutor, FeatureRequest};
use crate::idempotency::IdempotencyGuard;
use crate::points::PointsLedger;
use crate::pricing::{BillingPlan, PricingResolver, PricingTable};
use crate::retry::RetryPolicy;
use crate::store::{LedgerStore, NewExecution, StoreError};

/// Execution manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    /// Trailing window of the parameter reaccess cache
    pub reaccess_window: Duration,
    /// Age after which a pending execution is handed to recovery
    pub stale_after: Duration,
    pub recovery_batch_size: usize,
}

impl ManagerConfig {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            reaccess_window: Duration::hours(config.reaccess_window_hours),
            stale_after: Duration::seconds(config.stale_pending_secs),
            recovery_batch_size: config.recovery_batch_size,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reaccess_window: Duration::hours(DEFAULT_REACCESS_WINDOW_HOURS),
            stale_after: Duration::minutes(15),
            recovery_batch_size: 100,
        }
    }
}

/// One request to run a paid feature
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Authenticated caller; `None` when no identity could be resolved
    pub user_id: Option<String>,
    pub idempotency_key: String,
    pub feature_type: FeatureType,
    pub target_id: String,
    pub pricing_mode: PricingMode,
    pub input_params: Value,
    pub request_meta: Value,
    /// Downstream verdict that invalidates an otherwise committed result
    pub post_commit_anomaly: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        user_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        feature_type: FeatureType,
        target_id: impl Into<String>,
        pricing_mode: PricingMode,
        input_params: Value,
    ) -> Self {
        Self {
            user_id: Some(user_id.into()),
            idempotency_key: idempotency_key.into(),
            feature_type,
            target_id: target_id.into(),
            pricing_mode,
            input_params,
            request_meta: Value::Null,
            post_commit_anomaly: None,
        }
    }

    pub fn with_request_meta(mut self, meta: Value) -> Self {
        self.request_meta = meta;
        self
    }

    pub fn with_post_commit_anomaly(mut self, reason: impl Into<String>) -> Self {
        self.post_commit_anomaly = Some(reason.into());
        self
    }
}

/// Admitted execution that owns a pending row
struct Admitted<'a> {
    execution_id: String,
    user_id: &'a str,
    pricing_mode: PricingMode,
}

/// What is known about the point reservation when rolling back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    /// Nothing was ever deducted
    None,
    /// A deduction is on the ledger
    Confirmed,
    /// The reserve call failed in a way that leaves its effect unknown
    Unknown,
}

/// Drives one request through guard, pricing, reservation, execution and
/// commit, compensating on failure
pub struct ExecutionManager<S, E> {
    pub(crate) store: Arc<S>,
    executor: Arc<E>,
    guard: IdempotencyGuard<S>,
    pricing: PricingResolver<S>,
    pub(crate) points: PointsLedger<S>,
    pub(crate) config: ManagerConfig,
    pub(crate) metrics: Option<Arc<MetricsCollector>>,
}

impl<S: LedgerStore, E: FeatureExecutor> ExecutionManager<S, E> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<E>,
        pricing: PricingTable,
        config: ManagerConfig,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone(), config.reaccess_window),
            pricing: PricingResolver::new(store.clone(), pricing),
            points: PointsLedger::new(store.clone(), config.retry),
            store,
            executor,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.points = self.points.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn points(&self) -> &PointsLedger<S> {
        &self.points
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// [`Self::execute`] at the current time
    pub async fn execute_now(&self, request: ExecutionRequest) -> Result<OutputEnvelope, LedgerError> {
        self.execute(request, Utc::now()).await
    }

    /// Run one request, returning the output envelope or the error that
    /// stopped it
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        now: DateTime<Utc>,
    ) -> Result<OutputEnvelope, LedgerError> {
        let user_id = match request.user_id.as_deref().map(str::trim) {
            Some(user_id) if !user_id.is_empty() => user_id.to_string(),
            _ => {
                warn!(error_code = "AUTH_REQUIRED", "request without user identity");
                return Err(LedgerError::AuthRequired);
            }
        };

        let span = ExecutionSpan::new(
            user_id.as_str(),
            request.idempotency_key.as_str(),
            request.feature_type,
            request.pricing_mode,
        );
        let started = Instant::now();
        let mut refunded = false;

        let result = self
            .run(&user_id, &request, now, &mut refunded)
            .instrument(span.span())
            .await;

        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(_) if refunded => ExecutionOutcome::Refunded,
            Err(LedgerError::IdempotencyConflict { .. }) => ExecutionOutcome::Conflict,
            Err(_) => ExecutionOutcome::Failed,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(request.feature_type, request.pricing_mode, outcome);
            metrics.record_execution_latency(request.feature_type, started.elapsed());
        }

        match result {
            Ok((output, _)) => Ok(output),
            Err(err) => {
                log_failure(&err, &span);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        user_id: &str,
        request: &ExecutionRequest,
        now: DateTime<Utc>,
        refunded: &mut bool,
    ) -> Result<(OutputEnvelope, ExecutionOutcome), LedgerError> {
        if let Some(cached) = self
            .guard
            .lookup_by_key(user_id, &request.idempotency_key)
            .await?
        {
            info!(execution_id = %cached.execution_id, "replaying by idempotency key");
            return Ok((cached, ExecutionOutcome::CacheHitKey));
        }

        if let Some(cached) = self
            .guard
            .lookup_by_params(
                user_id,
                request.feature_type,
                &request.target_id,
                request.pricing_mode,
                &request.input_params,
                now,
            )
            .await?
        {
            info!(execution_id = %cached.execution_id, "replaying by parameters");
            return Ok((cached, ExecutionOutcome::CacheHitParams));
        }

        let billing = self
            .pricing
            .resolve(user_id, request.feature_type, request.pricing_mode, now)
            .await?;

        let admitted = match self.admit(user_id, request, &billing, now).await? {
            Ok(admitted) => admitted,
            Err(cached) => return Ok((cached, ExecutionOutcome::CacheHitKey)),
        };

        let reserved_balance = match request.pricing_mode {
            PricingMode::Subscription => None,
            PricingMode::Points => {
                match self
                    .points
                    .reserve(user_id, billing.consumed_points, &admitted.execution_id, now)
                    .await
                {
                    Ok(balance) => Some(balance),
                    Err(err) => {
                        let reservation = match err {
                            LedgerError::InsufficientPoints { .. }
                            | LedgerError::ExecutionFailed { .. } => Reservation::None,
                            _ => Reservation::Unknown,
                        };
                        *refunded = self
                            .roll_back(&admitted, reservation, &err.to_string(), now)
                            .await;
                        return Err(err);
                    }
                }
            }
        };
        let reservation = if reserved_balance.is_some() {
            Reservation::Confirmed
        } else {
            Reservation::None
        };

        let feature_request = FeatureRequest {
            execution_id: admitted.execution_id.clone(),
            feature_type: request.feature_type,
            target_id: request.target_id.clone(),
            request_meta: request.request_meta.clone(),
            input_params: request.input_params.clone(),
        };

        let feature_result = match self.executor.execute(&feature_request).await {
            Ok(result) => result,
            Err(err) => {
                let reason = format!("feature failed: {err}");
                *refunded = self.roll_back(&admitted, reservation, &reason, now).await;
                return Err(LedgerError::execution_failed(&admitted.execution_id, reason));
            }
        };

        let output = match self
            .commit(&admitted, &billing, reserved_balance, &feature_result, now)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                *refunded = self
                    .roll_back(&admitted, reservation, &format!("commit failed: {err}"), now)
                    .await;
                return Err(err);
            }
        };

        if let Some(anomaly) = &request.post_commit_anomaly {
            let reason = format!("post-commit anomaly: {anomaly}");
            self.compensate(&admitted, &reason, now).await;
            *refunded = true;
            return Err(LedgerError::execution_failed(&admitted.execution_id, reason));
        }

        info!(
            execution_id = %admitted.execution_id,
            consumed_points = billing.consumed_points,
            consumed_units = billing.consumed_units,
            "execution completed"
        );
        Ok((output, ExecutionOutcome::Completed))
    }

    /// Create the pending row; `Err(cached)` when a concurrent request with
    /// the same key already completed
    async fn admit<'a>(
        &self,
        user_id: &'a str,
        request: &ExecutionRequest,
        billing: &BillingPlan,
        now: DateTime<Utc>,
    ) -> Result<Result<Admitted<'a>, OutputEnvelope>, LedgerError> {
        let execution = NewExecution {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            idempotency_key: request.idempotency_key.clone(),
            feature_type: request.feature_type,
            target_id: request.target_id.clone(),
            pricing_mode: billing.mode,
            input_params: request.input_params.clone(),
            params_hash: params_hash(&request.input_params),
            consumed_units: billing.consumed_units,
            consumed_points: billing.consumed_points,
            created_at: now,
        };

        match self.store.create_pending_execution(&execution).await {
            Ok(record) => Ok(Ok(Admitted {
                execution_id: record.id,
                user_id,
                pricing_mode: billing.mode,
            })),
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                // lost the insert race; the winner's row decides
                match self
                    .guard
                    .lookup_by_key(user_id, &request.idempotency_key)
                    .await?
                {
                    Some(cached) => Ok(Err(cached)),
                    None => Err(LedgerError::ExecutionFailed {
                        execution_id: None,
                        reason: "idempotency key taken but no execution found".to_string(),
                    }),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(
        &self,
        admitted: &Admitted<'_>,
        billing: &BillingPlan,
        reserved_balance: Option<i64>,
        feature_result: &FeatureResult,
        now: DateTime<Utc>,
    ) -> Result<OutputEnvelope, LedgerError> {
        let points = match reserved_balance {
            Some(balance) => balance,
            None => self.points.balance(admitted.user_id).await?,
        };

        let output = OutputEnvelope {
            execution_id: admitted.execution_id.clone(),
            billing_result: BillingResult {
                mode: billing.mode,
                consumed_units: billing.consumed_units,
                consumed_points: billing.consumed_points,
            },
            remaining_balance: RemainingBalance {
                subscription_units: Some(billing.remaining_units),
                points,
            },
            result_ref: feature_result.result_ref.clone(),
            error_code: None,
        };

        self.store
            .complete_execution(&admitted.execution_id, &output, feature_result, now)
            .await?;

        Ok(output)
    }

    /// Undo a request that failed before its commit point; true when points
    /// went back to the wallet
    ///
    /// When the refund itself fails the row stays pending so that
    /// [`Self::recover_stale`] can finish the job later.
    async fn roll_back(
        &self,
        admitted: &Admitted<'_>,
        reservation: Reservation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let terminal = match (admitted.pricing_mode, reservation) {
            (PricingMode::Subscription, _) | (_, Reservation::None) => Terminal::Failed,
            (PricingMode::Points, _) => {
                match self
                    .points
                    .refund_outstanding(admitted.user_id, &admitted.execution_id, reason, now)
                    .await
                {
                    Ok(0) if reservation == Reservation::Unknown => Terminal::Failed,
                    Ok(_) => Terminal::Refunded,
                    Err(err) => {
                        error!(
                            execution_id = %admitted.execution_id,
                            error_code = err.error_code(),
                            error = %err,
                            "refund failed during rollback, leaving execution for recovery"
                        );
                        return false;
                    }
                }
            }
        };

        let marked = match terminal {
            Terminal::Failed => {
                self.store
                    .mark_execution_failed(&admitted.execution_id, reason, now)
                    .await
            }
            Terminal::Refunded => {
                self.store
                    .mark_execution_refunded(&admitted.execution_id, reason, now)
                    .await
            }
        };

        if let Err(err) = marked {
            error!(
                execution_id = %admitted.execution_id,
                error = %err,
                "could not record rollback"
            );
        }
        if terminal == Terminal::Refunded {
            if let Some(metrics) = &self.metrics {
                metrics.record_compensation("pre_commit");
            }
        }
        terminal == Terminal::Refunded
    }

    /// Reverse a committed execution: refund, then flip to refunded
    ///
    /// Both steps are attempted even if the first fails; failures are
    /// logged and never replace the error returned to the caller.
    async fn compensate(&self, admitted: &Admitted<'_>, reason: &str, now: DateTime<Utc>) {
        warn!(execution_id = %admitted.execution_id, reason, "compensating committed execution");

        if admitted.pricing_mode == PricingMode::Points {
            if let Err(err) = self
                .points
                .refund_outstanding(admitted.user_id, &admitted.execution_id, reason, now)
                .await
            {
                error!(
                    execution_id = %admitted.execution_id,
                    error_code = err.error_code(),
                    error = %err,
                    "refund failed during compensation"
                );
            }
        }

        if let Err(err) = self
            .store
            .mark_execution_refunded(&admitted.execution_id, reason, now)
            .await
        {
            error!(
                execution_id = %admitted.execution_id,
                error = %err,
                "could not mark compensated execution refunded"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_compensation("post_commit");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCOUNT HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.points.balance(user_id).await
    }

    pub async fn grant_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        self.points.grant(user_id, amount, reason, now).await
    }

    pub async fn set_plan(
        &self,
        user_id: &str,
        tier: PlanTier,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        Ok(self.store.set_plan(user_id, tier, now).await?)
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, LedgerError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Point ledger of a user, oldest first
    pub async fn history(&self, user_id: &str) -> Result<Vec<PointTransaction>, LedgerError> {
        Ok(self.store.list_point_transactions(user_id).await?)
    }

    pub async fn transitions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionTransition>, LedgerError> {
        Ok(self.store.list_transitions(execution_id).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Failed,
    Refunded,
}

fn log_failure(err: &LedgerError, span: &ExecutionSpan) {
    match err {
        LedgerError::ExecutionFailed { .. }
        | LedgerError::Unavailable(_)
        | LedgerError::Configuration(_)
        | LedgerError::Storage(_) => error!(
            correlation_id = %span.correlation_id,
            error_code = err.error_code(),
            error = %err,
            "execution request failed"
        ),
        _ => warn!(
            correlation_id = %span.correlation_id,
            error_code = err.error_code(),
            error = %err,
            "execution request rejected"
        ),
    }
}
