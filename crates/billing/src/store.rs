use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feature_ledger_types::{
    ExecutionRecord, ExecutionStatus, ExecutionTransition, FeatureResult, FeatureType,
    OutputEnvelope, PlanTier, PointTransaction, PricingMode, WalletSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

// ═══════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Row written when a request is admitted
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub id: String,
    pub user_id: String,
    pub idempotency_key: String,
    pub feature_type: FeatureType,
    pub target_id: String,
    pub pricing_mode: PricingMode,
    pub input_params: serde_json::Value,
    pub params_hash: String,
    pub consumed_units: u32,
    pub consumed_points: i64,
    pub created_at: DateTime<Utc>,
}

impl NewExecution {
    pub fn into_record(self) -> ExecutionRecord {
        ExecutionRecord {
            id: self.id,
            user_id: self.user_id,
            idempotency_key: self.idempotency_key,
            feature_type: self.feature_type,
            target_id: self.target_id,
            pricing_mode: self.pricing_mode,
            input_params: self.input_params,
            params_hash: self.params_hash,
            consumed_units: self.consumed_units,
            consumed_points: self.consumed_points,
            status: ExecutionStatus::Pending,
            result_data: None,
            feature_result: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Lookup key of the parameter reaccess cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsQuery {
    pub user_id: String,
    pub feature_type: FeatureType,
    pub target_id: String,
    pub pricing_mode: PricingMode,
    pub params_hash: String,
    /// Only executions created at or after this instant match
    pub since: DateTime<Utc>,
}

/// Conditional wallet write paired with its ledger entry
///
/// Applies only if the wallet is still at `expected_version`; a version of
/// 0 means the wallet row must not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub user_id: String,
    pub expected_version: i64,
    pub new_balance: i64,
    pub transaction: PointTransaction,
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("duplicate execution ID: {0}")]
    DuplicateId(String),

    #[error("idempotency key {key} already used by {user_id}")]
    DuplicateIdempotencyKey { user_id: String, key: String },

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Schema or backing service missing
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// Durable ledger storage - can be implemented for different backends
///
/// Status changes are conditional on the current status and each one
/// appends an [`ExecutionTransition`]. Wallet writes are conditional on the
/// wallet version and append exactly one [`PointTransaction`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_execution_by_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Most recent completed execution matching `query`
    async fn find_recent_completed_by_params(
        &self,
        query: &ParamsQuery,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Plan tier of the user, `None` when never assigned
    async fn read_plan(&self, user_id: &str) -> Result<Option<PlanTier>, StoreError>;

    async fn set_plan(
        &self,
        user_id: &str,
        tier: PlanTier,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Completed subscription executions of `feature` created since `month_start`
    async fn count_subscription_usage(
        &self,
        user_id: &str,
        feature: FeatureType,
        month_start: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Insert a pending execution; the (user, key) pair must be unused
    async fn create_pending_execution(
        &self,
        execution: &NewExecution,
    ) -> Result<ExecutionRecord, StoreError>;

    /// pending → completed, storing the output envelope
    async fn complete_execution(
        &self,
        id: &str,
        output: &OutputEnvelope,
        feature_result: &FeatureResult,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// pending → failed
    async fn mark_execution_failed(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// pending|completed → refunded, clearing the output envelope
    async fn mark_execution_refunded(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Transition history in the order it was written
    async fn list_transitions(&self, id: &str) -> Result<Vec<ExecutionTransition>, StoreError>;

    /// Pending executions created before `created_before`, oldest first
    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn read_wallet(&self, user_id: &str) -> Result<WalletSnapshot, StoreError>;

    /// Apply `change` atomically; `Ok(false)` when the version moved
    async fn apply_balance_change(&self, change: &BalanceChange) -> Result<bool, StoreError>;

    /// Ledger entries of a user, oldest first
    async fn list_point_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError>;

    /// Ledger entries caused by one execution, oldest first
    async fn list_execution_transactions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError>;
}

/// Shared status-change rule for every backend
pub(crate) fn check_transition(
    id: &str,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE (for testing)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct LedgerState {
    executions: HashMap<String, ExecutionRecord>,
    /// (user_id, idempotency_key) → execution id
    keys: HashMap<(String, String), String>,
    transitions: HashMap<String, Vec<ExecutionTransition>>,
    plans: HashMap<String, PlanTier>,
    wallets: HashMap<String, WalletSnapshot>,
    point_transactions: Vec<PointTransaction>,
}

impl LedgerState {
    fn transition(
        &mut self,
        id: &str,
        to: ExecutionStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<&mut ExecutionRecord, StoreError> {
        let execution = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        check_transition(id, execution.status, to)?;

        let from = execution.status;
        execution.status = to;
        execution.updated_at = at;

        self.transitions
            .entry(id.to_string())
            .or_default()
            .push(ExecutionTransition::new(id, from, to, at).with_reason(reason));

        Ok(execution)
    }
}

/// Process-local store; all collections sit behind one lock so every
/// operation is atomic
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of executions (for testing)
    pub async fn len(&self) -> usize {
        self.state.read().await.executions.len()
    }

    /// Check if store is empty (for testing)
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.executions.is_empty()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn find_execution_by_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .keys
            .get(&(user_id.to_string(), key.to_string()))
            .and_then(|id| state.executions.get(id))
            .cloned())
    }

    async fn find_recent_completed_by_params(
        &self,
        query: &ParamsQuery,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Completed
                    && e.user_id == query.user_id
                    && e.feature_type == query.feature_type
                    && e.target_id == query.target_id
                    && e.pricing_mode == query.pricing_mode
                    && e.params_hash == query.params_hash
                    && e.created_at >= query.since
            })
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.state.read().await.executions.get(id).cloned())
    }

    async fn read_plan(&self, user_id: &str) -> Result<Option<PlanTier>, StoreError> {
        Ok(self.state.read().await.plans.get(user_id).copied())
    }

    async fn set_plan(
        &self,
        user_id: &str,
        tier: PlanTier,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .plans
            .insert(user_id.to_string(), tier);
        Ok(())
    }

    async fn count_subscription_usage(
        &self,
        user_id: &str,
        feature: FeatureType,
        month_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let state = self.state.read().await;
        let used = state
            .executions
            .values()
            .filter(|e| {
                e.user_id == user_id
                    && e.feature_type == feature
                    && e.pricing_mode == PricingMode::Subscription
                    && e.status == ExecutionStatus::Completed
                    && e.created_at >= month_start
            })
            .count();
        Ok(used as u32)
    }

    async fn create_pending_execution(
        &self,
        execution: &NewExecution,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut state = self.state.write().await;

        let key = (
            execution.user_id.clone(),
            execution.idempotency_key.clone(),
        );
        if state.keys.contains_key(&key) {
            return Err(StoreError::DuplicateIdempotencyKey {
                user_id: execution.user_id.clone(),
                key: execution.idempotency_key.clone(),
            });
        }
        if state.executions.contains_key(&execution.id) {
            return Err(StoreError::DuplicateId(execution.id.clone()));
        }

        let record = execution.clone().into_record();
        state.keys.insert(key, record.id.clone());
        state.executions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn complete_execution(
        &self,
        id: &str,
        output: &OutputEnvelope,
        feature_result: &FeatureResult,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let execution = state.transition(id, ExecutionStatus::Completed, "feature completed", at)?;
        execution.result_data = Some(output.clone());
        execution.feature_result = Some(feature_result.clone());
        Ok(())
    }

    async fn mark_execution_failed(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.transition(id, ExecutionStatus::Failed, reason, at)?;
        Ok(())
    }

    async fn mark_execution_refunded(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let execution = state.transition(id, ExecutionStatus::Refunded, reason, at)?;
        execution.result_data = None;
        Ok(())
    }

    async fn list_transitions(&self, id: &str) -> Result<Vec<ExecutionTransition>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .transitions
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending && e.created_at < created_before)
            .cloned()
            .collect();

        stale.sort_by_key(|e| e.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn read_wallet(&self, user_id: &str) -> Result<WalletSnapshot, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .wallets
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn apply_balance_change(&self, change: &BalanceChange) -> Result<bool, StoreError> {
        if change.new_balance < 0 {
            return Err(StoreError::Constraint(format!(
                "wallet of {} would go negative",
                change.user_id
            )));
        }

        let mut state = self.state.write().await;
        let current = state
            .wallets
            .get(&change.user_id)
            .copied()
            .unwrap_or_default();

        if current.version != change.expected_version {
            return Ok(false);
        }

        state.wallets.insert(
            change.user_id.clone(),
            WalletSnapshot {
                balance: change.new_balance,
                version: current.version + 1,
            },
        );
        state.point_transactions.push(change.transaction.clone());
        Ok(true)
    }

    async fn list_point_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .point_transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_execution_transactions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .point_transactions
            .iter()
            .filter(|t| t.execution_id.as_deref() == Some(execution_id))
            .cloned()
            .collect())
    }
}
