use chrono::{DateTime, Duration, Utc};
use feature_ledger_types::{
    params_hash, ExecutionRecord, ExecutionStatus, FeatureType, OutputEnvelope, PricingMode,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::LedgerError;
use crate::store::{LedgerStore, ParamsQuery, StoreError};

/// Deduplicates requests by idempotency key and by recent identical parameters
pub struct IdempotencyGuard<S> {
    store: Arc<S>,
    window: Duration,
}

impl<S: LedgerStore> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cached output for `(user_id, key)`
    ///
    /// Returns `Ok(None)` for an unused key and an idempotency conflict when
    /// the key belongs to an execution that did not complete.
    pub async fn lookup_by_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<OutputEnvelope>, LedgerError> {
        match self.store.find_execution_by_idempotency(user_id, key).await? {
            None => Ok(None),
            Some(execution) => replay(&execution).map(Some),
        }
    }

    /// Cached output of the latest completed execution with equal parameters
    /// created inside the window ending at `now`
    pub async fn lookup_by_params(
        &self,
        user_id: &str,
        feature_type: FeatureType,
        target_id: &str,
        pricing_mode: PricingMode,
        input_params: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<OutputEnvelope>, LedgerError> {
        let query = ParamsQuery {
            user_id: user_id.to_string(),
            feature_type,
            target_id: target_id.to_string(),
            pricing_mode,
            params_hash: params_hash(input_params),
            since: now - self.window,
        };

        match self.store.find_recent_completed_by_params(&query).await? {
            None => Ok(None),
            Some(execution) => {
                debug!(
                    user_id,
                    execution_id = %execution.id,
                    "reaccess cache hit"
                );
                replay(&execution).map(Some)
            }
        }
    }
}

fn replay(execution: &ExecutionRecord) -> Result<OutputEnvelope, LedgerError> {
    if execution.status != ExecutionStatus::Completed {
        return Err(LedgerError::IdempotencyConflict {
            execution_id: execution.id.clone(),
            status: execution.status,
        });
    }

    execution.cached_output().cloned().ok_or_else(|| {
        StoreError::SerializationError(format!(
            "completed execution {} has no stored output",
            execution.id
        ))
        .into()
    })
}
