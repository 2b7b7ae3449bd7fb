//! Points wallet with optimistic concurrency.
//!
//! Every write reads the wallet, decides, and then applies a change that
//! only lands if the wallet version is still the one that was read. A lost
//! race re-runs the whole cycle, up to [`RetryPolicy::max_attempts`] times.
//! No lock is held between the read and the write.

use chrono::{DateTime, Utc};
use feature_ledger_metrics::MetricsCollector;
use feature_ledger_types::{PointTransaction, TransactionKind, WalletSnapshot};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::store::{BalanceChange, LedgerStore};

pub struct PointsLedger<S> {
    store: Arc<S>,
    policy: RetryPolicy,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: LedgerStore> PointsLedger<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        Ok(self.store.read_wallet(user_id).await?.balance)
    }

    /// Deduct `amount` for `execution_id`, returning the new balance
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        execution_id: &str,
        at: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        ensure_positive(amount)?;

        let mut backoff = self.policy.backoff();
        for attempt in 1..=self.policy.max_attempts {
            let wallet = self.store.read_wallet(user_id).await?;
            if wallet.balance < amount {
                return Err(LedgerError::InsufficientPoints {
                    required: amount,
                    available: wallet.balance,
                });
            }

            let applied = self
                .try_apply(
                    user_id,
                    wallet,
                    -amount,
                    TransactionKind::Deduction,
                    Some(execution_id),
                    "execution charge",
                    at,
                )
                .await?;

            if let Some(balance) = applied {
                info!(user_id, execution_id, amount, balance, "points reserved");
                if let Some(metrics) = &self.metrics {
                    metrics.record_points_deducted(amount);
                }
                return Ok(balance);
            }

            self.pause(&mut backoff, attempt).await;
        }

        Err(self.exhausted(user_id, Some(execution_id)))
    }

    /// Credit `amount` back for `execution_id`, returning the new balance
    pub async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        execution_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        ensure_positive(amount)?;

        let mut backoff = self.policy.backoff();
        for attempt in 1..=self.policy.max_attempts {
            let wallet = self.store.read_wallet(user_id).await?;

            let applied = self
                .try_apply(
                    user_id,
                    wallet,
                    amount,
                    TransactionKind::Refund,
                    Some(execution_id),
                    reason,
                    at,
                )
                .await?;

            if let Some(balance) = applied {
                info!(user_id, execution_id, amount, balance, reason, "points refunded");
                if let Some(metrics) = &self.metrics {
                    metrics.record_points_refunded(amount);
                }
                return Ok(balance);
            }

            self.pause(&mut backoff, attempt).await;
        }

        Err(self.exhausted(user_id, Some(execution_id)))
    }

    /// Refund whatever `execution_id` still has deducted; returns the amount
    ///
    /// The outstanding amount is recomputed from the ledger on every
    /// attempt, and the wallet is read before the ledger, so two callers
    /// racing to refund the same execution cannot both succeed.
    pub async fn refund_outstanding(
        &self,
        user_id: &str,
        execution_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let mut backoff = self.policy.backoff();
        for attempt in 1..=self.policy.max_attempts {
            let wallet = self.store.read_wallet(user_id).await?;
            let entries = self.store.list_execution_transactions(execution_id).await?;
            let outstanding = -entries.iter().map(|t| t.amount).sum::<i64>();

            if outstanding <= 0 {
                debug!(user_id, execution_id, "nothing outstanding to refund");
                return Ok(0);
            }

            let applied = self
                .try_apply(
                    user_id,
                    wallet,
                    outstanding,
                    TransactionKind::Refund,
                    Some(execution_id),
                    reason,
                    at,
                )
                .await?;

            if let Some(balance) = applied {
                info!(
                    user_id,
                    execution_id,
                    amount = outstanding,
                    balance,
                    reason,
                    "points refunded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_points_refunded(outstanding);
                }
                return Ok(outstanding);
            }

            self.pause(&mut backoff, attempt).await;
        }

        Err(self.exhausted(user_id, Some(execution_id)))
    }

    /// Credit points outside of any execution (purchase, promotion)
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        ensure_positive(amount)?;

        let mut backoff = self.policy.backoff();
        for attempt in 1..=self.policy.max_attempts {
            let wallet = self.store.read_wallet(user_id).await?;

            let applied = self
                .try_apply(
                    user_id,
                    wallet,
                    amount,
                    TransactionKind::Grant,
                    None,
                    reason,
                    at,
                )
                .await?;

            if let Some(balance) = applied {
                info!(user_id, amount, balance, reason, "points granted");
                if let Some(metrics) = &self.metrics {
                    metrics.record_points_granted(amount);
                }
                return Ok(balance);
            }

            self.pause(&mut backoff, attempt).await;
        }

        Err(self.exhausted(user_id, None))
    }

    /// One conditional write; `None` when another writer got there first
    #[allow(clippy::too_many_arguments)]
    async fn try_apply(
        &self,
        user_id: &str,
        wallet: WalletSnapshot,
        delta: i64,
        kind: TransactionKind,
        execution_id: Option<&str>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>, LedgerError> {
        let new_balance = wallet.balance + delta;
        let change = BalanceChange {
            user_id: user_id.to_string(),
            expected_version: wallet.version,
            new_balance,
            transaction: PointTransaction {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                amount: delta,
                kind,
                execution_id: execution_id.map(str::to_string),
                balance_after: new_balance,
                reason: reason.to_string(),
                created_at: at,
            },
        };

        if self.store.apply_balance_change(&change).await? {
            return Ok(Some(new_balance));
        }

        warn!(
            user_id,
            expected_version = wallet.version,
            kind = %kind,
            "wallet version moved, retrying"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_wallet_conflict();
        }
        Ok(None)
    }

    async fn pause(&self, backoff: &mut ExponentialBackoff, attempt: u32) {
        if attempt >= self.policy.max_attempts {
            return;
        }
        let delay = backoff.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn exhausted(&self, user_id: &str, execution_id: Option<&str>) -> LedgerError {
        warn!(
            user_id,
            attempts = self.policy.max_attempts,
            "wallet write retries exhausted"
        );
        LedgerError::ExecutionFailed {
            execution_id: execution_id.map(str::to_string),
            reason: format!(
                "ledger contention: wallet of {user_id} changed on all {} attempts",
                self.policy.max_attempts
            ),
        }
    }
}

fn ensure_positive(amount: i64) -> Result<(), LedgerError> {
    if amount > 0 {
        Ok(())
    } else {
        Err(LedgerError::Configuration(format!(
            "point amount must be positive, got {amount}"
        )))
    }
}
