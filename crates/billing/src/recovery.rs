use chrono::{DateTime, Utc};
use feature_ledger_types::{ExecutionRecord, ExecutionStatus, TransactionKind};
use tracing::{error, info};

use crate::error::LedgerError;
use crate::executor::FeatureExecutor;
use crate::manager::ExecutionManager;
use crate::store::LedgerStore;

const RECOVERY_REASON: &str = "stale pending execution recovered";

/// Result of one recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Executions whose deduction was returned
    pub refunded: Vec<String>,
    /// Executions that never charged anything
    pub failed: Vec<String>,
    pub points_returned: i64,
    /// Executions left pending, with the error that stopped them
    pub errors: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.refunded.len() + self.failed.len()
    }
}

impl<S: LedgerStore, E: FeatureExecutor> ExecutionManager<S, E> {
    /// Finalize executions stuck in `pending` longer than the configured age
    ///
    /// A charged execution gets its outstanding points back and ends
    /// `refunded`; one that never charged ends `failed`. Refunds are computed
    /// from the ledger, so sweeping an execution the request path is still
    /// rolling back never pays out twice.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<RecoveryReport, LedgerError> {
        let cutoff = now - self.config.stale_after;
        let stale = self
            .store
            .list_stale_pending(cutoff, self.config.recovery_batch_size)
            .await?;

        let mut report = RecoveryReport {
            scanned: stale.len(),
            ..RecoveryReport::default()
        };

        for execution in &stale {
            match self.recover_one(execution, now).await {
                Ok((ExecutionStatus::Refunded, amount)) => {
                    report.points_returned += amount;
                    report.refunded.push(execution.id.clone());
                }
                Ok(_) => report.failed.push(execution.id.clone()),
                Err(err) => {
                    error!(
                        execution_id = %execution.id,
                        error_code = err.error_code(),
                        error = %err,
                        "recovery failed"
                    );
                    report.errors.push((execution.id.clone(), err.to_string()));
                    continue;
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_recovered_execution();
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                refunded = report.refunded.len(),
                failed = report.failed.len(),
                errors = report.errors.len(),
                points_returned = report.points_returned,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover_one(
        &self,
        execution: &ExecutionRecord,
        now: DateTime<Utc>,
    ) -> Result<(ExecutionStatus, i64), LedgerError> {
        let entries = self.store.list_execution_transactions(&execution.id).await?;
        let charged = entries
            .iter()
            .any(|entry| entry.kind == TransactionKind::Deduction);

        if charged {
            let amount = self
                .points
                .refund_outstanding(&execution.user_id, &execution.id, RECOVERY_REASON, now)
                .await?;
            self.store
                .mark_execution_refunded(&execution.id, RECOVERY_REASON, now)
                .await?;
            Ok((ExecutionStatus::Refunded, amount))
        } else {
            self.store
                .mark_execution_failed(&execution.id, RECOVERY_REASON, now)
                .await?;
            Ok((ExecutionStatus::Failed, 0))
        }
    }
}
