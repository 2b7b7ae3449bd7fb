use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feature_ledger_types::{
    ExecutionRecord, ExecutionStatus, ExecutionTransition, FeatureResult, FeatureType,
    OutputEnvelope, PlanTier, PointTransaction, PricingMode, TransactionKind, WalletSnapshot,
};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::store::{
    check_transition, BalanceChange, LedgerStore, NewExecution, ParamsQuery, StoreError,
};

/// How long a writer waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const STATUSES: [ExecutionStatus; 4] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
    ExecutionStatus::Refunded,
];

const MIGRATIONS: [(&str, &str); 5] = [
    (
        "001_create_executions",
        include_str!("../migrations/001_create_executions.sql"),
    ),
    (
        "002_create_execution_transitions",
        include_str!("../migrations/002_create_execution_transitions.sql"),
    ),
    (
        "003_create_point_wallets",
        include_str!("../migrations/003_create_point_wallets.sql"),
    ),
    (
        "004_create_point_transactions",
        include_str!("../migrations/004_create_point_transactions.sql"),
    ),
    (
        "005_create_user_plans",
        include_str!("../migrations/005_create_user_plans.sql"),
    ),
];

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE STORE IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════

/// SQLite-backed [`LedgerStore`]
///
/// Timestamps are stored as UTC milliseconds, JSON payloads as text.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url`, creating the database file if needed, and migrate
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Self::connect_with(url, max_connections, true).await
    }

    /// Connect to `url`, migrating only when `migrate` is set
    pub async fn connect_with(
        url: &str,
        max_connections: u32,
        migrate: bool,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let store = Self { pool };
        if migrate {
            store.run_migrations().await?;
        }

        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing)
    ///
    /// Limited to one connection: every connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::from_pool(Self::memory_pool().await?);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool without touching its schema
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn memory_pool() -> Result<SqlitePool, StoreError> {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))
    }

    /// Apply the bundled schema; safe to run repeatedly
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            debug!(migration = name, "applied migration");
        }
        Ok(())
    }

    fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord, StoreError> {
        let result_data: Option<String> = row.get("result_data");
        let feature_result: Option<String> = row.get("feature_result");

        Ok(ExecutionRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            idempotency_key: row.get("idempotency_key"),
            feature_type: parse_enum::<FeatureType>(row.get("feature_type"))?,
            target_id: row.get("target_id"),
            pricing_mode: parse_enum::<PricingMode>(row.get("pricing_mode"))?,
            input_params: from_json::<serde_json::Value>(row.get("input_params"))?,
            params_hash: row.get("params_hash"),
            consumed_units: row.get::<i64, _>("consumed_units") as u32,
            consumed_points: row.get("consumed_points"),
            status: parse_enum::<ExecutionStatus>(row.get("status"))?,
            result_data: result_data
                .as_deref()
                .map(from_json::<OutputEnvelope>)
                .transpose()?,
            feature_result: feature_result
                .as_deref()
                .map(from_json::<FeatureResult>)
                .transpose()?,
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<PointTransaction, StoreError> {
        Ok(PointTransaction {
            id: row.get("id"),
            user_id: row.get("user_id"),
            amount: row.get("amount"),
            kind: parse_enum::<TransactionKind>(row.get("kind"))?,
            execution_id: row.get("execution_id"),
            balance_after: row.get("balance_after"),
            reason: row.get("reason"),
            created_at: from_millis(row.get("created_at"))?,
        })
    }

    /// Conditional status change plus its audit row, in one transaction
    ///
    /// The audit insert is the first statement, so the transaction holds the
    /// write lock before it reads the current status and waits out a busy
    /// database instead of failing on a read-to-write upgrade.
    async fn transition(
        &self,
        id: &str,
        to: ExecutionStatus,
        reason: &str,
        at: DateTime<Utc>,
        output: Option<(&OutputEnvelope, &FeatureResult)>,
    ) -> Result<(), StoreError> {
        let sources: Vec<ExecutionStatus> = STATUSES
            .into_iter()
            .filter(|status| status.can_transition_to(to))
            .collect();
        let placeholders = vec!["?"; sources.len()].join(", ");

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let audit = format!(
            r#"
            INSERT INTO execution_transitions (execution_id, from_status, to_status, at, reason)
            SELECT id, status, ?, ?, ? FROM executions
            WHERE id = ? AND status IN ({placeholders})
            RETURNING from_status
            "#
        );
        let mut query = sqlx::query_scalar::<_, String>(&audit)
            .bind(to.as_str())
            .bind(at.timestamp_millis())
            .bind(reason)
            .bind(id);
        for source in &sources {
            query = query.bind(source.as_str());
        }
        let from = query.fetch_optional(&mut *tx).await.map_err(db_error)?;

        let Some(from) = from else {
            tx.rollback().await.map_err(db_error)?;
            return Err(self.rejected_transition(id, to).await);
        };
        let from = parse_enum::<ExecutionStatus>(&from)?;

        let updated = match (to, output) {
            (ExecutionStatus::Completed, Some((envelope, feature_result))) => sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, result_data = ?, feature_result = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(to_json(envelope)?)
            .bind(to_json(feature_result)?)
            .bind(at.timestamp_millis())
            .bind(id)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?,
            // result_data only survives on completed rows
            _ => sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, result_data = NULL, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(at.timestamp_millis())
            .bind(id)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?,
        };

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    /// Explain why a conditional transition matched no row
    async fn rejected_transition(&self, id: &str, to: ExecutionStatus) -> StoreError {
        let current: Result<Option<String>, StoreError> =
            sqlx::query_scalar("SELECT status FROM executions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error);

        match current {
            Ok(Some(from)) => match parse_enum::<ExecutionStatus>(&from) {
                Ok(from) => check_transition(id, from, to)
                    .err()
                    .unwrap_or_else(|| StoreError::InvalidTransition {
                        id: id.to_string(),
                        from,
                        to,
                    }),
                Err(err) => err,
            },
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn find_execution_by_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE user_id = ? AND idempotency_key = ?")
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find_recent_completed_by_params(
        &self,
        query: &ParamsQuery,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE user_id = ? AND feature_type = ? AND target_id = ? AND pricing_mode = ?
              AND params_hash = ? AND status = 'completed' AND created_at >= ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&query.user_id)
        .bind(query.feature_type.as_str())
        .bind(&query.target_id)
        .bind(query.pricing_mode.as_str())
        .bind(&query.params_hash)
        .bind(query.since.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn read_plan(&self, user_id: &str) -> Result<Option<PlanTier>, StoreError> {
        let tier: Option<String> = sqlx::query_scalar("SELECT tier FROM user_plans WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        tier.as_deref().map(parse_enum::<PlanTier>).transpose()
    }

    async fn set_plan(
        &self,
        user_id: &str,
        tier: PlanTier,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_plans (user_id, tier, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET tier = excluded.tier, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn count_subscription_usage(
        &self,
        user_id: &str,
        feature: FeatureType,
        month_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM executions
            WHERE user_id = ? AND feature_type = ? AND pricing_mode = 'subscription'
              AND status = 'completed' AND created_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(month_start.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(used as u32)
    }

    async fn create_pending_execution(
        &self,
        execution: &NewExecution,
    ) -> Result<ExecutionRecord, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (
                id, user_id, idempotency_key, feature_type, target_id, pricing_mode,
                input_params, params_hash, consumed_units, consumed_points, status,
                result_data, feature_result, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.user_id)
        .bind(&execution.idempotency_key)
        .bind(execution.feature_type.as_str())
        .bind(&execution.target_id)
        .bind(execution.pricing_mode.as_str())
        .bind(to_json(&execution.input_params)?)
        .bind(&execution.params_hash)
        .bind(execution.consumed_units as i64)
        .bind(execution.consumed_points)
        .bind(ExecutionStatus::Pending.as_str())
        .bind(execution.created_at.timestamp_millis())
        .bind(execution.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(execution.clone().into_record()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                if db_err.message().contains("idempotency_key") {
                    Err(StoreError::DuplicateIdempotencyKey {
                        user_id: execution.user_id.clone(),
                        key: execution.idempotency_key.clone(),
                    })
                } else {
                    Err(StoreError::DuplicateId(execution.id.clone()))
                }
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn complete_execution(
        &self,
        id: &str,
        output: &OutputEnvelope,
        feature_result: &FeatureResult,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(
            id,
            ExecutionStatus::Completed,
            "feature completed",
            at,
            Some((output, feature_result)),
        )
        .await
    }

    async fn mark_execution_failed(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, ExecutionStatus::Failed, reason, at, None)
            .await
    }

    async fn mark_execution_refunded(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, ExecutionStatus::Refunded, reason, at, None)
            .await
    }

    async fn list_transitions(&self, id: &str) -> Result<Vec<ExecutionTransition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT from_status, to_status, at, reason FROM execution_transitions
            WHERE execution_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| -> Result<ExecutionTransition, StoreError> {
                Ok(ExecutionTransition {
                    execution_id: id.to_string(),
                    from_status: parse_enum(row.get("from_status"))?,
                    to_status: parse_enum(row.get("to_status"))?,
                    at: from_millis(row.get("at"))?,
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE status = 'pending' AND created_at < ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(created_before.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn read_wallet(&self, user_id: &str) -> Result<WalletSnapshot, StoreError> {
        let row = sqlx::query("SELECT balance, version FROM point_wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row
            .map(|row| WalletSnapshot {
                balance: row.get("balance"),
                version: row.get("version"),
            })
            .unwrap_or_default())
    }

    async fn apply_balance_change(&self, change: &BalanceChange) -> Result<bool, StoreError> {
        if change.new_balance < 0 {
            return Err(StoreError::Constraint(format!(
                "wallet of {} would go negative",
                change.user_id
            )));
        }

        let now = change.transaction.created_at.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let written = if change.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO point_wallets (user_id, balance, version, updated_at)
                VALUES (?, ?, 1, ?)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(&change.user_id)
            .bind(change.new_balance)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
        } else {
            sqlx::query(
                r#"
                UPDATE point_wallets
                SET balance = ?, version = version + 1, updated_at = ?
                WHERE user_id = ? AND version = ?
                "#,
            )
            .bind(change.new_balance)
            .bind(now)
            .bind(&change.user_id)
            .bind(change.expected_version)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
        };

        if written.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Ok(false);
        }

        let entry = &change.transaction;
        sqlx::query(
            r#"
            INSERT INTO point_transactions (
                id, user_id, amount, kind, execution_id, balance_after, reason, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(&entry.execution_id)
        .bind(entry.balance_after)
        .bind(&entry.reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn list_point_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM point_transactions WHERE user_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn list_execution_transactions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM point_transactions WHERE execution_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Map a driver error, singling out a missing schema
fn db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.message().contains("no such table") => {
            StoreError::Unavailable(db_err.message().to_string())
        }
        sqlx::Error::Database(db_err) if db_err.message().contains("CHECK constraint") => {
            StoreError::Constraint(db_err.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::ConnectionError(err.to_string())
        }
        _ => StoreError::DatabaseError(err.to_string()),
    }
}

fn parse_enum<T>(s: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::SerializationError(format!("timestamp out of range: {millis}")))
}
