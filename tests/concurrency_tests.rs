//! Ledger behaviour under concurrent requests and injected storage faults

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feature_ledger::billing::{BalanceChange, NewExecution, ParamsQuery, RetryPolicy, StoreError};
use feature_ledger::types::{
    replay_balance, ExecutionRecord, ExecutionTransition, PointTransaction, TransactionKind,
    WalletSnapshot,
};
use feature_ledger::{
    ExecutionManager, ExecutionRequest, ExecutionStatus, FeatureError, FeatureHandler,
    FeatureRegistry, FeatureRequest, FeatureResult, FeatureType, InMemoryStore, LedgerError,
    LedgerStore, ManagerConfig, OutputEnvelope, PlanTier, PricingMode, PricingTable, SqliteStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// FAULT-INJECTING STORE
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory store whose wallet and commit writes can be made to fail
#[derive(Default)]
struct FaultyStore {
    inner: InMemoryStore,
    /// Wallet writes still to be rejected as version conflicts
    wallet_conflicts: AtomicU32,
    fail_refunds: AtomicBool,
    fail_commit: AtomicBool,
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn find_execution_by_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.find_execution_by_idempotency(user_id, key).await
    }

    async fn find_recent_completed_by_params(
        &self,
        query: &ParamsQuery,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.find_recent_completed_by_params(query).await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn read_plan(&self, user_id: &str) -> Result<Option<PlanTier>, StoreError> {
        self.inner.read_plan(user_id).await
    }

    async fn set_plan(
        &self,
        user_id: &str,
        tier: PlanTier,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.set_plan(user_id, tier, at).await
    }

    async fn count_subscription_usage(
        &self,
        user_id: &str,
        feature: FeatureType,
        month_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.inner
            .count_subscription_usage(user_id, feature, month_start)
            .await
    }

    async fn create_pending_execution(
        &self,
        execution: &NewExecution,
    ) -> Result<ExecutionRecord, StoreError> {
        self.inner.create_pending_execution(execution).await
    }

    async fn complete_execution(
        &self,
        id: &str,
        output: &OutputEnvelope,
        feature_result: &FeatureResult,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("disk I/O error".to_string()));
        }
        self.inner
            .complete_execution(id, output, feature_result, at)
            .await
    }

    async fn mark_execution_failed(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_execution_failed(id, reason, at).await
    }

    async fn mark_execution_refunded(
        &self,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_execution_refunded(id, reason, at).await
    }

    async fn list_transitions(&self, id: &str) -> Result<Vec<ExecutionTransition>, StoreError> {
        self.inner.list_transitions(id).await
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.list_stale_pending(created_before, limit).await
    }

    async fn read_wallet(&self, user_id: &str) -> Result<WalletSnapshot, StoreError> {
        self.inner.read_wallet(user_id).await
    }

    async fn apply_balance_change(&self, change: &BalanceChange) -> Result<bool, StoreError> {
        if change.transaction.kind == TransactionKind::Refund
            && self.fail_refunds.load(Ordering::SeqCst)
        {
            return Err(StoreError::ConnectionError("connection reset".to_string()));
        }
        let conflicted = self
            .wallet_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if conflicted {
            return Ok(false);
        }
        self.inner.apply_balance_change(change).await
    }

    async fn list_point_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        self.inner.list_point_transactions(user_id).await
    }

    async fn list_execution_transactions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<PointTransaction>, StoreError> {
        self.inner.list_execution_transactions(execution_id).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Handler that yields once so concurrent requests interleave
#[derive(Default)]
struct YieldingHandler {
    runs: AtomicUsize,
}

#[async_trait]
impl FeatureHandler for YieldingHandler {
    async fn run(&self, request: &FeatureRequest) -> Result<FeatureResult, FeatureError> {
        tokio::task::yield_now().await;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(FeatureResult {
            result_ref: format!("report/{}", request.execution_id),
            model_version: None,
            result_data: json!({"pages": 12}),
        })
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 2, 14, 30, 0).unwrap()
}

fn manager<S: LedgerStore>(
    store: Arc<S>,
    handler: Arc<YieldingHandler>,
    attempts: u32,
) -> ExecutionManager<S, FeatureRegistry> {
    let executor = FeatureRegistry::new().register(FeatureType::Report, handler);
    ExecutionManager::new(
        store,
        Arc::new(executor),
        PricingTable::default(),
        ManagerConfig {
            retry: RetryPolicy::without_delay(attempts),
            ..ManagerConfig::default()
        },
    )
}

fn report(user: &str, key: &str, target: &str) -> ExecutionRequest {
    ExecutionRequest::new(
        user,
        key,
        FeatureType::Report,
        target,
        PricingMode::Points,
        json!({"format": "pdf"}),
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// CONCURRENCY
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spending_never_overdraws() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(YieldingHandler::default());
    let manager = Arc::new(manager(store.clone(), handler.clone(), 64));
    manager
        .grant_points("user-1", 1000, "purchase", t0())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(report("user-1", &format!("key-{i}"), &format!("team-{i}")), t0())
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut insufficient = 0;
    for result in futures::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(output) => {
                assert_eq!(output.billing_result.consumed_points, 300);
                assert!(output.remaining_balance.points >= 0);
                succeeded += 1;
            }
            Err(LedgerError::InsufficientPoints { required, .. }) => {
                assert_eq!(required, 300);
                insufficient += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(insufficient, 7);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 3);

    let balance = manager.balance("user-1").await.unwrap();
    assert_eq!(balance, 100);
    let history = manager.history("user-1").await.unwrap();
    assert_eq!(replay_balance(&history), balance);
    assert!(history.iter().all(|t| t.balance_after >= 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_execute_once() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(YieldingHandler::default());
    let manager = Arc::new(manager(store, handler.clone(), 64));
    manager
        .grant_points("user-1", 1000, "purchase", t0())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(report("user-1", "same-key", "team-1"), t0())
                    .await
            })
        })
        .collect();

    let mut outputs = Vec::new();
    for result in futures::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(output) => outputs.push(output),
            // the key was taken while its execution was still pending
            Err(LedgerError::IdempotencyConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert!(!outputs.is_empty());
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    assert_eq!(manager.balance("user-1").await.unwrap(), 700);

    // once settled, every retry replays
    let replay = manager
        .execute(report("user-1", "same-key", "team-1"), t0())
        .await
        .unwrap();
    assert_eq!(replay, outputs[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_do_not_contend_with_each_other() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(YieldingHandler::default());
    let manager = Arc::new(manager(store, handler, 3));

    for user in ["alice", "bob", "carol", "dave"] {
        manager.grant_points(user, 600, "purchase", t0()).await.unwrap();
    }

    let tasks: Vec<_> = ["alice", "bob", "carol", "dave"]
        .into_iter()
        .map(|user| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(report(user, "key-1", "team-1"), t0())
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().remaining_balance.points, 300);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONCURRENCY ON A SHARED SQLITE FILE
// ═══════════════════════════════════════════════════════════════════════════

async fn sqlite_file_store(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    Arc::new(SqliteStore::connect(&url, 8).await.unwrap())
}

async fn assert_settled(store: &SqliteStore, users: &[String]) {
    let far_future = t0() + Duration::days(365);
    assert!(store
        .list_stale_pending(far_future, 1000)
        .await
        .unwrap()
        .is_empty());
    for user in users {
        let history = store.list_point_transactions(user).await.unwrap();
        assert_eq!(
            replay_balance(&history),
            store.read_wallet(user).await.unwrap().balance,
            "{user}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_same_user_spending_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_file_store(&dir).await;
    let handler = Arc::new(YieldingHandler::default());
    let manager = Arc::new(manager(store.clone(), handler.clone(), 64));
    manager
        .grant_points("user-1", 3000, "purchase", t0())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(report("user-1", &format!("key-{i}"), &format!("team-{i}")), t0())
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        let output = result.unwrap().unwrap();
        assert_eq!(output.billing_result.consumed_points, 300);
    }

    assert_eq!(handler.runs.load(Ordering::SeqCst), 10);
    assert_eq!(manager.balance("user-1").await.unwrap(), 0);
    assert_settled(&store, &["user-1".to_string()]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_different_users_commit_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_file_store(&dir).await;
    let handler = Arc::new(YieldingHandler::default());
    let manager = Arc::new(manager(store.clone(), handler.clone(), 3));

    let users: Vec<String> = (0..32).map(|i| format!("user-{i}")).collect();
    for user in &users {
        manager.grant_points(user, 1000, "purchase", t0()).await.unwrap();
    }

    let tasks: Vec<_> = users
        .iter()
        .cloned()
        .map(|user| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(report(&user, "key-1", "team-1"), t0())
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        let output = result.unwrap().unwrap();
        assert_eq!(output.remaining_balance.points, 700);
    }

    assert_eq!(handler.runs.load(Ordering::SeqCst), 32);
    for user in &users {
        let record = store
            .find_execution_by_idempotency(user, "key-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed, "{user}");
        assert_eq!(manager.balance(user).await.unwrap(), 700);
    }
    assert_settled(&store, &users).await;
}

// ═══════════════════════════════════════════════════════════════════════════
// INJECTED FAULTS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_contention_exhaustion_fails_without_charge() {
    let store = Arc::new(FaultyStore::default());
    let handler = Arc::new(YieldingHandler::default());
    let manager = manager(store.clone(), handler.clone(), 3);
    manager
        .grant_points("user-1", 1000, "purchase", t0())
        .await
        .unwrap();

    store.wallet_conflicts.store(3, Ordering::SeqCst);
    let err = manager
        .execute(report("user-1", "key-1", "team-1"), t0())
        .await
        .unwrap_err();
    match &err {
        LedgerError::ExecutionFailed { reason, .. } => {
            assert!(reason.starts_with("ledger contention"), "{reason}")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
    assert_eq!(manager.balance("user-1").await.unwrap(), 1000);

    let record = store
        .find_execution_by_idempotency("user-1", "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);

    // two conflicts are absorbed by the retry loop
    store.wallet_conflicts.store(2, Ordering::SeqCst);
    let output = manager
        .execute(report("user-1", "key-2", "team-2"), t0())
        .await
        .unwrap();
    assert_eq!(output.remaining_balance.points, 700);
}

#[tokio::test]
async fn test_commit_failure_refunds_and_surfaces_storage_error() {
    let store = Arc::new(FaultyStore::default());
    let handler = Arc::new(YieldingHandler::default());
    let manager = manager(store.clone(), handler, 3);
    manager
        .grant_points("user-1", 1000, "purchase", t0())
        .await
        .unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    let err = manager
        .execute(report("user-1", "key-1", "team-1"), t0())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Storage(StoreError::DatabaseError(_))));
    assert!(err.is_retryable());
    assert_eq!(manager.balance("user-1").await.unwrap(), 1000);

    let record = store
        .find_execution_by_idempotency("user-1", "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Refunded);
}

#[tokio::test]
async fn test_failed_rollback_is_finished_by_recovery() {
    let store = Arc::new(FaultyStore::default());
    let manager = {
        let executor = FeatureRegistry::new().register(
            FeatureType::Report,
            Arc::new(ExplodingHandler) as Arc<dyn FeatureHandler>,
        );
        ExecutionManager::new(
            store.clone(),
            Arc::new(executor),
            PricingTable::default(),
            ManagerConfig {
                retry: RetryPolicy::without_delay(3),
                ..ManagerConfig::default()
            },
        )
    };
    manager
        .grant_points("user-1", 1000, "purchase", t0())
        .await
        .unwrap();

    store.fail_refunds.store(true, Ordering::SeqCst);
    let err = manager
        .execute(report("user-1", "key-1", "team-1"), t0())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("renderer crashed"));

    // refund could not be written: the execution stays pending and charged
    let record = store
        .find_execution_by_idempotency("user-1", "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Pending);
    assert_eq!(manager.balance("user-1").await.unwrap(), 700);

    store.fail_refunds.store(false, Ordering::SeqCst);
    let report = manager
        .recover_stale(t0() + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(report.refunded, vec![record.id.clone()]);
    assert_eq!(report.points_returned, 300);
    assert_eq!(manager.balance("user-1").await.unwrap(), 1000);

    let record = manager.execution(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Refunded);
}

struct ExplodingHandler;

#[async_trait]
impl FeatureHandler for ExplodingHandler {
    async fn run(&self, _request: &FeatureRequest) -> Result<FeatureResult, FeatureError> {
        Err(FeatureError::Failed("renderer crashed".to_string()))
    }
}
