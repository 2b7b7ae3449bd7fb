//! Paid-feature execution ledger
//!
//! Meters and bills runs of expensive features under subscription
//! allowances or pay-per-use points. A retried request is never billed or
//! executed twice, and every failure leaves the wallet and the execution
//! record consistent.

use std::sync::Arc;
use std::time::Duration;

pub use feature_ledger_billing as billing;
pub use feature_ledger_config as config;
pub use feature_ledger_metrics as metrics;
pub use feature_ledger_types as types;

pub use feature_ledger_billing::{
    ExecutionManager, ExecutionRequest, FeatureError, FeatureExecutor, FeatureHandler,
    FeatureRegistry, FeatureRequest, InMemoryStore, LedgerError, LedgerStore, ManagerConfig,
    PricingTable, RecoveryReport, SqliteStore,
};
pub use feature_ledger_types::{
    ExecutionStatus, FeatureResult, FeatureType, OutputEnvelope, PlanTier, PricingMode,
};

use feature_ledger_config::{AppConfig, DatabaseConfig};
use feature_ledger_metrics::MetricsCollector;
use tracing::info;

/// Open the configured SQLite ledger, applying migrations when enabled
pub async fn open_store(config: &DatabaseConfig) -> Result<SqliteStore, LedgerError> {
    let store =
        SqliteStore::connect_with(&config.url, config.max_connections, config.run_migrations)
            .await?;
    info!(url = %config.url, "ledger store opened");
    Ok(store)
}

/// Registry with the configured executor timeout and no handlers yet
pub fn feature_registry(config: &AppConfig) -> FeatureRegistry {
    FeatureRegistry::new().with_timeout(Duration::from_millis(config.ledger.executor_timeout_ms))
}

/// Assemble an execution manager from validated configuration
pub fn build_manager<S, E>(
    config: &AppConfig,
    store: Arc<S>,
    executor: Arc<E>,
    metrics: Option<Arc<MetricsCollector>>,
) -> Result<ExecutionManager<S, E>, LedgerError>
where
    S: LedgerStore,
    E: FeatureExecutor,
{
    feature_ledger_config::validate_config(config)
        .map_err(|e| LedgerError::Configuration(e.to_string()))?;

    let pricing = PricingTable::from_config(&config.pricing)?;
    let manager = ExecutionManager::new(
        store,
        executor,
        pricing,
        ManagerConfig::from_config(&config.ledger),
    );

    Ok(match metrics {
        Some(metrics) if config.service.metrics_enabled => manager.with_metrics(metrics),
        _ => manager,
    })
}
