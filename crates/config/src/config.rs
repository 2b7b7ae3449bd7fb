//! Core configuration structures for the execution ledger

use feature_ledger_types::{FeatureType, PlanTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub pricing: PricingConfig,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// Fallback log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Local,
}

/// SQLite connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://ledger.db?mode=rwc`
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Apply the bundled schema on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Execution pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Attempts at a wallet write before giving up on contention
    #[serde(default = "default_max_reserve_attempts")]
    pub max_reserve_attempts: u32,

    /// First backoff delay between wallet write attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Trailing window of the parameter-based reaccess cache
    #[serde(default = "default_reaccess_window_hours")]
    pub reaccess_window_hours: i64,

    /// Age after which a pending execution is handed to recovery
    #[serde(default = "default_stale_pending_secs")]
    pub stale_pending_secs: i64,

    /// Maximum executions recovered per sweep
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,

    /// Upper bound on a single feature run
    #[serde(default = "default_executor_timeout_ms")]
    pub executor_timeout_ms: u64,
}

/// Point costs and subscription allowances
///
/// Keys are the snake_case names of [`FeatureType`] and [`PlanTier`];
/// they are checked by [`crate::validate_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_point_costs")]
    pub point_costs: BTreeMap<String, i64>,

    /// Monthly allowance per plan tier and feature
    #[serde(default = "default_allowances")]
    pub allowances: BTreeMap<String, BTreeMap<String, u32>>,
}

impl PricingConfig {
    /// Configured point cost of `feature`
    pub fn point_cost(&self, feature: FeatureType) -> Option<i64> {
        self.point_costs.get(feature.as_str()).copied()
    }

    /// Configured monthly allowance; missing entries mean zero
    pub fn allowance(&self, tier: PlanTier, feature: FeatureType) -> u32 {
        self.allowances
            .get(tier.as_str())
            .and_then(|features| features.get(feature.as_str()))
            .copied()
            .unwrap_or(0)
    }
}

// Default value functions

fn default_environment() -> Environment {
    Environment::Local
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    "sqlite://feature-ledger.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_reserve_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_retry_backoff_max_ms() -> u64 {
    100
}

fn default_reaccess_window_hours() -> i64 {
    feature_ledger_types::DEFAULT_REACCESS_WINDOW_HOURS
}

fn default_stale_pending_secs() -> i64 {
    900
}

fn default_recovery_batch_size() -> usize {
    100
}

fn default_executor_timeout_ms() -> u64 {
    30_000
}

fn default_point_costs() -> BTreeMap<String, i64> {
    [
        (FeatureType::Report, 300),
        (FeatureType::ParticipantStats, 80),
        (FeatureType::RateStats, 80),
        (FeatureType::QualificationCalc, 120),
    ]
    .into_iter()
    .map(|(feature, cost)| (feature.as_str().to_string(), cost))
    .collect()
}

fn default_allowances() -> BTreeMap<String, BTreeMap<String, u32>> {
    let tier = |report, participant, rate, qualification| -> BTreeMap<String, u32> {
        [
            (FeatureType::Report, report),
            (FeatureType::ParticipantStats, participant),
            (FeatureType::RateStats, rate),
            (FeatureType::QualificationCalc, qualification),
        ]
        .into_iter()
        .map(|(feature, units)| (feature.as_str().to_string(), units))
        .collect()
    };

    let mut allowances = BTreeMap::new();
    allowances.insert(PlanTier::TierA.as_str().to_string(), tier(3, 10, 10, 5));
    allowances.insert(PlanTier::TierB.as_str().to_string(), tier(10, 50, 50, 20));
    allowances
}

// Default implementations

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            run_migrations: true,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_reserve_attempts: default_max_reserve_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            reaccess_window_hours: default_reaccess_window_hours(),
            stale_pending_secs: default_stale_pending_secs(),
            recovery_batch_size: default_recovery_batch_size(),
            executor_timeout_ms: default_executor_timeout_ms(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            point_costs: default_point_costs(),
            allowances: default_allowances(),
        }
    }
}
