use chrono::{DateTime, Datelike, TimeZone, Utc};
use feature_ledger_config::PricingConfig;
use feature_ledger_types::{FeatureType, PlanTier, PricingMode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LedgerError, PlanDenial};
use crate::store::LedgerStore;

/// Point cost and monthly allowance of every feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingTable {
    costs: HashMap<FeatureType, i64>,
    allowances: HashMap<(PlanTier, FeatureType), u32>,
}

impl PricingTable {
    /// Build a table; every feature type needs a positive point cost
    pub fn new(
        costs: HashMap<FeatureType, i64>,
        allowances: HashMap<(PlanTier, FeatureType), u32>,
    ) -> Result<Self, LedgerError> {
        for feature in FeatureType::ALL {
            match costs.get(&feature) {
                Some(cost) if *cost > 0 => {}
                Some(cost) => {
                    return Err(LedgerError::Configuration(format!(
                        "point cost of {feature} must be positive, got {cost}"
                    )))
                }
                None => {
                    return Err(LedgerError::Configuration(format!(
                        "no point cost configured for {feature}"
                    )))
                }
            }
        }

        if let Some(((tier, feature), _)) = allowances
            .iter()
            .find(|((tier, _), units)| !tier.is_paid() && **units > 0)
        {
            return Err(LedgerError::Configuration(format!(
                "{tier} tier cannot carry an allowance for {feature}"
            )));
        }

        Ok(Self { costs, allowances })
    }

    /// Convert the loaded configuration, rejecting unknown names
    pub fn from_config(config: &PricingConfig) -> Result<Self, LedgerError> {
        let mut costs = HashMap::new();
        for (name, cost) in &config.point_costs {
            let feature = name
                .parse::<FeatureType>()
                .map_err(|e| LedgerError::Configuration(e.to_string()))?;
            costs.insert(feature, *cost);
        }

        let mut allowances = HashMap::new();
        for (tier_name, features) in &config.allowances {
            let tier = tier_name
                .parse::<PlanTier>()
                .map_err(|e| LedgerError::Configuration(e.to_string()))?;
            for (name, units) in features {
                let feature = name
                    .parse::<FeatureType>()
                    .map_err(|e| LedgerError::Configuration(e.to_string()))?;
                allowances.insert((tier, feature), *units);
            }
        }

        Self::new(costs, allowances)
    }

    pub fn point_cost(&self, feature: FeatureType) -> Result<i64, LedgerError> {
        self.costs.get(&feature).copied().ok_or_else(|| {
            LedgerError::Configuration(format!("no point cost configured for {feature}"))
        })
    }

    /// Monthly allowance; zero for the free tier and for missing entries
    pub fn allowance(&self, tier: PlanTier, feature: FeatureType) -> u32 {
        if !tier.is_paid() {
            return 0;
        }
        self.allowances
            .get(&(tier, feature))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let config = PricingConfig::default();
        let config = &config;

        let costs = FeatureType::ALL
            .into_iter()
            .filter_map(|f| config.point_cost(f).map(|cost| (f, cost)))
            .collect();
        let allowances = [PlanTier::TierA, PlanTier::TierB]
            .into_iter()
            .flat_map(|tier| {
                FeatureType::ALL
                    .into_iter()
                    .map(move |f| ((tier, f), config.allowance(tier, f)))
            })
            .collect();

        Self { costs, allowances }
    }
}

/// Resolved charge for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPlan {
    pub mode: PricingMode,
    pub plan: PlanTier,
    pub consumed_units: u32,
    pub consumed_points: i64,
    /// Allowance left after this request is counted
    pub remaining_units: u32,
}

/// First instant of the UTC calendar month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Decides whether and how a request is charged
pub struct PricingResolver<S> {
    store: Arc<S>,
    table: PricingTable,
}

impl<S: LedgerStore> PricingResolver<S> {
    pub fn new(store: Arc<S>, table: PricingTable) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        feature: FeatureType,
        mode: PricingMode,
        now: DateTime<Utc>,
    ) -> Result<BillingPlan, LedgerError> {
        let cost = self.table.point_cost(feature)?;

        // plan and usage reads are independent
        let (plan, used) = futures::try_join!(
            self.store.read_plan(user_id),
            self.store
                .count_subscription_usage(user_id, feature, month_start(now)),
        )?;
        let plan = plan.unwrap_or_default();
        let allowance = self.table.allowance(plan, feature);

        let billing = match mode {
            PricingMode::Subscription => {
                if !plan.is_paid() {
                    return Err(LedgerError::PlanRequired {
                        feature,
                        denial: PlanDenial::NoPaidPlan,
                    });
                }
                if used >= allowance {
                    return Err(LedgerError::PlanRequired {
                        feature,
                        denial: PlanDenial::AllowanceExhausted { used, allowance },
                    });
                }
                BillingPlan {
                    mode,
                    plan,
                    consumed_units: 1,
                    consumed_points: 0,
                    remaining_units: allowance.saturating_sub(used + 1),
                }
            }
            PricingMode::Points => BillingPlan {
                mode,
                plan,
                consumed_units: 0,
                consumed_points: cost,
                remaining_units: allowance.saturating_sub(used),
            },
        };

        debug!(
            user_id,
            feature = %feature,
            mode = %mode,
            plan = %plan,
            used,
            allowance,
            "pricing resolved"
        );
        Ok(billing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{tests::envelope, tests::feature_result, InMemoryStore, NewExecution};
    use chrono::Duration;
    use serde_json::json;

    async fn completed_subscription(
        store: &InMemoryStore,
        id: &str,
        feature: FeatureType,
        at: DateTime<Utc>,
    ) {
        let params = json!({});
        store
            .create_pending_execution(&NewExecution {
                id: id.to_string(),
                user_id: "user-1".to_string(),
                idempotency_key: id.to_string(),
                feature_type: feature,
                target_id: "target-1".to_string(),
                pricing_mode: PricingMode::Subscription,
                params_hash: feature_ledger_types::params_hash(&params),
                input_params: params,
                consumed_units: 1,
                consumed_points: 0,
                created_at: at,
            })
            .await
            .unwrap();
        store
            .complete_execution(id, &envelope(id), &feature_result(), at)
            .await
            .unwrap();
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_month_start() {
        assert_eq!(
            month_start(now()),
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
        );
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(month_start(first), first);
    }

    #[test]
    fn test_default_table() {
        let table = PricingTable::default();
        assert_eq!(table.point_cost(FeatureType::Report).unwrap(), 300);
        assert_eq!(table.point_cost(FeatureType::QualificationCalc).unwrap(), 120);
        assert_eq!(table.allowance(PlanTier::Free, FeatureType::Report), 0);
        assert_eq!(table.allowance(PlanTier::TierA, FeatureType::Report), 3);
        assert_eq!(table, PricingTable::from_config(&PricingConfig::default()).unwrap());
    }

    #[test]
    fn test_missing_cost_is_configuration_error() {
        let mut costs = HashMap::new();
        costs.insert(FeatureType::Report, 300);

        let err = PricingTable::new(costs, HashMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_unknown_config_name_rejected() {
        let mut config = PricingConfig::default();
        config.point_costs.insert("tarot".to_string(), 5);
        assert!(matches!(
            PricingTable::from_config(&config),
            Err(LedgerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_free_tier_cannot_use_subscription() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = PricingResolver::new(store, PricingTable::default());

        let err = resolver
            .resolve("user-1", FeatureType::Report, PricingMode::Subscription, now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::PlanRequired {
                denial: PlanDenial::NoPaidPlan,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_subscription_counts_down_allowance() {
        let store = Arc::new(InMemoryStore::new());
        store.set_plan("user-1", PlanTier::TierA, now()).await.unwrap();
        let resolver = PricingResolver::new(store.clone(), PricingTable::default());

        // last month's usage does not count
        completed_subscription(&store, "april", FeatureType::Report, now() - Duration::days(30))
            .await;
        completed_subscription(&store, "may-1", FeatureType::Report, now() - Duration::days(2))
            .await;

        let plan = resolver
            .resolve("user-1", FeatureType::Report, PricingMode::Subscription, now())
            .await
            .unwrap();
        assert_eq!(plan.consumed_units, 1);
        assert_eq!(plan.consumed_points, 0);
        assert_eq!(plan.remaining_units, 1);

        completed_subscription(&store, "may-2", FeatureType::Report, now() - Duration::days(1))
            .await;
        let plan = resolver
            .resolve("user-1", FeatureType::Report, PricingMode::Subscription, now())
            .await
            .unwrap();
        assert_eq!(plan.remaining_units, 0);

        completed_subscription(&store, "may-3", FeatureType::Report, now()).await;
        let err = resolver
            .resolve("user-1", FeatureType::Report, PricingMode::Subscription, now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::PlanRequired {
                denial: PlanDenial::AllowanceExhausted {
                    used: 3,
                    allowance: 3
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_points_mode_reports_allowance_without_decrement() {
        let store = Arc::new(InMemoryStore::new());
        store.set_plan("user-1", PlanTier::TierB, now()).await.unwrap();
        completed_subscription(&store, "s-1", FeatureType::QualificationCalc, now()).await;
        let resolver = PricingResolver::new(store, PricingTable::default());

        let plan = resolver
            .resolve(
                "user-1",
                FeatureType::QualificationCalc,
                PricingMode::Points,
                now(),
            )
            .await
            .unwrap();
        assert_eq!(plan.consumed_units, 0);
        assert_eq!(plan.consumed_points, 120);
        assert_eq!(plan.remaining_units, 19);
        assert_eq!(plan.plan, PlanTier::TierB);
    }
}
