use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Paid feature that can be executed through the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    /// AI-generated report for a target
    Report,

    /// Participant statistics computation
    ParticipantStats,

    /// Rate statistics computation
    RateStats,

    /// Deterministic qualification score
    QualificationCalc,
}

impl FeatureType {
    /// Every feature type, in a stable order
    pub const ALL: [FeatureType; 4] = [
        FeatureType::Report,
        FeatureType::ParticipantStats,
        FeatureType::RateStats,
        FeatureType::QualificationCalc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Report => "report",
            FeatureType::ParticipantStats => "participant_stats",
            FeatureType::RateStats => "rate_stats",
            FeatureType::QualificationCalc => "qualification_calc",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(FeatureType::Report),
            "participant_stats" => Ok(FeatureType::ParticipantStats),
            "rate_stats" => Ok(FeatureType::RateStats),
            "qualification_calc" => Ok(FeatureType::QualificationCalc),
            other => Err(UnknownVariant::new("feature type", other)),
        }
    }
}

/// How an execution is paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    /// Consumes one unit of the monthly plan allowance
    Subscription,

    /// Deducts the feature's point cost from the wallet
    Points,
}

impl PricingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingMode::Subscription => "subscription",
            PricingMode::Points => "points",
        }
    }
}

impl fmt::Display for PricingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(PricingMode::Subscription),
            "points" => Ok(PricingMode::Points),
            other => Err(UnknownVariant::new("pricing mode", other)),
        }
    }
}

/// Subscription plan tier of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    TierA,
    TierB,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::TierA => "tier_a",
            PlanTier::TierB => "tier_b",
        }
    }

    /// Whether the tier carries a monthly allowance at all
    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl Default for PlanTier {
    fn default() -> Self {
        PlanTier::Free
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "tier_a" => Ok(PlanTier::TierA),
            "tier_b" => Ok(PlanTier::TierB),
            other => Err(UnknownVariant::new("plan tier", other)),
        }
    }
}

/// Returned when a stored string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_type_string_round_trip() {
        for feature in FeatureType::ALL {
            assert_eq!(feature.as_str().parse::<FeatureType>().unwrap(), feature);
        }
    }

    #[test]
    fn test_feature_type_serde_matches_as_str() {
        let json = serde_json::to_string(&FeatureType::QualificationCalc).unwrap();
        assert_eq!(json, "\"qualification_calc\"");
    }

    #[test]
    fn test_unknown_values_rejected() {
        let err = "ai_magic".parse::<FeatureType>().unwrap_err();
        assert_eq!(err.kind, "feature type");
        assert!("monthly".parse::<PricingMode>().is_err());
        assert!("gold".parse::<PlanTier>().is_err());
    }

    #[test]
    fn test_plan_tier_paid() {
        assert!(!PlanTier::Free.is_paid());
        assert!(PlanTier::TierA.is_paid());
        assert!(PlanTier::TierB.is_paid());
        assert_eq!(PlanTier::default(), PlanTier::Free);
    }
}
