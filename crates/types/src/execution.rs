use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{FeatureType, OutputEnvelope, PricingMode, UnknownVariant};

/// Lifecycle state of a single execution
///
/// `Pending` is the only non-terminal state. `Completed` may still be
/// compensated into `Refunded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }

    /// Allowed edges of the execution state machine
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Completed)
                | (ExecutionStatus::Pending, ExecutionStatus::Failed)
                | (ExecutionStatus::Pending, ExecutionStatus::Refunded)
                | (ExecutionStatus::Completed, ExecutionStatus::Refunded)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "refunded" => Ok(ExecutionStatus::Refunded),
            other => Err(UnknownVariant::new("execution status", other)),
        }
    }
}

/// What a feature implementation hands back after running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResult {
    /// Reference to the stored artifact (report id, stats snapshot id, ...)
    pub result_ref: String,

    /// Version of the model or formula that produced the result
    pub model_version: Option<String>,

    /// Feature-specific payload
    pub result_data: serde_json::Value,
}

/// Persistent execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub user_id: String,
    pub idempotency_key: String,
    pub feature_type: FeatureType,
    pub target_id: String,
    pub pricing_mode: PricingMode,
    pub input_params: serde_json::Value,
    /// SHA-256 of the canonical form of `input_params`
    pub params_hash: String,
    pub consumed_units: u32,
    pub consumed_points: i64,
    pub status: ExecutionStatus,
    /// Output envelope, present only while `status == Completed`
    pub result_data: Option<OutputEnvelope>,
    pub feature_result: Option<FeatureResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Cached output to replay, if this execution completed
    pub fn cached_output(&self) -> Option<&OutputEnvelope> {
        match self.status {
            ExecutionStatus::Completed => self.result_data.as_ref(),
            _ => None,
        }
    }

    /// Whether the execution has been pending longer than `max_age_secs`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        self.status == ExecutionStatus::Pending
            && (now - self.created_at).num_seconds() > max_age_secs
    }
}

/// Audit row for one status change of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTransition {
    pub execution_id: String,
    pub from_status: ExecutionStatus,
    pub to_status: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ExecutionTransition {
    pub fn new(
        execution_id: impl Into<String>,
        from_status: ExecutionStatus,
        to_status: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            from_status,
            to_status,
            at,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
