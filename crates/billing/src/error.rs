use feature_ledger_types::{ExecutionStatus, FeatureType};
use thiserror::Error;

use crate::store::StoreError;

/// Why a paid-plan check refused a subscription execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDenial {
    /// User is on the free tier
    NoPaidPlan,

    /// Monthly allowance for this feature is used up
    AllowanceExhausted { used: u32, allowance: u32 },
}

impl std::fmt::Display for PlanDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanDenial::NoPaidPlan => f.write_str("no paid plan"),
            PlanDenial::AllowanceExhausted { used, allowance } => {
                write!(f, "monthly allowance exhausted ({used}/{allowance})")
            }
        }
    }
}

/// Errors surfaced to callers of the execution ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("authentication required")]
    AuthRequired,

    #[error("plan required for {feature}: {denial}")]
    PlanRequired {
        feature: FeatureType,
        denial: PlanDenial,
    },

    #[error("insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: i64, available: i64 },

    #[error("idempotency conflict: execution {execution_id} is {status}")]
    IdempotencyConflict {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error("execution failed: {reason}")]
    ExecutionFailed {
        execution_id: Option<String>,
        reason: String,
    },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl LedgerError {
    /// Stable machine-readable code for the error
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::AuthRequired => "AUTH_REQUIRED",
            LedgerError::PlanRequired { .. } => "PLAN_REQUIRED",
            LedgerError::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            LedgerError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            LedgerError::ExecutionFailed { .. } => "EXECUTION_FAILED",
            LedgerError::Unavailable(_) => "UNAVAILABLE",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the caller may retry the same request as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }

    pub(crate) fn execution_failed(
        execution_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LedgerError::ExecutionFailed {
            execution_id: Some(execution_id.into()),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LedgerError::Unavailable(msg),
            other => LedgerError::Storage(other),
        }
    }
}

/// Errors raised by a feature implementation
#[derive(Debug, Clone, Error)]
pub enum FeatureError {
    #[error("no handler registered for {0}")]
    Unsupported(FeatureType),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("feature timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Failed(String),
}
