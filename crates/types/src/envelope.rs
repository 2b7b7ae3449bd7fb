use serde::{Deserialize, Serialize};

use crate::PricingMode;

/// What was charged for an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingResult {
    pub mode: PricingMode,
    pub consumed_units: u32,
    pub consumed_points: i64,
}

/// Balances left after the charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingBalance {
    pub subscription_units: Option<u32>,
    pub points: i64,
}

/// Caller-facing response of a successful execution
///
/// Stored verbatim on the execution row and replayed unchanged for
/// duplicate requests, so the field set and names are part of the wire
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEnvelope {
    pub execution_id: String,
    pub billing_result: BillingResult,
    pub remaining_balance: RemainingBalance,
    pub result_ref: String,
    pub error_code: Option<String>,
}
