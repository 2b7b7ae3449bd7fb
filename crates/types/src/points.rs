use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::UnknownVariant;

/// Kind of point ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Points taken for an execution
    Deduction,

    /// Points returned for an execution that did not stand
    Refund,

    /// Points credited outside of any execution
    Grant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deduction => "deduction",
            TransactionKind::Refund => "refund",
            TransactionKind::Grant => "grant",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deduction" => Ok(TransactionKind::Deduction),
            "refund" => Ok(TransactionKind::Refund),
            "grant" => Ok(TransactionKind::Grant),
            other => Err(UnknownVariant::new("transaction kind", other)),
        }
    }
}

/// Immutable point ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointTransaction {
    pub id: String,
    pub user_id: String,
    /// Signed change: negative for deductions
    pub amount: i64,
    pub kind: TransactionKind,
    pub execution_id: Option<String>,
    /// Wallet balance right after this entry was applied
    pub balance_after: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Current wallet state together with its concurrency token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub balance: i64,
    /// Incremented on every successful write; 0 means no wallet row yet
    pub version: i64,
}

/// Sum of signed amounts, which must equal the wallet balance
pub fn replay_balance(transactions: &[PointTransaction]) -> i64 {
    transactions.iter().map(|t| t.amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(amount: i64, kind: TransactionKind) -> PointTransaction {
        PointTransaction {
            id: format!("tx-{amount}"),
            user_id: "user-1".to_string(),
            amount,
            kind,
            execution_id: None,
            balance_after: 0,
            reason: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_balance() {
        let history = vec![
            tx(1000, TransactionKind::Grant),
            tx(-120, TransactionKind::Deduction),
            tx(120, TransactionKind::Refund),
            tx(-300, TransactionKind::Deduction),
        ];
        assert_eq!(replay_balance(&history), 700);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(
            "refund".parse::<TransactionKind>().unwrap(),
            TransactionKind::Refund
        );
        assert!("bonus".parse::<TransactionKind>().is_err());
    }
}
