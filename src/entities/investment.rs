// 💼 Investment Entity - what an investor committed, and whether it's paid
//
// payment_status is DERIVED: it is recomputed from the ledger by
// `reconciliation::PaymentReconciler`, never typed in by hand.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PAYMENT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Nothing received yet
    Pending,

    /// Some funds received, less than committed
    Partial,

    /// Received amount matches commitment (within tolerance)
    Paid,

    /// Received more than committed
    Overpaid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Overpaid => "overpaid",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Overpaid)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "partial" => Ok(PaymentStatus::Partial),
            "paid" => Ok(PaymentStatus::Paid),
            "overpaid" => Ok(PaymentStatus::Overpaid),
            other => Err(format!("Unknown payment status: {}", other)),
        }
    }
}

// ============================================================================
// INVESTMENT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: String,
    pub investor_id: String,

    /// Committed amount, denominated in `currency`
    pub amount: Decimal,
    pub currency: String,

    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl Investment {
    pub fn new(investor_id: &str, amount: Decimal, currency: &str) -> Self {
        Investment {
            id: uuid::Uuid::new_v4().to_string(),
            investor_id: investor_id.to_string(),
            amount,
            currency: currency.trim().to_uppercase(),
            payment_status: PaymentStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
