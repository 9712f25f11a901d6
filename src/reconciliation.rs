// ⚖️ Reconciliation Engine - make the ledger agree with reality
//
// Two checks:
//   1. Payments:  sum(confirmed incoming linked to investment) vs committed amount
//   2. Balances:  opening + inflows - outflows - fees = on-chain balance
//
// Without these, a synced balance is just a number someone fetched.

use crate::db::{self, Direction, Event, LedgerTransaction};
use crate::entities::{Investment, PaymentStatus, Wallet};
use crate::error::LedgerResult;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// PAYMENT RECONCILIATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReconciliation {
    pub investment_id: String,
    pub currency: String,
    pub committed: Decimal,
    pub received: Decimal,

    /// committed - received, floored at zero
    pub outstanding: Decimal,

    pub previous_status: PaymentStatus,
    pub status: PaymentStatus,

    /// Transactions that counted toward `received`
    pub counted_transactions: usize,

    /// Linked transactions left out (pending, failed, outgoing, other currency)
    pub ignored_transactions: usize,

    pub reconciled_at: DateTime<Utc>,
}

impl PaymentReconciliation {
    pub fn changed(&self) -> bool {
        self.status != self.previous_status
    }

    pub fn summary(&self) -> String {
        format!(
            "Investment {}: received {} of {} {} -> {}",
            self.investment_id, self.received, self.committed, self.currency, self.status
        )
    }
}

pub struct PaymentReconciler {
    /// Allowed gap between received and committed for "paid" (default: 0.01)
    pub tolerance: Decimal,
}

impl PaymentReconciler {
    pub fn new() -> Self {
        PaymentReconciler {
            tolerance: Decimal::new(1, 2),
        }
    }

    pub fn with_tolerance(tolerance: Decimal) -> Self {
        PaymentReconciler {
            tolerance: tolerance.abs(),
        }
    }

    fn counts_toward(investment: &Investment, tx: &LedgerTransaction) -> bool {
        tx.investment_id.as_deref() == Some(investment.id.as_str())
            && tx.is_confirmed()
            && tx.direction == Direction::Incoming
            && tx.currency.eq_ignore_ascii_case(&investment.currency)
    }

    /// Derive the payment status of one investment from its linked transactions
    pub fn reconcile_investment(
        &self,
        investment: &Investment,
        transactions: &[LedgerTransaction],
    ) -> PaymentReconciliation {
        let linked: Vec<&LedgerTransaction> = transactions
            .iter()
            .filter(|tx| tx.investment_id.as_deref() == Some(investment.id.as_str()))
            .collect();
        let counted: Vec<&LedgerTransaction> = linked
            .iter()
            .copied()
            .filter(|tx| Self::counts_toward(investment, tx))
            .collect();

        let received: Decimal = counted.iter().map(|tx| tx.amount).sum();
        let status = self.status_for(investment.amount, received);

        PaymentReconciliation {
            investment_id: investment.id.clone(),
            currency: investment.currency.clone(),
            committed: investment.amount,
            received,
            outstanding: (investment.amount - received).max(Decimal::ZERO),
            previous_status: investment.payment_status,
            status,
            counted_transactions: counted.len(),
            ignored_transactions: linked.len() - counted.len(),
            reconciled_at: Utc::now(),
        }
    }

    fn status_for(&self, committed: Decimal, received: Decimal) -> PaymentStatus {
        if received.is_zero() {
            PaymentStatus::Pending
        } else if received < committed - self.tolerance {
            PaymentStatus::Partial
        } else if received > committed + self.tolerance {
            PaymentStatus::Overpaid
        } else {
            PaymentStatus::Paid
        }
    }

    /// Reconcile every investment and persist changed statuses
    pub fn reconcile_all(&self, conn: &Connection) -> LedgerResult<Vec<PaymentReconciliation>> {
        let investments = db::get_all_investments(conn)?;
        let mut results = Vec::with_capacity(investments.len());

        for investment in &investments {
            let result = self.reconcile_one(conn, investment)?;
            results.push(result);
        }

        let changed = results.iter().filter(|r| r.changed()).count();
        info!(investments = results.len(), changed, "payment reconciliation finished");
        Ok(results)
    }

    /// Reconcile one stored investment and persist its status if it changed
    pub fn reconcile_one(&self, conn: &Connection, investment: &Investment) -> LedgerResult<PaymentReconciliation> {
        let transactions = db::get_transactions_for_investment(conn, &investment.id)?;
        let result = self.reconcile_investment(investment, &transactions);

        if result.changed() {
            db::update_payment_status(conn, &investment.id, result.status)?;
            let event = Event::new(
                "payment_status_changed",
                "investment",
                &investment.id,
                serde_json::json!({
                    "from": result.previous_status.as_str(),
                    "to": result.status.as_str(),
                    "received": result.received.to_string(),
                    "committed": result.committed.to_string(),
                }),
                "payment_reconciler",
            );
            db::insert_event(conn, &event)?;
        }
        Ok(result)
    }
}

impl Default for PaymentReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BALANCE RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Ledger explains the on-chain balance
    Balanced {
        opening_balance: Decimal,
        total_inflows: Decimal,
        total_outflows: Decimal,
        closing_balance: Decimal,
    },

    /// Off by less than the major threshold
    MinorDiscrepancy {
        expected_balance: Decimal,
        actual_balance: Decimal,
        difference: Decimal,
        tolerance: Decimal,
    },

    /// Off by the major threshold or more: transactions are missing
    MajorDiscrepancy {
        expected_balance: Decimal,
        actual_balance: Decimal,
        difference: Decimal,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn difference(&self) -> Decimal {
        match self {
            ReconciliationResult::Balanced { .. } => Decimal::ZERO,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub description: String,
    pub amount: Decimal,
    pub category: DiscrepancyCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    AmountMismatch,
    PendingTransaction,
}

// ============================================================================
// BALANCE RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReconciliationReport {
    pub wallet_id: String,
    pub wallet_label: String,
    pub currency: String,
    pub result: ReconciliationResult,
    pub transaction_count: usize,
    pub total_inflows: Decimal,
    pub total_outflows: Decimal,
    pub total_fees: Decimal,
    pub calculated_balance: Decimal,
    pub onchain_balance: Decimal,
    pub discrepancies: Vec<Discrepancy>,
    pub reconciled_at: DateTime<Utc>,
}

impl BalanceReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced()
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation for {} ({}): {} transactions, calculated {}, on-chain {}, difference {}",
            self.wallet_label,
            self.currency,
            self.transaction_count,
            self.calculated_balance,
            self.onchain_balance,
            self.result.difference()
        )
    }
}

// ============================================================================
// BALANCE RECONCILER
// ============================================================================

pub struct BalanceReconciler {
    /// Differences below this are rounding (default: 0.00000001)
    pub tolerance: Decimal,

    /// Minor vs major discrepancy, in wallet currency (default: 0.01)
    pub major_discrepancy_threshold: Decimal,
}

impl BalanceReconciler {
    pub fn new() -> Self {
        BalanceReconciler {
            tolerance: Decimal::new(1, 8),
            major_discrepancy_threshold: Decimal::new(1, 2),
        }
    }

    pub fn with_thresholds(tolerance: Decimal, major_threshold: Decimal) -> Self {
        BalanceReconciler {
            tolerance,
            major_discrepancy_threshold: major_threshold,
        }
    }

    /// Check a wallet's synced balance against its ledger rows.
    ///
    /// Formula: opening + inflows - outflows - fees = on-chain balance
    /// (fees only count on native-coin wallets). Only confirmed rows count.
    pub fn reconcile_wallet(
        &self,
        wallet: &Wallet,
        opening_balance: Decimal,
        transactions: &[LedgerTransaction],
    ) -> BalanceReconciliationReport {
        let own: Vec<&LedgerTransaction> = transactions
            .iter()
            .filter(|tx| tx.wallet_id == wallet.id)
            .collect();
        let confirmed: Vec<&LedgerTransaction> =
            own.iter().copied().filter(|tx| tx.is_confirmed()).collect();

        let total_inflows: Decimal = confirmed
            .iter()
            .filter(|tx| tx.direction == Direction::Incoming)
            .map(|tx| tx.amount)
            .sum();
        let total_outflows: Decimal = confirmed
            .iter()
            .filter(|tx| tx.direction == Direction::Outgoing)
            .map(|tx| tx.amount)
            .sum();
        let net: Decimal = confirmed.iter().map(|tx| tx.balance_effect()).sum();
        let total_fees = total_inflows - total_outflows - net;

        let calculated_balance = opening_balance + net;
        let difference = (calculated_balance - wallet.balance).abs();

        let result = if difference <= self.tolerance {
            ReconciliationResult::Balanced {
                opening_balance,
                total_inflows,
                total_outflows,
                closing_balance: wallet.balance,
            }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                expected_balance: wallet.balance,
                actual_balance: calculated_balance,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                expected_balance: wallet.balance,
                actual_balance: calculated_balance,
                difference,
            }
        };

        let mut discrepancies = Vec::new();
        if difference > self.tolerance {
            discrepancies.push(Discrepancy {
                description: format!("Balance mismatch: {} {} difference", difference, wallet.currency),
                amount: difference,
                category: DiscrepancyCategory::AmountMismatch,
            });
        }
        for tx in own.iter().filter(|tx| !tx.is_confirmed()) {
            discrepancies.push(Discrepancy {
                description: format!("Unconfirmed transaction {} not counted", tx.tx_hash),
                amount: tx.balance_effect(),
                category: DiscrepancyCategory::PendingTransaction,
            });
        }

        BalanceReconciliationReport {
            wallet_id: wallet.id.clone(),
            wallet_label: wallet.label.clone(),
            currency: wallet.currency.clone(),
            result,
            transaction_count: confirmed.len(),
            total_inflows,
            total_outflows,
            total_fees,
            calculated_balance,
            onchain_balance: wallet.balance,
            discrepancies,
            reconciled_at: Utc::now(),
        }
    }

    /// Reconcile every current wallet against its full ledger history.
    /// Opening balance is zero: the ledger is expected to hold every movement.
    pub fn reconcile_all(&self, conn: &Connection) -> LedgerResult<Vec<BalanceReconciliationReport>> {
        let wallets = db::get_current_wallets(conn)?;
        let mut reports = Vec::with_capacity(wallets.len());
        for wallet in wallets.iter().filter(|w| w.is_active) {
            let transactions = db::get_transactions_for_wallet(conn, &wallet.id)?;
            reports.push(self.reconcile_wallet(wallet, Decimal::ZERO, &transactions));
        }
        Ok(reports)
    }
}

impl Default for BalanceReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TxStatus;
    use crate::entities::Network;
    use rust_decimal_macros::dec;

    fn create_test_transaction(wallet: &Wallet, hash: &str, direction: Direction, amount: Decimal) -> LedgerTransaction {
        LedgerTransaction::new(hash, wallet, direction, "from", "to", amount, Utc::now())
    }

    fn usdt_wallet() -> Wallet {
        Wallet::new(
            "Treasury USDT",
            "0x1111111111111111111111111111111111111111",
            Network::Ethereum,
            "USDT",
        )
        .with_token_contract("0xdac17f958d2ee523a2206206994597c13d831ec7")
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    #[test]
    fn test_payment_status_transitions() {
        let reconciler = PaymentReconciler::new();
        let wallet = usdt_wallet();
        let investment = Investment::new("investor-1", dec!(10000), "USDT");

        let pay = |amount: Decimal, hash: &str| {
            create_test_transaction(&wallet, hash, Direction::Incoming, amount).with_investment(&investment.id)
        };

        let none = reconciler.reconcile_investment(&investment, &[]);
        assert_eq!(none.status, PaymentStatus::Pending);
        assert!(!none.changed());

        let partial = reconciler.reconcile_investment(&investment, &[pay(dec!(4000), "a")]);
        assert_eq!(partial.status, PaymentStatus::Partial);
        assert_eq!(partial.outstanding, dec!(6000));

        let paid = reconciler.reconcile_investment(&investment, &[pay(dec!(4000), "a"), pay(dec!(5999.995), "b")]);
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert!(paid.changed());

        let over = reconciler.reconcile_investment(&investment, &[pay(dec!(10000.02), "a")]);
        assert_eq!(over.status, PaymentStatus::Overpaid);
        assert_eq!(over.outstanding, Decimal::ZERO);
    }

    #[test]
    fn test_payment_ignores_unconfirmed_and_foreign_rows() {
        let reconciler = PaymentReconciler::new();
        let wallet = usdt_wallet();
        let investment = Investment::new("investor-1", dec!(100), "USDT");

        let pending = create_test_transaction(&wallet, "a", Direction::Incoming, dec!(100))
            .with_investment(&investment.id)
            .with_status(TxStatus::Pending);
        let refund = create_test_transaction(&wallet, "b", Direction::Outgoing, dec!(100))
            .with_investment(&investment.id);
        let unrelated = create_test_transaction(&wallet, "c", Direction::Incoming, dec!(100));

        let result = reconciler.reconcile_investment(&investment, &[pending, refund, unrelated]);
        assert_eq!(result.status, PaymentStatus::Pending);
        assert_eq!(result.counted_transactions, 0);
        assert_eq!(result.ignored_transactions, 2);
    }

    #[test]
    fn test_reconcile_all_persists_and_logs_changes() {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let wallet = usdt_wallet();
        db::insert_wallet(&conn, &wallet, "test").unwrap();

        let investment = Investment::new("investor-1", dec!(500), "USDT");
        db::insert_investment(&conn, &investment).unwrap();
        let tx = create_test_transaction(&wallet, "0xpay", Direction::Incoming, dec!(500));
        db::insert_transactions(&conn, &[tx.clone()], "test").unwrap();
        db::link_transaction_to_investment(&conn, &tx.id, &investment.id, "test").unwrap();

        let reconciler = PaymentReconciler::new();
        let results = reconciler.reconcile_all(&conn).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, PaymentStatus::Paid);

        let stored = db::get_investment(&conn, &investment.id).unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        let events = db::get_events_for_entity(&conn, "investment", &investment.id).unwrap();
        assert_eq!(
            events.iter().filter(|e| e.event_type == "payment_status_changed").count(),
            1
        );

        // Second pass: nothing changes, no new event
        let again = reconciler.reconcile_all(&conn).unwrap();
        assert!(!again[0].changed());
        let events = db::get_events_for_entity(&conn, "investment", &investment.id).unwrap();
        assert_eq!(
            events.iter().filter(|e| e.event_type == "payment_status_changed").count(),
            1
        );
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    #[test]
    fn test_balance_reconciliation_with_fees() {
        let reconciler = BalanceReconciler::new();
        let wallet = Wallet::new(
            "Hot ETH",
            "0x2222222222222222222222222222222222222222",
            Network::Ethereum,
            "ETH",
        )
        .with_balance(dec!(1.499));

        let transactions = vec![
            create_test_transaction(&wallet, "a", Direction::Incoming, dec!(2)),
            create_test_transaction(&wallet, "b", Direction::Outgoing, dec!(0.5)).with_fee(dec!(0.001)),
        ];

        // 0 + 2 - 0.5 - 0.001 = 1.499
        let report = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(report.is_balanced());
        assert_eq!(report.total_inflows, dec!(2));
        assert_eq!(report.total_outflows, dec!(0.5));
        assert_eq!(report.total_fees, dec!(0.001));
        assert_eq!(report.transaction_count, 2);
    }

    #[test]
    fn test_fee_only_rows_explain_native_balance() {
        let reconciler = BalanceReconciler::new();
        let wallet = Wallet::new(
            "Gas ETH",
            "0x2222222222222222222222222222222222222222",
            Network::Ethereum,
            "ETH",
        )
        .with_balance(dec!(0.99879));

        // A token send and a reverted call: only gas leaves the wallet
        let transactions = vec![
            create_test_transaction(&wallet, "a", Direction::Incoming, dec!(1)),
            create_test_transaction(&wallet, "b", Direction::Outgoing, Decimal::ZERO).with_fee(dec!(0.001)),
            create_test_transaction(&wallet, "c", Direction::Outgoing, Decimal::ZERO).with_fee(dec!(0.00021)),
        ];

        let report = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(report.is_balanced(), "{}", report.summary());
        assert_eq!(report.total_outflows, Decimal::ZERO);
        assert_eq!(report.total_fees, dec!(0.00121));
    }

    #[test]
    fn test_token_fees_do_not_hit_token_balance() {
        let reconciler = BalanceReconciler::new();
        let wallet = usdt_wallet().with_balance(dec!(700));
        let transactions = vec![
            create_test_transaction(&wallet, "a", Direction::Incoming, dec!(1000)),
            create_test_transaction(&wallet, "b", Direction::Outgoing, dec!(300)).with_fee(dec!(0.002)),
        ];

        let report = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(report.is_balanced());
        assert_eq!(report.total_fees, Decimal::ZERO);
    }

    #[test]
    fn test_balance_minor_and_major_discrepancy() {
        let reconciler = BalanceReconciler::new();
        let wallet = usdt_wallet().with_balance(dec!(1000.005));
        let transactions = vec![create_test_transaction(&wallet, "a", Direction::Incoming, dec!(1000))];

        let minor = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(matches!(minor.result, ReconciliationResult::MinorDiscrepancy { .. }));
        assert_eq!(minor.result.difference(), dec!(0.005));
        assert_eq!(minor.discrepancies[0].category, DiscrepancyCategory::AmountMismatch);

        let wallet = wallet.with_balance(dec!(1250));
        let major = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(matches!(major.result, ReconciliationResult::MajorDiscrepancy { .. }));
        assert_eq!(major.result.difference(), dec!(250));
    }

    #[test]
    fn test_pending_rows_reported_not_counted() {
        let reconciler = BalanceReconciler::new();
        let wallet = usdt_wallet().with_balance(dec!(100));
        let transactions = vec![
            create_test_transaction(&wallet, "a", Direction::Incoming, dec!(100)),
            create_test_transaction(&wallet, "b", Direction::Incoming, dec!(50)).with_status(TxStatus::Pending),
        ];

        let report = reconciler.reconcile_wallet(&wallet, Decimal::ZERO, &transactions);
        assert!(report.is_balanced());
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].category, DiscrepancyCategory::PendingTransaction);
    }

    #[test]
    fn test_reconciliation_result_methods() {
        let balanced = ReconciliationResult::Balanced {
            opening_balance: dec!(1000),
            total_inflows: dec!(2000),
            total_outflows: dec!(500),
            closing_balance: dec!(2500),
        };
        assert!(balanced.is_balanced());
        assert!(!balanced.has_discrepancy());
        assert_eq!(balanced.difference(), Decimal::ZERO);

        let minor = ReconciliationResult::MinorDiscrepancy {
            expected_balance: dec!(2500),
            actual_balance: dec!(2495),
            difference: dec!(5),
            tolerance: dec!(0.01),
        };
        assert!(minor.has_discrepancy());
        assert_eq!(minor.difference(), dec!(5));
    }
}
