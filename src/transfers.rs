// 🔁 Internal Transfer Detection - moves between the platform's own wallets
//
// A transfer is internal when BOTH ends are tracked addresses. Each internal
// transfer is recorded twice (sender's outgoing leg, receiver's incoming leg),
// so the two legs are cross-checked: a pair only counts when they agree.

use crate::db::{self, Direction, LedgerTransaction, TransferKind};
use crate::entities::wallet::address_key;
use crate::entities::{Network, Wallet};
use crate::error::LedgerResult;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

// ============================================================================
// REPORT TYPES
// ============================================================================

/// Both legs present and consistent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalTransfer {
    pub network: Network,
    pub tx_hash: String,
    pub outgoing: LedgerTransaction,
    pub incoming: LedgerTransaction,
}

/// Only one wallet has recorded the transfer so far
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneSidedTransfer {
    pub network: Network,
    pub tx_hash: String,
    pub leg: LedgerTransaction,
    pub missing: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictReason {
    AmountMismatch { outgoing: Decimal, incoming: Decimal },
    CurrencyMismatch { outgoing: String, incoming: String },
    AddressMismatch { outgoing: String, incoming: String },
    /// More than one leg recorded for the same side
    DuplicateLegs { direction: Direction, count: usize },
}

/// The two wallets tell different stories about the same transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConflict {
    pub network: Network,
    pub tx_hash: String,
    pub legs: Vec<LedgerTransaction>,
    pub reasons: Vec<ConflictReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalTransferReport {
    pub pairs: Vec<InternalTransfer>,
    pub one_sided: Vec<OneSidedTransfer>,
    pub conflicts: Vec<TransferConflict>,
    pub external_count: usize,
}

impl InternalTransferReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Uuids of every leg classified as internal
    pub fn internal_leg_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for pair in &self.pairs {
            ids.push(pair.outgoing.id.clone());
            ids.push(pair.incoming.id.clone());
        }
        ids.extend(self.one_sided.iter().map(|o| o.leg.id.clone()));
        for conflict in &self.conflicts {
            ids.extend(conflict.legs.iter().map(|l| l.id.clone()));
        }
        ids
    }

    pub fn summary(&self) -> String {
        format!(
            "Internal transfers: {} paired, {} one-sided, {} conflicts ({} external)",
            self.pairs.len(),
            self.one_sided.len(),
            self.conflicts.len(),
            self.external_count
        )
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct TransferClassifier {
    /// Tracked address set (see `address_key`)
    tracked: HashSet<String>,

    /// Max amount difference between the two legs (default: 1e-8)
    pub amount_tolerance: Decimal,
}

impl TransferClassifier {
    pub fn new(tracked: HashSet<String>) -> Self {
        TransferClassifier {
            tracked,
            amount_tolerance: Decimal::new(1, 8),
        }
    }

    /// Classifier over the active wallets in `wallets`
    pub fn from_wallets(wallets: &[Wallet]) -> Self {
        Self::new(
            wallets
                .iter()
                .filter(|w| w.is_active && w.is_current())
                .map(|w| w.address_key())
                .collect(),
        )
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.amount_tolerance = tolerance;
        self
    }

    pub fn is_tracked(&self, network: Network, address: &str) -> bool {
        self.tracked.contains(&address_key(network, address))
    }

    pub fn classify(&self, tx: &LedgerTransaction) -> TransferKind {
        if self.is_tracked(tx.network, &tx.from_address) && self.is_tracked(tx.network, &tx.to_address) {
            TransferKind::Internal
        } else {
            TransferKind::External
        }
    }

    /// Group internal legs by (network, tx_hash) and cross-check them
    pub fn pair_internal(&self, transactions: &[LedgerTransaction]) -> InternalTransferReport {
        let mut report = InternalTransferReport::default();
        let mut groups: BTreeMap<(String, String), Vec<&LedgerTransaction>> = BTreeMap::new();

        for tx in transactions {
            // Failed txs moved nothing; fee-only rows have no counterpart leg
            if tx.status == db::TxStatus::Failed || tx.amount.is_zero() {
                continue;
            }
            if self.classify(tx) == TransferKind::Internal {
                groups
                    .entry((tx.network.as_str().to_string(), tx.tx_hash.to_lowercase()))
                    .or_default()
                    .push(tx);
            } else {
                report.external_count += 1;
            }
        }

        for ((_, tx_hash), legs) in groups {
            let network = legs[0].network;
            let outgoing: Vec<&LedgerTransaction> =
                legs.iter().copied().filter(|l| l.direction == Direction::Outgoing).collect();
            let incoming: Vec<&LedgerTransaction> =
                legs.iter().copied().filter(|l| l.direction == Direction::Incoming).collect();

            match (outgoing.as_slice(), incoming.as_slice()) {
                ([out], [inc]) => {
                    let reasons = self.compare_legs(out, inc);
                    if reasons.is_empty() {
                        report.pairs.push(InternalTransfer {
                            network,
                            tx_hash,
                            outgoing: (*out).clone(),
                            incoming: (*inc).clone(),
                        });
                    } else {
                        report.conflicts.push(TransferConflict {
                            network,
                            tx_hash,
                            legs: vec![(*out).clone(), (*inc).clone()],
                            reasons,
                        });
                    }
                }
                ([leg], []) | ([], [leg]) => {
                    let missing = match leg.direction {
                        Direction::Outgoing => Direction::Incoming,
                        Direction::Incoming => Direction::Outgoing,
                    };
                    report.one_sided.push(OneSidedTransfer {
                        network,
                        tx_hash,
                        leg: (*leg).clone(),
                        missing,
                    });
                }
                _ => {
                    let mut reasons = Vec::new();
                    if outgoing.len() > 1 {
                        reasons.push(ConflictReason::DuplicateLegs {
                            direction: Direction::Outgoing,
                            count: outgoing.len(),
                        });
                    }
                    if incoming.len() > 1 {
                        reasons.push(ConflictReason::DuplicateLegs {
                            direction: Direction::Incoming,
                            count: incoming.len(),
                        });
                    }
                    report.conflicts.push(TransferConflict {
                        network,
                        tx_hash,
                        legs: legs.into_iter().cloned().collect(),
                        reasons,
                    });
                }
            }
        }

        report
    }

    fn compare_legs(&self, out: &LedgerTransaction, inc: &LedgerTransaction) -> Vec<ConflictReason> {
        let mut reasons = Vec::new();

        if (out.amount - inc.amount).abs() > self.amount_tolerance {
            reasons.push(ConflictReason::AmountMismatch {
                outgoing: out.amount,
                incoming: inc.amount,
            });
        }
        if out.currency != inc.currency {
            reasons.push(ConflictReason::CurrencyMismatch {
                outgoing: out.currency.clone(),
                incoming: inc.currency.clone(),
            });
        }
        let out_route = (
            address_key(out.network, &out.from_address),
            address_key(out.network, &out.to_address),
        );
        let in_route = (
            address_key(inc.network, &inc.from_address),
            address_key(inc.network, &inc.to_address),
        );
        if out_route != in_route {
            reasons.push(ConflictReason::AddressMismatch {
                outgoing: format!("{} -> {}", out.from_address, out.to_address),
                incoming: format!("{} -> {}", inc.from_address, inc.to_address),
            });
        }

        reasons
    }

    /// Classify the whole ledger and persist the Internal kind.
    /// Legs already recorded as swap legs keep that kind.
    pub fn mark_internal(&self, conn: &Connection) -> LedgerResult<InternalTransferReport> {
        let transactions = db::get_all_transactions(conn)?;
        let report = self.pair_internal(&transactions);

        let swap_legs: HashSet<&str> = transactions
            .iter()
            .filter(|t| t.kind == TransferKind::SwapLeg)
            .map(|t| t.id.as_str())
            .collect();
        let ids: Vec<String> = report
            .internal_leg_ids()
            .into_iter()
            .filter(|id| !swap_legs.contains(id.as_str()))
            .collect();

        let changed = db::set_transaction_kind(conn, &ids, TransferKind::Internal)?;

        for conflict in &report.conflicts {
            warn!(tx_hash = %conflict.tx_hash, reasons = ?conflict.reasons, "internal transfer legs disagree");
        }
        info!(changed, "{}", report.summary());
        Ok(report)
    }
}
