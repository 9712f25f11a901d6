// 🔄 Swap Detection - outgoing + incoming on one platform = currency exchange
//
// Heuristic: when a platform sends one currency out and receives a different
// currency within the window, the pair is booked as a swap. Each ledger row
// is used by at most one swap; the closest incoming in time wins.

use crate::db::{self, Direction, Event, LedgerTransaction, SharedConnection, TransferKind, TxStatus};
use crate::error::LedgerResult;
use crate::prices::PriceSource;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{info, warn};

// ============================================================================
// TYPES
// ============================================================================

/// Two ledger rows that look like one exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapCandidate {
    pub platform: String,
    pub outgoing: LedgerTransaction,
    pub incoming: LedgerTransaction,
}

impl SwapCandidate {
    /// Stable id: same two chain transactions, same swap
    pub fn swap_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}:{}|{}:{}",
            self.outgoing.network.as_str(),
            self.outgoing.tx_hash.to_lowercase(),
            self.incoming.network.as_str(),
            self.incoming.tx_hash.to_lowercase()
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn gap(&self) -> Duration {
        self.incoming.occurred_at - self.outgoing.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: String,
    pub platform: String,
    pub sold_currency: String,
    pub sold_amount: Decimal,
    pub bought_currency: String,
    pub bought_amount: Decimal,

    /// Units bought per unit sold
    pub rate: Decimal,

    pub sold_value_usd: Option<Decimal>,
    pub bought_value_usd: Option<Decimal>,

    /// bought_value_usd - sold_value_usd, when both prices are known
    pub profit_loss_usd: Option<Decimal>,

    /// Ledger row uuids of the two legs
    pub outgoing_tx: String,
    pub incoming_tx: String,
    pub detected_at: DateTime<Utc>,
}

impl SwapRecord {
    pub fn is_valued(&self) -> bool {
        self.profit_loss_usd.is_some()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} {} -> {} {} (rate {})",
            self.platform,
            self.sold_amount,
            self.sold_currency,
            self.bought_amount,
            self.bought_currency,
            self.rate.round_dp(8).normalize()
        )
    }
}

// ============================================================================
// SWAP DETECTOR
// ============================================================================

pub struct SwapDetector {
    /// Max time between outgoing and incoming leg (default: 1 hour)
    pub window: Duration,
}

impl SwapDetector {
    pub fn new() -> Self {
        SwapDetector {
            window: Duration::hours(1),
        }
    }

    pub fn with_window(window: Duration) -> Self {
        SwapDetector { window }
    }

    // Fee-only rows move no value and cannot be a leg
    fn eligible(tx: &LedgerTransaction) -> bool {
        tx.kind == TransferKind::External
            && tx.status != TxStatus::Failed
            && tx.platform.is_some()
            && !tx.amount.is_zero()
    }

    /// Pair outgoing and incoming rows into swap candidates.
    ///
    /// Outgoing legs are taken oldest first; each picks the unused incoming
    /// leg on the same platform, in another currency, at or after it and
    /// inside the window, with the smallest gap (ties by row id).
    pub fn detect(&self, transactions: &[LedgerTransaction]) -> Vec<SwapCandidate> {
        let mut outgoing: Vec<&LedgerTransaction> = transactions
            .iter()
            .filter(|t| Self::eligible(t) && t.direction == Direction::Outgoing)
            .collect();
        outgoing.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));

        let incoming: Vec<&LedgerTransaction> = transactions
            .iter()
            .filter(|t| Self::eligible(t) && t.direction == Direction::Incoming)
            .collect();

        let mut used: HashSet<&str> = HashSet::new();
        let mut candidates = Vec::new();

        for out in outgoing {
            let Some(platform) = out.platform.as_deref() else {
                continue;
            };

            let best = incoming
                .iter()
                .copied()
                .filter(|inc| !used.contains(inc.id.as_str()))
                .filter(|inc| inc.platform.as_deref() == Some(platform))
                .filter(|inc| inc.currency != out.currency)
                .filter(|inc| {
                    let gap = inc.occurred_at - out.occurred_at;
                    gap >= Duration::zero() && gap <= self.window
                })
                .min_by(|a, b| {
                    let gap_a = a.occurred_at - out.occurred_at;
                    let gap_b = b.occurred_at - out.occurred_at;
                    gap_a.cmp(&gap_b).then_with(|| a.id.cmp(&b.id))
                });

            if let Some(inc) = best {
                used.insert(inc.id.as_str());
                candidates.push(SwapCandidate {
                    platform: platform.to_string(),
                    outgoing: out.clone(),
                    incoming: inc.clone(),
                });
            }
        }

        candidates
    }

    /// Price both legs in USD at the time they happened.
    /// A failed price lookup leaves the value empty instead of dropping the swap.
    pub async fn value(&self, candidate: &SwapCandidate, prices: &dyn PriceSource) -> SwapRecord {
        let out = &candidate.outgoing;
        let inc = &candidate.incoming;

        let sold_value_usd = leg_value(prices, out).await;
        let bought_value_usd = leg_value(prices, inc).await;
        let profit_loss_usd = match (sold_value_usd, bought_value_usd) {
            (Some(sold), Some(bought)) => Some(bought - sold),
            _ => None,
        };

        SwapRecord {
            id: candidate.swap_id(),
            platform: candidate.platform.clone(),
            sold_currency: out.currency.clone(),
            sold_amount: out.amount,
            bought_currency: inc.currency.clone(),
            bought_amount: inc.amount,
            rate: inc.amount.checked_div(out.amount).unwrap_or(Decimal::ZERO),
            sold_value_usd,
            bought_value_usd,
            profit_loss_usd,
            outgoing_tx: out.id.clone(),
            incoming_tx: inc.id.clone(),
            detected_at: Utc::now(),
        }
    }

    /// Record new swaps and mark their legs. Returns the swaps actually added.
    ///
    /// Each swap is written in one transaction. Legs of an already known swap
    /// are still marked, so a half-written earlier run is completed.
    pub fn persist(&self, conn: &Connection, records: &[SwapRecord]) -> LedgerResult<Vec<SwapRecord>> {
        let mut added = Vec::new();

        for record in records {
            let inserted = db::atomically(conn, |tx| {
                let inserted = db::insert_swap(tx, record)?;
                db::set_transaction_kind(
                    tx,
                    &[record.outgoing_tx.clone(), record.incoming_tx.clone()],
                    TransferKind::SwapLeg,
                )?;
                if !inserted {
                    return Ok(false);
                }

                let event = Event::new(
                    "swap_detected",
                    "swap",
                    &record.id,
                    serde_json::json!({
                        "platform": record.platform,
                        "sold": format!("{} {}", record.sold_amount, record.sold_currency),
                        "bought": format!("{} {}", record.bought_amount, record.bought_currency),
                        "profit_loss_usd": record.profit_loss_usd.map(|d| d.to_string()),
                    }),
                    "swap_detector",
                );
                db::insert_event(tx, &event)?;
                Ok(true)
            })?;

            if inserted {
                added.push(record.clone());
            }
        }

        Ok(added)
    }

    /// Detect, value and record swaps over the whole ledger.
    ///
    /// Rows already referenced by a stored swap never pair again; any of them
    /// not yet marked `SwapLeg` is marked before detection runs.
    pub async fn scan(&self, shared: &SharedConnection, prices: &dyn PriceSource) -> LedgerResult<Vec<SwapRecord>> {
        let open = {
            let conn = db::lock(shared);
            let swapped = db::get_swapped_transaction_ids(&conn)?;
            let (known, open): (Vec<LedgerTransaction>, Vec<LedgerTransaction>) =
                db::get_all_transactions(&conn)?
                    .into_iter()
                    .partition(|t| swapped.contains(&t.id));

            let unmarked: Vec<String> = known
                .into_iter()
                .filter(|t| t.kind != TransferKind::SwapLeg)
                .map(|t| t.id)
                .collect();
            if !unmarked.is_empty() {
                let repaired = db::set_transaction_kind(&conn, &unmarked, TransferKind::SwapLeg)?;
                warn!(repaired, "marked legs of stored swaps");
            }
            open
        };

        let candidates = self.detect(&open);
        let mut records = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            records.push(self.value(candidate, prices).await);
        }

        let added = {
            let conn = db::lock(shared);
            self.persist(&conn, &records)?
        };
        info!(candidates = candidates.len(), added = added.len(), "swap scan finished");
        Ok(added)
    }
}

impl Default for SwapDetector {
    fn default() -> Self {
        Self::new()
    }
}

async fn leg_value(prices: &dyn PriceSource, leg: &LedgerTransaction) -> Option<Decimal> {
    match prices.usd_price_at(&leg.currency, leg.occurred_at).await {
        Ok(price) => price.map(|p| p * leg.amount),
        Err(e) => {
            warn!(currency = %leg.currency, error = %e, "price lookup failed");
            None
        }
    }
}
