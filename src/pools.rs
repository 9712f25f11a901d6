// 💧 Liquidity Pools - per-currency totals across the platform's wallets
//
// Invariant: for every currency, pool.total_balance == sum of the balances
// of ACTIVE wallets holding that currency. Pools are never patched in place;
// they are rebuilt from wallets and swapped in wholesale.

use crate::db;
use crate::entities::Wallet;
use crate::error::LedgerResult;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub currency: String,
    pub total_balance: Decimal,
    pub wallet_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// A currency whose pool total disagrees with its wallets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolViolation {
    pub currency: String,
    pub pool_total: Decimal,
    pub wallet_total: Decimal,
}

impl PoolViolation {
    pub fn difference(&self) -> Decimal {
        self.pool_total - self.wallet_total
    }
}

pub struct LiquidityPoolEngine;

impl LiquidityPoolEngine {
    pub fn new() -> Self {
        LiquidityPoolEngine
    }

    /// Group active wallets by currency, sorted by currency
    pub fn aggregate(&self, wallets: &[Wallet]) -> Vec<LiquidityPool> {
        let now = Utc::now();
        let mut totals: BTreeMap<&str, (Decimal, usize)> = BTreeMap::new();

        for wallet in wallets.iter().filter(|w| w.is_active && w.is_current()) {
            let entry = totals.entry(wallet.currency.as_str()).or_insert((Decimal::ZERO, 0));
            entry.0 += wallet.balance;
            entry.1 += 1;
        }

        totals
            .into_iter()
            .map(|(currency, (total_balance, wallet_count))| LiquidityPool {
                currency: currency.to_string(),
                total_balance,
                wallet_count,
                updated_at: now,
            })
            .collect()
    }

    /// Rebuild the pool table from current wallets
    pub fn recompute(&self, conn: &Connection) -> LedgerResult<Vec<LiquidityPool>> {
        let wallets = db::get_current_wallets(conn)?;
        let pools = self.aggregate(&wallets);
        db::replace_liquidity_pools(conn, &pools)?;

        info!(pools = pools.len(), wallets = wallets.len(), "liquidity pools recomputed");
        Ok(pools)
    }

    /// Every currency where pools and wallets disagree.
    /// A currency present on only one side counts with a zero on the other.
    pub fn verify(&self, pools: &[LiquidityPool], wallets: &[Wallet]) -> Vec<PoolViolation> {
        let expected: BTreeMap<String, Decimal> = self
            .aggregate(wallets)
            .into_iter()
            .map(|p| (p.currency, p.total_balance))
            .collect();
        let actual: BTreeMap<String, Decimal> = pools
            .iter()
            .map(|p| (p.currency.clone(), p.total_balance))
            .collect();

        let mut currencies: Vec<&String> = expected.keys().chain(actual.keys()).collect();
        currencies.sort();
        currencies.dedup();

        currencies
            .into_iter()
            .filter_map(|currency| {
                let pool_total = actual.get(currency).copied().unwrap_or(Decimal::ZERO);
                let wallet_total = expected.get(currency).copied().unwrap_or(Decimal::ZERO);
                (pool_total != wallet_total).then(|| PoolViolation {
                    currency: currency.clone(),
                    pool_total,
                    wallet_total,
                })
            })
            .collect()
    }
}

impl Default for LiquidityPoolEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Network;
    use rust_decimal_macros::dec;

    fn create_test_wallet(currency: &str, balance: Decimal) -> Wallet {
        let network = match currency {
            "BTC" => Network::Bitcoin,
            "TRX" => Network::Tron,
            _ => Network::Ethereum,
        };
        Wallet::new(&format!("{} wallet", currency), "addr", network, currency).with_balance(balance)
    }

    #[test]
    fn test_aggregate_groups_and_sorts() {
        let engine = LiquidityPoolEngine::new();
        let wallets = vec![
            create_test_wallet("USDT", dec!(1000)),
            create_test_wallet("BTC", dec!(0.5)),
            create_test_wallet("USDT", dec!(250.25)),
        ];

        let pools = engine.aggregate(&wallets);
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].currency, "BTC");
        assert_eq!(pools[0].wallet_count, 1);
        assert_eq!(pools[1].currency, "USDT");
        assert_eq!(pools[1].total_balance, dec!(1250.25));
        assert_eq!(pools[1].wallet_count, 2);
    }

    #[test]
    fn test_aggregate_skips_inactive() {
        let engine = LiquidityPoolEngine::new();
        let mut retired = create_test_wallet("ETH", dec!(3));
        retired.is_active = false;

        let pools = engine.aggregate(&[retired, create_test_wallet("BTC", dec!(1))]);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].currency, "BTC");
    }

    #[test]
    fn test_verify_detects_drift() {
        let engine = LiquidityPoolEngine::new();
        let wallets = vec![create_test_wallet("BTC", dec!(1)), create_test_wallet("ETH", dec!(2))];
        let mut pools = engine.aggregate(&wallets);
        assert!(engine.verify(&pools, &wallets).is_empty());

        pools[0].total_balance = dec!(1.1);
        pools.push(LiquidityPool {
            currency: "DOGE".to_string(),
            total_balance: dec!(5),
            wallet_count: 1,
            updated_at: Utc::now(),
        });

        let violations = engine.verify(&pools, &wallets);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].currency, "BTC");
        assert_eq!(violations[0].difference(), dec!(0.1));
        assert_eq!(violations[1].currency, "DOGE");
        assert_eq!(violations[1].wallet_total, Decimal::ZERO);
    }

    #[test]
    fn test_recompute_replaces_table() {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let engine = LiquidityPoolEngine::new();

        let btc = create_test_wallet("BTC", dec!(2));
        let eth = create_test_wallet("ETH", dec!(10));
        db::insert_wallet(&conn, &btc, "test").unwrap();
        db::insert_wallet(&conn, &eth, "test").unwrap();
        assert_eq!(engine.recompute(&conn).unwrap().len(), 2);

        // Deactivate ETH: its pool disappears on the next rebuild
        let mut next = eth.next_version();
        next.is_active = false;
        db::save_wallet_version(&conn, &eth, &next).unwrap();

        let pools = engine.recompute(&conn).unwrap();
        assert_eq!(pools.len(), 1);
        let stored = db::get_liquidity_pools(&conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].currency, "BTC");
        assert_eq!(stored[0].total_balance, dec!(2));
    }
}
