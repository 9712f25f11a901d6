// 🔃 Wallet Sync - poll providers, version balances, import transfers
//
// One wallet at a time, with bounded retries per wallet. A wallet that
// keeps failing is reported and skipped; the rest of the batch carries on.
// The SQLite lock is only taken between network calls.

use crate::chain::{ChainDataProvider, ChainTransfer, ProviderSet};
use crate::config::Config;
use crate::db::{self, Event, LedgerTransaction, SharedConnection, TxStatus};
use crate::entities::{Wallet, WalletSnapshot};
use crate::error::{LedgerError, LedgerResult};
use crate::pools::{LiquidityPool, LiquidityPoolEngine};
use crate::transfers::{InternalTransferReport, TransferClassifier};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const ACTOR: &str = "wallet_sync";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Provider calls per wallet before giving up (>= 1)
    pub max_attempts: u32,

    /// First retry delay; doubles on every further attempt
    pub retry_base: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        SyncSettings {
            max_attempts: config.sync_max_attempts.max(1),
            retry_base: Duration::from_millis(config.sync_retry_base_ms),
        }
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base.saturating_mul(factor)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_attempts: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct WalletSyncOutcome {
    pub wallet_id: String,
    pub label: String,
    pub currency: String,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub tx_count: u64,

    /// Version written by this sync (None = nothing changed)
    pub new_version: Option<i64>,

    pub transfers_imported: usize,
    pub attempts: u32,
}

impl WalletSyncOutcome {
    pub fn changed(&self) -> bool {
        self.new_version.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub wallet_id: String,
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced: Vec<WalletSyncOutcome>,
    pub failed: Vec<SyncFailure>,
    pub pools: Vec<LiquidityPool>,
    pub internal_transfers: InternalTransferReport,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.synced.iter().filter(|o| o.changed()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Synced {} wallets ({} changed, {} failed), {} pools, {} new transfers",
            self.synced.len(),
            self.changed_count(),
            self.failed.len(),
            self.pools.len(),
            self.synced.iter().map(|o| o.transfers_imported).sum::<usize>()
        )
    }
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

pub struct WalletSyncEngine {
    db: SharedConnection,
    providers: ProviderSet,
    settings: SyncSettings,

    /// Held for the duration of a sync_all
    running: AsyncMutex<()>,
}

impl WalletSyncEngine {
    pub fn new(db: SharedConnection, providers: ProviderSet, settings: SyncSettings) -> Self {
        WalletSyncEngine {
            db,
            providers,
            settings,
            running: AsyncMutex::new(()),
        }
    }

    /// Engine backed by the public providers in `config`
    pub fn from_config(db: SharedConnection, config: &Config) -> LedgerResult<Self> {
        Ok(Self::new(
            db,
            ProviderSet::from_config(config)?,
            SyncSettings::from_config(config),
        ))
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Returns the value and how many attempts it took.
    async fn with_retry<T, F, Fut>(&self, what: &str, wallet: &Wallet, mut op: F) -> LedgerResult<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        wallet = %wallet.label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying", what
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sync one wallet: snapshot, new version if anything moved, transfers.
    /// Nothing is written unless every provider call succeeded, and the
    /// writes land in one SQL transaction.
    pub async fn sync_wallet(&self, wallet_id: &str) -> LedgerResult<WalletSyncOutcome> {
        let wallet = {
            let conn = db::lock(&self.db);
            db::get_wallet(&conn, wallet_id)?
        }
        .ok_or_else(|| LedgerError::WalletNotFound {
            id: wallet_id.to_string(),
        })?;

        let provider: Arc<dyn ChainDataProvider> = self.providers.get(wallet.network)?;
        debug!(wallet = %wallet.label, provider = provider.name(), "syncing wallet");

        let (snapshot, attempts) = self
            .with_retry("snapshot", &wallet, || provider.fetch_snapshot(&wallet))
            .await?;
        let (transfers, _) = self
            .with_retry("transfer list", &wallet, || provider.fetch_transfers(&wallet))
            .await?;

        let conn = db::lock(&self.db);
        db::atomically(&conn, |tx| self.record(tx, &wallet, snapshot, &transfers, attempts))
    }

    fn record(
        &self,
        conn: &rusqlite::Connection,
        fetched_for: &Wallet,
        snapshot: WalletSnapshot,
        transfers: &[ChainTransfer],
        attempts: u32,
    ) -> LedgerResult<WalletSyncOutcome> {
        // Re-read: the wallet may have been edited while we were on the network
        let current = db::get_wallet(conn, &fetched_for.id)?.ok_or_else(|| LedgerError::WalletNotFound {
            id: fetched_for.id.clone(),
        })?;

        let new_version = if current.differs_from(&snapshot) {
            let next = current.apply_snapshot(&snapshot);
            db::save_wallet_version(conn, &current, &next)?;
            Some(next.version)
        } else {
            db::touch_wallet_sync(conn, &current.id, &snapshot.fetched_at)?;
            None
        };

        let ledger_rows: Vec<LedgerTransaction> = transfers
            .iter()
            .map(|t| {
                LedgerTransaction::new(
                    &t.tx_hash,
                    &current,
                    t.direction,
                    &t.from_address,
                    &t.to_address,
                    t.amount,
                    t.occurred_at,
                )
                .with_fee(t.fee)
                .with_status(if t.confirmed { TxStatus::Confirmed } else { TxStatus::Pending })
            })
            .collect();
        let transfers_imported = db::insert_transactions(conn, &ledger_rows, ACTOR)?;
        let confirmed = db::refresh_transaction_status(conn, &ledger_rows)?;

        let event = Event::new(
            "wallet_synced",
            "wallet",
            &current.id,
            serde_json::json!({
                "previous_balance": current.balance.to_string(),
                "new_balance": snapshot.balance.to_string(),
                "tx_count": snapshot.tx_count,
                "new_version": new_version,
                "transfers_imported": transfers_imported,
                "attempts": attempts,
            }),
            ACTOR,
        );
        db::insert_event(conn, &event)?;

        info!(
            wallet = %current.label,
            balance = %snapshot.balance,
            changed = new_version.is_some(),
            transfers_imported,
            confirmed,
            "wallet synced"
        );

        Ok(WalletSyncOutcome {
            wallet_id: current.id.clone(),
            label: current.label.clone(),
            currency: current.currency.clone(),
            previous_balance: current.balance,
            new_balance: snapshot.balance,
            tx_count: snapshot.tx_count,
            new_version,
            transfers_imported,
            attempts,
        })
    }

    /// Sync every active wallet, then rebuild pools and reclassify transfers.
    /// Only one sync_all runs at a time.
    pub async fn sync_all(&self) -> LedgerResult<SyncReport> {
        let _running = self.running.try_lock().map_err(|_| LedgerError::SyncInProgress)?;
        let started_at = Utc::now();

        let wallets: Vec<Wallet> = {
            let conn = db::lock(&self.db);
            db::get_current_wallets(&conn)?
        }
        .into_iter()
        .filter(|w| w.is_active)
        .collect();
        info!(wallets = wallets.len(), "sync started");

        let mut synced = Vec::new();
        let mut failed = Vec::new();
        for wallet in &wallets {
            match self.sync_wallet(&wallet.id).await {
                Ok(outcome) => synced.push(outcome),
                Err(e) => {
                    warn!(wallet = %wallet.label, error = %e, "wallet sync failed");
                    failed.push(SyncFailure {
                        wallet_id: wallet.id.clone(),
                        label: wallet.label.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let conn = db::lock(&self.db);
        let pools = LiquidityPoolEngine::new().recompute(&conn)?;
        let current = db::get_current_wallets(&conn)?;
        let internal_transfers = TransferClassifier::from_wallets(&current).mark_internal(&conn)?;

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            synced,
            failed,
            pools,
            internal_transfers,
        };

        let event = Event::new(
            "sync_completed",
            "sync",
            &started_at.timestamp().to_string(),
            serde_json::json!({
                "synced": report.synced.len(),
                "changed": report.changed_count(),
                "failed": report.failed.len(),
            }),
            ACTOR,
        );
        db::insert_event(&conn, &event)?;

        info!("{}", report.summary());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainProvider;
    use crate::db::Direction;
    use crate::entities::Network;
    use rusqlite::Connection;
    use rust_decimal_macros::dec;

    const BTC_ADDR: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
    const ETH_ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
        }
    }

    fn setup(wallets: &[Wallet]) -> SharedConnection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        for wallet in wallets {
            db::insert_wallet(&conn, wallet, "test").unwrap();
        }
        db::shared(conn)
    }

    fn engine_with(db: SharedConnection, mock: Arc<MockChainProvider>) -> WalletSyncEngine {
        WalletSyncEngine::new(db, ProviderSet::new().with(mock), fast_settings())
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = SyncSettings {
            max_attempts: 5,
            retry_base: Duration::from_millis(100),
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_sync_wallet_writes_new_version_on_change() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let db = setup(&[wallet.clone()]);
        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_snapshot(BTC_ADDR, dec!(1.25), 7);
        let engine = engine_with(db.clone(), mock);

        let outcome = engine.sync_wallet(&wallet.id).await.unwrap();
        assert_eq!(outcome.new_version, Some(2));
        assert_eq!(outcome.previous_balance, Decimal::ZERO);
        assert_eq!(outcome.new_balance, dec!(1.25));

        let conn = db::lock(&db);
        let history = db::get_wallet_history(&conn, &wallet.id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].valid_until.is_some());
        assert_eq!(history[1].tx_count, 7);
        assert!(history[1].last_synced_at.is_some());

        let events = db::get_events_for_entity(&conn, "wallet", &wallet.id).unwrap();
        assert!(events.iter().any(|e| e.event_type == "wallet_synced"));
    }

    #[tokio::test]
    async fn test_sync_wallet_unchanged_only_stamps_time() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC").with_balance(dec!(2));
        let db = setup(&[wallet.clone()]);
        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_snapshot(BTC_ADDR, dec!(2), 0);
        let engine = engine_with(db.clone(), mock);

        let outcome = engine.sync_wallet(&wallet.id).await.unwrap();
        assert!(!outcome.changed());

        let conn = db::lock(&db);
        let history = db::get_wallet_history(&conn, &wallet.id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_wallet_retries_transient_failures() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let db = setup(&[wallet.clone()]);
        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_failure(BTC_ADDR, "HTTP 503");
        mock.push_snapshot(BTC_ADDR, dec!(0.1), 1);
        let engine = engine_with(db, mock.clone());

        let outcome = engine.sync_wallet(&wallet.id).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(mock.snapshot_calls(BTC_ADDR), 2);
    }

    #[tokio::test]
    async fn test_sync_wallet_gives_up_after_max_attempts() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let db = setup(&[wallet.clone()]);
        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_failure(BTC_ADDR, "HTTP 429");
        let engine = engine_with(db.clone(), mock.clone());

        let err = engine.sync_wallet(&wallet.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::Provider { .. }));
        assert_eq!(mock.snapshot_calls(BTC_ADDR), 3);

        // Nothing written
        let conn = db::lock(&db);
        assert_eq!(db::get_wallet_history(&conn, &wallet.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_wallet_errors() {
        let wallet = Wallet::new("Hot ETH", ETH_ADDR, Network::Ethereum, "ETH");
        let db = setup(&[wallet.clone()]);
        let engine = engine_with(db, Arc::new(MockChainProvider::new(Network::Bitcoin)));

        assert!(matches!(
            engine.sync_wallet(&wallet.id).await,
            Err(LedgerError::NoProvider { .. })
        ));
        assert!(matches!(
            engine.sync_wallet("missing").await,
            Err(LedgerError::WalletNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_wallet_failed_write_leaves_nothing_behind() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let db = setup(&[wallet.clone()]);
        {
            let conn = db::lock(&db);
            conn.execute_batch(
                "CREATE TRIGGER reject_sync_event BEFORE INSERT ON events
                 WHEN NEW.event_type = 'wallet_synced'
                 BEGIN SELECT RAISE(ABORT, 'audit log unavailable'); END;",
            )
            .unwrap();
        }

        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_snapshot(BTC_ADDR, dec!(2), 1);
        mock.set_transfers(
            BTC_ADDR,
            vec![ChainTransfer {
                tx_hash: "aa11".to_string(),
                direction: Direction::Incoming,
                from_address: "bc1qsender".to_string(),
                to_address: BTC_ADDR.to_string(),
                amount: dec!(2),
                fee: Decimal::ZERO,
                occurred_at: Utc::now(),
                confirmed: true,
            }],
        );
        let engine = engine_with(db.clone(), mock);

        assert!(matches!(
            engine.sync_wallet(&wallet.id).await,
            Err(LedgerError::Database(_))
        ));

        let conn = db::lock(&db);
        assert_eq!(db::get_wallet_history(&conn, &wallet.id).unwrap().len(), 1);
        assert_eq!(db::count_transactions(&conn).unwrap(), 0);
        assert!(conn.is_autocommit());
    }

    #[tokio::test]
    async fn test_transfers_imported_once_and_confirmed_later() {
        let wallet = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let db = setup(&[wallet.clone()]);
        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_snapshot(BTC_ADDR, dec!(0.5), 1);

        let mut transfer = ChainTransfer {
            tx_hash: "aa11".to_string(),
            direction: Direction::Incoming,
            from_address: "bc1qsender".to_string(),
            to_address: BTC_ADDR.to_string(),
            amount: dec!(0.5),
            fee: Decimal::ZERO,
            occurred_at: Utc::now(),
            confirmed: false,
        };
        mock.set_transfers(BTC_ADDR, vec![transfer.clone()]);
        let engine = engine_with(db.clone(), mock.clone());

        assert_eq!(engine.sync_wallet(&wallet.id).await.unwrap().transfers_imported, 1);

        let mined_at = transfer.occurred_at - chrono::Duration::minutes(20);
        transfer.confirmed = true;
        transfer.occurred_at = mined_at;
        mock.set_transfers(BTC_ADDR, vec![transfer]);
        assert_eq!(engine.sync_wallet(&wallet.id).await.unwrap().transfers_imported, 0);

        let conn = db::lock(&db);
        let rows = db::get_transactions_for_wallet(&conn, &wallet.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TxStatus::Confirmed);
        assert_eq!(rows[0].occurred_at.timestamp(), mined_at.timestamp());
    }

    #[tokio::test]
    async fn test_sync_all_survives_failures_and_builds_pools() {
        let good = Wallet::new("Cold BTC", BTC_ADDR, Network::Bitcoin, "BTC");
        let bad = Wallet::new("Broken BTC", "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", Network::Bitcoin, "BTC");
        let no_provider = Wallet::new("Hot ETH", ETH_ADDR, Network::Ethereum, "ETH");
        let db = setup(&[good.clone(), bad.clone(), no_provider]);

        let mock = Arc::new(MockChainProvider::new(Network::Bitcoin));
        mock.push_snapshot(BTC_ADDR, dec!(3), 2);
        mock.push_failure("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", "timeout");
        let engine = engine_with(db.clone(), mock);

        let report = engine.sync_all().await.unwrap();
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.failed.len(), 2);
        assert!(!report.is_clean());
        assert_eq!(report.pools.len(), 2);

        let btc_pool = report.pools.iter().find(|p| p.currency == "BTC").unwrap();
        assert_eq!(btc_pool.total_balance, dec!(3));
        assert_eq!(btc_pool.wallet_count, 2);

        let conn = db::lock(&db);
        assert_eq!(db::get_liquidity_pools(&conn).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_all_rejects_concurrent_run() {
        let engine = engine_with(setup(&[]), Arc::new(MockChainProvider::new(Network::Bitcoin)));

        let _held = engine.running.try_lock().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.sync_all().await, Err(LedgerError::SyncInProgress)));
    }
}
