use crate::address;
use crate::entities::{Investment, Network, PaymentStatus, Wallet, WalletRegistry};
use crate::error::{LedgerError, LedgerResult};
use crate::pools::LiquidityPool;
use crate::swap::SwapRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

// ============================================================================
// LEDGER TRANSACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("Unknown direction: {}", other)),
        }
    }
}

/// How bookkeeping treats a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Money entering or leaving the platform
    External,

    /// Both ends are platform wallets (no P&L, no pool change overall)
    Internal,

    /// One leg of a detected currency swap
    SwapLeg,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::External => "external",
            TransferKind::Internal => "internal",
            TransferKind::SwapLeg => "swap_leg",
        }
    }
}

impl FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "external" => Ok(TransferKind::External),
            "internal" => Ok(TransferKind::Internal),
            "swap_leg" => Ok(TransferKind::SwapLeg),
            other => Err(format!("Unknown transfer kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            "failed" => Ok(TxStatus::Failed),
            other => Err(format!("Unknown status: {}", other)),
        }
    }
}

/// One movement of funds as seen from ONE platform wallet.
///
/// An internal transfer therefore appears twice: once as the sender's
/// Outgoing row and once as the receiver's Incoming row, sharing tx_hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Stable identity (UUID)
    pub id: String,

    pub tx_hash: String,
    pub wallet_id: String,
    pub network: Network,
    pub currency: String,
    pub direction: Direction,
    pub from_address: String,
    pub to_address: String,

    /// Never negative; direction carries the sign. Zero on fee-only rows
    /// (failed calls, consolidations, token sends seen from the gas payer).
    pub amount: Decimal,

    /// Network fee, in the network's native coin
    pub fee: Decimal,

    pub occurred_at: DateTime<Utc>,
    pub platform: Option<String>,
    pub kind: TransferKind,
    pub investment_id: Option<String>,
    pub status: TxStatus,

    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LedgerTransaction {
    /// New confirmed external transaction for `wallet`
    pub fn new(
        tx_hash: &str,
        wallet: &Wallet,
        direction: Direction,
        from_address: &str,
        to_address: &str,
        amount: Decimal,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        LedgerTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            tx_hash: tx_hash.trim().to_string(),
            wallet_id: wallet.id.clone(),
            network: wallet.network,
            currency: wallet.currency.clone(),
            direction,
            from_address: from_address.trim().to_string(),
            to_address: to_address.trim().to_string(),
            amount: amount.abs(),
            fee: Decimal::ZERO,
            occurred_at,
            platform: wallet.platform.clone(),
            kind: TransferKind::External,
            investment_id: None,
            status: TxStatus::Confirmed,
            metadata: HashMap::new(),
        }
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee.abs();
        self
    }

    pub fn with_status(mut self, status: TxStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_investment(mut self, investment_id: &str) -> Self {
        self.investment_id = Some(investment_id.to_string());
        self
    }

    /// Deduplication key, NOT identity.
    /// Same chain tx seen by the same wallet in the same direction and
    /// currency is the same ledger row no matter how often it's imported.
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}",
            self.network.as_str(),
            self.tx_hash.to_lowercase(),
            self.wallet_id,
            self.direction.as_str(),
            self.currency
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Signed effect on the wallet's balance (fees only hit native-coin wallets)
    pub fn balance_effect(&self) -> Decimal {
        match self.direction {
            Direction::Incoming => self.amount,
            Direction::Outgoing => {
                if self.currency == self.network.native_currency() {
                    -(self.amount + self.fee)
                } else {
                    -self.amount
                }
            }
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

// ============================================================================
// EVENT (audit log)
// ============================================================================

/// Every change is an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// Connection shared by async engines and server handlers.
/// Never hold the guard across an `.await`.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Lock, recovering from a poisoned mutex (SQLite keeps its own consistency)
pub fn lock(db: &SharedConnection) -> MutexGuard<'_, Connection> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` inside one SQL transaction; nested calls join the outer one.
/// Any error rolls the whole unit back.
pub fn atomically<T, F>(conn: &Connection, f: F) -> LedgerResult<T>
where
    F: FnOnce(&Connection) -> LedgerResult<T>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Open (or create) the ledger database and make sure the schema exists
pub fn open_database(path: &Path) -> LedgerResult<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, format!("{}: '{}'", e, raw)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn opt_decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> LedgerResult<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Wallets - every version is a row, current = valid_until IS NULL
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS wallets (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            wallet_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            label TEXT NOT NULL,
            address TEXT NOT NULL,
            network TEXT NOT NULL,
            currency TEXT NOT NULL,
            token_contract TEXT,
            platform TEXT,
            balance TEXT NOT NULL,
            tx_count INTEGER NOT NULL DEFAULT 0,
            last_synced_at TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            system_time TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_until TEXT,
            UNIQUE(wallet_id, version)
        )",
        [],
    )?;

    // ==========================================================================
    // Ledger transactions (per-wallet view of on-chain movements)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            tx_uuid TEXT UNIQUE NOT NULL,
            tx_hash TEXT NOT NULL,
            wallet_id TEXT NOT NULL,
            network TEXT NOT NULL,
            currency TEXT NOT NULL,
            direction TEXT NOT NULL,
            from_address TEXT NOT NULL,
            to_address TEXT NOT NULL,
            amount TEXT NOT NULL,
            fee TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            platform TEXT,
            kind TEXT NOT NULL,
            investment_id TEXT,
            status TEXT NOT NULL,
            metadata TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS investments (
            id TEXT PRIMARY KEY,
            investor_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            payment_status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS liquidity_pools (
            currency TEXT PRIMARY KEY,
            total_balance TEXT NOT NULL,
            wallet_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS swaps (
            swap_id TEXT PRIMARY KEY,
            platform TEXT NOT NULL,
            sold_currency TEXT NOT NULL,
            sold_amount TEXT NOT NULL,
            bought_currency TEXT NOT NULL,
            bought_amount TEXT NOT NULL,
            rate TEXT NOT NULL,
            sold_value_usd TEXT,
            bought_value_usd TEXT,
            profit_loss_usd TEXT,
            outgoing_tx TEXT NOT NULL,
            incoming_tx TEXT NOT NULL,
            detected_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_wallets_current ON wallets(wallet_id, valid_until)",
        [],
    )?;
    // One current wallet per (network, address, currency)
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_current_address
         ON wallets(network, address, currency) WHERE valid_until IS NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_wallet ON ledger_transactions(wallet_id, occurred_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_hash ON ledger_transactions(network, tx_hash)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_investment ON ledger_transactions(investment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// WALLETS
// ============================================================================

const WALLET_COLUMNS: &str = "wallet_id, version, label, address, network, currency,
    token_contract, platform, balance, tx_count, last_synced_at, is_active,
    system_time, valid_from, valid_until";

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    let tx_count: i64 = row.get(9)?;
    Ok(Wallet {
        id: row.get(0)?,
        version: row.get(1)?,
        label: row.get(2)?,
        address: row.get(3)?,
        network: parsed_col(row, 4)?,
        currency: row.get(5)?,
        token_contract: row.get(6)?,
        platform: row.get(7)?,
        balance: parsed_col(row, 8)?,
        tx_count: tx_count.max(0) as u64,
        last_synced_at: opt_ts_col(row, 10)?,
        is_active: row.get(11)?,
        system_time: ts_col(row, 12)?,
        valid_from: ts_col(row, 13)?,
        valid_until: opt_ts_col(row, 14)?,
    })
}

fn insert_wallet_row(conn: &Connection, wallet: &Wallet) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO wallets (
            wallet_id, version, label, address, network, currency,
            token_contract, platform, balance, tx_count, last_synced_at, is_active,
            system_time, valid_from, valid_until
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            wallet.id,
            wallet.version,
            wallet.label,
            wallet.address,
            wallet.network.as_str(),
            wallet.currency,
            wallet.token_contract,
            wallet.platform,
            wallet.balance.to_string(),
            wallet.tx_count as i64,
            wallet.last_synced_at.as_ref().map(fmt_ts),
            wallet.is_active,
            fmt_ts(&wallet.system_time),
            fmt_ts(&wallet.valid_from),
            wallet.valid_until.as_ref().map(fmt_ts),
        ],
    )
}

/// Register a new tracked wallet (first version).
/// The same address and currency can only be tracked once.
pub fn insert_wallet(conn: &Connection, wallet: &Wallet, actor: &str) -> LedgerResult<()> {
    let key = wallet.address_key();
    if let Some(existing) = get_current_wallets(conn)?
        .into_iter()
        .find(|w| w.currency == wallet.currency && w.address_key() == key)
    {
        return Err(LedgerError::DuplicateWallet {
            address: wallet.address.clone(),
            currency: wallet.currency.clone(),
            existing_id: existing.id,
        });
    }
    insert_wallet_row(conn, wallet)?;

    let event = Event::new(
        "wallet_registered",
        "wallet",
        &wallet.id,
        serde_json::json!({
            "address": wallet.address,
            "network": wallet.network.as_str(),
            "currency": wallet.currency,
            "platform": wallet.platform,
        }),
        actor,
    );
    insert_event(conn, &event)?;
    Ok(())
}

/// Expire `current` and append `next` atomically
pub fn save_wallet_version(conn: &Connection, current: &Wallet, next: &Wallet) -> LedgerResult<()> {
    atomically(conn, |tx| {
        let expired = tx.execute(
            "UPDATE wallets SET valid_until = ?1
             WHERE wallet_id = ?2 AND version = ?3 AND valid_until IS NULL",
            params![fmt_ts(&next.valid_from), current.id, current.version],
        )?;
        if expired == 0 {
            // Someone else already moved this wallet on; refuse to fork history
            return Err(LedgerError::WalletNotFound {
                id: format!("{} (version {})", current.id, current.version),
            });
        }
        insert_wallet_row(tx, next)?;
        Ok(())
    })
}

/// Stamp a sync time on the current version without creating a new one
pub fn touch_wallet_sync(conn: &Connection, wallet_id: &str, at: &DateTime<Utc>) -> LedgerResult<()> {
    conn.execute(
        "UPDATE wallets SET last_synced_at = ?1 WHERE wallet_id = ?2 AND valid_until IS NULL",
        params![fmt_ts(at), wallet_id],
    )?;
    Ok(())
}

pub fn get_current_wallets(conn: &Connection) -> LedgerResult<Vec<Wallet>> {
    let sql = format!(
        "SELECT {} FROM wallets WHERE valid_until IS NULL ORDER BY label, wallet_id",
        WALLET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let wallets = stmt
        .query_map([], wallet_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(wallets)
}

pub fn get_wallet(conn: &Connection, wallet_id: &str) -> LedgerResult<Option<Wallet>> {
    let sql = format!(
        "SELECT {} FROM wallets WHERE wallet_id = ?1 AND valid_until IS NULL",
        WALLET_COLUMNS
    );
    let wallet = conn
        .query_row(&sql, [wallet_id], wallet_from_row)
        .optional()?;
    Ok(wallet)
}

pub fn get_wallet_history(conn: &Connection, wallet_id: &str) -> LedgerResult<Vec<Wallet>> {
    let sql = format!(
        "SELECT {} FROM wallets WHERE wallet_id = ?1 ORDER BY version",
        WALLET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let wallets = stmt
        .query_map([wallet_id], wallet_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(wallets)
}

/// Every version of every wallet
pub fn get_all_wallet_versions(conn: &Connection) -> LedgerResult<Vec<Wallet>> {
    let sql = format!("SELECT {} FROM wallets ORDER BY wallet_id, version", WALLET_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let wallets = stmt
        .query_map([], wallet_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(wallets)
}

/// Full version history loaded into an in-memory registry (for as-of queries)
pub fn load_wallet_registry(conn: &Connection) -> LedgerResult<WalletRegistry> {
    Ok(WalletRegistry::from_versions(get_all_wallet_versions(conn)?))
}

/// CSV row for bulk wallet registration from the back-office
#[derive(Debug, Deserialize)]
struct WalletCsvRow {
    label: String,
    address: String,
    network: String,
    currency: String,
    #[serde(default)]
    token_contract: Option<String>,
    #[serde(default)]
    platform: Option<String>,
}

/// Load wallets from CSV (label,address,network,currency,token_contract,platform)
///
/// Addresses are validated and normalized; a bad row aborts the import with
/// its line number so nothing half-imports.
pub fn load_wallets_csv(csv_path: &Path) -> Result<Vec<Wallet>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open wallet CSV")?;
    let mut wallets = Vec::new();

    for (i, result) in rdr.deserialize::<WalletCsvRow>().enumerate() {
        let line = i + 2; // header is line 1
        let row = result.with_context(|| format!("Failed to parse wallet CSV line {}", line))?;

        let network: Network = row
            .network
            .parse()
            .map_err(|e: String| anyhow::anyhow!("line {}: {}", line, e))?;
        let address = address::validate(network, &row.address)
            .with_context(|| format!("line {}", line))?;

        let mut wallet = Wallet::new(&row.label, &address, network, &row.currency);
        if let Some(contract) = row.token_contract.filter(|c| !c.trim().is_empty()) {
            wallet = wallet.with_token_contract(&address::normalize(network, &contract));
        }
        if let Some(platform) = row.platform.filter(|p| !p.trim().is_empty()) {
            wallet = wallet.with_platform(&platform);
        }
        wallets.push(wallet);
    }

    Ok(wallets)
}

// ============================================================================
// LEDGER TRANSACTIONS
// ============================================================================

const TX_COLUMNS: &str = "tx_uuid, tx_hash, wallet_id, network, currency, direction,
    from_address, to_address, amount, fee, occurred_at, platform, kind,
    investment_id, status, metadata";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    let metadata_json: Option<String> = row.get(15)?;
    let metadata = metadata_json
        .map(|json| serde_json::from_str(&json).map_err(|e| conversion_error(15, e)))
        .transpose()?
        .unwrap_or_default();

    Ok(LedgerTransaction {
        id: row.get(0)?,
        tx_hash: row.get(1)?,
        wallet_id: row.get(2)?,
        network: parsed_col(row, 3)?,
        currency: row.get(4)?,
        direction: parsed_col(row, 5)?,
        from_address: row.get(6)?,
        to_address: row.get(7)?,
        amount: parsed_col(row, 8)?,
        fee: parsed_col(row, 9)?,
        occurred_at: ts_col(row, 10)?,
        platform: row.get(11)?,
        kind: parsed_col(row, 12)?,
        investment_id: row.get(13)?,
        status: parsed_col(row, 14)?,
        metadata,
    })
}

/// Insert transactions, skipping ones already in the ledger.
/// Returns how many rows were actually inserted.
pub fn insert_transactions(
    conn: &Connection,
    transactions: &[LedgerTransaction],
    actor: &str,
) -> LedgerResult<usize> {
    atomically(conn, |conn| import_transactions(conn, transactions, actor))
}

fn import_transactions(
    conn: &Connection,
    transactions: &[LedgerTransaction],
    actor: &str,
) -> LedgerResult<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for tx in transactions {
        let hash = tx.compute_idempotency_hash();
        let metadata_json = serde_json::to_string(&tx.metadata)?;

        let result = conn.execute(
            "INSERT INTO ledger_transactions (
                idempotency_hash, tx_uuid, tx_hash, wallet_id, network, currency,
                direction, from_address, to_address, amount, fee, occurred_at,
                platform, kind, investment_id, status, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                hash,
                tx.id,
                tx.tx_hash,
                tx.wallet_id,
                tx.network.as_str(),
                tx.currency,
                tx.direction.as_str(),
                tx.from_address,
                tx.to_address,
                tx.amount.to_string(),
                tx.fee.to_string(),
                fmt_ts(&tx.occurred_at),
                tx.platform,
                tx.kind.as_str(),
                tx.investment_id,
                tx.status.as_str(),
                metadata_json,
            ],
        );

        match result {
            Ok(_) => {
                inserted += 1;

                let event = Event::new(
                    "transaction_imported",
                    "transaction",
                    &tx.id,
                    serde_json::json!({
                        "tx_hash": tx.tx_hash,
                        "wallet_id": tx.wallet_id,
                        "direction": tx.direction.as_str(),
                        "amount": tx.amount.to_string(),
                        "currency": tx.currency,
                    }),
                    actor,
                );
                insert_event(conn, &event)?;
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(inserted, duplicates, "ledger import finished");
    Ok(inserted)
}

/// Promote rows imported as pending once the chain reports a final status.
/// The block time replaces the first-seen time. Returns rows changed.
pub fn refresh_transaction_status(
    conn: &Connection,
    transactions: &[LedgerTransaction],
) -> LedgerResult<usize> {
    let mut changed = 0;
    let mut stmt = conn.prepare(
        "UPDATE ledger_transactions SET status = ?1, occurred_at = ?2
         WHERE idempotency_hash = ?3 AND status = 'pending'",
    )?;
    for tx in transactions.iter().filter(|t| t.status != TxStatus::Pending) {
        changed += stmt.execute(params![
            tx.status.as_str(),
            fmt_ts(&tx.occurred_at),
            tx.compute_idempotency_hash()
        ])?;
    }
    Ok(changed)
}

fn query_transactions<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> LedgerResult<Vec<LedgerTransaction>> {
    let sql = format!(
        "SELECT {} FROM ledger_transactions {} ORDER BY occurred_at, id",
        TX_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let transactions = stmt
        .query_map(params, transaction_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(transactions)
}

/// All ledger rows, oldest first
pub fn get_all_transactions(conn: &Connection) -> LedgerResult<Vec<LedgerTransaction>> {
    query_transactions(conn, "", [])
}

pub fn get_transactions_for_wallet(
    conn: &Connection,
    wallet_id: &str,
) -> LedgerResult<Vec<LedgerTransaction>> {
    query_transactions(conn, "WHERE wallet_id = ?1", [wallet_id])
}

pub fn get_transactions_for_investment(
    conn: &Connection,
    investment_id: &str,
) -> LedgerResult<Vec<LedgerTransaction>> {
    query_transactions(conn, "WHERE investment_id = ?1", [investment_id])
}

pub fn count_transactions(conn: &Connection) -> LedgerResult<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM ledger_transactions", [], |row| row.get(0))?;
    Ok(count)
}

/// Reclassify ledger rows (by tx uuid). Returns rows changed.
pub fn set_transaction_kind(
    conn: &Connection,
    tx_ids: &[String],
    kind: TransferKind,
) -> LedgerResult<usize> {
    atomically(conn, |tx| {
        let mut changed = 0;
        let mut stmt = tx.prepare(
            "UPDATE ledger_transactions SET kind = ?1 WHERE tx_uuid = ?2 AND kind != ?1",
        )?;
        for id in tx_ids {
            changed += stmt.execute(params![kind.as_str(), id])?;
        }
        Ok(changed)
    })
}

pub fn get_transaction(conn: &Connection, tx_id: &str) -> LedgerResult<Option<LedgerTransaction>> {
    let mut found = query_transactions(conn, "WHERE tx_uuid = ?1", [tx_id])?;
    Ok(found.pop())
}

/// Attach a ledger row to the investment it pays for
pub fn link_transaction_to_investment(
    conn: &Connection,
    tx_id: &str,
    investment_id: &str,
    actor: &str,
) -> LedgerResult<()> {
    if get_investment(conn, investment_id)?.is_none() {
        return Err(LedgerError::InvestmentNotFound {
            id: investment_id.to_string(),
        });
    }
    atomically(conn, |tx| {
        let updated = tx.execute(
            "UPDATE ledger_transactions SET investment_id = ?1 WHERE tx_uuid = ?2",
            params![investment_id, tx_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::TransactionNotFound {
                id: tx_id.to_string(),
            });
        }

        let event = Event::new(
            "transaction_linked",
            "investment",
            investment_id,
            serde_json::json!({ "tx_id": tx_id }),
            actor,
        );
        insert_event(tx, &event)
    })
}

// ============================================================================
// INVESTMENTS
// ============================================================================

fn investment_from_row(row: &Row<'_>) -> rusqlite::Result<Investment> {
    Ok(Investment {
        id: row.get(0)?,
        investor_id: row.get(1)?,
        amount: parsed_col(row, 2)?,
        currency: row.get(3)?,
        payment_status: parsed_col::<PaymentStatus>(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}

pub fn insert_investment(conn: &Connection, investment: &Investment) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO investments (id, investor_id, amount, currency, payment_status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            investment.id,
            investment.investor_id,
            investment.amount.to_string(),
            investment.currency,
            investment.payment_status.as_str(),
            fmt_ts(&investment.created_at),
        ],
    )?;
    Ok(())
}

/// Validate and store a new commitment, with an `investment_created` event
pub fn create_investment(
    conn: &Connection,
    investor_id: &str,
    amount: Decimal,
    currency: &str,
    actor: &str,
) -> LedgerResult<Investment> {
    if investor_id.trim().is_empty() {
        return Err(LedgerError::InvalidInvestment {
            reason: "investor id is empty".to_string(),
        });
    }
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidInvestment {
            reason: format!("amount must be positive, got {}", amount),
        });
    }
    if currency.trim().is_empty() {
        return Err(LedgerError::InvalidInvestment {
            reason: "currency is empty".to_string(),
        });
    }

    let investment = Investment::new(investor_id.trim(), amount, currency);
    atomically(conn, |tx| {
        insert_investment(tx, &investment)?;
        let event = Event::new(
            "investment_created",
            "investment",
            &investment.id,
            serde_json::json!({
                "investor_id": investment.investor_id,
                "amount": investment.amount.to_string(),
                "currency": investment.currency,
            }),
            actor,
        );
        insert_event(tx, &event)
    })?;
    Ok(investment)
}

pub fn get_investment(conn: &Connection, id: &str) -> LedgerResult<Option<Investment>> {
    let investment = conn
        .query_row(
            "SELECT id, investor_id, amount, currency, payment_status, created_at
             FROM investments WHERE id = ?1",
            [id],
            investment_from_row,
        )
        .optional()?;
    Ok(investment)
}

pub fn get_all_investments(conn: &Connection) -> LedgerResult<Vec<Investment>> {
    let mut stmt = conn.prepare(
        "SELECT id, investor_id, amount, currency, payment_status, created_at
         FROM investments ORDER BY created_at, id",
    )?;
    let investments = stmt
        .query_map([], investment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(investments)
}

pub fn update_payment_status(
    conn: &Connection,
    investment_id: &str,
    status: PaymentStatus,
) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE investments SET payment_status = ?1 WHERE id = ?2",
        params![status.as_str(), investment_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::InvestmentNotFound {
            id: investment_id.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// LIQUIDITY POOLS
// ============================================================================

/// Replace the whole pool table in one SQL transaction
pub fn replace_liquidity_pools(conn: &Connection, pools: &[LiquidityPool]) -> LedgerResult<()> {
    atomically(conn, |tx| {
        tx.execute("DELETE FROM liquidity_pools", [])?;
        let mut stmt = tx.prepare(
            "INSERT INTO liquidity_pools (currency, total_balance, wallet_count, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for pool in pools {
            stmt.execute(params![
                pool.currency,
                pool.total_balance.to_string(),
                pool.wallet_count as i64,
                fmt_ts(&pool.updated_at),
            ])?;
        }
        Ok(())
    })
}

pub fn get_liquidity_pools(conn: &Connection) -> LedgerResult<Vec<LiquidityPool>> {
    let mut stmt = conn.prepare(
        "SELECT currency, total_balance, wallet_count, updated_at
         FROM liquidity_pools ORDER BY currency",
    )?;
    let pools = stmt
        .query_map([], |row| {
            let wallet_count: i64 = row.get(2)?;
            Ok(LiquidityPool {
                currency: row.get(0)?,
                total_balance: parsed_col(row, 1)?,
                wallet_count: wallet_count.max(0) as usize,
                updated_at: ts_col(row, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pools)
}

// ============================================================================
// SWAPS
// ============================================================================

/// Insert a swap unless its id is already recorded. Returns true if new.
pub fn insert_swap(conn: &Connection, swap: &SwapRecord) -> LedgerResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO swaps (
            swap_id, platform, sold_currency, sold_amount, bought_currency, bought_amount,
            rate, sold_value_usd, bought_value_usd, profit_loss_usd,
            outgoing_tx, incoming_tx, detected_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            swap.id,
            swap.platform,
            swap.sold_currency,
            swap.sold_amount.to_string(),
            swap.bought_currency,
            swap.bought_amount.to_string(),
            swap.rate.to_string(),
            swap.sold_value_usd.map(|d| d.to_string()),
            swap.bought_value_usd.map(|d| d.to_string()),
            swap.profit_loss_usd.map(|d| d.to_string()),
            swap.outgoing_tx,
            swap.incoming_tx,
            fmt_ts(&swap.detected_at),
        ],
    )?;
    Ok(inserted > 0)
}

pub fn get_swaps(conn: &Connection) -> LedgerResult<Vec<SwapRecord>> {
    let mut stmt = conn.prepare(
        "SELECT swap_id, platform, sold_currency, sold_amount, bought_currency, bought_amount,
                rate, sold_value_usd, bought_value_usd, profit_loss_usd,
                outgoing_tx, incoming_tx, detected_at
         FROM swaps ORDER BY detected_at, swap_id",
    )?;
    let swaps = stmt
        .query_map([], |row| {
            Ok(SwapRecord {
                id: row.get(0)?,
                platform: row.get(1)?,
                sold_currency: row.get(2)?,
                sold_amount: parsed_col(row, 3)?,
                bought_currency: row.get(4)?,
                bought_amount: parsed_col(row, 5)?,
                rate: parsed_col(row, 6)?,
                sold_value_usd: opt_decimal_col(row, 7)?,
                bought_value_usd: opt_decimal_col(row, 8)?,
                profit_loss_usd: opt_decimal_col(row, 9)?,
                outgoing_tx: row.get(10)?,
                incoming_tx: row.get(11)?,
                detected_at: ts_col(row, 12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(swaps)
}

/// Tx uuids already consumed by a recorded swap
pub fn get_swapped_transaction_ids(conn: &Connection) -> LedgerResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT outgoing_tx, incoming_tx FROM swaps")?;
    let mut ids = HashSet::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (out_id, in_id) = row?;
        ids.insert(out_id);
        ids.insert(in_id);
    }
    Ok(ids)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> LedgerResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            fmt_ts(&event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let data_json: String = row.get(5)?;
    Ok(Event {
        event_id: row.get(0)?,
        timestamp: ts_col(row, 1)?,
        event_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
        actor: row.get(6)?,
    })
}

/// Events for one entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LedgerResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn get_recent_events(conn: &Connection, limit: usize) -> LedgerResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
    )?;
    let events = stmt
        .query_map([limit as i64], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}
