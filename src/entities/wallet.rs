// 👛 Wallet Entity - Stable identity with balance history
//
// "Wallet balance is a VALUE (changes every sync), Wallet UUID is IDENTITY"
//
// - A tracked address keeps one UUID for its whole life
// - Every sync that moves the balance appends a new version
// - Old versions are expired (valid_until), never deleted
// - Temporal queries answer "what did we hold at time T?"

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Bitcoin,
    Ethereum,
    Tron,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Ethereum => "ethereum",
            Network::Tron => "tron",
        }
    }

    /// Native coin of the chain (fees are always paid in it)
    pub fn native_currency(&self) -> &'static str {
        match self {
            Network::Bitcoin => "BTC",
            Network::Ethereum => "ETH",
            Network::Tron => "TRX",
        }
    }

    /// Decimals of the native coin's base unit (sats, wei, sun)
    pub fn decimals(&self) -> u32 {
        match self {
            Network::Bitcoin => 8,
            Network::Ethereum => 18,
            Network::Tron => 6,
        }
    }

    /// Convert an integer amount of base units into a coin amount.
    pub fn from_base_units(&self, units: i128) -> Decimal {
        base_units_to_decimal(units, self.decimals())
    }

    /// EVM hex addresses compare case-insensitively; base58/bech32 don't.
    pub fn is_case_insensitive(&self) -> bool {
        matches!(self, Network::Ethereum)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Network::Bitcoin),
            "ethereum" | "eth" | "erc20" => Ok(Network::Ethereum),
            "tron" | "trx" | "trc20" => Ok(Network::Tron),
            other => Err(format!("Unknown network: {}", other)),
        }
    }
}

/// Scale an integer base-unit amount by `decimals`.
///
/// Decimal carries at most 28 fractional digits and a 96-bit mantissa, so
/// precision is dropped from the right until the value fits.
pub fn base_units_to_decimal(units: i128, decimals: u32) -> Decimal {
    let mut units = units;
    let mut scale = decimals;
    loop {
        if scale <= 28 {
            if let Ok(d) = Decimal::try_from_i128_with_scale(units, scale) {
                return d.normalize();
            }
        }
        if scale == 0 {
            return if units.is_negative() { Decimal::MIN } else { Decimal::MAX };
        }
        units /= 10;
        scale -= 1;
    }
}

// ============================================================================
// WALLET SNAPSHOT (what a chain data provider reports)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub balance: Decimal,
    pub tx_count: u64,
    pub fetched_at: DateTime<Utc>,
}

// ============================================================================
// WALLET ENTITY
// ============================================================================

/// Wallet Entity - a platform-owned address on one network holding one currency
///
/// Identity: UUID (never changes)
/// Values: balance, tx_count, label, active flag (change over time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub id: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    /// Human label shown in the back-office (e.g. "Cold storage BTC #1")
    pub label: String,

    /// On-chain address (normalized, see `address::normalize`)
    pub address: String,

    pub network: Network,

    /// Currency held (BTC, ETH, USDT, ...)
    pub currency: String,

    /// Token contract for ERC-20 / TRC-20 wallets (None = native coin)
    pub token_contract: Option<String>,

    /// Exchange or custodian the address belongs to (e.g. "Binance")
    pub platform: Option<String>,

    pub balance: Decimal,
    pub tx_count: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_active: bool,

    // ========================================================================
    // VERSIONING
    // ========================================================================
    pub version: i64,
    pub system_time: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl Wallet {
    /// Create a new tracked wallet with zero balance (first sync fills it in)
    pub fn new(label: &str, address: &str, network: Network, currency: &str) -> Self {
        let now = Utc::now();

        Wallet {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            address: address.trim().to_string(),
            network,
            currency: currency.trim().to_uppercase(),
            token_contract: None,
            platform: None,
            balance: Decimal::ZERO,
            tx_count: 0,
            last_synced_at: None,
            is_active: true,
            version: 1,
            system_time: now,
            valid_from: now,
            valid_until: None,
        }
    }

    pub fn with_token_contract(mut self, contract: &str) -> Self {
        self.token_contract = Some(contract.trim().to_string());
        self
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = Some(platform.trim().to_string());
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    /// Token wallets hold something other than the chain's native coin
    pub fn is_token(&self) -> bool {
        self.token_contract.is_some()
    }

    pub fn is_current(&self) -> bool {
        self.valid_until.is_none()
    }

    /// Does `address` refer to this wallet?
    pub fn owns_address(&self, address: &str) -> bool {
        if self.network.is_case_insensitive() {
            self.address.eq_ignore_ascii_case(address.trim())
        } else {
            self.address == address.trim()
        }
    }

    /// True when the snapshot would change balance or tx count
    pub fn differs_from(&self, snapshot: &WalletSnapshot) -> bool {
        self.balance != snapshot.balance || self.tx_count != snapshot.tx_count
    }

    /// Create next version (same identity, fresh validity window)
    pub fn next_version(&self) -> Wallet {
        let now = Utc::now();
        let mut next = self.clone();
        next.version += 1;
        next.system_time = now;
        next.valid_from = now;
        next.valid_until = None;
        next
    }

    /// Next version carrying the provider's balance and tx count
    pub fn apply_snapshot(&self, snapshot: &WalletSnapshot) -> Wallet {
        let mut next = self.next_version();
        next.balance = snapshot.balance;
        next.tx_count = snapshot.tx_count;
        next.last_synced_at = Some(snapshot.fetched_at);
        next
    }

    /// Key used in the tracked address set
    pub fn address_key(&self) -> String {
        address_key(self.network, &self.address)
    }
}

/// Tracked-address-set key: network plus (case-folded for EVM) address
pub fn address_key(network: Network, address: &str) -> String {
    let address = address.trim();
    if network.is_case_insensitive() {
        format!("{}:{}", network.as_str(), address.to_lowercase())
    } else {
        format!("{}:{}", network.as_str(), address)
    }
}

// ============================================================================
// WALLET REGISTRY
// ============================================================================

/// In-memory registry of every wallet version (append-only)
///
/// The SQLite `wallets` table has the same shape; the registry is what the
/// engines work on between loads.
pub struct WalletRegistry {
    versions: Arc<RwLock<Vec<Wallet>>>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        WalletRegistry {
            versions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Build a registry from already persisted versions
    pub fn from_versions(versions: Vec<Wallet>) -> Self {
        WalletRegistry {
            versions: Arc::new(RwLock::new(versions)),
        }
    }

    /// Register a wallet version (append-only, never overwrites)
    pub fn register(&mut self, wallet: Wallet) {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        versions.push(wallet);
    }

    pub fn get_all_versions(&self, id: &str) -> Vec<Wallet> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Wallet> = versions.iter().filter(|w| w.id == id).cloned().collect();
        all.sort_by_key(|w| w.version);
        all
    }

    pub fn get_current_version(&self, id: &str) -> Option<Wallet> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        versions
            .iter()
            .filter(|w| w.id == id && w.is_current())
            .max_by_key(|w| w.version)
            .cloned()
    }

    /// Wallet as of a specific time (temporal query)
    pub fn get_wallet_at_time(&self, id: &str, as_of: DateTime<Utc>) -> Option<Wallet> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        versions
            .iter()
            .filter(|w| w.id == id)
            .find(|w| w.valid_from <= as_of && w.valid_until.map_or(true, |until| until > as_of))
            .cloned()
    }

    /// Update a wallet: expire the current version and append the next one.
    /// Returns the new current version.
    pub fn update_wallet<F>(&mut self, id: &str, mut update_fn: F) -> Result<Wallet, String>
    where
        F: FnMut(&mut Wallet),
    {
        let current = self
            .get_current_version(id)
            .ok_or_else(|| format!("Wallet not found: {}", id))?;

        let mut next = current.next_version();
        update_fn(&mut next);

        let mut expired = current;
        expired.valid_until = Some(next.valid_from);

        {
            let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
            versions.retain(|w| !(w.id == id && w.is_current()));
            versions.push(expired);
            versions.push(next.clone());
        }

        Ok(next)
    }

    /// Current wallets, one per identity, sorted by label
    pub fn all_wallets(&self) -> Vec<Wallet> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        let mut current: Vec<Wallet> = versions.iter().filter(|w| w.is_current()).cloned().collect();

        current.sort_by(|a, b| a.id.cmp(&b.id).then(b.version.cmp(&a.version)));
        current.dedup_by(|a, b| a.id == b.id);
        current.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));

        current
    }

    pub fn active_wallets(&self) -> Vec<Wallet> {
        self.all_wallets().into_iter().filter(|w| w.is_active).collect()
    }

    pub fn count(&self) -> usize {
        self.all_wallets().len()
    }

    pub fn find_by_address(&self, network: Network, address: &str) -> Option<Wallet> {
        self.all_wallets()
            .into_iter()
            .find(|w| w.network == network && w.owns_address(address))
    }

    pub fn by_currency(&self, currency: &str) -> Vec<Wallet> {
        self.all_wallets()
            .into_iter()
            .filter(|w| w.currency.eq_ignore_ascii_case(currency))
            .collect()
    }

    /// The platform's own address set (active wallets only)
    pub fn address_set(&self) -> HashSet<String> {
        self.active_wallets().iter().map(|w| w.address_key()).collect()
    }

    pub fn total_balance_by_currency(&self, currency: &str) -> Decimal {
        self.active_wallets()
            .iter()
            .filter(|w| w.currency.eq_ignore_ascii_case(currency))
            .map(|w| w.balance)
            .sum()
    }
}

impl Default for WalletRegistry {
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
    use rust_decimal_macros::dec;

    fn btc_wallet(label: &str, address: &str) -> Wallet {
        Wallet::new(label, address, Network::Bitcoin, "BTC")
    }

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new(
            "Hot ETH",
            "0xAbC0000000000000000000000000000000000001",
            Network::Ethereum,
            "eth",
        )
        .with_platform("Binance");

        assert!(!wallet.id.is_empty());
        assert_eq!(wallet.currency, "ETH");
        assert_eq!(wallet.balance, Decimal::ZERO);
        assert_eq!(wallet.version, 1);
        assert_eq!(wallet.platform.as_deref(), Some("Binance"));
        assert!(wallet.is_current());
        assert!(wallet.is_active);
        assert!(!wallet.is_token());
    }

    #[test]
    fn test_network_parsing_and_units() {
        assert_eq!("BTC".parse::<Network>().unwrap(), Network::Bitcoin);
        assert_eq!("erc20".parse::<Network>().unwrap(), Network::Ethereum);
        assert_eq!("Tron".parse::<Network>().unwrap(), Network::Tron);
        assert!("dogecoin".parse::<Network>().is_err());

        assert_eq!(Network::Bitcoin.from_base_units(150_000_000), dec!(1.5));
        assert_eq!(
            Network::Ethereum.from_base_units(2_500_000_000_000_000_000),
            dec!(2.5)
        );
        assert_eq!(Network::Tron.from_base_units(1_000_001), dec!(1.000001));
    }

    #[test]
    fn test_owns_address_case_rules() {
        let eth = Wallet::new(
            "ETH",
            "0xAbC0000000000000000000000000000000000001",
            Network::Ethereum,
            "ETH",
        );
        assert!(eth.owns_address("0xabc0000000000000000000000000000000000001"));

        let tron = Wallet::new("TRX", "TXyz1234567890abcdefghijklmnopqrs", Network::Tron, "TRX");
        assert!(!tron.owns_address("txyz1234567890abcdefghijklmnopqrs"));
    }

    #[test]
    fn test_apply_snapshot_preserves_identity() {
        let wallet = btc_wallet("Cold", "bc1qcold");
        let snapshot = WalletSnapshot {
            balance: dec!(0.75),
            tx_count: 12,
            fetched_at: Utc::now(),
        };

        assert!(wallet.differs_from(&snapshot));
        let next = wallet.apply_snapshot(&snapshot);

        assert_eq!(next.id, wallet.id);
        assert_eq!(next.version, 2);
        assert_eq!(next.balance, dec!(0.75));
        assert_eq!(next.tx_count, 12);
        assert_eq!(next.last_synced_at, Some(snapshot.fetched_at));
        assert!(!next.differs_from(&snapshot));
    }

    #[test]
    fn test_registry_update_keeps_history() {
        let mut registry = WalletRegistry::new();
        let wallet = btc_wallet("Cold", "bc1qcold");
        let id = wallet.id.clone();
        registry.register(wallet);

        registry.update_wallet(&id, |w| w.balance = dec!(1.0)).unwrap();
        let v3 = registry.update_wallet(&id, |w| w.balance = dec!(2.0)).unwrap();
        assert_eq!(v3.version, 3);

        let all = registry.get_all_versions(&id);
        assert_eq!(all.len(), 3);
        assert!(all[0].valid_until.is_some());
        assert!(all[1].valid_until.is_some());
        assert!(all[2].valid_until.is_none());
        assert_eq!(all[1].balance, dec!(1.0));

        let current = registry.get_current_version(&id).unwrap();
        assert_eq!(current.balance, dec!(2.0));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_registry_temporal_query() {
        use chrono::Duration;

        let mut registry = WalletRegistry::new();
        let wallet = btc_wallet("Cold", "bc1qcold").with_balance(dec!(1));
        let id = wallet.id.clone();
        let t0 = wallet.valid_from;
        registry.register(wallet);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let t1 = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(10));

        registry.update_wallet(&id, |w| w.balance = dec!(3)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = Utc::now();

        assert!(registry.get_wallet_at_time(&id, t0 - Duration::seconds(1)).is_none());
        assert_eq!(registry.get_wallet_at_time(&id, t1).unwrap().balance, dec!(1));
        assert_eq!(registry.get_wallet_at_time(&id, t2).unwrap().balance, dec!(3));
    }

    #[test]
    fn test_registry_update_nonexistent_fails() {
        let mut registry = WalletRegistry::new();
        let result = registry.update_wallet("missing", |w| w.balance = dec!(1));
        assert!(result.unwrap_err().contains("Wallet not found"));
    }

    #[test]
    fn test_address_set_and_totals() {
        let mut registry = WalletRegistry::new();
        registry.register(btc_wallet("A", "bc1qa").with_balance(dec!(1.25)));
        registry.register(btc_wallet("B", "bc1qb").with_balance(dec!(0.75)));
        let mut inactive = btc_wallet("C", "bc1qc").with_balance(dec!(10));
        inactive.is_active = false;
        registry.register(inactive);
        registry.register(
            Wallet::new(
                "USDT",
                "0xDEAD000000000000000000000000000000000000",
                Network::Ethereum,
                "USDT",
            )
            .with_token_contract("0xdac17f958d2ee523a2206206994597c13d831ec7")
            .with_balance(dec!(5000)),
        );

        let set = registry.address_set();
        assert_eq!(set.len(), 3);
        assert!(set.contains("bitcoin:bc1qa"));
        assert!(set.contains("ethereum:0xdead000000000000000000000000000000000000"));
        assert!(!set.contains("bitcoin:bc1qc"));

        assert_eq!(registry.total_balance_by_currency("BTC"), dec!(2.0));
        assert_eq!(registry.total_balance_by_currency("usdt"), dec!(5000));
        assert_eq!(registry.by_currency("BTC").len(), 3);

        let found = registry
            .find_by_address(Network::Ethereum, "0xdead000000000000000000000000000000000000")
            .unwrap();
        assert!(found.is_token());
    }
}
