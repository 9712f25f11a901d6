// Treasury Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod address;        // Address format validation
pub mod chain;          // Blockchain data providers
pub mod config;         // Environment configuration
pub mod db;             // SQLite persistence + audit events
pub mod entities;       // Wallet + Investment entities
pub mod error;          // Typed errors
pub mod format;         // Amount display
pub mod pools;          // Liquidity pools
pub mod prices;         // Historical USD prices
pub mod reconciliation; // Payment + balance reconciliation
pub mod swap;           // Swap detection
pub mod sync;           // Wallet sync engine
pub mod transfers;      // Internal transfer detection

// Re-export commonly used types
pub use chain::{
    BlockstreamClient, ChainDataProvider, ChainTransfer, EtherscanClient,
    MockChainProvider, ProviderSet, TronGridClient,
};
pub use config::Config;
pub use db::{
    Direction, Event, LedgerTransaction, SharedConnection, TransferKind, TxStatus,
    open_database, setup_database, insert_transactions, get_all_transactions,
    insert_event, get_events_for_entity,
};
pub use entities::{Investment, Network, PaymentStatus, Wallet, WalletRegistry, WalletSnapshot};
pub use error::{ConfigError, LedgerError, LedgerResult};
pub use format::{format_amount, format_signed_usd};
pub use pools::{LiquidityPool, LiquidityPoolEngine, PoolViolation};
pub use prices::{CoinGeckoClient, PriceSource, StaticPriceSource};
pub use reconciliation::{
    BalanceReconciler, BalanceReconciliationReport, PaymentReconciler,
    PaymentReconciliation, ReconciliationResult, Discrepancy, DiscrepancyCategory,
};
pub use swap::{SwapCandidate, SwapDetector, SwapRecord};
pub use sync::{SyncReport, SyncSettings, WalletSyncEngine, WalletSyncOutcome};
pub use transfers::{InternalTransferReport, TransferClassifier};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
