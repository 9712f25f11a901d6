// ⚠️ Ledger Errors - typed failures for engines and providers
//
// Binaries wrap these in anyhow; engines return them directly so callers
// can tell a provider outage from a missing wallet.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Provider error ({provider}): {reason}")]
    Provider { provider: String, reason: String },

    #[error("No chain data provider configured for network {network}")]
    NoProvider { network: String },

    #[error("Wallet not found: {id}")]
    WalletNotFound { id: String },

    #[error("Investment not found: {id}")]
    InvestmentNotFound { id: String },

    #[error("Ledger transaction not found: {id}")]
    TransactionNotFound { id: String },

    #[error("Wallet {address} ({currency}) is already tracked as {existing_id}")]
    DuplicateWallet {
        address: String,
        currency: String,
        existing_id: String,
    },

    #[error("Invalid investment: {reason}")]
    InvalidInvestment { reason: String },

    #[error("Invalid {network} address '{address}': {reason}")]
    InvalidAddress {
        network: String,
        address: String,
        reason: String,
    },

    #[error("A wallet sync is already running")]
    SyncInProgress,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored value in {field}: {value}")]
    CorruptValue { field: String, value: String },
}

impl LedgerError {
    pub fn provider(provider: &str, reason: impl Into<String>) -> Self {
        LedgerError::Provider {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Provider failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Provider { .. })
    }

    /// Lookups that found nothing (wallet, investment, ledger row)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::WalletNotFound { .. }
                | LedgerError::InvestmentNotFound { .. }
                | LedgerError::TransactionNotFound { .. }
        )
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        let provider = err
            .url()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "http".to_string());
        LedgerError::Provider {
            provider,
            reason: err.to_string(),
        }
    }
}

/// Errors raised while reading configuration from the environment
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Empty value for {key}")]
    EmptyValue { key: String },

    #[error("HTTP client could not be built: {0}")]
    HttpClient(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
