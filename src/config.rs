// ⚙️ Configuration - environment driven
//
// Loaded once at startup (after dotenvy has read .env). Every value has a
// default so a bare `treasury-ledger sync` works against public endpoints.

use crate::error::ConfigError;
use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_BLOCKSTREAM_URL: &str = "https://blockstream.info/api";
pub const DEFAULT_ETHERSCAN_URL: &str = "https://api.etherscan.io/api";
pub const DEFAULT_TRONGRID_URL: &str = "https://api.trongrid.io";
pub const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,

    // Chain data providers
    pub blockstream_base_url: String,
    pub etherscan_base_url: String,
    pub etherscan_api_key: Option<String>,
    pub trongrid_base_url: String,
    pub trongrid_api_key: Option<String>,
    pub coingecko_base_url: String,
    pub http_timeout_secs: u64,

    // Sync behaviour
    pub sync_max_attempts: u32,
    pub sync_retry_base_ms: u64,

    // Bookkeeping
    pub swap_window_minutes: i64,
    pub payment_tolerance: Decimal,

    pub server_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from("treasury.db"),
            blockstream_base_url: DEFAULT_BLOCKSTREAM_URL.to_string(),
            etherscan_base_url: DEFAULT_ETHERSCAN_URL.to_string(),
            etherscan_api_key: None,
            trongrid_base_url: DEFAULT_TRONGRID_URL.to_string(),
            trongrid_api_key: None,
            coingecko_base_url: DEFAULT_COINGECKO_URL.to_string(),
            http_timeout_secs: 30,
            sync_max_attempts: 3,
            sync_retry_base_ms: 500,
            swap_window_minutes: 60,
            payment_tolerance: Decimal::new(1, 2),
            server_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let string_or = |key: &str, default: String| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Config {
            db_path: PathBuf::from(string_or(
                "LEDGER_DB_PATH",
                defaults.db_path.to_string_lossy().into_owned(),
            )),
            blockstream_base_url: string_or("BLOCKSTREAM_BASE_URL", defaults.blockstream_base_url),
            etherscan_base_url: string_or("ETHERSCAN_BASE_URL", defaults.etherscan_base_url),
            etherscan_api_key: optional("ETHERSCAN_API_KEY"),
            trongrid_base_url: string_or("TRONGRID_BASE_URL", defaults.trongrid_base_url),
            trongrid_api_key: optional("TRONGRID_API_KEY"),
            coingecko_base_url: string_or("COINGECKO_BASE_URL", defaults.coingecko_base_url),
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            sync_max_attempts: parse_or(&lookup, "SYNC_MAX_ATTEMPTS", defaults.sync_max_attempts)?,
            sync_retry_base_ms: parse_or(&lookup, "SYNC_RETRY_BASE_MS", defaults.sync_retry_base_ms)?,
            swap_window_minutes: parse_or(
                &lookup,
                "SWAP_WINDOW_MINUTES",
                defaults.swap_window_minutes,
            )?,
            payment_tolerance: parse_or(&lookup, "PAYMENT_TOLERANCE", defaults.payment_tolerance)?,
            server_addr: string_or("SERVER_ADDR", defaults.server_addr),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
            });
        }
        if self.swap_window_minutes <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "SWAP_WINDOW_MINUTES".to_string(),
                value: self.swap_window_minutes.to_string(),
            });
        }
        if self.payment_tolerance.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "PAYMENT_TOLERANCE".to_string(),
                value: self.payment_tolerance.to_string(),
            });
        }
        if self.server_addr.is_empty() {
            return Err(ConfigError::EmptyValue {
                key: "SERVER_ADDR".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
        }),
    }
}
