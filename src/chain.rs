//! Chain data providers
//!
//! Thin clients over public blockchain-data APIs. Each one answers two
//! questions for a tracked wallet: what does it hold right now, and which
//! transfers touched it recently.
//!
//! - Bitcoin: Esplora API (blockstream.info)
//! - Ethereum: Etherscan (native ETH and ERC-20)
//! - Tron: TronGrid (native TRX balance and TRC-20)

use crate::config::Config;
use crate::db::Direction;
use crate::entities::wallet::base_units_to_decimal;
use crate::entities::{Network, Wallet, WalletSnapshot};
use crate::error::{ConfigError, LedgerError, LedgerResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// A transfer as the chain reports it, from the tracked wallet's side
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTransfer {
    pub tx_hash: String,
    pub direction: Direction,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub confirmed: bool,
}

#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn network(&self) -> Network;

    async fn fetch_snapshot(&self, wallet: &Wallet) -> LedgerResult<WalletSnapshot>;

    /// Recent transfers; providers that can't list them return nothing
    async fn fetch_transfers(&self, _wallet: &Wallet) -> LedgerResult<Vec<ChainTransfer>> {
        Ok(Vec::new())
    }
}

/// Shared reqwest client with sane timeouts
pub fn build_http_client(timeout_secs: u64) -> LedgerResult<Client> {
    Client::builder()
        .pool_max_idle_per_host(5)
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("treasury-ledger/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LedgerError::Config(ConfigError::HttpClient(e.to_string())))
}

/// Parse a non-negative integer amount string ("12345") into base units
fn parse_units(provider: &str, raw: &str) -> LedgerResult<i128> {
    raw.trim()
        .parse::<i128>()
        .map_err(|_| LedgerError::provider(provider, format!("invalid amount '{}'", raw)))
}

fn from_unix(provider: &str, secs: i64) -> LedgerResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| LedgerError::provider(provider, format!("invalid timestamp {}", secs)))
}

async fn get_json<T: for<'de> Deserialize<'de>>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> LedgerResult<T> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LedgerError::provider(
            provider,
            format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| LedgerError::provider(provider, format!("unparsable response: {}", e)))
}

// ============================================================================
// BLOCKSTREAM (Bitcoin, Esplora API)
// ============================================================================

#[derive(Debug, Deserialize)]
struct EsploraAddress {
    chain_stats: EsploraStats,
}

#[derive(Debug, Deserialize)]
struct EsploraStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
    tx_count: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    fee: u64,
    status: EsploraStatus,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

pub struct BlockstreamClient {
    client: Client,
    base_url: String,
}

impl BlockstreamClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        BlockstreamClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Net effect of one tx on `address`, as a ChainTransfer.
    /// Consolidations back to the same address come out as fee-only rows.
    fn transfer_from_tx(&self, address: &str, tx: &EsploraTx) -> LedgerResult<Option<ChainTransfer>> {
        let spent: u64 = tx
            .vin
            .iter()
            .filter_map(|vin| vin.prevout.as_ref())
            .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
            .map(|out| out.value)
            .sum();
        let received: u64 = tx
            .vout
            .iter()
            .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
            .map(|out| out.value)
            .sum();

        let occurred_at = match tx.status.block_time {
            Some(t) => from_unix(self.name(), t)?,
            None => Utc::now(),
        };

        let net = received as i128 - spent as i128;
        if net > 0 {
            let from = tx
                .vin
                .iter()
                .filter_map(|vin| vin.prevout.as_ref())
                .filter_map(|out| out.scriptpubkey_address.clone())
                .find(|a| a != address)
                .unwrap_or_default();
            return Ok(Some(ChainTransfer {
                tx_hash: tx.txid.clone(),
                direction: Direction::Incoming,
                from_address: from,
                to_address: address.to_string(),
                amount: Network::Bitcoin.from_base_units(net),
                fee: Decimal::ZERO,
                occurred_at,
                confirmed: tx.status.confirmed,
            }));
        }

        if net == 0 {
            return Ok(None);
        }

        // Outgoing: the wallet funded the inputs, so it also paid the fee
        let outflow = -net;
        let fee = (tx.fee as i128).min(outflow);
        let sent = outflow - fee;
        let to = tx
            .vout
            .iter()
            .filter_map(|out| out.scriptpubkey_address.clone())
            .find(|a| a != address)
            .unwrap_or_else(|| address.to_string());
        Ok(Some(ChainTransfer {
            tx_hash: tx.txid.clone(),
            direction: Direction::Outgoing,
            from_address: address.to_string(),
            to_address: to,
            amount: Network::Bitcoin.from_base_units(sent),
            fee: Network::Bitcoin.from_base_units(fee),
            occurred_at,
            confirmed: tx.status.confirmed,
        }))
    }
}

#[async_trait]
impl ChainDataProvider for BlockstreamClient {
    fn name(&self) -> &str {
        "blockstream"
    }

    fn network(&self) -> Network {
        Network::Bitcoin
    }

    async fn fetch_snapshot(&self, wallet: &Wallet) -> LedgerResult<WalletSnapshot> {
        let url = format!("{}/address/{}", self.base_url, wallet.address);
        let info: EsploraAddress = get_json(self.name(), self.client.get(&url)).await?;

        let sats = info.chain_stats.funded_txo_sum as i128 - info.chain_stats.spent_txo_sum as i128;
        debug!(address = %wallet.address, sats, "blockstream balance");

        Ok(WalletSnapshot {
            balance: Network::Bitcoin.from_base_units(sats),
            tx_count: info.chain_stats.tx_count,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_transfers(&self, wallet: &Wallet) -> LedgerResult<Vec<ChainTransfer>> {
        let url = format!("{}/address/{}/txs", self.base_url, wallet.address);
        let txs: Vec<EsploraTx> = get_json(self.name(), self.client.get(&url)).await?;

        let mut transfers = Vec::new();
        for tx in &txs {
            if let Some(transfer) = self.transfer_from_tx(&wallet.address, tx)? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

// ============================================================================
// ETHERSCAN (Ethereum + ERC-20)
// ============================================================================

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EtherscanProxyResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtherscanTx {
    hash: String,
    from: String,
    to: String,
    value: String,
    time_stamp: String,
    #[serde(default)]
    gas_used: String,
    #[serde(default)]
    gas_price: String,
    #[serde(default)]
    is_error: Option<String>,
    #[serde(default)]
    token_decimal: Option<String>,
}

/// Unwrap an account-module response. "No transactions found" is an empty list.
fn etherscan_result(provider: &str, response: EtherscanResponse) -> LedgerResult<serde_json::Value> {
    if response.status == "1" {
        return Ok(response.result);
    }
    if response.message.starts_with("No transactions found") {
        return Ok(serde_json::Value::Array(Vec::new()));
    }
    let detail = response.result.as_str().unwrap_or(&response.message).to_string();
    Err(LedgerError::provider(provider, detail))
}

/// `balance` / `tokenbalance` result (a base-unit string)
fn etherscan_balance(provider: &str, result: &serde_json::Value, decimals: u32) -> LedgerResult<Decimal> {
    let raw = result
        .as_str()
        .ok_or_else(|| LedgerError::provider(provider, "balance result is not a string"))?;
    Ok(base_units_to_decimal(parse_units(provider, raw)?, decimals))
}

/// `eth_getTransactionCount` answer ("0x1a") as a count
fn etherscan_nonce(provider: &str, proxy: EtherscanProxyResponse) -> LedgerResult<u64> {
    if let Some(error) = proxy.error {
        return Err(LedgerError::provider(provider, error.to_string()));
    }
    let hex = proxy
        .result
        .ok_or_else(|| LedgerError::provider(provider, "missing nonce"))?;
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|_| LedgerError::provider(provider, format!("invalid nonce '{}'", hex)))
}

pub struct EtherscanClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl EtherscanClient {
    pub fn new(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        EtherscanClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Decimals for token balances (tokenbalance doesn't report them)
    pub fn token_decimals(currency: &str) -> u32 {
        match currency.to_uppercase().as_str() {
            "USDT" | "USDC" => 6,
            "WBTC" => 8,
            _ => 18,
        }
    }

    async fn account_call(&self, query: &[(&str, &str)]) -> LedgerResult<serde_json::Value> {
        let mut request = self.client.get(&self.base_url).query(query);
        if let Some(key) = &self.api_key {
            request = request.query(&[("apikey", key.as_str())]);
        }
        let response: EtherscanResponse = get_json(self.name(), request).await?;
        etherscan_result(self.name(), response)
    }

    /// One txlist/tokentx row from the wallet's side.
    ///
    /// The sender pays gas even when nothing moves (failed calls, token
    /// transfers sent from this address), so a native wallet gets a
    /// zero-amount outgoing row carrying the fee.
    fn transfer_from_tx(&self, wallet: &Wallet, tx: &EtherscanTx) -> LedgerResult<Option<ChainTransfer>> {
        let incoming = wallet.owns_address(&tx.to);
        let outgoing = wallet.owns_address(&tx.from);
        if !incoming && !outgoing {
            return Ok(None);
        }

        let decimals = match &tx.token_decimal {
            Some(d) => d.trim().parse::<u32>().map_err(|_| {
                LedgerError::provider(self.name(), format!("invalid tokenDecimal '{}'", d))
            })?,
            None => Network::Ethereum.decimals(),
        };
        let amount = if tx.is_error.as_deref() == Some("1") {
            Decimal::ZERO
        } else {
            base_units_to_decimal(parse_units(self.name(), &tx.value)?, decimals)
        };

        let fee = if outgoing && !tx.gas_used.is_empty() && !tx.gas_price.is_empty() {
            let wei = parse_units(self.name(), &tx.gas_used)?
                .saturating_mul(parse_units(self.name(), &tx.gas_price)?);
            Network::Ethereum.from_base_units(wei)
        } else {
            Decimal::ZERO
        };

        if amount.is_zero() && (fee.is_zero() || wallet.is_token()) {
            return Ok(None);
        }

        let secs = tx
            .time_stamp
            .parse::<i64>()
            .map_err(|_| LedgerError::provider(self.name(), format!("invalid timeStamp '{}'", tx.time_stamp)))?;

        Ok(Some(ChainTransfer {
            tx_hash: tx.hash.to_lowercase(),
            // A self-send shows up as outgoing; the fee is the only real effect
            direction: if outgoing { Direction::Outgoing } else { Direction::Incoming },
            from_address: tx.from.to_lowercase(),
            to_address: tx.to.to_lowercase(),
            amount,
            fee,
            occurred_at: from_unix(self.name(), secs)?,
            confirmed: true,
        }))
    }
}

#[async_trait]
impl ChainDataProvider for EtherscanClient {
    fn name(&self) -> &str {
        "etherscan"
    }

    fn network(&self) -> Network {
        Network::Ethereum
    }

    async fn fetch_snapshot(&self, wallet: &Wallet) -> LedgerResult<WalletSnapshot> {
        let result = match &wallet.token_contract {
            Some(contract) => {
                self.account_call(&[
                    ("module", "account"),
                    ("action", "tokenbalance"),
                    ("contractaddress", contract.as_str()),
                    ("address", wallet.address.as_str()),
                    ("tag", "latest"),
                ])
                .await?
            }
            None => {
                self.account_call(&[
                    ("module", "account"),
                    ("action", "balance"),
                    ("address", wallet.address.as_str()),
                    ("tag", "latest"),
                ])
                .await?
            }
        };
        let decimals = if wallet.is_token() {
            Self::token_decimals(&wallet.currency)
        } else {
            Network::Ethereum.decimals()
        };
        let balance = etherscan_balance(self.name(), &result, decimals)?;

        // Nonce = number of transactions sent from the address
        let mut request = self.client.get(&self.base_url).query(&[
            ("module", "proxy"),
            ("action", "eth_getTransactionCount"),
            ("address", wallet.address.as_str()),
            ("tag", "latest"),
        ]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("apikey", key.as_str())]);
        }
        let proxy: EtherscanProxyResponse = get_json(self.name(), request).await?;
        let tx_count = etherscan_nonce(self.name(), proxy)?;

        Ok(WalletSnapshot {
            balance,
            tx_count,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_transfers(&self, wallet: &Wallet) -> LedgerResult<Vec<ChainTransfer>> {
        let result = match &wallet.token_contract {
            Some(contract) => {
                self.account_call(&[
                    ("module", "account"),
                    ("action", "tokentx"),
                    ("contractaddress", contract.as_str()),
                    ("address", wallet.address.as_str()),
                    ("page", "1"),
                    ("offset", "100"),
                    ("sort", "desc"),
                ])
                .await?
            }
            None => {
                self.account_call(&[
                    ("module", "account"),
                    ("action", "txlist"),
                    ("address", wallet.address.as_str()),
                    ("page", "1"),
                    ("offset", "100"),
                    ("sort", "desc"),
                ])
                .await?
            }
        };

        let txs: Vec<EtherscanTx> = serde_json::from_value(result)
            .map_err(|e| LedgerError::provider(self.name(), format!("unparsable tx list: {}", e)))?;

        let mut transfers = Vec::new();
        for tx in &txs {
            if let Some(transfer) = self.transfer_from_tx(wallet, tx)? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

// ============================================================================
// TRONGRID (Tron + TRC-20)
// ============================================================================

#[derive(Debug, Deserialize)]
struct TronAccountResponse {
    #[serde(default)]
    data: Vec<TronAccount>,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct TronAccount {
    #[serde(default)]
    balance: i64,
    #[serde(default)]
    trc20: Vec<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TronTrc20Response {
    #[serde(default)]
    data: Vec<TronTrc20Transfer>,
}

#[derive(Debug, Deserialize)]
struct TronTrc20Transfer {
    transaction_id: String,
    from: String,
    to: String,
    value: String,
    block_timestamp: i64,
    token_info: TronTokenInfo,
}

#[derive(Debug, Deserialize)]
struct TronTokenInfo {
    decimals: u32,
}

/// Native or TRC-20 balance out of a `/v1/accounts/{addr}` answer
fn tron_balance(provider: &str, response: &TronAccountResponse, wallet: &Wallet) -> LedgerResult<Decimal> {
    if !response.success {
        return Err(LedgerError::provider(provider, "account lookup unsuccessful"));
    }

    // Unactivated accounts come back with no data at all
    match (response.data.first(), &wallet.token_contract) {
        (None, _) => Ok(Decimal::ZERO),
        (Some(account), None) => Ok(Network::Tron.from_base_units(account.balance as i128)),
        (Some(account), Some(contract)) => {
            let raw = account
                .trc20
                .iter()
                .find_map(|entry| entry.get(contract.as_str()))
                .map(String::as_str)
                .unwrap_or("0");
            Ok(base_units_to_decimal(
                parse_units(provider, raw)?,
                EtherscanClient::token_decimals(&wallet.currency),
            ))
        }
    }
}

fn tron_transfer(provider: &str, wallet: &Wallet, t: &TronTrc20Transfer) -> LedgerResult<Option<ChainTransfer>> {
    let outgoing = wallet.owns_address(&t.from);
    if !outgoing && !wallet.owns_address(&t.to) {
        return Ok(None);
    }
    let occurred_at = Utc
        .timestamp_millis_opt(t.block_timestamp)
        .single()
        .ok_or_else(|| LedgerError::provider(provider, "invalid block_timestamp"))?;
    Ok(Some(ChainTransfer {
        tx_hash: t.transaction_id.clone(),
        direction: if outgoing { Direction::Outgoing } else { Direction::Incoming },
        from_address: t.from.clone(),
        to_address: t.to.clone(),
        amount: base_units_to_decimal(parse_units(provider, &t.value)?, t.token_info.decimals),
        fee: Decimal::ZERO,
        occurred_at,
        confirmed: true,
    }))
}

pub struct TronGridClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl TronGridClient {
    pub fn new(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        TronGridClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.api_key {
            Some(key) => request.header("TRON-PRO-API-KEY", key),
            None => request,
        }
    }
}

#[async_trait]
impl ChainDataProvider for TronGridClient {
    fn name(&self) -> &str {
        "trongrid"
    }

    fn network(&self) -> Network {
        Network::Tron
    }

    /// TronGrid doesn't report a transaction count; the stored one is kept.
    async fn fetch_snapshot(&self, wallet: &Wallet) -> LedgerResult<WalletSnapshot> {
        let url = format!("{}/v1/accounts/{}", self.base_url, wallet.address);
        let response: TronAccountResponse = get_json(self.name(), self.request(&url)).await?;
        let balance = tron_balance(self.name(), &response, wallet)?;

        Ok(WalletSnapshot {
            balance,
            tx_count: wallet.tx_count,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_transfers(&self, wallet: &Wallet) -> LedgerResult<Vec<ChainTransfer>> {
        let Some(contract) = &wallet.token_contract else {
            return Ok(Vec::new());
        };
        let url = format!("{}/v1/accounts/{}/transactions/trc20", self.base_url, wallet.address);
        let request = self
            .request(&url)
            .query(&[("limit", "50"), ("contract_address", contract.as_str())]);
        let response: TronTrc20Response = get_json(self.name(), request).await?;

        let mut transfers = Vec::new();
        for t in &response.data {
            if let Some(transfer) = tron_transfer(self.name(), wallet, t)? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

// ============================================================================
// PROVIDER SET
// ============================================================================

/// One provider per network
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<Network, Arc<dyn ChainDataProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Public-API providers for every supported network
    pub fn from_config(config: &Config) -> LedgerResult<Self> {
        let client = build_http_client(config.http_timeout_secs)?;
        let mut set = ProviderSet::new();
        set.insert(Arc::new(BlockstreamClient::new(
            client.clone(),
            &config.blockstream_base_url,
        )));
        set.insert(Arc::new(EtherscanClient::new(
            client.clone(),
            &config.etherscan_base_url,
            config.etherscan_api_key.clone(),
        )));
        set.insert(Arc::new(TronGridClient::new(
            client,
            &config.trongrid_base_url,
            config.trongrid_api_key.clone(),
        )));
        Ok(set)
    }

    pub fn insert(&mut self, provider: Arc<dyn ChainDataProvider>) {
        self.providers.insert(provider.network(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ChainDataProvider>) -> Self {
        self.insert(provider);
        self
    }

    pub fn get(&self, network: Network) -> LedgerResult<Arc<dyn ChainDataProvider>> {
        self.providers
            .get(&network)
            .cloned()
            .ok_or_else(|| LedgerError::NoProvider {
                network: network.to_string(),
            })
    }
}

// ============================================================================
// MOCK PROVIDER
// ============================================================================

/// Scripted provider for tests and dry runs.
///
/// Snapshot responses are queued per address; when a queue has one entry
/// left it keeps answering with it.
pub struct MockChainProvider {
    network: Network,
    snapshots: Mutex<HashMap<String, VecDeque<Result<WalletSnapshot, String>>>>,
    transfers: Mutex<HashMap<String, Vec<ChainTransfer>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockChainProvider {
    pub fn new(network: Network) -> Self {
        MockChainProvider {
            network,
            snapshots: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, address: &str) -> String {
        crate::entities::wallet::address_key(self.network, address)
    }

    pub fn push_snapshot(&self, address: &str, balance: Decimal, tx_count: u64) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots.entry(self.key(address)).or_default().push_back(Ok(WalletSnapshot {
            balance,
            tx_count,
            fetched_at: Utc::now(),
        }));
    }

    pub fn push_failure(&self, address: &str, reason: &str) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .entry(self.key(address))
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    pub fn set_transfers(&self, address: &str, transfers: Vec<ChainTransfer>) {
        let mut map = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(self.key(address), transfers);
    }

    pub fn snapshot_calls(&self, address: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(&self.key(address)).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ChainDataProvider for MockChainProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn fetch_snapshot(&self, wallet: &Wallet) -> LedgerResult<WalletSnapshot> {
        let key = self.key(&wallet.address);
        {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            *calls.entry(key.clone()).or_insert(0) += 1;
        }

        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = snapshots
            .get_mut(&key)
            .ok_or_else(|| LedgerError::provider("mock", format!("no script for {}", wallet.address)))?;
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next {
            Some(Ok(mut snapshot)) => {
                snapshot.fetched_at = Utc::now();
                Ok(snapshot)
            }
            Some(Err(reason)) => Err(LedgerError::provider("mock", reason)),
            None => Err(LedgerError::provider("mock", "script exhausted")),
        }
    }

    async fn fetch_transfers(&self, wallet: &Wallet) -> LedgerResult<Vec<ChainTransfer>> {
        let map = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(&self.key(&wallet.address)).cloned().unwrap_or_default())
    }
}
