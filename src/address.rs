// 🔎 Address Validation - checks run before a wallet enters the tracked set
//
// Format checks only (charset, prefix, length). No checksum verification:
// a typo that survives these still fails loudly on the first sync.

use crate::entities::Network;
use crate::error::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Address is unusable
    Warning,  // Usable but suspicious
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressIssue {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressCheck {
    pub network: Network,
    pub normalized: String,
    pub issues: Vec<AddressIssue>,
}

impl AddressCheck {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    fn critical(&mut self, message: &str) {
        self.issues.push(AddressIssue {
            severity: Severity::Critical,
            message: message.to_string(),
        });
    }

    fn warning(&mut self, message: &str) {
        self.issues.push(AddressIssue {
            severity: Severity::Warning,
            message: message.to_string(),
        });
    }
}

/// Canonical form for storage and comparison
pub fn normalize(network: Network, address: &str) -> String {
    let trimmed = address.trim();
    match network {
        Network::Ethereum => trimmed.to_lowercase(),
        Network::Bitcoin if trimmed.to_lowercase().starts_with("bc1") => trimmed.to_lowercase(),
        _ => trimmed.to_string(),
    }
}

/// Run every format check and collect issues
pub fn check(network: Network, address: &str) -> AddressCheck {
    let normalized = normalize(network, address);
    let mut result = AddressCheck {
        network,
        normalized: normalized.clone(),
        issues: Vec::new(),
    };

    if normalized.is_empty() {
        result.critical("Address is empty");
        return result;
    }
    if address.trim() != address {
        result.warning("Address had surrounding whitespace");
    }

    match network {
        Network::Bitcoin => check_bitcoin(address.trim(), &mut result),
        Network::Ethereum => check_ethereum(&normalized, &mut result),
        Network::Tron => check_tron(&normalized, &mut result),
    }

    result
}

/// Validate and return the normalized address, or an InvalidAddress error
pub fn validate(network: Network, address: &str) -> LedgerResult<String> {
    let result = check(network, address);
    if result.is_valid() {
        return Ok(result.normalized);
    }

    let reason = result
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Err(LedgerError::InvalidAddress {
        network: network.to_string(),
        address: address.to_string(),
        reason,
    })
}

fn is_base58(s: &str) -> bool {
    s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn check_bitcoin(address: &str, result: &mut AddressCheck) {
    let lower = address.to_lowercase();

    if lower.starts_with("bc1") {
        // Mixed case is forbidden by bech32
        if address != lower && address != address.to_uppercase() {
            result.critical("Bech32 address mixes upper and lower case");
        }
        let data = &lower[3..];
        if !data.chars().all(|c| BECH32_CHARSET.contains(c)) {
            result.critical("Bech32 address contains characters outside the bech32 charset");
        }
        if lower.len() != 42 && lower.len() != 62 {
            result.critical("Bech32 address must be 42 (P2WPKH) or 62 (P2WSH/P2TR) characters");
        }
        return;
    }

    if address.starts_with('1') || address.starts_with('3') {
        if !is_base58(address) {
            result.critical("Legacy address contains non-base58 characters");
        }
        if !(26..=35).contains(&address.len()) {
            result.critical("Legacy address must be 26-35 characters");
        }
        if address.starts_with('1') {
            result.warning("Legacy P2PKH address; prefer segwit for new wallets");
        }
        return;
    }

    if lower.starts_with("tb1") || address.starts_with('m') || address.starts_with('n') {
        result.critical("Testnet address on mainnet wallet");
        return;
    }

    result.critical("Bitcoin address must start with bc1, 1 or 3");
}

fn check_ethereum(address: &str, result: &mut AddressCheck) {
    let Some(hex) = address.strip_prefix("0x") else {
        result.critical("Ethereum address must start with 0x");
        return;
    };
    if hex.len() != 40 {
        result.critical("Ethereum address must have 40 hex characters after 0x");
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        result.critical("Ethereum address contains non-hex characters");
    }
    if hex.chars().all(|c| c == '0') {
        result.critical("Zero address cannot hold funds");
    }
}

fn check_tron(address: &str, result: &mut AddressCheck) {
    if !address.starts_with('T') {
        result.critical("Tron address must start with T");
    }
    if address.len() != 34 {
        result.critical("Tron address must be 34 characters");
    }
    if !is_base58(address) {
        result.critical("Tron address contains non-base58 characters");
    }
}
