//! Ethereum helpers: address and hash validation, unit conversion, and the
//! JSON-RPC client used by the wallet and token tools.

pub mod abi;
pub mod rpc;

pub use rpc::RpcClient;

use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid transaction hash: {0}")]
    InvalidHash(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

pub const WEI_PER_ETH: f64 = 1e18;

/// `0x` followed by 40 hex digits. All-lowercase and all-uppercase forms are
/// accepted as-is; mixed case must carry a valid EIP-55 checksum.
pub fn validate_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    let has_lower = body.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = body.bytes().any(|b| b.is_ascii_uppercase());
    if !(has_lower && has_upper) {
        return true;
    }
    to_checksum_address(address).map(|c| c == address).unwrap_or(false)
}

/// EIP-55 mixed-case checksum encoding of `address`.
pub fn to_checksum_address(address: &str) -> Result<String, ChainError> {
    let body = address
        .strip_prefix("0x")
        .filter(|b| b.len() == 40 && b.bytes().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| ChainError::InvalidAddress(address.to_string()))?
        .to_ascii_lowercase();

    let hash = Keccak256::digest(body.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in body.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

pub fn validate_transaction_hash(hash: &str) -> bool {
    hash.len() == 66
        && hash.starts_with("0x")
        && hash[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn wei_to_eth(wei: u128) -> f64 {
    wei as f64 / WEI_PER_ETH
}

/// Parse a JSON-RPC hex quantity such as `"0x1b4"`.
pub fn parse_quantity(value: &str) -> Result<u128, ChainError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::Decode(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| ChainError::Decode(format!("{value}: {e}")))
}

/// Parse an explorer decimal string such as `"1000000000000000000"`.
pub fn parse_decimal(value: &str) -> Result<u128, ChainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse::<u128>().map_err(|e| ChainError::Decode(format!("{value}: {e}")))
}

/// Every `0x` + 40-hex-digit run in `text` that is not part of a longer hex run.
pub fn extract_addresses(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i + 42 <= bytes.len() {
        let at_boundary = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        if at_boundary
            && bytes[i] == b'0'
            && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
            && bytes[i + 2..i + 42].iter().all(u8::is_ascii_hexdigit)
            && bytes.get(i + 42).map(|b| !b.is_ascii_hexdigit()).unwrap_or(true)
        {
            found.push(format!("0x{}", &text[i + 2..i + 42]));
            i += 42;
        } else {
            i += 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn checksum_matches_eip55_vectors() {
        assert_eq!(to_checksum_address(&CHECKSUMMED.to_lowercase()).unwrap(), CHECKSUMMED);
        assert_eq!(
            to_checksum_address("0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359").unwrap(),
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359"
        );
    }

    #[test]
    fn address_validation() {
        assert!(validate_address(CHECKSUMMED));
        assert!(validate_address(&CHECKSUMMED.to_lowercase()));
        assert!(validate_address(&format!("0x{}", CHECKSUMMED[2..].to_uppercase())));
        // one flipped letter breaks the checksum
        assert!(!validate_address("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
        assert!(!validate_address("0x123"));
        assert!(!validate_address("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed00"));
        assert!(!validate_address("0xzzAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
    }

    #[test]
    fn transaction_hash_validation() {
        let hash = format!("0x{}", "ab".repeat(32));
        assert!(validate_transaction_hash(&hash));
        assert!(!validate_transaction_hash(&hash[..65]));
        assert!(!validate_transaction_hash(&format!("0x{}", "g".repeat(64))));
    }

    #[test]
    fn quantities_and_units() {
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert!(parse_quantity("1b4").is_err());
        assert_eq!(parse_decimal("1000000000000000000").unwrap(), 1_000_000_000_000_000_000);
        assert!((wei_to_eth(1_500_000_000_000_000_000) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn extracts_addresses_from_prose() {
        let text = format!("check {} and also 0x{}ff", CHECKSUMMED, "a".repeat(40));
        assert_eq!(extract_addresses(&text), vec![CHECKSUMMED.to_string()]);
        assert!(extract_addresses("no address here 0x1234").is_empty());
    }
}
