//! Minimal ABI encoding for read-only ERC-20 calls.

use super::ChainError;

pub const NAME: &str = "0x06fdde03";
pub const SYMBOL: &str = "0x95d89b41";
pub const DECIMALS: &str = "0x313ce567";
pub const TOTAL_SUPPLY: &str = "0x18160ddd";

/// Selectors worth recognising in raw transaction input.
pub const KNOWN_SELECTORS: &[(&str, &str)] = &[
    ("0xa9059cbb", "transfer(address,uint256)"),
    ("0x095ea7b3", "approve(address,uint256)"),
    ("0x23b872dd", "transferFrom(address,address,uint256)"),
    ("0x70a08231", "balanceOf(address)"),
    (NAME, "name()"),
    (SYMBOL, "symbol()"),
    (DECIMALS, "decimals()"),
    (TOTAL_SUPPLY, "totalSupply()"),
];

fn decode_hex(data: &str) -> Result<Vec<u8>, ChainError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| ChainError::Decode(format!("bad hex: {e}")))
}

fn word_to_usize(word: &[u8]) -> Result<usize, ChainError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("offset out of range".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..32]);
    Ok(u64::from_be_bytes(buf) as usize)
}

fn overflow() -> ChainError {
    ChainError::Decode("string offset overflows".into())
}

/// Decode a single `uint256` return word. Values above 128 bits are rejected.
pub fn decode_uint256(data: &str) -> Result<u128, ChainError> {
    let bytes = decode_hex(data)?;
    if bytes.len() < 32 {
        return Err(ChainError::Decode(format!("expected 32 bytes, got {}", bytes.len())));
    }
    let word = &bytes[..32];
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("uint256 exceeds 128 bits".into()));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..32]);
    Ok(u128::from_be_bytes(buf))
}

/// Decode a `string` return value. Older tokens (MKR and friends) return a
/// right-padded `bytes32` instead; that layout is accepted too.
pub fn decode_string(data: &str) -> Result<String, ChainError> {
    let bytes = decode_hex(data)?;
    if bytes.len() >= 64 {
        let offset = word_to_usize(&bytes[..32])?;
        let start = offset.checked_add(32).ok_or_else(overflow)?;
        if let Some(len_word) = bytes.get(offset..start) {
            let len = word_to_usize(len_word)?;
            let end = start.checked_add(len).ok_or_else(overflow)?;
            if let Some(raw) = bytes.get(start..end) {
                return String::from_utf8(raw.to_vec())
                    .map_err(|e| ChainError::Decode(format!("string is not utf-8: {e}")));
            }
        }
    }
    if bytes.len() == 32 {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        return String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| ChainError::Decode(format!("bytes32 is not utf-8: {e}")));
    }
    Err(ChainError::Decode(format!("cannot decode string from {} bytes", bytes.len())))
}

/// Name the function called by `input` calldata if its selector is in
/// `known`; otherwise return the raw selector.
pub fn decode_function_selector(input: &str, known: &[(&str, &str)]) -> Result<String, ChainError> {
    let Some(head) = input.get(..10).filter(|h| h.starts_with("0x")) else {
        return Err(ChainError::Decode(format!("calldata too short: {input}")));
    };
    let selector = head.to_ascii_lowercase();
    if !selector[2..].bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChainError::Decode(format!("bad selector: {selector}")));
    }
    Ok(known
        .iter()
        .find(|(sel, _)| *sel == selector)
        .map(|(_, sig)| sig.to_string())
        .unwrap_or(selector))
}
