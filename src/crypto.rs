//! secp256k1 / keccak primitives for EIP-191 personal-message signatures.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::SignatureError;

/// Length of an `r || s || v` signature.
pub const SIGNATURE_LEN: usize = 65;

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Digest signed by `personal_sign`:
/// `keccak256("\x19Ethereum Signed Message:\n" || len || message)`.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Decode a hex string, with or without a `0x` prefix.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, SignatureError> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(SignatureError::InvalidHex("hex string is empty".to_string()));
    }
    hex::decode(digits).map_err(|e| SignatureError::InvalidHex(e.to_string()))
}

pub fn encode_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Raw 65-byte signature in its wire order.
pub fn signature_bytes(signature_hex: &str) -> Result<Vec<u8>, SignatureError> {
    let bytes = decode_hex(signature_hex)?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength(bytes.len()));
    }
    Ok(bytes)
}

fn normalize_recovery_id(raw: u8) -> Result<RecoveryId, SignatureError> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => return Err(SignatureError::InvalidRecoveryId(raw)),
    };
    RecoveryId::from_byte(id).ok_or(SignatureError::InvalidRecoveryId(raw))
}

/// Recover the lowercase `0x` address that produced `signature_hex` over the
/// 32-byte `prehash`.
pub fn recover_prehash(prehash: &[u8; 32], signature_hex: &str) -> Result<String, SignatureError> {
    let bytes = signature_bytes(signature_hex)?;
    let sig = EcdsaSignature::try_from(&bytes[..64])
        .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
    let recovery_id = normalize_recovery_id(bytes[64])?;
    let key = VerifyingKey::recover_from_prehash(prehash, &sig, recovery_id)
        .map_err(|e| SignatureError::RecoveryFailed(e.to_string()))?;
    address_from_verifying_key(&key)
}

/// Recover the signer of an EIP-191 personal message.
pub fn recover_address(message: &str, signature_hex: &str) -> Result<String, SignatureError> {
    recover_prehash(&eip191_hash(message.as_bytes()), signature_hex)
}

pub fn address_from_verifying_key(key: &VerifyingKey) -> Result<String, SignatureError> {
    let encoded = key.to_encoded_point(false);
    let pubkey = encoded.as_bytes();
    if pubkey.len() != 65 || pubkey[0] != 0x04 {
        return Err(SignatureError::RecoveryFailed(
            "unexpected recovered public key format".to_string(),
        ));
    }
    let digest = keccak256(&pubkey[1..]);
    Ok(encode_hex_prefixed(&digest[12..]))
}

/// `0x` + 40 hex digits, lowercased. `None` for anything else.
pub fn normalize_address(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let hex = trimmed.strip_prefix("0x")?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

pub fn addresses_equal(a: &str, b: &str) -> bool {
    match (normalize_address(a), normalize_address(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Sign a 32-byte digest, returning `0x || r || s || v` with `v` in 27/28.
pub fn sign_prehash(key: &SigningKey, prehash: &[u8; 32]) -> Result<String, SignatureError> {
    let (sig, recid) = key
        .sign_prehash_recoverable(prehash)
        .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
    let mut bytes = sig.to_bytes().to_vec();
    bytes.push(recid.to_byte() + 27);
    Ok(encode_hex_prefixed(&bytes))
}
