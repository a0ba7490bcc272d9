//! Agent-side signing.
//!
//! [`Signer`] hides where the key lives. [`LocalSigner`] keeps a secp256k1
//! key in memory; remote and custodial signers implement the same trait.

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    address_from_verifying_key, addresses_equal, decode_hex, eip191_hash, sign_prehash,
};
use crate::error::{SignatureError, SignerError};
use crate::message::SiwaMessage;

#[async_trait]
pub trait Signer: Send + Sync {
    /// Lowercase `0x` address of the signing key.
    async fn get_address(&self) -> Result<String, SignerError>;

    /// EIP-191 personal sign; `0x` + 65-byte hex with `v` in 27/28.
    async fn sign_message(&self, message: &str) -> Result<String, SignerError>;

    /// Personal sign over raw bytes given as hex.
    async fn sign_raw_message(&self, _raw_hex: &str) -> Result<String, SignerError> {
        Err(SignerError::RawSigningUnsupported)
    }
}

/// In-memory secp256k1 key.
pub struct LocalSigner {
    key: SigningKey,
    address: String,
}

impl LocalSigner {
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let bytes = decode_hex(private_key)?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let address = address_from_verifying_key(key.verifying_key())?;
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn get_address(&self) -> Result<String, SignerError> {
        Ok(self.address.clone())
    }

    async fn sign_message(&self, message: &str) -> Result<String, SignerError> {
        let digest = eip191_hash(message.as_bytes());
        Ok(sign_prehash(&self.key, &digest)?)
    }

    async fn sign_raw_message(&self, raw_hex: &str) -> Result<String, SignerError> {
        let bytes = decode_hex(raw_hex)?;
        let digest = eip191_hash(&bytes);
        Ok(sign_prehash(&self.key, &digest)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSiwaMessage {
    pub message: String,
    pub signature: String,
    pub address: String,
}

/// Fill in the signer's address, then validate, encode and sign.
///
/// A message that already names a different address is refused.
pub async fn sign_siwa_message(
    mut message: SiwaMessage,
    signer: &dyn Signer,
) -> Result<SignedSiwaMessage, SignerError> {
    let address = signer.get_address().await?;
    if !message.address.is_empty() && !addresses_equal(&message.address, &address) {
        return Err(SignerError::AddressMismatch {
            signer: address,
            message: message.address,
        });
    }
    if message.address.is_empty() {
        message.address = address.clone();
    }

    message.validate()?;
    let text = message.encode();
    let signature = signer.sign_message(&text).await?;
    tracing::debug!(%address, agent_id = %message.agent_id, "Signed SIWA message");

    Ok(SignedSiwaMessage {
        message: text,
        signature,
        address,
    })
}
