//! Sign-In-With-Agent (SIWA).
//!
//! An agent proves control of an on-chain agent identity by signing a
//! structured message with its key. This crate issues single-use nonces,
//! encodes and decodes the message, verifies the EIP-191 signature and
//! (optionally) ERC-721 registry ownership with an ERC-1271 fallback, and
//! mints stateless HMAC receipts for verified sessions.
//!
//! The building blocks are usable on their own; [`service::SiwaService`]
//! and [`server::router`] wire them into an HTTP service.

pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod message;
pub mod nonce;
pub mod receipt;
pub mod response;
pub mod server;
pub mod service;
pub mod settings;
pub mod signer;
pub mod verify;

pub use error::{Error, Result, SiwaErrorCode};
pub use message::{AgentId, AgentRegistry, SiwaMessage, generate_nonce};
pub use nonce::{NonceCheck, NonceStore};
pub use receipt::{ReceiptPayload, issue_receipt, validate_receipt};
pub use response::{SiwaResponse, SiwaStatus};
pub use signer::{LocalSigner, Signer, sign_siwa_message};
pub use verify::{VerificationMode, VerificationResult, Verifier, VerifierConfig};
