//! End-to-end sign-in flows through the public API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use secrecy::SecretString;

use siwa::chain::{ChainClients, ERC1271_MAGIC_VALUE, RegistryReader};
use siwa::error::{ChainError, ResolverError};
use siwa::nonce::{HmacNonce, InMemoryNonceStore};
use siwa::response::SiwaAction;
use siwa::server::start_server;
use siwa::service::{NonceRequest, ServiceOptions, SiwaService, VerifyRequest};
use siwa::verify::SignerType;
use siwa::{
    AgentId, AgentRegistry, LocalSigner, NonceCheck, SiwaErrorCode, SiwaMessage, SiwaStatus,
    VerificationMode, Verifier, VerifierConfig, issue_receipt, sign_siwa_message,
    validate_receipt,
};

const AGENT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const AGENT_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
const SMART_ACCOUNT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
const REGISTRY: &str = "eip155:84532:0x8004AA63c570c570eBF15376c0dB199918BFe9Fb";
const DOMAIN: &str = "api.example.com";
const RECEIPT_SECRET: &str = "receipt-secret-0123456789abcdef0123";

fn draft(agent_id: u64, nonce: &str) -> SiwaMessage {
    SiwaMessage::new(
        DOMAIN,
        "",
        format!("https://{DOMAIN}/verify"),
        agent_id,
        AgentRegistry::parse(REGISTRY).expect("registry"),
        nonce,
        Utc::now(),
    )
}

async fn sign(message: SiwaMessage) -> (String, String) {
    let signer = LocalSigner::from_hex(AGENT_KEY).expect("signer");
    let signed = sign_siwa_message(message, &signer).await.expect("sign");
    (signed.message, signed.signature)
}

/// Agent 1 is owned by the agent key, agent 2 by a smart account that
/// accepts any signature, everything else is unminted.
struct FakeRegistry;

#[async_trait]
impl RegistryReader for FakeRegistry {
    async fn owner_of(&self, _registry: &str, agent_id: AgentId) -> Result<String, ChainError> {
        match agent_id.to_u64() {
            Some(1) => Ok(AGENT_ADDRESS.to_string()),
            Some(2) => Ok(SMART_ACCOUNT.to_string()),
            _ => Err(ChainError::Reverted("ERC721NonexistentToken".to_string())),
        }
    }

    async fn is_valid_signature(
        &self,
        account: &str,
        _digest: [u8; 32],
        _signature: &[u8],
    ) -> Result<[u8; 4], ChainError> {
        if account == SMART_ACCOUNT {
            Ok(ERC1271_MAGIC_VALUE)
        } else {
            Err(ChainError::EmptyReturnData)
        }
    }
}

struct FakeChains;

#[async_trait]
impl ChainClients for FakeChains {
    async fn reader(&self, chain_id: u64) -> Result<Arc<dyn RegistryReader>, ResolverError> {
        if chain_id == 84532 {
            Ok(Arc::new(FakeRegistry))
        } else {
            Err(ResolverError::UnsupportedChain {
                chain_id,
                known: vec![84532],
            })
        }
    }
}

#[tokio::test]
async fn offline_sign_in_then_replay_is_rejected() {
    let nonces = NonceCheck::store(InMemoryNonceStore::new());
    let verifier = Verifier::new(
        VerifierConfig::new(DOMAIN),
        nonces.clone(),
        VerificationMode::Offline,
    );

    let issued = nonces.issue(Duration::from_secs(300)).await.expect("nonce");
    let (message, signature) = sign(draft(42, &issued.nonce)).await;

    let result = verifier.verify(&message, &signature).await;
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(result.address, AGENT_ADDRESS);
    assert_eq!(result.agent_id, AgentId::from(42u64));
    assert_eq!(result.chain_id, 84532);

    let receipt = issue_receipt(&result, RECEIPT_SECRET.as_bytes(), Duration::from_secs(60))
        .expect("receipt");
    let payload = validate_receipt(&receipt.receipt, RECEIPT_SECRET.as_bytes()).expect("valid");
    assert_eq!(payload.address, AGENT_ADDRESS);
    assert_eq!(payload.agent_registry, REGISTRY);

    let replay = verifier.verify(&message, &signature).await;
    assert!(!replay.valid);
    assert_eq!(replay.code, Some(SiwaErrorCode::InvalidNonce));
}

#[tokio::test]
async fn stateless_nonces_verify_without_a_store() {
    let hmac = HmacNonce::new("nonce-secret-0123456789abcdef012345").expect("hmac");
    let nonces = NonceCheck::stateless(hmac);
    let verifier = Verifier::new(
        VerifierConfig::new(DOMAIN),
        nonces.clone(),
        VerificationMode::Offline,
    );

    let issued = nonces.issue(Duration::from_secs(300)).await.expect("nonce");
    let (message, signature) = sign(draft(42, &issued.nonce)).await;
    assert!(verifier.verify(&message, &signature).await.valid);

    let (message, signature) = sign(draft(42, "forged-nonce-value")).await;
    let result = verifier.verify(&message, &signature).await;
    assert_eq!(result.code, Some(SiwaErrorCode::InvalidNonce));
}

#[tokio::test]
async fn onchain_ownership_distinguishes_eoa_sca_and_unregistered() {
    let nonces = NonceCheck::store(InMemoryNonceStore::new());
    let verifier = Verifier::new(
        VerifierConfig::new(DOMAIN),
        nonces.clone(),
        VerificationMode::Onchain(Arc::new(FakeChains)),
    );

    for (agent_id, expected) in [(1, SignerType::Eoa), (2, SignerType::Sca)] {
        let issued = nonces.issue(Duration::from_secs(300)).await.expect("nonce");
        let (message, signature) = sign(draft(agent_id, &issued.nonce)).await;
        let result = verifier.verify(&message, &signature).await;
        assert!(result.valid, "agent {agent_id}: {:?}", result.error);
        assert_eq!(result.signer_type, Some(expected));
    }

    let issued = nonces.issue(Duration::from_secs(300)).await.expect("nonce");
    let (message, signature) = sign(draft(99, &issued.nonce)).await;
    let result = verifier.verify(&message, &signature).await;
    assert_eq!(result.code, Some(SiwaErrorCode::NotRegistered));

    let response = siwa::SiwaResponse::from_result(&result);
    assert_eq!(response.status, SiwaStatus::NotRegistered);
    assert_eq!(response.http_status(), 403);
    assert!(matches!(
        response.action,
        Some(SiwaAction::Register {
            chain_id: Some(84532),
            ..
        })
    ));
}

#[tokio::test]
async fn http_flow_over_tcp() {
    let service = SiwaService::new(
        ServiceOptions::new(DOMAIN, SecretString::from(RECEIPT_SECRET.to_string())),
        NonceCheck::store(InMemoryNonceStore::new()),
        VerificationMode::Offline,
    )
    .expect("service");

    let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
    let server = match start_server(addr, Arc::new(service)).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("skipping: cannot bind test listener: {e}");
            return;
        }
    };
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let nonce: serde_json::Value = client
        .post(format!("{base}/nonce"))
        .json(&serde_json::json!({ "address": AGENT_ADDRESS, "agentRegistry": REGISTRY }))
        .send()
        .await
        .expect("nonce request")
        .json()
        .await
        .expect("nonce json");
    let (message, signature) = sign(draft(42, nonce["nonce"].as_str().expect("nonce"))).await;

    let response = client
        .post(format!("{base}/verify"))
        .json(&serde_json::json!({ "message": message, "signature": signature }))
        .send()
        .await
        .expect("verify request");
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("verify json");
    let receipt = body["receipt"].as_str().expect("receipt");

    let session = client
        .get(format!("{base}/session"))
        .bearer_auth(receipt)
        .send()
        .await
        .expect("session request");
    assert_eq!(session.status().as_u16(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn service_rejects_requests_for_other_domains() {
    let service = SiwaService::new(
        ServiceOptions::new(DOMAIN, SecretString::from(RECEIPT_SECRET.to_string())),
        NonceCheck::store(InMemoryNonceStore::new()),
        VerificationMode::Offline,
    )
    .expect("service");
    let nonce = service
        .request_nonce(NonceRequest {
            address: AGENT_ADDRESS.to_string(),
            agent_id: Some(AgentId::from(42u64)),
            agent_registry: None,
        })
        .await
        .expect("nonce");

    let mut message = draft(42, &nonce.nonce);
    message.domain = "evil.example.com".to_string();
    let (message, signature) = sign(message).await;
    let response = service
        .verify(VerifyRequest { message, signature })
        .await
        .expect("verify");
    assert_eq!(response.status, SiwaStatus::Rejected);
    assert_eq!(response.code, Some(SiwaErrorCode::DomainMismatch));
}
