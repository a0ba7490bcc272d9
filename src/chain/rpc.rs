//! Registry reads over JSON-RPC through an alloy provider.

use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::{SolCall, SolType, sol, sol_data};
use async_trait::async_trait;

use crate::chain::RegistryReader;
use crate::crypto::{encode_hex_prefixed, normalize_address};
use crate::error::ChainError;
use crate::message::AgentId;

sol! {
    /// ERC-721 owner lookup on the identity registry.
    function ownerOf(uint256 tokenId) external view returns (address owner);

    /// ERC-1271 signature check on a contract account.
    function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4 magicValue);
}

pub const OWNER_OF_SELECTOR: [u8; 4] = ownerOfCall::SELECTOR;
pub const IS_VALID_SIGNATURE_SELECTOR: [u8; 4] = isValidSignatureCall::SELECTOR;
/// ERC-1271 success value, equal to the selector.
pub const ERC1271_MAGIC_VALUE: [u8; 4] = IS_VALID_SIGNATURE_SELECTOR;

/// Read-only client bound to one chain's RPC endpoint.
pub struct RpcClient {
    provider: RootProvider,
    endpoint: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let endpoint = endpoint.into();
        let url = url::Url::parse(&endpoint)
            .map_err(|e| ChainError::Transport(format!("invalid RPC endpoint: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ChainError::Transport(format!(
                "RPC endpoint must be http(s), got '{}'",
                url.scheme()
            )));
        }
        Ok(Self {
            provider: RootProvider::new_http(url),
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `eth_call` against `to`, bounded by the client timeout.
    pub async fn call(&self, to: Address, calldata: Vec<u8>) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(Bytes::from(calldata).into());

        match tokio::time::timeout(self.timeout, async { self.provider.call(tx).await }).await {
            Err(_) => Err(ChainError::Timeout),
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(match e.as_error_resp() {
                Some(payload) => classify_rpc_error(
                    payload.code,
                    &payload.message,
                    payload.data.as_deref().map(|data| data.get()),
                ),
                None => ChainError::Transport(e.to_string()),
            }),
        }
    }
}

#[async_trait]
impl RegistryReader for RpcClient {
    async fn owner_of(&self, registry: &str, agent_id: AgentId) -> Result<String, ChainError> {
        let call = ownerOfCall {
            tokenId: agent_id.as_u256(),
        };
        let data = self.call(parse_address(registry)?, call.abi_encode()).await?;
        decode_owner(&data)
    }

    async fn is_valid_signature(
        &self,
        account: &str,
        digest: [u8; 32],
        signature: &[u8],
    ) -> Result<[u8; 4], ChainError> {
        let call = isValidSignatureCall {
            hash: B256::from(digest),
            signature: Bytes::from(signature.to_vec()),
        };
        let data = self.call(parse_address(account)?, call.abi_encode()).await?;
        decode_magic_value(&data)
    }
}

fn parse_address(value: &str) -> Result<Address, ChainError> {
    value
        .parse::<Address>()
        .map_err(|e| ChainError::InvalidResponse(format!("invalid contract address '{value}': {e}")))
}

/// Classify a JSON-RPC error object. Geth and most providers report
/// execution reverts as code 3.
fn classify_rpc_error(code: i64, message: &str, data: Option<&str>) -> ChainError {
    if code == 3 || message.to_ascii_lowercase().contains("revert") {
        let data = data.map(|d| d.trim_matches('"')).filter(|d| !d.is_empty());
        let detail = match data {
            Some(data) => format!("{message} ({data})"),
            None => message.to_string(),
        };
        return ChainError::Reverted(detail);
    }
    ChainError::Rpc {
        code,
        message: message.to_string(),
    }
}

/// `ownerOf` return data as a lowercase address.
pub fn decode_owner(data: &[u8]) -> Result<String, ChainError> {
    if data.is_empty() {
        return Err(ChainError::EmptyReturnData);
    }
    let owner = <sol_data::Address as SolType>::abi_decode(data)
        .map_err(|e| ChainError::InvalidResponse(format!("ownerOf returned {e}")))?;
    normalize_address(&encode_hex_prefixed(owner.as_slice()))
        .ok_or_else(|| ChainError::InvalidResponse("invalid owner address".to_string()))
}

/// `isValidSignature` return data (a left-aligned `bytes4`).
pub fn decode_magic_value(data: &[u8]) -> Result<[u8; 4], ChainError> {
    if data.is_empty() {
        return Err(ChainError::EmptyReturnData);
    }
    let magic = <sol_data::FixedBytes<4> as SolType>::abi_decode(data)
        .map_err(|e| ChainError::InvalidResponse(format!("isValidSignature returned {e}")))?;
    Ok(magic.0)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use alloy_primitives::U256;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;

    const REGISTRY: &str = "0x8004a169fb4a3325136eb29fa0ceb6d2e539a432";
    const OWNER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn owner_word() -> Vec<u8> {
        let owner: Address = OWNER.parse().expect("address");
        <sol_data::Address as SolType>::abi_encode(&owner)
    }

    #[test]
    fn owner_of_calldata_carries_full_uint256_ids() {
        let data = ownerOfCall {
            tokenId: AgentId::from(42u64).as_u256(),
        }
        .abi_encode();
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &OWNER_OF_SELECTOR);
        assert_eq!(data[35], 42);

        let big = AgentId::parse("18446744073709551616").expect("id");
        let data = ownerOfCall {
            tokenId: big.as_u256(),
        }
        .abi_encode();
        assert_eq!(&data[4..], &big.as_u256().to_be_bytes::<32>());
        assert_eq!(data[4 + 23], 1);
        assert_eq!(big.as_u256(), U256::from(u64::MAX) + U256::from(1u8));
    }

    #[test]
    fn is_valid_signature_calldata_layout() {
        let digest = [0xabu8; 32];
        let signature = [0x11u8; 65];
        let data = isValidSignatureCall {
            hash: B256::from(digest),
            signature: Bytes::from(signature.to_vec()),
        }
        .abi_encode();

        // selector + hash + offset + length + 65 bytes padded to 96
        assert_eq!(data.len(), 4 + 32 * 3 + 96);
        assert_eq!(&data[..4], &IS_VALID_SIGNATURE_SELECTOR);
        assert_eq!(&data[4..36], &digest);
        assert_eq!(data[67], 0x40);
        assert_eq!(data[99], 65);
        assert_eq!(&data[100..165], &signature);
        assert!(data[165..].iter().all(|b| *b == 0));
    }

    #[test]
    fn decodes_return_values() {
        assert_eq!(decode_owner(&owner_word()).expect("owner"), OWNER);
        assert!(matches!(decode_owner(&[]), Err(ChainError::EmptyReturnData)));
        assert!(matches!(decode_owner(&[0u8; 7]), Err(ChainError::InvalidResponse(_))));

        let mut magic = vec![0u8; 32];
        magic[..4].copy_from_slice(&ERC1271_MAGIC_VALUE);
        assert_eq!(decode_magic_value(&magic).expect("bytes4"), ERC1271_MAGIC_VALUE);
        assert!(matches!(decode_magic_value(&[]), Err(ChainError::EmptyReturnData)));
    }

    #[test]
    fn revert_errors_are_classified() {
        let revert = classify_rpc_error(3, "execution reverted", Some("\"0x7e273289\""));
        assert_eq!(
            revert,
            ChainError::Reverted("execution reverted (0x7e273289)".to_string())
        );

        let by_message =
            classify_rpc_error(-32000, "Execution Reverted: ERC721NonexistentToken", None);
        assert!(matches!(by_message, ChainError::Reverted(_)));

        let other = classify_rpc_error(-32005, "rate limited", None);
        assert!(matches!(other, ChainError::Rpc { code: -32005, .. }));
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(RpcClient::new("ws://localhost:8545", Duration::from_secs(1)).is_err());
        assert!(RpcClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    /// Answers `ownerOf` with a fixed owner and reverts everything else.
    async fn node_emulator(Json(request): Json<Value>) -> Json<Value> {
        let id = request["id"].clone();
        let tx = &request["params"][0];
        let input = tx["input"]
            .as_str()
            .or_else(|| tx["data"].as_str())
            .unwrap_or_default();
        if input.starts_with(&encode_hex_prefixed(&OWNER_OF_SELECTOR)) {
            let result = encode_hex_prefixed(&owner_word());
            return Json(json!({"jsonrpc": "2.0", "id": id, "result": result}));
        }
        Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": 3, "message": "execution reverted", "data": "0x"}
        }))
    }

    async fn slow_node(Json(request): Json<Value>) -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Json(json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": "0x"}))
    }

    async fn start_node(app: Router) -> Option<SocketAddr> {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
            Err(e) => panic!("failed to bind emulator: {e}"),
        };
        let addr = listener.local_addr().ok()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Some(addr)
    }

    #[tokio::test]
    async fn reads_owner_and_classifies_reverts_over_http() {
        let Some(addr) = start_node(Router::new().route("/", post(node_emulator))).await else {
            eprintln!("skipping: local bind not permitted");
            return;
        };
        let client =
            RpcClient::new(format!("http://{addr}"), Duration::from_secs(2)).expect("client");

        assert_eq!(
            client
                .owner_of(REGISTRY, AgentId::from(7u64))
                .await
                .expect("owner"),
            OWNER
        );
        let err = client
            .is_valid_signature(OWNER, [0u8; 32], &[0u8; 65])
            .await
            .expect_err("revert");
        assert!(matches!(err, ChainError::Reverted(_)));
    }

    #[tokio::test]
    async fn slow_node_times_out() {
        let Some(addr) = start_node(Router::new().route("/", post(slow_node))).await else {
            eprintln!("skipping: local bind not permitted");
            return;
        };
        let client =
            RpcClient::new(format!("http://{addr}"), Duration::from_millis(100)).expect("client");
        let err = client
            .owner_of(REGISTRY, AgentId::from(7u64))
            .await
            .expect_err("timeout");
        assert_eq!(err, ChainError::Timeout);
    }
}
