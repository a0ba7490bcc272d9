//! On-chain access for ownership verification.
//!
//! [`RegistryReader`] is the pair of view calls the verifier needs;
//! [`ChainClients`] maps a chain id to a reader. [`ClientResolver`] is the
//! production implementation, caching one [`RpcClient`] per chain.

pub mod rpc;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ChainError, ResolverError};
use crate::message::AgentId;

pub use self::rpc::{ERC1271_MAGIC_VALUE, RpcClient};

/// Per-chain RPC endpoint environment variable prefix (`SIWA_RPC_URL_8453`).
pub const RPC_URL_ENV_PREFIX: &str = "SIWA_RPC_URL_";

/// Public endpoints used when nothing else is configured.
const DEFAULT_RPC_URLS: &[(u64, &str)] = &[
    (1, "https://ethereum-rpc.publicnode.com"),
    (10, "https://mainnet.optimism.io"),
    (8453, "https://mainnet.base.org"),
    (42161, "https://arb1.arbitrum.io/rpc"),
    (84532, "https://sepolia.base.org"),
    (11155111, "https://ethereum-sepolia-rpc.publicnode.com"),
];

/// Read-only registry and account calls.
#[async_trait]
pub trait RegistryReader: Send + Sync {
    /// ERC-721 `ownerOf(agentId)` on the registry; lowercase address.
    async fn owner_of(&self, registry: &str, agent_id: AgentId) -> Result<String, ChainError>;

    /// ERC-1271 `isValidSignature(digest, signature)` on `account`.
    async fn is_valid_signature(
        &self,
        account: &str,
        digest: [u8; 32],
        signature: &[u8],
    ) -> Result<[u8; 4], ChainError>;
}

/// Chain id to reader lookup.
#[async_trait]
pub trait ChainClients: Send + Sync {
    async fn reader(&self, chain_id: u64) -> Result<Arc<dyn RegistryReader>, ResolverError>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Explicit endpoints; highest priority.
    pub overrides: HashMap<u64, String>,
    /// When set, only these chains may ever be resolved.
    pub allowed_chains: Option<Vec<u64>>,
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            allowed_chains: None,
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct ClientResolver {
    config: ResolverConfig,
    cache: RwLock<HashMap<u64, Arc<RpcClient>>>,
}

impl ClientResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn is_allowed(&self, chain_id: u64) -> bool {
        self.config
            .allowed_chains
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&chain_id))
    }

    /// Override map, then `SIWA_RPC_URL_<chainId>`, then the default table.
    pub fn resolve_endpoint(&self, chain_id: u64) -> Option<String> {
        if let Some(url) = self.config.overrides.get(&chain_id) {
            return Some(url.clone());
        }
        if let Some(url) = env_endpoint(chain_id) {
            return Some(url);
        }
        DEFAULT_RPC_URLS
            .iter()
            .find(|(id, _)| *id == chain_id)
            .map(|(_, url)| (*url).to_string())
    }

    pub fn is_supported(&self, chain_id: u64) -> bool {
        self.is_allowed(chain_id) && self.resolve_endpoint(chain_id).is_some()
    }

    /// Every chain id that would currently resolve, ascending.
    pub fn supported_chain_ids(&self) -> Vec<u64> {
        let mut ids: BTreeSet<u64> = DEFAULT_RPC_URLS.iter().map(|(id, _)| *id).collect();
        ids.extend(self.config.overrides.keys().copied());
        ids.extend(std::env::vars().filter_map(|(key, value)| {
            let id = key.strip_prefix(RPC_URL_ENV_PREFIX)?.parse::<u64>().ok()?;
            (!value.trim().is_empty()).then_some(id)
        }));
        ids.into_iter().filter(|id| self.is_allowed(*id)).collect()
    }

    /// Cached client for `chain_id`, constructed on first use.
    pub async fn get_client(&self, chain_id: u64) -> Result<Arc<RpcClient>, ResolverError> {
        if !self.is_allowed(chain_id) {
            return Err(ResolverError::ChainNotAllowed {
                chain_id,
                allowed: self.config.allowed_chains.clone().unwrap_or_default(),
            });
        }

        if let Some(client) = self.cache.read().await.get(&chain_id) {
            return Ok(Arc::clone(client));
        }

        let endpoint =
            self.resolve_endpoint(chain_id)
                .ok_or_else(|| ResolverError::UnsupportedChain {
                    chain_id,
                    known: self.supported_chain_ids(),
                })?;
        let client = RpcClient::new(endpoint, self.config.timeout).map_err(|e| {
            ResolverError::InvalidEndpoint {
                chain_id,
                reason: e.to_string(),
            }
        })?;

        // Two requests may race to build the same client; the first insert wins.
        let mut cache = self.cache.write().await;
        let client = cache.entry(chain_id).or_insert_with(|| Arc::new(client));
        tracing::debug!(chain_id, "RPC client ready");
        Ok(Arc::clone(client))
    }
}

#[async_trait]
impl ChainClients for ClientResolver {
    async fn reader(&self, chain_id: u64) -> Result<Arc<dyn RegistryReader>, ResolverError> {
        let client = self.get_client(chain_id).await?;
        Ok(client)
    }
}

fn env_endpoint(chain_id: u64) -> Option<String> {
    std::env::var(format!("{RPC_URL_ENV_PREFIX}{chain_id}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn resolver(overrides: &[(u64, &str)], allowed: Option<Vec<u64>>) -> ClientResolver {
        ClientResolver::new(ResolverConfig {
            overrides: overrides
                .iter()
                .map(|(id, url)| (*id, (*url).to_string()))
                .collect(),
            allowed_chains: allowed,
            timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn resolution_prefers_override_then_env_then_default() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("SIWA_RPC_URL_8453", "https://base.env.example");
            std::env::set_var("SIWA_RPC_URL_777", "https://custom.env.example");
        }

        let r = resolver(&[(8453, "https://base.override.example")], None);
        assert_eq!(
            r.resolve_endpoint(8453).as_deref(),
            Some("https://base.override.example")
        );

        let r = resolver(&[], None);
        assert_eq!(r.resolve_endpoint(8453).as_deref(), Some("https://base.env.example"));
        assert_eq!(r.resolve_endpoint(777).as_deref(), Some("https://custom.env.example"));
        assert_eq!(r.resolve_endpoint(84532).as_deref(), Some("https://sepolia.base.org"));
        assert!(r.supported_chain_ids().contains(&777));

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("SIWA_RPC_URL_8453");
            std::env::remove_var("SIWA_RPC_URL_777");
        }
        assert_eq!(r.resolve_endpoint(8453).as_deref(), Some("https://mainnet.base.org"));
        assert!(!r.is_supported(777));
    }

    #[tokio::test]
    async fn unknown_chain_lists_known_chains() {
        let r = resolver(&[(31337, "http://127.0.0.1:8545")], None);
        let err = r.get_client(999_999_999).await.err().expect("unsupported");
        match err {
            ResolverError::UnsupportedChain { chain_id, known } => {
                assert_eq!(chain_id, 999_999_999);
                assert!(known.contains(&8453));
                assert!(known.contains(&31337));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn allow_list_blocks_resolvable_chains() {
        let r = resolver(&[], Some(vec![84532]));
        assert!(r.is_supported(84532));
        assert!(!r.is_supported(8453));
        assert_eq!(r.supported_chain_ids(), vec![84532]);
        assert!(matches!(
            r.get_client(8453).await,
            Err(ResolverError::ChainNotAllowed { chain_id: 8453, .. })
        ));
        assert!(r.get_client(84532).await.is_ok());
    }

    #[tokio::test]
    async fn clients_are_memoized() {
        let r = resolver(&[(31337, "http://127.0.0.1:8545")], None);
        let a = r.get_client(31337).await.expect("client");
        let b = r.get_client(31337).await.expect("client");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.endpoint(), "http://127.0.0.1:8545");
    }

    #[tokio::test]
    async fn bad_override_is_invalid_endpoint() {
        let r = resolver(&[(31337, "ftp://127.0.0.1")], None);
        assert!(matches!(
            r.get_client(31337).await,
            Err(ResolverError::InvalidEndpoint { chain_id: 31337, .. })
        ));
    }
}
