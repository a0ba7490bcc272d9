//! Settings file for the SIWA server.
//!
//! Stores non-secret options in `~/.siwa/config.toml`. Values resolve with
//! env var > TOML file > default priority; secrets are only read from the
//! environment.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CHAIN_ID: u64 = 8453;
pub const DEFAULT_NONCE_TTL_SECS: u64 = 300;
pub const DEFAULT_RECEIPT_TTL_SECS: u64 = 3600;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Settings persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Domain that messages must be addressed to.
    pub domain: Option<String>,

    /// URI handed out with nonces. Defaults to `https://<domain>/verify`.
    pub uri: Option<String>,

    /// Chain id returned by `/nonce` when the request names no registry.
    pub chain_id: u64,

    pub nonce_ttl_secs: u64,

    pub receipt_ttl_secs: u64,

    /// "offline" or "onchain".
    pub verification_mode: String,

    /// "memory", "stateless", "upstash" or "cloudflare".
    pub nonce_backend: String,

    /// Bound on every outbound call (nonce backend, RPC).
    pub rpc_timeout_ms: u64,

    pub allowed_chains: Option<Vec<u64>>,

    /// `eip155:<chainId>:<address>` entries accepted for on-chain checks.
    pub allowed_registries: Option<Vec<String>>,

    /// Per-chain RPC endpoint overrides, keyed by decimal chain id.
    pub rpc_urls: BTreeMap<String, String>,

    pub bind: String,

    pub upstash_url: Option<String>,

    pub cloudflare_account_id: Option<String>,

    pub cloudflare_namespace_id: Option<String>,

    pub cloudflare_api_base_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domain: None,
            uri: None,
            chain_id: DEFAULT_CHAIN_ID,
            nonce_ttl_secs: DEFAULT_NONCE_TTL_SECS,
            receipt_ttl_secs: DEFAULT_RECEIPT_TTL_SECS,
            verification_mode: "offline".to_string(),
            nonce_backend: "memory".to_string(),
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            allowed_chains: None,
            allowed_registries: None,
            rpc_urls: BTreeMap::new(),
            bind: DEFAULT_BIND.to_string(),
            upstash_url: None,
            cloudflare_account_id: None,
            cloudflare_namespace_id: None,
            cloudflare_api_base_url: None,
        }
    }
}

impl Settings {
    /// Default TOML config file path (~/.siwa/config.toml).
    pub fn default_toml_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".siwa")
            .join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Merge values from `other` into `self`, preferring `other` for
    /// fields that differ from the default.
    pub fn merge_from(&mut self, other: &Self) {
        let default_json = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let other_json = match serde_json::to_value(other) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut self_json = match serde_json::to_value(&*self) {
            Ok(v) => v,
            Err(_) => return,
        };

        merge_non_default(&mut self_json, &other_json, &default_json);

        if let Ok(merged) = serde_json::from_value(self_json) {
            *self = merged;
        }
    }
}

fn merge_non_default(
    target: &mut serde_json::Value,
    other: &serde_json::Value,
    defaults: &serde_json::Value,
) {
    match (target, other, defaults) {
        (
            serde_json::Value::Object(t),
            serde_json::Value::Object(o),
            serde_json::Value::Object(d),
        ) => {
            for (key, other_val) in o {
                let default_val = d.get(key).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(target_val) = t.get_mut(key) {
                    merge_non_default(target_val, other_val, &default_val);
                } else if other_val != &default_val {
                    t.insert(key.clone(), other_val.clone());
                }
            }
        }
        (target, other, defaults) => {
            if other != defaults {
                *target = other.clone();
            }
        }
    }
}
