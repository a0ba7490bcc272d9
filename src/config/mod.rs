//! Configuration for the SIWA server.
//!
//! Settings are loaded with priority: env var > TOML file > default.
//! A `.env` in the working directory is loaded first via dotenvy. Secrets
//! (receipt key, nonce key, KV tokens) are only ever read from the
//! environment.

pub(crate) mod helpers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::message::AgentRegistry;
use crate::nonce::stateless::MIN_NONCE_SECRET_LEN;
use crate::receipt::MIN_RECEIPT_SECRET_LEN;
use crate::settings::Settings;

use self::helpers::{
    bounded_u64, normalize_variant, optional_env, parse_chain_ids, positive_u64, split_list,
};

/// Upper bound for `SIWA_NONCE_TTL_SECS` (one day).
pub const MAX_NONCE_TTL_SECS: u64 = 24 * 60 * 60;
/// Upper bound for `SIWA_RECEIPT_TTL_SECS` (thirty days).
pub const MAX_RECEIPT_TTL_SECS: u64 = 30 * 24 * 60 * 60;
/// Upper bound for `SIWA_RPC_TIMEOUT_MS` (one minute).
pub const MAX_RPC_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationModeKind {
    Offline,
    Onchain,
}

impl VerificationModeKind {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "offline" => Ok(Self::Offline),
            "onchain" | "on_chain" => Ok(Self::Onchain),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'offline' or 'onchain', got '{value}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceBackendKind {
    Memory,
    Stateless,
    Upstash,
    Cloudflare,
}

impl NonceBackendKind {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "stateless" | "hmac" => Ok(Self::Stateless),
            "upstash" | "redis" => Ok(Self::Upstash),
            "cloudflare" | "cloudflare_kv" => Ok(Self::Cloudflare),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!(
                    "expected 'memory', 'stateless', 'upstash', or 'cloudflare', got '{value}'"
                ),
            }),
        }
    }
}

/// Nonce backend plus the credentials it needs.
#[derive(Debug, Clone)]
pub enum NonceBackendConfig {
    Memory,
    Stateless {
        secret: SecretString,
    },
    Upstash {
        url: String,
        token: SecretString,
    },
    Cloudflare {
        api_base_url: Option<String>,
        account_id: String,
        namespace_id: String,
        api_token: SecretString,
    },
}

impl NonceBackendConfig {
    pub fn kind(&self) -> NonceBackendKind {
        match self {
            Self::Memory => NonceBackendKind::Memory,
            Self::Stateless { .. } => NonceBackendKind::Stateless,
            Self::Upstash { .. } => NonceBackendKind::Upstash,
            Self::Cloudflare { .. } => NonceBackendKind::Cloudflare,
        }
    }

    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let kind = NonceBackendKind::parse(
            &optional_env("SIWA_NONCE_BACKEND")?.unwrap_or_else(|| settings.nonce_backend.clone()),
            "SIWA_NONCE_BACKEND",
        )?;

        Ok(match kind {
            NonceBackendKind::Memory => Self::Memory,
            NonceBackendKind::Stateless => Self::Stateless {
                secret: required_secret("SIWA_NONCE_SECRET", MIN_NONCE_SECRET_LEN)?,
            },
            NonceBackendKind::Upstash => Self::Upstash {
                url: optional_env("UPSTASH_REDIS_REST_URL")?
                    .or_else(|| settings.upstash_url.clone())
                    .ok_or_else(|| ConfigError::MissingRequired {
                        key: "UPSTASH_REDIS_REST_URL".to_string(),
                        hint: "Required when SIWA_NONCE_BACKEND=upstash".to_string(),
                    })?,
                token: required_env_secret(
                    "UPSTASH_REDIS_REST_TOKEN",
                    "Required when SIWA_NONCE_BACKEND=upstash",
                )?,
            },
            NonceBackendKind::Cloudflare => Self::Cloudflare {
                api_base_url: optional_env("CLOUDFLARE_API_BASE_URL")?
                    .or_else(|| settings.cloudflare_api_base_url.clone()),
                account_id: optional_env("CLOUDFLARE_ACCOUNT_ID")?
                    .or_else(|| settings.cloudflare_account_id.clone())
                    .ok_or_else(|| ConfigError::MissingRequired {
                        key: "CLOUDFLARE_ACCOUNT_ID".to_string(),
                        hint: "Required when SIWA_NONCE_BACKEND=cloudflare".to_string(),
                    })?,
                namespace_id: optional_env("CLOUDFLARE_KV_NAMESPACE_ID")?
                    .or_else(|| settings.cloudflare_namespace_id.clone())
                    .ok_or_else(|| ConfigError::MissingRequired {
                        key: "CLOUDFLARE_KV_NAMESPACE_ID".to_string(),
                        hint: "Required when SIWA_NONCE_BACKEND=cloudflare".to_string(),
                    })?,
                api_token: required_env_secret(
                    "CLOUDFLARE_API_TOKEN",
                    "Required when SIWA_NONCE_BACKEND=cloudflare",
                )?,
            },
        })
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct SiwaConfig {
    pub domain: String,
    pub uri: String,
    pub default_chain_id: u64,
    pub nonce_ttl: Duration,
    pub receipt_ttl: Duration,
    pub receipt_secret: SecretString,
    pub verification_mode: VerificationModeKind,
    pub nonce_backend: NonceBackendConfig,
    pub rpc_timeout: Duration,
    pub allowed_chains: Option<Vec<u64>>,
    pub allowed_registries: Option<Vec<AgentRegistry>>,
    pub rpc_urls: HashMap<u64, String>,
    pub bind: SocketAddr,
}

impl SiwaConfig {
    /// Load from env vars and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env vars, overlaying `toml_path` (or the default path) on
    /// top of built-in defaults.
    pub fn from_env_with_toml(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut settings = Settings::default();
        Self::apply_toml_overlay(&mut settings, toml_path)?;
        Self::resolve(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is given, the file must exist and parse. Otherwise
    /// the default path is tried and silently skipped when absent.
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&std::path::Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(std::path::PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Resolve every key against the environment, falling back to `settings`.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let domain = optional_env("SIWA_DOMAIN")?
            .or_else(|| settings.domain.clone())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "SIWA_DOMAIN".to_string(),
                hint: "Set it to the host agents sign in to, e.g. api.example.com".to_string(),
            })?;
        let uri = optional_env("SIWA_URI")?
            .or_else(|| settings.uri.clone())
            .unwrap_or_else(|| format!("https://{domain}/verify"));
        url::Url::parse(&uri).map_err(|e| ConfigError::InvalidValue {
            key: "SIWA_URI".to_string(),
            message: e.to_string(),
        })?;

        let default_chain_id = positive_u64("SIWA_CHAIN_ID", settings.chain_id)?;
        let nonce_ttl_secs = bounded_u64(
            "SIWA_NONCE_TTL_SECS",
            settings.nonce_ttl_secs,
            MAX_NONCE_TTL_SECS,
        )?;
        let receipt_ttl_secs = bounded_u64(
            "SIWA_RECEIPT_TTL_SECS",
            settings.receipt_ttl_secs,
            MAX_RECEIPT_TTL_SECS,
        )?;
        let rpc_timeout_ms = bounded_u64(
            "SIWA_RPC_TIMEOUT_MS",
            settings.rpc_timeout_ms,
            MAX_RPC_TIMEOUT_MS,
        )?;

        let receipt_secret = required_secret("SIWA_RECEIPT_SECRET", MIN_RECEIPT_SECRET_LEN)?;

        let verification_mode = VerificationModeKind::parse(
            &optional_env("SIWA_VERIFICATION_MODE")?
                .unwrap_or_else(|| settings.verification_mode.clone()),
            "SIWA_VERIFICATION_MODE",
        )?;
        let nonce_backend = NonceBackendConfig::resolve(settings)?;

        let allowed_chains = match optional_env("SIWA_ALLOWED_CHAINS")? {
            Some(raw) => Some(parse_chain_ids("SIWA_ALLOWED_CHAINS", &split_list(&raw))?),
            None => settings.allowed_chains.clone(),
        };

        let allowed_registries = optional_env("SIWA_ALLOWED_REGISTRIES")?
            .map(|raw| split_list(&raw))
            .or_else(|| settings.allowed_registries.clone())
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        AgentRegistry::parse(entry).map_err(|e| ConfigError::InvalidValue {
                            key: "SIWA_ALLOWED_REGISTRIES".to_string(),
                            message: e.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let mut rpc_urls = HashMap::new();
        for (chain, url) in &settings.rpc_urls {
            let chain_id = chain
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: format!("rpc_urls.{chain}"),
                    message: format!("key must be a chain id: {e}"),
                })?;
            rpc_urls.insert(chain_id, url.trim().to_string());
        }

        let bind = optional_env("SIWA_BIND")?
            .unwrap_or_else(|| settings.bind.clone())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SIWA_BIND".to_string(),
                message: format!("must be a socket address: {e}"),
            })?;

        Ok(Self {
            domain,
            uri,
            default_chain_id,
            nonce_ttl: Duration::from_secs(nonce_ttl_secs),
            receipt_ttl: Duration::from_secs(receipt_ttl_secs),
            receipt_secret,
            verification_mode,
            nonce_backend,
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            allowed_chains,
            allowed_registries,
            rpc_urls,
            bind,
        })
    }
}

fn required_env_secret(key: &str, hint: &str) -> Result<SecretString, ConfigError> {
    optional_env(key)?
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
}

fn required_secret(key: &str, min_len: usize) -> Result<SecretString, ConfigError> {
    let secret = required_env_secret(key, &format!("Set it to at least {min_len} random bytes"))?;
    if secret.expose_secret().len() < min_len {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at least {min_len} bytes"),
        });
    }
    Ok(secret)
}
