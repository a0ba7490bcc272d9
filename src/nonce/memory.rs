//! Single-process nonce store.
//!
//! Not shared across server instances. Consumed nonces stay behind as
//! tombstones until their original expiry so they cannot be reissued early.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::NonceStoreError;
use crate::nonce::NonceStore;

/// Run a full sweep every this many operations.
const SWEEP_EVERY_OPS: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceState {
    Outstanding,
    Consumed,
}

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    state: NonceState,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
    ops: AtomicU64,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked entries, tombstones included.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop every entry whose expiry has passed. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        sweep_expired(&mut entries, Instant::now())
    }

    /// Periodically sweep in the background. The task stops once the store
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired nonces");
                }
            }
        })
    }

    fn should_sweep(&self) -> bool {
        self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_OPS == SWEEP_EVERY_OPS - 1
    }
}

fn sweep_expired(entries: &mut HashMap<String, NonceEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn issue(&self, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| NonceStoreError::Config(format!("nonce TTL {ttl:?} is out of range")))?;
        let sweep = self.should_sweep();
        let mut entries = self.entries.lock().await;
        if sweep {
            sweep_expired(&mut entries, now);
        }

        if let Some(existing) = entries.get(nonce) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(
            nonce.to_string(),
            NonceEntry {
                state: NonceState::Outstanding,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn consume(&self, nonce: &str) -> Result<bool, NonceStoreError> {
        let now = Instant::now();
        let sweep = self.should_sweep();
        let mut entries = self.entries.lock().await;
        if sweep {
            sweep_expired(&mut entries, now);
        }

        let Some(entry) = entries.get_mut(nonce) else {
            return Ok(false);
        };
        if entry.expires_at <= now {
            entries.remove(nonce);
            return Ok(false);
        }
        if entry.state == NonceState::Consumed {
            return Ok(false);
        }
        entry.state = NonceState::Consumed;
        Ok(true)
    }
}
