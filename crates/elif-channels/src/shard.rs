//! Routing of keys onto store connections

use crate::{ChannelBackend, ChannelError, ChannelResult, Connector};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Map `key` onto one of `shards` buckets.
///
/// The hash is stable across processes and releases, so every layer
/// configured with the same host list agrees on placement.
pub fn shard_index(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(bytes) % shards as u64) as usize
}

struct Shard<B> {
    host: String,
    backend: RwLock<Option<Arc<B>>>,
}

/// Owns one lazily established backend per configured host
pub struct ShardRouter<C: Connector> {
    connector: C,
    shards: Vec<Shard<C::Backend>>,
}

impl<C: Connector> ShardRouter<C> {
    pub fn new(connector: C, hosts: &[String]) -> ChannelResult<Self> {
        if hosts.is_empty() {
            return Err(ChannelError::Configuration(
                "At least one host is required".to_string(),
            ));
        }

        let shards = hosts
            .iter()
            .map(|host| Shard {
                host: host.clone(),
                backend: RwLock::new(None),
            })
            .collect();

        Ok(Self { connector, shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`
    pub fn shard_for(&self, key: &str) -> usize {
        shard_index(key, self.shards.len())
    }

    /// Backend of shard `index`, connecting on first use
    pub async fn connection_for(&self, index: usize) -> ChannelResult<Arc<C::Backend>> {
        let shard = self.shards.get(index).ok_or_else(|| {
            ChannelError::Configuration(format!(
                "Shard index {} out of range ({} shards)",
                index,
                self.shards.len()
            ))
        })?;

        if let Some(backend) = shard.backend.read().await.as_ref() {
            return Ok(backend.clone());
        }

        let mut slot = shard.backend.write().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }

        let backend = Arc::new(self.connector.connect(&shard.host).await?);
        info!("Connected channel layer shard {} ({})", index, shard.host);
        *slot = Some(backend.clone());
        Ok(backend)
    }

    /// Backend owning `key`
    pub async fn connection_for_key(&self, key: &str) -> ChannelResult<Arc<C::Backend>> {
        self.connection_for(self.shard_for(key)).await
    }

    /// Every backend established so far
    pub async fn established(&self) -> Vec<Arc<C::Backend>> {
        let mut backends = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            if let Some(backend) = shard.backend.read().await.as_ref() {
                backends.push(backend.clone());
            }
        }
        backends
    }

    /// Connect every shard (used by administrative operations that touch all of them)
    pub async fn connect_all(&self) -> ChannelResult<Vec<Arc<C::Backend>>> {
        let mut backends = Vec::with_capacity(self.shards.len());
        for index in 0..self.shards.len() {
            backends.push(self.connection_for(index).await?);
        }
        Ok(backends)
    }

    /// Release every established backend. Safe to call repeatedly.
    pub async fn close_all(&self) {
        for (index, shard) in self.shards.iter().enumerate() {
            let backend = shard.backend.write().await.take();
            if let Some(backend) = backend {
                match backend.close().await {
                    Ok(()) => debug!("Closed channel layer shard {} ({})", index, shard.host),
                    Err(e) => warn!("Failed to close shard {} ({}): {}", index, shard.host, e),
                }
            }
        }
    }
}
