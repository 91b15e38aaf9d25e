//! # elif-channels
//!
//! Channel layer for the elif.rs framework: lets independent processes exchange
//! structured messages by channel name (point-to-point) or group name (fan-out),
//! using a bank of sharded key-value stores as transport.
//!
//! ## Features
//!
//! - **Bounded channels**: per-channel capacity enforced atomically in the store
//! - **Process-local channels**: names minted per layer instance, receivable only by their owner
//! - **Multiplexed receive**: many concurrent receivers share one blocking poll per queue
//! - **Groups**: expiring membership sets with best-effort fan-out
//! - **Sharding**: consistent mapping of channels and groups onto N store connections
//! - **Multi-backend support**: in-memory store and Redis
//!
//! ## Quick Start
//!
//! ```rust
//! use elif_channels::{ChannelLayer, ChannelLayerConfig, MemoryConnector, Message};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let layer = ChannelLayer::new(ChannelLayerConfig::default(), MemoryConnector::new()).unwrap();
//!
//! let mut message = Message::new();
//! message.insert("type".to_string(), json!("chat.message"));
//! message.insert("text".to_string(), json!("Ahoy-hoy!"));
//!
//! let reply_to = layer.new_channel(None).unwrap();
//! layer.group_add("room", &reply_to).await.unwrap();
//! layer.group_send("room", message).await.unwrap();
//!
//! let received = layer.receive(&reply_to).await.unwrap();
//! assert_eq!(received["text"], "Ahoy-hoy!");
//!
//! layer.flush().await.unwrap();
//! layer.close_pools().await;
//! # });
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod backends;
pub mod buffer;
pub mod capacity;
pub mod config;
pub mod groups;
pub mod layer;
pub mod naming;
pub mod send;
pub mod shard;

pub use backends::*;
pub use buffer::{Receive, ReceiveBuffer};
pub use capacity::CapacityPolicy;
pub use config::*;
pub use groups::{GroupRegistry, GroupSendSummary};
pub use layer::ChannelLayer;
pub use naming::{ChannelName, ClientIdentity};
pub use send::{Envelope, SendPath};
pub use shard::ShardRouter;

/// Channel layer errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid channel name: {0}")]
    InvalidChannelName(String),

    #[error("Invalid group name: {0}")]
    InvalidGroupName(String),

    #[error("Channel not owned by this layer: {0}")]
    OwnershipViolation(String),

    #[error("Channel is full: {0}")]
    ChannelFull(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel layer configuration error: {0}")]
    Configuration(String),

    #[error("Channel layer closed")]
    Closed,
}

/// Result type for channel layer operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A message: an ordered mapping of string keys to JSON values
pub type Message = serde_json::Map<String, serde_json::Value>;

/// A handle on one store connection (one shard).
///
/// Every operation the channel layer needs from its store is expressed here;
/// all of them are single round trips and none may be emulated with separate
/// read-then-write steps where atomicity is stated.
#[async_trait]
pub trait ChannelBackend: Send + Sync + 'static {
    /// Append `payload` to the tail of the list at `key` unless the list already
    /// holds `capacity` entries, then re-arm the key's expiry. The length check,
    /// the append and the expiry must happen in one atomic store operation.
    ///
    /// Returns `false` if the list was full and nothing was written.
    async fn push_bounded(
        &self,
        key: &str,
        payload: Vec<u8>,
        capacity: usize,
        expiry: Duration,
    ) -> ChannelResult<bool>;

    /// Open a receiver popping from the head of the list at `key`.
    ///
    /// The receiver owns whatever the store needs for a blocking pop (for
    /// network stores, a dedicated connection) so it never stalls other
    /// operations on this backend.
    async fn open_receiver(&self, key: &str) -> ChannelResult<Box<dyn QueueReceiver>>;

    /// Upsert `member` into the sorted set at `key` with `score` and refresh
    /// the set's expiry.
    async fn group_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        expiry: Duration,
    ) -> ChannelResult<()>;

    /// Remove `member` from the sorted set at `key`. Absent members are not an error.
    async fn group_discard(&self, key: &str, member: &str) -> ChannelResult<()>;

    /// Drop every member scored below `min_score`, then return the remaining members.
    async fn group_members(&self, key: &str, min_score: f64) -> ChannelResult<Vec<String>>;

    /// Number of entries in the list at `key`.
    async fn queue_len(&self, key: &str) -> ChannelResult<usize>;

    /// Delete every key starting with `prefix`.
    async fn flush(&self, prefix: &str) -> ChannelResult<()>;

    /// Release transport resources held by this backend.
    async fn close(&self) -> ChannelResult<()>;
}

/// Blocking pop over one list.
///
/// `pop` must be cancel safe: dropping the future before it completes must
/// leave every message in the store.
#[async_trait]
pub trait QueueReceiver: Send {
    /// Wait up to `timeout` for the head of the list. `None` on timeout.
    async fn pop(&mut self, timeout: Duration) -> ChannelResult<Option<Vec<u8>>>;

    /// Hand back to the store anything an abandoned pop left behind and drop
    /// the receiver's connection. Called when its buffer closes.
    async fn release(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

/// Establishes backends from configured host strings.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Backend: ChannelBackend;

    /// Connect to `host`, one of the configured `hosts` entries.
    async fn connect(&self, host: &str) -> ChannelResult<Self::Backend>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::ChannelFull("chat".to_string());
        assert_eq!(err.to_string(), "Channel is full: chat");

        let err = ChannelError::OwnershipViolation("specific!abc.def".to_string());
        assert!(err.to_string().contains("specific!abc.def"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let parse: Result<Message, _> = serde_json::from_str("not json");
        let err: ChannelError = parse.unwrap_err().into();
        assert!(matches!(err, ChannelError::Serialization(_)));
    }
}
