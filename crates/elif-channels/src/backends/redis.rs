//! Redis store backend for production use
//!
//! Channel queues are Redis lists, groups are sorted sets scored by Unix time.
//!
//! Blocking receives run on a dedicated connection per receiver. `BLMOVE`
//! moves the head of the queue into the queue's in-flight list, and the
//! receiver then claims it with `LREM`. A pop dropped mid-command drops its
//! connection with it, which cancels the blocked command on the server; a
//! message the command had already moved stays in the in-flight list. Every
//! pop, from any receiver of the queue, starts by restoring the in-flight
//! list to the head of the queue, and a receiver restores it on release. A
//! receiver whose claim finds its message already restored skips it, so each
//! message is delivered at most once and never lost.

use crate::{ChannelBackend, ChannelError, ChannelResult, Connector, QueueReceiver};
use async_trait::async_trait;
use redis::aio::{Connection, ConnectionManager};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PUSH_BOUNDED_SCRIPT: &str = r#"
    local queue = KEYS[1]
    local payload = ARGV[1]
    local capacity = tonumber(ARGV[2])
    local expiry = tonumber(ARGV[3])

    if redis.call('LLEN', queue) >= capacity then
        return 0
    end

    redis.call('RPUSH', queue, payload)
    redis.call('EXPIRE', queue, expiry)
    return 1
"#;

const RESTORE_INFLIGHT_SCRIPT: &str = r#"
    local queue = KEYS[1]
    local inflight = KEYS[2]
    local expiry = tonumber(ARGV[1])

    -- Unclaimed messages go back to the head, oldest first
    local restored = 0
    while redis.call('LMOVE', inflight, queue, 'RIGHT', 'LEFT') do
        restored = restored + 1
    end
    if restored > 0 then
        redis.call('EXPIRE', queue, expiry)
    end
    return restored
"#;

const GROUP_MEMBERS_SCRIPT: &str = r#"
    local group = KEYS[1]
    local min_score = ARGV[1]

    redis.call('ZREMRANGEBYSCORE', group, '-inf', '(' .. min_score)
    return redis.call('ZRANGE', group, 0, -1)
"#;

fn expiry_secs(expiry: Duration) -> usize {
    expiry.as_secs().max(1) as usize
}

/// In-flight list of the queue at `key`. `$` never occurs in channel names.
fn inflight_key(key: &str) -> String {
    format!("{}$inflight", key)
}

/// Redis backend: one shard
pub struct RedisBackend {
    host: String,
    client: Client,
    connect_timeout: Duration,
    queue_expiry: Duration,
    connection_pool: RwLock<Option<ConnectionManager>>,
}

impl RedisBackend {
    /// Create a backend for `url` and establish its command connection
    pub async fn new(url: &str, connect_timeout: Duration) -> ChannelResult<Self> {
        let client = Client::open(url)
            .map_err(|e| ChannelError::Configuration(format!("Invalid Redis URL {}: {}", url, e)))?;

        let backend = Self {
            host: url.to_string(),
            client,
            connect_timeout,
            queue_expiry: Duration::from_secs(3600),
            connection_pool: RwLock::new(None),
        };

        backend.ensure_connection().await?;

        Ok(backend)
    }

    /// Ensure we have a valid connection
    async fn ensure_connection(&self) -> ChannelResult<()> {
        let mut pool = self.connection_pool.write().await;

        if pool.is_none() {
            let manager = tokio::time::timeout(
                self.connect_timeout,
                self.client.get_tokio_connection_manager(),
            )
            .await
            .map_err(|_| ChannelError::Transport(format!("Timed out connecting to {}", self.host)))?
            .map_err(|e| ChannelError::Transport(format!("Failed to connect to Redis: {}", e)))?;

            info!("Connected to Redis at {}", self.host);
            *pool = Some(manager);
        }

        Ok(())
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> ChannelResult<ConnectionManager> {
        loop {
            if let Some(manager) = self.connection_pool.read().await.as_ref() {
                return Ok(manager.clone());
            }
            self.ensure_connection().await?;
        }
    }
}

#[async_trait]
impl ChannelBackend for RedisBackend {
    async fn push_bounded(
        &self,
        key: &str,
        payload: Vec<u8>,
        capacity: usize,
        expiry: Duration,
    ) -> ChannelResult<bool> {
        let mut conn = self.get_connection().await?;

        let pushed: i32 = redis::Script::new(PUSH_BOUNDED_SCRIPT)
            .key(key)
            .arg(payload)
            .arg(capacity)
            .arg(expiry_secs(expiry))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to push to {}: {}", key, e)))?;

        Ok(pushed == 1)
    }

    async fn open_receiver(&self, key: &str) -> ChannelResult<Box<dyn QueueReceiver>> {
        Ok(Box::new(RedisReceiver {
            client: self.client.clone(),
            connect_timeout: self.connect_timeout,
            connection: None,
            queue: key.to_string(),
            inflight: inflight_key(key),
            queue_expiry: self.queue_expiry,
            unsettled: false,
        }))
    }

    async fn group_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        expiry: Duration,
    ) -> ChannelResult<()> {
        let mut conn = self.get_connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .zadd(key, member, score)
            .ignore()
            .expire(key, expiry_secs(expiry))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to add group member: {}", e)))?;

        Ok(())
    }

    async fn group_discard(&self, key: &str, member: &str) -> ChannelResult<()> {
        let mut conn = self.get_connection().await?;

        let _: () = conn
            .zrem(key, member)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to discard group member: {}", e)))?;

        Ok(())
    }

    async fn group_members(&self, key: &str, min_score: f64) -> ChannelResult<Vec<String>> {
        let mut conn = self.get_connection().await?;

        redis::Script::new(GROUP_MEMBERS_SCRIPT)
            .key(key)
            .arg(min_score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to read group members: {}", e)))
    }

    async fn queue_len(&self, key: &str) -> ChannelResult<usize> {
        let mut conn = self.get_connection().await?;

        conn.llen(key)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to read queue length: {}", e)))
    }

    async fn flush(&self, prefix: &str) -> ChannelResult<()> {
        let mut conn = self.get_connection().await?;

        let pattern = format!("{}*", prefix);
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = conn
                .scan_match(&pattern)
                .await
                .map_err(|e| ChannelError::Transport(format!("Failed to scan keys: {}", e)))?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        for batch in keys.chunks(500) {
            let _: () = conn
                .del(batch)
                .await
                .map_err(|e| ChannelError::Transport(format!("Failed to flush keys: {}", e)))?;
        }

        debug!("Flushed {} keys matching {} on {}", keys.len(), pattern, self.host);
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        if self.connection_pool.write().await.take().is_some() {
            debug!("Released Redis connection to {}", self.host);
        }
        Ok(())
    }
}

/// Blocking pop over one Redis list on a dedicated connection
pub struct RedisReceiver {
    client: Client,
    connect_timeout: Duration,
    /// Taken out for the length of a pop
    connection: Option<Connection>,
    queue: String,
    inflight: String,
    queue_expiry: Duration,
    /// A pop ended without settling what it may have moved
    unsettled: bool,
}

impl RedisReceiver {
    async fn connect(&self) -> ChannelResult<Connection> {
        tokio::time::timeout(self.connect_timeout, self.client.get_async_connection())
            .await
            .map_err(|_| ChannelError::Transport("Timed out opening receive connection".to_string()))?
            .map_err(|e| ChannelError::Transport(format!("Failed to open receive connection: {}", e)))
    }

    async fn restore(&self, conn: &mut Connection) -> redis::RedisResult<()> {
        let restored: i32 = redis::Script::new(RESTORE_INFLIGHT_SCRIPT)
            .key(&self.queue)
            .key(&self.inflight)
            .arg(expiry_secs(self.queue_expiry))
            .invoke_async(conn)
            .await?;
        if restored > 0 {
            debug!("Restored {} in-flight messages to {}", restored, self.queue);
        }
        Ok(())
    }

    async fn restore_and_pop(
        &self,
        conn: &mut Connection,
        timeout: Duration,
    ) -> redis::RedisResult<Option<Vec<u8>>> {
        self.restore(conn).await?;

        let popped: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.inflight)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(conn)
            .await?;

        let Some(payload) = popped else {
            return Ok(None);
        };
        let claimed: i32 = conn.lrem(&self.inflight, 1, payload.as_slice()).await?;
        if claimed == 0 {
            // Another receiver restored it to the queue first.
            debug!("Skipping a message on {} restored before it was claimed", self.queue);
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

#[async_trait]
impl QueueReceiver for RedisReceiver {
    async fn pop(&mut self, timeout: Duration) -> ChannelResult<Option<Vec<u8>>> {
        // Owned by this future: dropping it mid-command closes the socket.
        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        self.unsettled = true;
        let popped = self
            .restore_and_pop(&mut conn, timeout)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to pop from {}: {}", self.queue, e)))?;
        self.unsettled = false;
        self.connection = Some(conn);
        Ok(popped)
    }

    async fn release(&mut self) -> ChannelResult<()> {
        let connection = self.connection.take();
        if !self.unsettled {
            return Ok(());
        }

        warn!("Restoring in-flight messages of {} after an abandoned pop", self.queue);
        let mut conn = match connection {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        self.restore(&mut conn)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to restore {}: {}", self.inflight, e)))?;
        self.unsettled = false;
        Ok(())
    }
}

/// Connects one [`RedisBackend`] per configured `redis://` URL
#[derive(Debug, Clone)]
pub struct RedisConnector {
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Backend = RedisBackend;

    async fn connect(&self, host: &str) -> ChannelResult<RedisBackend> {
        RedisBackend::new(host, self.connect_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelLayer, ChannelLayerConfigBuilder, Message};
    use serde_json::json;

    const TEST_URL: &str = "redis://localhost:6379";

    async fn create_test_backend() -> RedisBackend {
        match RedisBackend::new(TEST_URL, Duration::from_secs(2)).await {
            Ok(backend) => {
                // Clear any existing test data
                let _ = backend.flush("elif_channels_test:").await;
                backend
            }
            Err(_) => {
                // Skip tests if Redis is not available
                panic!("Redis server not available for testing");
            }
        }
    }

    fn message(kind: &str) -> Message {
        let mut message = Message::new();
        message.insert("type".to_string(), json!(kind));
        message
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_push_pop() {
        let backend = create_test_backend().await;
        let key = "elif_channels_test:queue";
        let expiry = Duration::from_secs(60);

        assert!(backend.push_bounded(key, b"one".to_vec(), 2, expiry).await.unwrap());
        assert!(backend.push_bounded(key, b"two".to_vec(), 2, expiry).await.unwrap());
        assert!(!backend.push_bounded(key, b"three".to_vec(), 2, expiry).await.unwrap());

        let mut receiver = backend.open_receiver(key).await.unwrap();
        let wait = Duration::from_secs(1);
        assert_eq!(receiver.pop(wait).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(receiver.pop(wait).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(receiver.pop(wait).await.unwrap(), None);

        backend.flush("elif_channels_test:").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_abandoned_pop_leaves_message_queued() {
        let backend = create_test_backend().await;
        let key = "elif_channels_test:abandoned";
        let mut receiver = backend.open_receiver(key).await.unwrap();

        // Dropping the pop closes its connection, so the blocked move is cancelled.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            receiver.pop(Duration::from_secs(1)),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend
            .push_bounded(key, b"kept".to_vec(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(backend.queue_len(key).await.unwrap(), 1);

        let popped = receiver.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped, Some(b"kept".to_vec()));

        backend.flush("elif_channels_test:").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_inflight_is_restored_by_any_receiver() {
        let backend = create_test_backend().await;
        let key = "elif_channels_test:stranded";
        let mut conn = backend.get_connection().await.unwrap();

        // Left behind by a receiver that went away mid-pop.
        let _: () = conn.rpush(inflight_key(key), b"stranded".to_vec()).await.unwrap();

        let mut other = backend.open_receiver(key).await.unwrap();
        let popped = other.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped, Some(b"stranded".to_vec()));

        let left: usize = conn.llen(inflight_key(key)).await.unwrap();
        assert_eq!(left, 0);

        backend.flush("elif_channels_test:").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_release_restores_unsettled_pop() {
        let backend = create_test_backend().await;
        let key = "elif_channels_test:released";
        let mut conn = backend.get_connection().await.unwrap();
        let mut receiver = backend.open_receiver(key).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            receiver.pop(Duration::from_secs(1)),
        )
        .await;
        assert!(abandoned.is_err());
        let _: () = conn.rpush(inflight_key(key), b"stranded".to_vec()).await.unwrap();

        receiver.release().await.unwrap();
        assert_eq!(backend.queue_len(key).await.unwrap(), 1);
        let left: usize = conn.llen(inflight_key(key)).await.unwrap();
        assert_eq!(left, 0);

        backend.flush("elif_channels_test:").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_layer_groups() {
        let config = ChannelLayerConfigBuilder::testing()
            .hosts(vec![format!("{}/0", TEST_URL), format!("{}/1", TEST_URL)])
            .build()
            .expect("Failed to build config");
        let layer = ChannelLayer::new(config, RedisConnector::new()).unwrap();

        let one = layer.new_channel(Some("channel1")).unwrap();
        let two = layer.new_channel(Some("channel2")).unwrap();
        layer.group_add("test-group", &one).await.unwrap();
        layer.group_add("test-group", &two).await.unwrap();
        layer.group_discard("test-group", &two).await.unwrap();
        layer.group_send("test-group", message("message.1")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), layer.receive(&one))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received["type"], "message.1");
        assert!(
            tokio::time::timeout(Duration::from_millis(500), layer.receive(&two))
                .await
                .is_err()
        );

        layer.flush().await.unwrap();
    }
}
