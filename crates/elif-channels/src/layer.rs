//! The channel layer facade

use crate::groups::GroupSendSummary;
use crate::{
    CapacityPolicy, ChannelBackend, ChannelLayerConfig, ChannelResult, ClientIdentity, Connector,
    GroupRegistry, Message, QueueReceiver, ReceiveBuffer, SendPath, ShardRouter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefix of channels minted by [`ChannelLayer::new_channel`] when none is given
pub const DEFAULT_CHANNEL_PREFIX: &str = "specific";

/// Optional capabilities this layer implements
pub const EXTENSIONS: &[&str] = &["groups", "flush"];

/// One participant in the channel layer.
///
/// Owns its store connections and a random identity; process-local channels
/// it mints can only be received by it. Call [`close_pools`](Self::close_pools)
/// before dropping it to release transport resources.
pub struct ChannelLayer<C: Connector> {
    config: Arc<ChannelLayerConfig>,
    identity: ClientIdentity,
    router: Arc<ShardRouter<C>>,
    send: Arc<SendPath<C>>,
    groups: GroupRegistry<C>,
    buffers: Mutex<HashMap<String, Arc<ReceiveBuffer>>>,
}

impl<C: Connector> ChannelLayer<C> {
    /// Create a layer over the configured hosts. Connections are made on first use.
    pub fn new(config: ChannelLayerConfig, connector: C) -> ChannelResult<Self> {
        config.validate()?;
        let capacity = CapacityPolicy::new(*config.get_capacity(), config.get_channel_capacity())?;
        let config = Arc::new(config);
        let router = Arc::new(ShardRouter::new(connector, config.get_hosts())?);
        let send = Arc::new(SendPath::new(router.clone(), capacity, config.clone()));
        let groups = GroupRegistry::new(router.clone(), send.clone(), config.clone());
        let identity = ClientIdentity::generate();

        info!(
            "Channel layer {} created with {} shard(s) under prefix {}",
            identity,
            router.shard_count(),
            config.get_prefix()
        );

        Ok(Self {
            config,
            identity,
            router,
            send,
            groups,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ChannelLayerConfig {
        &self.config
    }

    pub fn client_identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn shard_count(&self) -> usize {
        self.router.shard_count()
    }

    pub fn capacity_for(&self, channel: &str) -> usize {
        self.send.capacity_for(channel)
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        EXTENSIONS
    }

    /// Mint a new process-local channel name owned by this layer
    pub fn new_channel(&self, prefix: Option<&str>) -> ChannelResult<String> {
        self.identity.mint(prefix.unwrap_or(DEFAULT_CHANNEL_PREFIX))
    }

    /// Queue `message` on `channel`
    pub async fn send(&self, channel: &str, message: Message) -> ChannelResult<()> {
        self.send.send(channel, &message).await
    }

    /// Wait for the next message on `channel`.
    ///
    /// Process-local channels must have been minted by this layer. Dropping the
    /// returned future cancels the receive without losing messages.
    pub async fn receive(&self, channel: &str) -> ChannelResult<Message> {
        let name = self.identity.validate_receive(channel)?;
        let receive = {
            let mut buffers = self.buffers.lock().await;
            let buffer = self.buffer_for(&mut buffers, name.queue_name()).await?;
            let mut receive = buffer.get(channel)?;
            // Registered under the map lock so the idle sweep never races it.
            receive.start();
            receive
        };
        receive.await
    }

    async fn open_receiver(&self, queue: &str) -> ChannelResult<Box<dyn QueueReceiver>> {
        let backend = self.router.connection_for_key(queue).await?;
        backend.open_receiver(&self.config.queue_key(queue)).await
    }

    async fn buffer_for(
        &self,
        buffers: &mut HashMap<String, Arc<ReceiveBuffer>>,
        queue: &str,
    ) -> ChannelResult<Arc<ReceiveBuffer>> {
        if let Some(buffer) = buffers.get(queue).cloned() {
            if buffer.is_detached() {
                buffer.attach(self.open_receiver(queue).await?).await;
            }
            return Ok(buffer);
        }

        let idle: Vec<String> = buffers
            .iter()
            .filter(|(_, buffer)| buffer.is_idle())
            .map(|(name, _)| name.clone())
            .collect();
        for name in idle {
            if let Some(buffer) = buffers.remove(&name) {
                buffer.close().await;
                debug!("Evicted idle receive buffer for {}", name);
            }
        }

        let buffer = Arc::new(ReceiveBuffer::new(
            queue,
            self.open_receiver(queue).await?,
            *self.config.get_poll_timeout(),
        ));
        debug!("Opened receive buffer for {}", queue);
        buffers.insert(queue.to_string(), buffer.clone());
        Ok(buffer)
    }

    /// Number of receive buffers currently held
    pub async fn open_buffers(&self) -> usize {
        self.buffers.lock().await.len()
    }

    /// Add `channel` to `group`, refreshing its membership
    pub async fn group_add(&self, group: &str, channel: &str) -> ChannelResult<()> {
        self.groups.group_add(group, channel).await
    }

    /// Remove `channel` from `group`
    pub async fn group_discard(&self, group: &str, channel: &str) -> ChannelResult<()> {
        self.groups.group_discard(group, channel).await
    }

    /// Live members of `group`
    pub async fn group_members(&self, group: &str) -> ChannelResult<Vec<String>> {
        self.groups.members(group).await
    }

    /// Send `message` to every member of `group`, skipping members whose channel is full
    pub async fn group_send(&self, group: &str, message: Message) -> ChannelResult<GroupSendSummary> {
        self.groups.group_send(group, &message).await
    }

    /// Number of messages queued in the store for `channel`'s queue
    pub async fn queue_len(&self, channel: &str) -> ChannelResult<usize> {
        let name = crate::naming::validate(channel)?;
        let backend = self.router.connection_for_key(name.queue_name()).await?;
        backend
            .queue_len(&self.config.queue_key(name.queue_name()))
            .await
    }

    /// Delete every queue and group under this layer's prefix on every shard,
    /// drop every buffered message, then release all connections
    pub async fn flush(&self) -> ChannelResult<()> {
        let discarded = self.close_buffers(false).await;
        if discarded > 0 {
            warn!("Discarding {} buffered messages", discarded);
        }

        let namespace = self.config.key_namespace();
        for backend in self.router.connect_all().await? {
            backend.flush(&namespace).await?;
        }
        info!("Flushed channel layer keys under {}", namespace);
        self.router.close_all().await;
        Ok(())
    }

    /// Release every shard connection and stop all receives.
    ///
    /// Pending receives fail with [`ChannelError::Closed`](crate::ChannelError::Closed).
    /// Messages already read into a buffer stay there for later receives.
    /// Idempotent; the layer reconnects lazily if used again.
    pub async fn close_pools(&self) {
        self.close_buffers(true).await;
        self.router.close_all().await;
        debug!("Closed channel layer {} pools", self.identity);
    }

    /// Close every buffer, keeping those with a backlog if asked to.
    /// Returns the number of buffered messages dropped.
    async fn close_buffers(&self, keep_backlog: bool) -> usize {
        let mut buffers = self.buffers.lock().await;
        for buffer in buffers.values() {
            buffer.close().await;
        }

        let mut dropped = 0;
        buffers.retain(|_, buffer| {
            let buffered = buffer.buffered();
            if keep_backlog && buffered > 0 {
                return true;
            }
            dropped += buffered;
            false
        });
        dropped
    }
}
