//! Capacity-bounded enqueue

use crate::naming;
use crate::{
    CapacityPolicy, ChannelBackend, ChannelError, ChannelLayerConfig, ChannelResult, Connector,
    Message, ShardRouter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Stored form of a message: the payload tagged with its exact destination.
///
/// Process-local channels share a queue, so the receiving side needs the
/// destination to hand each message to the right waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub message: Message,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    channel: &'a str,
    message: &'a Message,
}

impl Envelope {
    pub fn encode(channel: &str, message: &Message) -> ChannelResult<Vec<u8>> {
        Ok(serde_json::to_vec(&EnvelopeRef { channel, message })?)
    }

    pub fn decode(payload: &[u8]) -> ChannelResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Validates, routes and atomically appends messages to channel queues
pub struct SendPath<C: Connector> {
    router: Arc<ShardRouter<C>>,
    capacity: CapacityPolicy,
    config: Arc<ChannelLayerConfig>,
}

impl<C: Connector> SendPath<C> {
    pub fn new(
        router: Arc<ShardRouter<C>>,
        capacity: CapacityPolicy,
        config: Arc<ChannelLayerConfig>,
    ) -> Self {
        Self {
            router,
            capacity,
            config,
        }
    }

    pub fn capacity_for(&self, channel: &str) -> usize {
        self.capacity.capacity_for(channel)
    }

    /// Append `message` to `channel`, failing with `ChannelFull` at capacity
    pub async fn send(&self, channel: &str, message: &Message) -> ChannelResult<()> {
        let name = naming::validate(channel)?;
        let capacity = self.capacity.capacity_for(channel);
        let key = self.config.queue_key(name.queue_name());
        let payload = Envelope::encode(channel, message)?;

        let backend = self.router.connection_for_key(name.queue_name()).await?;
        if backend
            .push_bounded(&key, payload, capacity, *self.config.get_expiry())
            .await?
        {
            Ok(())
        } else {
            debug!("Channel {} is at capacity ({})", channel, capacity);
            Err(ChannelError::ChannelFull(channel.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryConnector;
    use crate::{CapacityRule, ChannelLayerConfigBuilder};
    use serde_json::json;

    fn message(kind: &str) -> Message {
        let mut message = Message::new();
        message.insert("type".to_string(), json!(kind));
        message
    }

    fn send_path(rules: Vec<CapacityRule>) -> SendPath<MemoryConnector> {
        let config = ChannelLayerConfigBuilder::testing()
            .channel_capacity(rules)
            .build()
            .expect("Failed to build config");
        let router = ShardRouter::new(MemoryConnector::new(), config.get_hosts()).unwrap();
        let capacity = CapacityPolicy::new(*config.get_capacity(), config.get_channel_capacity()).unwrap();
        SendPath::new(Arc::new(router), capacity, Arc::new(config))
    }

    #[test]
    fn test_envelope_keeps_key_order() {
        let mut msg = Message::new();
        msg.insert("zeta".to_string(), json!(1));
        msg.insert("alpha".to_string(), json!({"nested": [1, 2, 3]}));

        let payload = Envelope::encode("chat!abc.def", &msg).unwrap();
        let envelope = Envelope::decode(&payload).unwrap();
        assert_eq!(envelope.channel, "chat!abc.def");
        let keys: Vec<&String> = envelope.message.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn test_send_enforces_capacity() {
        let path = send_path(Vec::new());
        for _ in 0..3 {
            path.send("test-channel-1", &message("test.message")).await.unwrap();
        }
        let result = path.send("test-channel-1", &message("test.message")).await;
        assert!(matches!(result, Err(ChannelError::ChannelFull(name)) if name == "test-channel-1"));

        // Other channels are unaffected.
        path.send("test-channel-2", &message("test.message")).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_specific_capacity() {
        let path = send_path(vec![CapacityRule::exact("one", 1)]);
        path.send("one", &message("test.message")).await.unwrap();
        assert!(matches!(
            path.send("one", &message("test.message")).await,
            Err(ChannelError::ChannelFull(_))
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_bad_names() {
        let path = send_path(Vec::new());
        assert!(matches!(
            path.send("=+135!", &message("foom")).await,
            Err(ChannelError::InvalidChannelName(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_exceed_capacity() {
        let path = Arc::new(send_path(Vec::new()));
        let sends = (0..20).map(|i| {
            let path = path.clone();
            tokio::spawn(async move { path.send("contended", &message(&format!("m{}", i))).await })
        });

        let results = futures::future::join_all(sends).await;
        let delivered = results
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(()))))
            .count();
        assert_eq!(delivered, 3);

        let backend = path.router.connection_for_key("contended").await.unwrap();
        let key = path.config.queue_key("contended");
        assert_eq!(backend.queue_len(&key).await.unwrap(), 3);
    }
}
