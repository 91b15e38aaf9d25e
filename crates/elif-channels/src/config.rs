//! Channel layer configuration types and builders

use crate::{CapacityPolicy, ChannelError, ChannelResult};
use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::time::Duration;

/// How a capacity override selects channel names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityMatcher {
    /// The whole channel name must equal this string
    Exact(String),
    /// Shell-style wildcard (`*`, `?`) over the whole name
    Glob(String),
    /// Regular expression anchored at the start of the name
    Regex(String),
}

/// A per-channel capacity override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRule {
    pub matcher: CapacityMatcher,
    pub capacity: usize,
}

impl CapacityRule {
    pub fn exact(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            matcher: CapacityMatcher::Exact(name.into()),
            capacity,
        }
    }

    pub fn glob(pattern: impl Into<String>, capacity: usize) -> Self {
        Self {
            matcher: CapacityMatcher::Glob(pattern.into()),
            capacity,
        }
    }

    pub fn regex(pattern: impl Into<String>, capacity: usize) -> Self {
        Self {
            matcher: CapacityMatcher::Regex(pattern.into()),
            capacity,
        }
    }
}

/// Configuration for a channel layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct ChannelLayerConfig {
    /// Store connection targets, one shard each. Order is significant for routing.
    #[builder(default = "vec![String::from(\"redis://localhost:6379\")]", getter)]
    pub hosts: Vec<String>,

    /// Key namespace isolating one deployment sharing the stores
    #[builder(default = "String::from(\"elif_channels\")", getter)]
    pub prefix: String,

    /// How long an unconsumed channel queue survives
    #[builder(default = "Duration::from_secs(60)", getter)]
    pub expiry: Duration,

    /// How long a group membership survives without refresh
    #[builder(default = "Duration::from_secs(86400)", getter)]
    pub group_expiry: Duration,

    /// Default per-channel queue limit
    #[builder(default = "100", getter)]
    pub capacity: usize,

    /// Ordered capacity overrides; the first matching rule wins
    #[builder(default, getter)]
    pub channel_capacity: Vec<CapacityRule>,

    /// Server-side timeout of one blocking pop round
    #[builder(default = "Duration::from_secs(5)", getter)]
    pub poll_timeout: Duration,
}

impl Default for ChannelLayerConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["redis://localhost:6379".to_string()],
            prefix: "elif_channels".to_string(),
            expiry: Duration::from_secs(60),
            group_expiry: Duration::from_secs(86400), // 1 day
            capacity: 100,
            channel_capacity: Vec::new(),
            poll_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelLayerConfig {
    /// Reject configurations the layer cannot run with
    pub fn validate(&self) -> ChannelResult<()> {
        if self.hosts.is_empty() {
            return Err(ChannelError::Configuration(
                "At least one host is required".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(ChannelError::Configuration(
                "Default capacity must be at least 1".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(ChannelError::Configuration(
                "Key prefix must not be empty".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            // A zero timeout means "block forever" to some stores.
            return Err(ChannelError::Configuration(
                "Poll timeout must be non-zero".to_string(),
            ));
        }
        CapacityPolicy::new(self.capacity, &self.channel_capacity)?;
        Ok(())
    }

    /// Store key of a channel queue
    pub fn queue_key(&self, queue_name: &str) -> String {
        format!("{}:{}", self.prefix, queue_name)
    }

    /// Store key of a group membership set
    pub fn group_key(&self, group: &str) -> String {
        format!("{}:group:{}", self.prefix, group)
    }

    /// Prefix shared by every key this layer writes
    pub fn key_namespace(&self) -> String {
        format!("{}:", self.prefix)
    }
}

impl ChannelLayerConfigBuilder {
    /// Append a capacity override after the ones already declared
    pub fn add_channel_capacity(self, matcher: CapacityMatcher, capacity: usize) -> Self {
        let mut rules = self.channel_capacity.clone().unwrap_or_default();
        rules.push(CapacityRule { matcher, capacity });
        self.channel_capacity(rules)
    }

    /// Set hosts from anything string-like
    pub fn hosts_from<I, S>(self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts(hosts.into_iter().map(Into::into).collect())
    }

    /// Create a development configuration with a local store and short lifetimes
    pub fn development() -> Self {
        ChannelLayerConfigBuilder::new()
            .hosts(vec!["redis://localhost:6379".to_string()])
            .prefix("elif_channels_dev".to_string())
            .group_expiry(Duration::from_secs(3600))
    }

    /// Create a production configuration with conservative defaults
    pub fn production() -> Self {
        ChannelLayerConfigBuilder::new()
            .prefix("elif_channels_prod".to_string())
            .capacity(1000)
            .expiry(Duration::from_secs(120))
    }

    /// Create a testing configuration with small queues and fast polling
    pub fn testing() -> Self {
        ChannelLayerConfigBuilder::new()
            .hosts(vec!["memory://test".to_string()])
            .prefix("elif_channels_test".to_string())
            .capacity(3)
            .expiry(Duration::from_secs(10))
            .poll_timeout(Duration::from_millis(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelLayerConfig::default();
        assert_eq!(config.get_hosts(), &vec!["redis://localhost:6379".to_string()]);
        assert_eq!(*config.get_expiry(), Duration::from_secs(60));
        assert_eq!(*config.get_group_expiry(), Duration::from_secs(86400));
        assert_eq!(*config.get_capacity(), 100);
        assert!(config.get_channel_capacity().is_empty());
        assert_eq!(*config.get_poll_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ChannelLayerConfigBuilder::new()
            .capacity(3)
            .add_channel_capacity(CapacityMatcher::Exact("tiny".to_string()), 1)
            .add_channel_capacity(CapacityMatcher::Glob("http.*".to_string()), 50)
            .build()
            .expect("Failed to build config");

        assert_eq!(*config.get_capacity(), 3);
        assert_eq!(config.get_channel_capacity().len(), 2);
        assert_eq!(config.get_channel_capacity()[0], CapacityRule::exact("tiny", 1));
        assert_eq!(*config.get_expiry(), Duration::from_secs(60)); // Default
    }

    #[test]
    fn test_testing_config() {
        let config = ChannelLayerConfigBuilder::testing()
            .build()
            .expect("Failed to build config");
        assert_eq!(*config.get_capacity(), 3);
        assert_eq!(config.get_prefix(), "elif_channels_test");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_config() {
        let config = ChannelLayerConfigBuilder::production()
            .build()
            .expect("Failed to build config");
        assert_eq!(*config.get_capacity(), 1000);
        assert_eq!(*config.get_expiry(), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let config = ChannelLayerConfigBuilder::new()
            .hosts(Vec::new())
            .build()
            .expect("Failed to build config");
        assert!(matches!(
            config.validate(),
            Err(ChannelError::Configuration(_))
        ));

        let config = ChannelLayerConfigBuilder::new()
            .capacity(0)
            .build()
            .expect("Failed to build config");
        assert!(config.validate().is_err());

        let config = ChannelLayerConfigBuilder::new()
            .channel_capacity(vec![CapacityRule::regex("http.(", 5)])
            .build()
            .expect("Failed to build config");
        assert!(matches!(
            config.validate(),
            Err(ChannelError::Configuration(_))
        ));
    }

    #[test]
    fn test_key_layout() {
        let config = ChannelLayerConfig::default();
        assert_eq!(config.queue_key("chat"), "elif_channels:chat");
        assert_eq!(config.group_key("room"), "elif_channels:group:room");
        assert_eq!(config.key_namespace(), "elif_channels:");
    }
}
