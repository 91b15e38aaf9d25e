//! Group membership and fan-out
//!
//! A group is a sorted set of channel names scored by the time each was last
//! added. Members older than `group_expiry` count as gone and are pruned when
//! the group is next read. Every operation on a group lands on the shard chosen
//! by the group name, whatever shards its members live on.

use crate::naming;
use crate::{
    ChannelBackend, ChannelError, ChannelLayerConfig, ChannelResult, Connector, Message,
    SendPath, ShardRouter,
};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSendSummary {
    /// Members the message was queued for
    pub delivered: usize,
    /// Members skipped because their channel was full
    pub full: usize,
}

fn now_score() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct GroupRegistry<C: Connector> {
    router: Arc<ShardRouter<C>>,
    send: Arc<SendPath<C>>,
    config: Arc<ChannelLayerConfig>,
}

impl<C: Connector> GroupRegistry<C> {
    pub fn new(
        router: Arc<ShardRouter<C>>,
        send: Arc<SendPath<C>>,
        config: Arc<ChannelLayerConfig>,
    ) -> Self {
        Self {
            router,
            send,
            config,
        }
    }

    /// Add `channel` to `group`, or refresh its membership
    pub async fn group_add(&self, group: &str, channel: &str) -> ChannelResult<()> {
        naming::validate_group(group)?;
        naming::validate(channel)?;

        let backend = self.router.connection_for_key(group).await?;
        backend
            .group_add(
                &self.config.group_key(group),
                channel,
                now_score(),
                *self.config.get_group_expiry(),
            )
            .await
    }

    /// Remove `channel` from `group`. Not an error if it was never a member.
    pub async fn group_discard(&self, group: &str, channel: &str) -> ChannelResult<()> {
        naming::validate_group(group)?;
        naming::validate(channel)?;

        let backend = self.router.connection_for_key(group).await?;
        backend
            .group_discard(&self.config.group_key(group), channel)
            .await
    }

    /// Live members of `group`, pruning expired ones
    pub async fn members(&self, group: &str) -> ChannelResult<Vec<String>> {
        naming::validate_group(group)?;

        let backend = self.router.connection_for_key(group).await?;
        let cutoff = now_score() - self.config.get_group_expiry().as_secs_f64();
        backend
            .group_members(&self.config.group_key(group), cutoff)
            .await
    }

    /// Send `message` to every live member of `group`.
    ///
    /// Full member channels are skipped. Other member failures are reported
    /// after every member has been attempted.
    pub async fn group_send(&self, group: &str, message: &Message) -> ChannelResult<GroupSendSummary> {
        let members = self.members(group).await?;
        debug!("Sending to {} members of group {}", members.len(), group);

        let results = join_all(
            members
                .iter()
                .map(|member| self.send.send(member, message)),
        )
        .await;

        let mut summary = GroupSendSummary::default();
        let mut failure = None;
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => summary.delivered += 1,
                Err(ChannelError::ChannelFull(_)) => {
                    debug!("Group {} member {} is full, skipping", group, member);
                    summary.full += 1;
                }
                Err(e) => {
                    warn!("Group {} send to {} failed: {}", group, member, e);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}
