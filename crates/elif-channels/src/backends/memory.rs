//! In-memory store backend for development and testing

use crate::{ChannelBackend, ChannelError, ChannelResult, Connector, QueueReceiver};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct StoredList {
    items: VecDeque<Vec<u8>>,
    expires_at: Instant,
}

struct StoredGroup {
    members: HashMap<String, f64>,
    expires_at: Instant,
}

/// Shared state of one in-memory "server"
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, StoredList>>,
    groups: DashMap<String, StoredGroup>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_front(&self, key: &str) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock();
        let now = Instant::now();
        let list = lists.get_mut(key)?;
        if list.expires_at <= now {
            lists.remove(key);
            return None;
        }
        let item = list.items.pop_front();
        if list.items.is_empty() {
            lists.remove(key);
        }
        item
    }
}

/// In-memory backend: one connection to a [`MemoryStore`]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create a backend over a fresh, private store
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Create a backend over a store other backends may share
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChannelError::Transport("Connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelBackend for MemoryBackend {
    async fn push_bounded(
        &self,
        key: &str,
        payload: Vec<u8>,
        capacity: usize,
        expiry: Duration,
    ) -> ChannelResult<bool> {
        self.ensure_open()?;
        {
            let mut lists = self.store.lists.lock();
            let now = Instant::now();
            let list = lists.entry(key.to_string()).or_insert_with(|| StoredList {
                items: VecDeque::new(),
                expires_at: now,
            });
            if list.expires_at <= now {
                list.items.clear();
            }
            if list.items.len() >= capacity {
                return Ok(false);
            }
            list.items.push_back(payload);
            list.expires_at = now + expiry;
        }
        self.store.pushed.notify_waiters();
        Ok(true)
    }

    async fn open_receiver(&self, key: &str) -> ChannelResult<Box<dyn QueueReceiver>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryReceiver {
            store: self.store.clone(),
            closed: self.closed.clone(),
            key: key.to_string(),
        }))
    }

    async fn group_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        expiry: Duration,
    ) -> ChannelResult<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut group = self
            .store
            .groups
            .entry(key.to_string())
            .or_insert_with(|| StoredGroup {
                members: HashMap::new(),
                expires_at: now,
            });
        if group.expires_at <= now {
            group.members.clear();
        }
        group.members.insert(member.to_string(), score);
        group.expires_at = now + expiry;
        Ok(())
    }

    async fn group_discard(&self, key: &str, member: &str) -> ChannelResult<()> {
        self.ensure_open()?;
        if let Some(mut group) = self.store.groups.get_mut(key) {
            group.members.remove(member);
        }
        Ok(())
    }

    async fn group_members(&self, key: &str, min_score: f64) -> ChannelResult<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut members = match self.store.groups.get_mut(key) {
            Some(mut group) if group.expires_at > now => {
                let before = group.members.len();
                group.members.retain(|_, score| *score >= min_score);
                if group.members.len() < before {
                    debug!("Pruned {} expired members from {}", before - group.members.len(), key);
                }
                group
                    .members
                    .iter()
                    .map(|(member, score)| (member.clone(), *score))
                    .collect::<Vec<_>>()
            }
            _ => Vec::new(),
        };
        self.store
            .groups
            .remove_if(key, |_, group| group.expires_at <= now || group.members.is_empty());

        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().map(|(member, _)| member).collect())
    }

    async fn queue_len(&self, key: &str) -> ChannelResult<usize> {
        self.ensure_open()?;
        let lists = self.store.lists.lock();
        Ok(lists
            .get(key)
            .filter(|list| list.expires_at > Instant::now())
            .map_or(0, |list| list.items.len()))
    }

    async fn flush(&self, prefix: &str) -> ChannelResult<()> {
        self.ensure_open()?;
        self.store.lists.lock().retain(|key, _| !key.starts_with(prefix));
        self.store.groups.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        self.closed.store(true, Ordering::Release);
        // Wake blocked receivers so they observe the close.
        self.store.pushed.notify_waiters();
        Ok(())
    }
}

/// Blocking pop over one in-memory list
pub struct MemoryReceiver {
    store: Arc<MemoryStore>,
    closed: Arc<AtomicBool>,
    key: String,
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn pop(&mut self, timeout: Duration) -> ChannelResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.store.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(ChannelError::Transport("Connection closed".to_string()));
            }
            if let Some(item) = self.store.pop_front(&self.key) {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// Connects to in-memory stores, one per host name.
///
/// Clones share their stores, so layers built from clones of one connector
/// see each other's queues and groups like processes sharing servers.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<DashMap<String, Arc<MemoryStore>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `host`, created on first use
    pub fn store(&self, host: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Backend = MemoryBackend;

    async fn connect(&self, host: &str) -> ChannelResult<MemoryBackend> {
        Ok(MemoryBackend::with_store(self.store(host)))
    }
}
