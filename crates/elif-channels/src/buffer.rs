//! Multiplexed receive over one blocking queue
//!
//! Every process-local channel minted by a layer under one prefix shares a
//! store queue, and a store connection only serves one blocking pop at a time.
//! [`ReceiveBuffer`] runs at most one poll task per queue and hands each popped
//! message to the waiter registered for its exact channel, buffering messages
//! nobody is waiting for yet. To callers each channel looks like a private queue.
//!
//! A [`Receive`] future registers its waiter when first polled (or when
//! [`Receive::start`] is called). Dropping it before completion cancels the
//! wait without losing anything: a message already matched to it goes back to
//! the front of the backlog, and the poll task is aborted once no waiters remain.
//!
//! After a delivery the poll task does not exit if other waiters are still
//! registered; it keeps polling for them and exits after the round that leaves
//! no waiters. There is never more than one poll task per buffer.
//!
//! Closing a buffer fails pending receives and releases its receiver but keeps
//! the backlog: those messages have already left the store, so they stay
//! claimable once a new receiver is attached.

use crate::naming::ChannelName;
use crate::{ChannelError, ChannelResult, Envelope, Message, QueueReceiver};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Delivery = ChannelResult<Message>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Delivery>,
}

struct Poller {
    id: u64,
    handle: JoinHandle<()>,
}

enum Registration {
    Buffered(Message),
    Waiting(u64, oneshot::Receiver<Delivery>),
    Detached,
}

#[derive(Default)]
struct BufferState {
    waiters: HashMap<String, Waiter>,
    backlog: HashMap<String, VecDeque<Message>>,
    poller: Option<Poller>,
    next_id: u64,
    /// Closed and waiting for a new receiver
    detached: bool,
}

impl BufferState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_backlog(&mut self, channel: &str) -> Option<Message> {
        let queue = self.backlog.get_mut(channel)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.backlog.remove(channel);
        }
        message
    }

    fn push_backlog_front(&mut self, channel: &str, message: Message) {
        self.backlog
            .entry(channel.to_string())
            .or_default()
            .push_front(message);
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Envelope { channel, message } = envelope;
        match self.waiters.remove(&channel) {
            Some(waiter) => {
                if let Err(Ok(message)) = waiter.tx.send(Ok(message)) {
                    self.push_backlog_front(&channel, message);
                }
            }
            None => {
                debug!("Buffering message for {} (no waiter)", channel);
                self.backlog.entry(channel).or_default().push_back(message);
            }
        }
    }

    fn fail_waiters(&mut self, reason: &ChannelError) {
        let detail = match reason {
            ChannelError::Transport(detail) => detail.clone(),
            other => other.to_string(),
        };
        for (channel, waiter) in self.waiters.drain() {
            warn!("Failing receive on {}: {}", channel, detail);
            let _ = waiter.tx.send(Err(ChannelError::Transport(detail.clone())));
        }
    }

    fn is_current_poller(&self, id: u64) -> bool {
        self.poller.as_ref().map(|poller| poller.id) == Some(id)
    }

    fn abort_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.handle.abort();
            debug!("Aborted poll task {}", poller.id);
        }
    }
}

struct Shared {
    queue: String,
    poll_timeout: Duration,
    /// Held by the poll task from before a pop until its result is delivered
    receiver: tokio::sync::Mutex<Box<dyn QueueReceiver>>,
    state: Mutex<BufferState>,
}

impl Shared {
    fn ensure_poller(self: &Arc<Self>, state: &mut BufferState) {
        if state.poller.is_some() {
            return;
        }
        let id = state.next_id();
        let shared = self.clone();
        let handle = tokio::spawn(async move { shared.poll_loop(id).await });
        state.poller = Some(Poller { id, handle });
    }

    async fn poll_loop(self: Arc<Self>, id: u64) {
        debug!("Poll task {} started on {}", id, self.queue);
        loop {
            let mut receiver = self.receiver.lock().await;
            if !self.state.lock().is_current_poller(id) {
                return;
            }

            let popped = receiver.pop(self.poll_timeout).await;

            let mut state = self.state.lock();
            match popped {
                Ok(Some(payload)) => match Envelope::decode(&payload) {
                    Ok(envelope) => state.deliver(envelope),
                    Err(e) => error!("Dropping undecodable message on {}: {}", self.queue, e),
                },
                Ok(None) => {}
                Err(e) => {
                    error!("Poll on {} failed: {}", self.queue, e);
                    state.fail_waiters(&e);
                }
            }

            if state.waiters.is_empty() || !state.is_current_poller(id) {
                if state.is_current_poller(id) {
                    state.poller = None;
                }
                debug!("Poll task {} on {} finished", id, self.queue);
                return;
            }
        }
    }

    fn register(self: &Arc<Self>, channel: &str) -> Registration {
        let mut state = self.state.lock();
        if let Some(message) = state.take_backlog(channel) {
            return Registration::Buffered(message);
        }
        if state.detached {
            return Registration::Detached;
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_id();
        if state
            .waiters
            .insert(channel.to_string(), Waiter { id, tx })
            .is_some()
        {
            warn!("Replaced a pending receive on {}", channel);
        }
        self.ensure_poller(&mut state);
        Registration::Waiting(id, rx)
    }

    fn cancel(&self, channel: &str, id: u64, mut rx: oneshot::Receiver<Delivery>) {
        let mut state = self.state.lock();
        if state.waiters.get(channel).map(|waiter| waiter.id) == Some(id) {
            state.waiters.remove(channel);
        }

        rx.close();
        if let Ok(Ok(message)) = rx.try_recv() {
            debug!("Returning matched message for cancelled receive on {}", channel);
            state.push_backlog_front(channel, message);
        }

        if state.waiters.is_empty() {
            state.abort_poller();
        }
    }

    fn requeue(&self, channel: &str, message: Message) {
        self.state.lock().push_backlog_front(channel, message);
    }
}

/// Demultiplexes one store queue into per-channel receives
pub struct ReceiveBuffer {
    shared: Arc<Shared>,
}

impl ReceiveBuffer {
    /// Create a buffer for the store queue `queue`, read through `receiver`
    pub fn new(
        queue: impl Into<String>,
        receiver: Box<dyn QueueReceiver>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: queue.into(),
                poll_timeout,
                receiver: tokio::sync::Mutex::new(receiver),
                state: Mutex::new(BufferState::default()),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.queue
    }

    /// Receive the next message for `channel`, which must live in this buffer's queue
    pub fn get(&self, channel: &str) -> ChannelResult<Receive> {
        let name = ChannelName::parse(channel)?;
        if name.queue_name() != self.shared.queue {
            return Err(ChannelError::OwnershipViolation(format!(
                "{} is not served by queue {}",
                channel, self.shared.queue
            )));
        }

        Ok(Receive {
            shared: self.shared.clone(),
            channel: channel.to_string(),
            state: ReceiveState::Idle,
        })
    }

    /// Whether a poll task is in flight
    pub fn is_polling(&self) -> bool {
        self.shared.state.lock().poller.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Messages read for `channel` but not yet claimed
    pub fn backlog_len(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .backlog
            .get(channel)
            .map_or(0, VecDeque::len)
    }

    /// Messages read for any channel but not yet claimed
    pub fn buffered(&self) -> usize {
        self.shared
            .state
            .lock()
            .backlog
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// No waiters, no backlog and no pop in progress: dropping the buffer loses nothing
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.waiters.is_empty()
            && state.backlog.is_empty()
            && state.poller.is_none()
            && self.shared.receiver.try_lock().is_ok()
    }

    /// Whether the buffer was closed and has no receiver attached
    pub fn is_detached(&self) -> bool {
        self.shared.state.lock().detached
    }

    /// Abort polling, wake every pending receive with [`ChannelError::Closed`]
    /// and release the receiver. Buffered messages are kept.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.abort_poller();
            state.waiters.clear();
            state.detached = true;
        }

        // Waits for an aborted poll task to let go of the receiver.
        let mut receiver = self.shared.receiver.lock().await;
        if let Err(e) = receiver.release().await {
            warn!("Failed to release receiver of {}: {}", self.shared.queue, e);
        }
        debug!("Closed receive buffer for {}", self.shared.queue);
    }

    /// Resume a closed buffer with a fresh receiver
    pub async fn attach(&self, receiver: Box<dyn QueueReceiver>) {
        let mut current = self.shared.receiver.lock().await;
        *current = receiver;
        self.shared.state.lock().detached = false;
        debug!("Attached a new receiver to {}", self.shared.queue);
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        self.shared.state.lock().abort_poller();
    }
}

enum ReceiveState {
    Idle,
    Ready(Message),
    Waiting {
        id: u64,
        rx: oneshot::Receiver<Delivery>,
    },
    Fulfilled,
    Cancelled,
}

/// A pending receive on one channel.
///
/// Idle until started, then either ready with a buffered message or waiting
/// until one arrives. Dropping or [`cancel`](Receive::cancel)ling it before it
/// completes leaves every message in the buffer or the store.
pub struct Receive {
    shared: Arc<Shared>,
    channel: String,
    state: ReceiveState,
}

impl Receive {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Register with the buffer now rather than on first poll
    pub fn start(&mut self) {
        if let ReceiveState::Idle = self.state {
            self.state = match self.shared.register(&self.channel) {
                Registration::Buffered(message) => ReceiveState::Ready(message),
                Registration::Waiting(id, rx) => ReceiveState::Waiting { id, rx },
                Registration::Detached => ReceiveState::Cancelled,
            };
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, ReceiveState::Waiting { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ReceiveState::Fulfilled | ReceiveState::Cancelled
        )
    }

    /// Withdraw this receive. Polling it afterwards yields [`ChannelError::Closed`].
    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.state, ReceiveState::Cancelled) {
            ReceiveState::Waiting { id, rx } => self.shared.cancel(&self.channel, id, rx),
            ReceiveState::Ready(message) => self.shared.requeue(&self.channel, message),
            ReceiveState::Fulfilled => self.state = ReceiveState::Fulfilled,
            ReceiveState::Idle | ReceiveState::Cancelled => {}
        }
    }
}

impl Future for Receive {
    type Output = ChannelResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        this.start();

        match std::mem::replace(&mut this.state, ReceiveState::Fulfilled) {
            ReceiveState::Ready(message) => Poll::Ready(Ok(message)),
            ReceiveState::Waiting { id, mut rx } => match Pin::new(&mut rx).poll(cx) {
                Poll::Pending => {
                    this.state = ReceiveState::Waiting { id, rx };
                    Poll::Pending
                }
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Closed)),
            },
            ReceiveState::Cancelled => {
                this.state = ReceiveState::Cancelled;
                Poll::Ready(Err(ChannelError::Closed))
            }
            ReceiveState::Idle | ReceiveState::Fulfilled => Poll::Ready(Err(ChannelError::Closed)),
        }
    }
}

impl Drop for Receive {
    fn drop(&mut self) {
        self.cancel();
    }
}
