use crate::message::{ChannelMessage, MessageKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use weave_core::{WeaveError, WeaveResult};

/// Default number of messages kept in the channel history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// FIFO queue for one recipient.
struct Mailbox {
    queue: Mutex<VecDeque<ChannelMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, message: ChannelMessage) {
        self.queue.lock().push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ChannelMessage> {
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Counters reported by [`MessageChannel::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub broadcasts_sent: u64,
    pub messages_dropped: u64,
    pub mailboxes: usize,
    pub subscriptions: usize,
    pub pending: usize,
}

/// Per-recipient mailboxes with direct delivery and topic broadcast.
///
/// Delivery within one mailbox is FIFO. There is no ordering guarantee across
/// mailboxes. Receivers wait on a [`Notify`], so `receive` suspends the calling
/// task instead of polling.
pub struct MessageChannel {
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    subscriptions: RwLock<HashMap<String, BTreeSet<String>>>,
    history: Mutex<VecDeque<ChannelMessage>>,
    history_limit: usize,
    sent: AtomicU64,
    received: AtomicU64,
    broadcasts: AtomicU64,
    dropped: AtomicU64,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a channel that keeps at most `limit` messages of history.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: limit,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn mailbox(&self, id: &str) -> Arc<Mailbox> {
        if let Some(mailbox) = self.mailboxes.read().get(id) {
            return mailbox.clone();
        }
        self.mailboxes
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(mailbox = %id, "Mailbox created");
                Arc::new(Mailbox::new())
            })
            .clone()
    }

    /// Create the mailbox for `id` if it does not exist yet.
    pub fn open_mailbox(&self, id: &str) {
        let _ = self.mailbox(id);
    }

    /// Whether a mailbox exists for `id` and is still open.
    pub fn is_open(&self, id: &str) -> bool {
        self.mailboxes
            .read()
            .get(id)
            .is_some_and(|m| !m.is_closed())
    }

    /// Append a message to the recipient's mailbox, creating it on first use.
    ///
    /// Fails only when the recipient's mailbox has been closed.
    pub fn send(&self, message: ChannelMessage) -> WeaveResult<()> {
        let mailbox = self.mailbox(&message.recipient);
        if mailbox.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(WeaveError::Channel(format!(
                "Mailbox '{}' is closed",
                message.recipient
            )));
        }
        self.enqueue(&mailbox, message);
        Ok(())
    }

    /// Deliver into an existing open mailbox only. Returns `false` (and drops
    /// the message) when nobody is listening at that address anymore.
    pub fn deliver(&self, message: ChannelMessage) -> bool {
        let mailbox = self.mailboxes.read().get(&message.recipient).cloned();
        match mailbox {
            Some(mailbox) if !mailbox.is_closed() => {
                self.enqueue(&mailbox, message);
                true
            }
            _ => {
                debug!(
                    recipient = %message.recipient,
                    sender = %message.sender,
                    "Dropping message for absent mailbox"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn enqueue(&self, mailbox: &Mailbox, message: ChannelMessage) {
        debug!(
            sender = %message.sender,
            recipient = %message.recipient,
            kind = %message.kind,
            "Message sent"
        );
        self.record(&message);
        mailbox.push(message);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, message: &ChannelMessage) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(message.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Wait up to `timeout` for the next message in `id`'s mailbox.
    /// Returns `None` on timeout, when the mailbox is closed and drained, or
    /// straight away when no mailbox exists for `id`.
    pub async fn receive(&self, id: &str, timeout: Duration) -> Option<ChannelMessage> {
        self.wait_for(id, Some(Instant::now() + timeout)).await
    }

    /// Wait for the next message with no deadline. Returns `None` once the
    /// mailbox is closed and drained, or if it does not exist.
    pub async fn recv(&self, id: &str) -> Option<ChannelMessage> {
        self.wait_for(id, None).await
    }

    /// Take the next message without waiting.
    pub fn try_receive(&self, id: &str) -> Option<ChannelMessage> {
        let mailbox = self.mailboxes.read().get(id).cloned()?;
        let message = mailbox.pop()?;
        self.received.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    async fn wait_for(&self, id: &str, deadline: Option<Instant>) -> Option<ChannelMessage> {
        let mailbox = self.mailboxes.read().get(id).cloned()?;
        loop {
            // Register interest before checking the queue so a send that lands
            // in between still wakes us.
            let notified = mailbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = mailbox.pop() {
                self.received.fetch_add(1, Ordering::Relaxed);
                return Some(message);
            }
            if mailbox.is_closed() {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let message = mailbox.pop();
                        if message.is_some() {
                            self.received.fetch_add(1, Ordering::Relaxed);
                        }
                        return message;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Record `id`'s interest in `topic`.
    pub fn subscribe(&self, id: &str, topic: &str) {
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());
        debug!(subscriber = %id, topic = %topic, "Subscribed");
    }

    pub fn unsubscribe(&self, id: &str, topic: &str) {
        if let Some(subscribers) = self.subscriptions.write().get_mut(topic) {
            subscribers.remove(id);
        }
    }

    /// Subscribers of `topic`, sorted by id.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send a copy of `message` to every subscriber of `topic`.
    /// Closed mailboxes are skipped. Returns the number of copies delivered.
    pub fn broadcast(&self, topic: &str, message: ChannelMessage) -> usize {
        let subscribers = self.subscribers(topic);
        if subscribers.is_empty() {
            debug!(topic = %topic, sender = %message.sender, "Broadcast has no subscribers");
            return 0;
        }

        let mut delivered = 0;
        for subscriber in &subscribers {
            match self.send(message.readdressed(subscriber, topic)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(subscriber = %subscriber, error = %e, "Broadcast send failed"),
            }
        }
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %topic, delivered, "Broadcast sent");
        delivered
    }

    /// Close a mailbox: pending messages can still be drained, new sends fail,
    /// and waiters on an empty mailbox return `None`.
    pub fn close_mailbox(&self, id: &str) {
        if let Some(mailbox) = self.mailboxes.read().get(id) {
            mailbox.close();
        }
    }

    /// Close and forget a mailbox and drop it from every topic.
    pub fn remove_mailbox(&self, id: &str) {
        if let Some(mailbox) = self.mailboxes.write().remove(id) {
            mailbox.close();
        }
        for subscribers in self.subscriptions.write().values_mut() {
            subscribers.remove(id);
        }
    }

    /// Close every mailbox, releasing all blocked receivers.
    pub fn close_all(&self) {
        for mailbox in self.mailboxes.read().values() {
            mailbox.close();
        }
    }

    pub fn has_messages(&self, id: &str) -> bool {
        self.pending_count(id) > 0
    }

    pub fn pending_count(&self, id: &str) -> usize {
        self.mailboxes.read().get(id).map_or(0, |m| m.len())
    }

    /// Drop every pending message for `id`. Returns how many were removed.
    pub fn clear_mailbox(&self, id: &str) -> usize {
        match self.mailboxes.read().get(id) {
            Some(mailbox) => {
                let mut queue = mailbox.queue.lock();
                let count = queue.len();
                queue.clear();
                count
            }
            None => 0,
        }
    }

    /// Most recent messages, oldest first, optionally filtered by participant
    /// (sender or recipient) and kind.
    pub fn history(
        &self,
        participant: Option<&str>,
        kind: Option<MessageKind>,
        limit: usize,
    ) -> Vec<ChannelMessage> {
        let history = self.history.lock();
        let mut matching: Vec<ChannelMessage> = history
            .iter()
            .rev()
            .filter(|m| participant.map_or(true, |p| m.involves(p)))
            .filter(|m| kind.map_or(true, |k| m.kind == k))
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn statistics(&self) -> ChannelStatistics {
        let mailboxes = self.mailboxes.read();
        ChannelStatistics {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            mailboxes: mailboxes.len(),
            subscriptions: self.subscriptions.read().values().map(BTreeSet::len).sum(),
            pending: mailboxes.values().map(|m| m.len()).sum(),
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}
