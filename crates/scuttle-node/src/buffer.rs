//! Staging area between gossip and the feed store.
//!
//! Peers deliver messages per feed and not necessarily in order. Messages
//! wait here until the feed's stored tip catches up with them, and are
//! appended in batches, one transaction per persist attempt. Messages that
//! never become contiguous are dropped after a while.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scuttle_net::PubSub;
use scuttle_shared::{FeedRef, Message};
use scuttle_store::{Database, Hops, StoreError};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Buffered message count that triggers an early persist.
    pub persist_threshold: usize,
    pub persist_every: Duration,
    /// Age after which a message that could not be persisted is dropped.
    pub leave_unpersisted_for: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            persist_threshold: 1000,
            persist_every: Duration::from_secs(5),
            leave_unpersisted_for: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
struct Pending {
    received_at: Instant,
    message: Message,
}

type PendingFeeds = HashMap<FeedRef, Vec<Pending>>;

pub struct MessageBuffer {
    db: Arc<Database>,
    local: FeedRef,
    hops: Hops,
    config: BufferConfig,
    /// Per feed, sorted by sequence without duplicates.
    feeds: Mutex<PendingFeeds>,
    persist_now: Notify,
    persisted: Arc<PubSub<Message>>,
}

impl MessageBuffer {
    /// `persisted` receives every message once its transaction committed.
    pub fn new(
        db: Arc<Database>,
        local: FeedRef,
        hops: Hops,
        config: BufferConfig,
        persisted: Arc<PubSub<Message>>,
    ) -> Self {
        Self {
            db,
            local,
            hops,
            config,
            feeds: Mutex::new(HashMap::new()),
            persist_now: Notify::new(),
            persisted,
        }
    }

    fn feeds(&self) -> MutexGuard<'_, PendingFeeds> {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stage a verified message.
    pub fn handle(&self, message: Message) {
        let total = {
            let mut feeds = self.feeds();
            let pending = feeds.entry(message.feed).or_default();
            match pending.binary_search_by_key(&message.sequence, |p| p.message.sequence) {
                Ok(_) => return,
                Err(index) => pending.insert(
                    index,
                    Pending {
                        received_at: Instant::now(),
                        message,
                    },
                ),
            }
            feeds.values().map(Vec::len).sum::<usize>()
        };
        if total > self.config.persist_threshold {
            self.persist_now.notify_one();
        }
    }

    /// Number of buffered messages across all feeds.
    pub fn len(&self) -> usize {
        self.feeds().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence `feed` will reach once the buffered messages following
    /// `stored` are persisted.
    pub fn contiguous_sequence(&self, feed: &FeedRef, stored: u64) -> u64 {
        let feeds = self.feeds();
        let Some(pending) = feeds.get(feed) else {
            return stored;
        };
        let mut sequence = stored;
        for p in pending.iter().skip_while(|p| p.message.sequence <= stored) {
            if p.message.sequence != sequence + 1 {
                break;
            }
            sequence += 1;
        }
        sequence
    }

    /// Persist on every tick or threshold signal until `cancel` fires, then
    /// persist one last time.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.persist_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.persist_now.notified() => {}
            }
            self.persist_and_cleanup();
        }

        if let Err(e) = self.persist() {
            warn!(error = %e, "final persist of buffered messages failed");
        }
        info!(dropped = self.len(), "message buffer stopped");
    }

    fn persist_and_cleanup(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "persisting buffered messages failed");
        }
        self.cleanup(Instant::now());
    }

    /// Append every buffered run that continues a stored feed, in one
    /// transaction. Returns how many messages were persisted.
    ///
    /// Messages of banned feeds are discarded and reported as
    /// [`StoreError::Banned`] once the other feeds are committed.
    pub fn persist(&self) -> Result<usize, StoreError> {
        let snapshot: Vec<(FeedRef, Vec<Message>)> = self
            .feeds()
            .iter()
            .map(|(feed, pending)| (*feed, pending.iter().map(|p| p.message.clone()).collect()))
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let (persisted, tips, banned) = self.db.transact(|tx| {
            let graph = tx.graph.get_social_graph(&self.local, self.hops)?;
            let mut persisted = Vec::new();
            let mut tips = HashMap::new();
            let mut banned = Vec::new();

            for (feed, messages) in &snapshot {
                if tx.ban_list.contains_feed(feed)? {
                    tips.insert(*feed, u64::MAX);
                    banned.push(*feed);
                    continue;
                }
                if !graph.contains(feed) && !tx.feed_want_list.contains(feed)? {
                    continue;
                }

                let stored = tx.feeds.tip(feed)?.map_or(0, |t| t.sequence);
                let run = contiguous_run(messages, stored);
                if run.is_empty() {
                    tips.insert(*feed, stored);
                    continue;
                }

                let appended = tx.feeds.update_feed(feed, |f| {
                    for message in run {
                        if let Err(e) = f.append(message.clone()) {
                            debug!(
                                feed = %feed,
                                sequence = message.sequence,
                                error = %e,
                                "buffered message does not extend the feed"
                            );
                            break;
                        }
                    }
                    Ok(())
                })?;
                tips.insert(*feed, appended.last().map_or(stored, |m| m.sequence));
                persisted.extend(appended);
            }
            Ok((persisted, tips, banned))
        })?;

        {
            let mut feeds = self.feeds();
            for (feed, tip) in &tips {
                if let Some(pending) = feeds.get_mut(feed) {
                    pending.retain(|p| p.message.sequence > *tip);
                    if pending.is_empty() {
                        feeds.remove(feed);
                    }
                }
            }
        }

        let count = persisted.len();
        if count > 0 {
            debug!(count, "persisted buffered messages");
        }
        for message in persisted {
            self.persisted.publish(message);
        }

        for feed in &banned {
            warn!(feed = %feed, "discarded buffered messages of banned feed");
        }
        match banned.first() {
            Some(feed) => Err(StoreError::Banned(*feed)),
            None => Ok(count),
        }
    }

    /// Drop messages received before `now - leave_unpersisted_for`.
    pub fn cleanup(&self, now: Instant) {
        let ttl = self.config.leave_unpersisted_for;
        let mut feeds = self.feeds();
        let mut dropped = 0;
        feeds.retain(|_, pending| {
            let before = pending.len();
            pending.retain(|p| now.saturating_duration_since(p.received_at) < ttl);
            dropped += before - pending.len();
            !pending.is_empty()
        });
        if dropped > 0 {
            debug!(dropped, "dropped stale buffered messages");
        }
    }
}

/// The longest prefix of `messages` (sorted, unique) that continues a feed
/// whose stored tip is `stored`.
fn contiguous_run(messages: &[Message], stored: u64) -> &[Message] {
    let start = messages.partition_point(|m| m.sequence <= stored);
    let mut end = start;
    let mut expected = stored + 1;
    while end < messages.len() && messages[end].sequence == expected {
        end += 1;
        expected += 1;
    }
    &messages[start..end]
}
