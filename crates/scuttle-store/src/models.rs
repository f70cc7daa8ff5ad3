//! Records persisted as JSON values inside buckets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use scuttle_shared::message::PubAddress;
use scuttle_shared::{FeedRef, Message, MessageRef};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Social graph
// ---------------------------------------------------------------------------

/// State of one directed contact edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactState {
    pub following: bool,
    pub blocking: bool,
}

/// Graph distance from the local identity.
pub type Hops = u32;

/// Identities reachable from the local identity with their minimal hops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocialGraph {
    hops: HashMap<FeedRef, Hops>,
}

impl SocialGraph {
    pub(crate) fn from_map(hops: HashMap<FeedRef, Hops>) -> Self {
        Self { hops }
    }

    pub fn contains(&self, feed: &FeedRef) -> bool {
        self.hops.contains_key(feed)
    }

    pub fn hops_of(&self, feed: &FeedRef) -> Option<Hops> {
        self.hops.get(feed).copied()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Entries ordered by hops, then by reference.
    pub fn list(&self) -> Vec<(FeedRef, Hops)> {
        let mut entries: Vec<_> = self.hops.iter().map(|(f, h)| (*f, *h)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn as_map(&self) -> &HashMap<FeedRef, Hops> {
        &self.hops
    }
}

// ---------------------------------------------------------------------------
// Ban list
// ---------------------------------------------------------------------------

/// Reverse mapping from a ban hash to the ref it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanMapping {
    pub typ: BannableType,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannableType {
    Feed,
}

// ---------------------------------------------------------------------------
// Pubs
// ---------------------------------------------------------------------------

/// A pub announcement found in some feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubRecord {
    pub author: FeedRef,
    pub message: MessageRef,
    pub address: PubAddress,
}

// ---------------------------------------------------------------------------
// Receive log
// ---------------------------------------------------------------------------

/// A message together with its receive-log position.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub sequence: u64,
    pub message: Message,
}

/// A want-list entry that has not expired yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantListEntry<R> {
    pub reference: R,
    pub until: DateTime<Utc>,
}
