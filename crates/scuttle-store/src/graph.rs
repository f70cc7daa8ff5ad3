//! Contact edges and the hop-bounded social graph built from them.

use std::collections::{BTreeSet, HashMap, HashSet};

use scuttle_shared::FeedRef;

use crate::ban_list::BanListRepository;
use crate::error::{Result, StoreError};
use crate::kv::Kv;
use crate::models::{ContactState, Hops, SocialGraph};

const GRAPH: &str = "graph";

/// `graph/<authorRef>/<targetRef> -> {following, blocking}`
#[derive(Clone, Copy)]
pub struct SocialGraphRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> SocialGraphRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    /// Load the edge `author -> target` (default: neither following nor
    /// blocking), apply `update` and store the result.
    pub fn update_contact(
        &self,
        author: &FeedRef,
        target: &FeedRef,
        update: impl FnOnce(&mut ContactState),
    ) -> Result<ContactState> {
        let author_key = author.to_string();
        let target_key = target.to_string();
        let bucket = [GRAPH, author_key.as_str()];

        let mut state = match self.kv.get(&bucket, target_key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ContactState::default(),
        };
        update(&mut state);
        self.kv
            .put(&bucket, target_key.as_bytes(), &serde_json::to_vec(&state)?)?;
        Ok(state)
    }

    /// Outgoing edges of `node`, sorted by target.
    pub fn get_contacts(&self, node: &FeedRef) -> Result<Vec<(FeedRef, ContactState)>> {
        let node_key = node.to_string();
        self.kv
            .list(&[GRAPH, node_key.as_str()])?
            .into_iter()
            .map(|(key, value)| -> Result<(FeedRef, ContactState)> {
                let target: FeedRef = std::str::from_utf8(&key)
                    .map_err(|e| StoreError::Invariant(format!("graph key: {e}")))?
                    .parse()?;
                Ok((target, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    /// Remove every edge authored by `author`.
    pub fn remove(&self, author: &FeedRef) -> Result<()> {
        let author_key = author.to_string();
        self.kv.delete_bucket(&[GRAPH, author_key.as_str()])
    }

    pub fn get_social_graph(&self, local: &FeedRef, max_hops: Hops) -> Result<SocialGraph> {
        let ban_list = BanListRepository::new(self.kv);
        build_social_graph(
            local,
            max_hops,
            |node| self.get_contacts(node),
            |feed| ban_list.contains_feed(feed),
        )
    }
}

/// Breadth-first walk from `local` over followed edges.
///
/// Levels are expanded in full before the next one starts, so every node is
/// recorded with its minimal hop count no matter in which order neighbours are
/// returned. Nodes blocked by `local` are never included nor expanded.
pub fn build_social_graph(
    local: &FeedRef,
    max_hops: Hops,
    mut contacts: impl FnMut(&FeedRef) -> Result<Vec<(FeedRef, ContactState)>>,
    mut is_banned: impl FnMut(&FeedRef) -> Result<bool>,
) -> Result<SocialGraph> {
    let local_contacts = contacts(local)?;
    let excluded: HashSet<FeedRef> = local_contacts
        .iter()
        .filter(|(_, state)| state.blocking)
        .map(|(target, _)| *target)
        .collect();

    let mut hops: HashMap<FeedRef, Hops> = HashMap::new();
    hops.insert(*local, 0);

    let mut frontier: BTreeSet<FeedRef> = BTreeSet::new();
    frontier.insert(*local);
    let mut cached_local = Some(local_contacts);

    for depth in 1..=max_hops {
        let mut next = BTreeSet::new();
        for node in &frontier {
            let edges = if node == local {
                cached_local.take().unwrap_or_default()
            } else {
                contacts(node)?
            };
            for (target, state) in edges {
                if !state.following || state.blocking {
                    continue;
                }
                if excluded.contains(&target) || hops.contains_key(&target) {
                    continue;
                }
                if is_banned(&target)? {
                    continue;
                }
                hops.insert(target, depth);
                next.insert(target);
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    Ok(SocialGraph::from_map(hops))
}
