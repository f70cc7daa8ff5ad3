use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use scuttle_shared::FeedRef;

/// Round-robin over feeds, always picking the one attempted longest ago.
/// Feeds never attempted come first.
#[derive(Debug, Default)]
pub struct FeedScheduler {
    last_attempt: HashMap<FeedRef, Instant>,
}

impl FeedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the next feed among `candidates` and record the attempt.
    pub fn next(&mut self, candidates: &[FeedRef], now: Instant) -> Option<FeedRef> {
        let current: HashSet<&FeedRef> = candidates.iter().collect();
        self.last_attempt.retain(|feed, _| current.contains(feed));

        let feed = *candidates
            .iter()
            .min_by_key(|feed| (self.last_attempt.get(*feed).copied(), **feed))?;
        self.last_attempt.insert(feed, now);
        Some(feed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use scuttle_shared::Identity;

    #[test]
    fn test_round_robin_prefers_oldest_attempt() {
        let mut feeds: Vec<FeedRef> = (0..3).map(|_| Identity::generate().feed()).collect();
        feeds.sort();
        let mut scheduler = FeedScheduler::new();
        let t0 = Instant::now();

        let picked: Vec<_> = (0..6)
            .map(|i| {
                scheduler
                    .next(&feeds, t0 + Duration::from_secs(i))
                    .unwrap()
            })
            .collect();
        assert_eq!(&picked[..3], &feeds[..]);
        assert_eq!(&picked[3..], &feeds[..]);
    }

    #[test]
    fn test_new_candidates_go_first() {
        let a = Identity::generate().feed();
        let b = Identity::generate().feed();
        let mut scheduler = FeedScheduler::new();
        let t0 = Instant::now();

        assert_eq!(scheduler.next(&[a], t0), Some(a));
        assert_eq!(scheduler.next(&[a, b], t0 + Duration::from_secs(1)), Some(b));
        assert_eq!(scheduler.next(&[], t0), None);
    }
}
