// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! User routing cache: radio id of a heard user mapped to the endpoint it
//! was last heard through.
//!
//! Feeds private-call routing so a private call goes only to the one
//! endpoint known to reach the destination radio instead of flooding every
//! peer. Entries expire after a TTL (default 10 minutes); expired entries
//! are evicted lazily on lookup and in bulk by the periodic sweep.

use crate::protocol::Slot;
use crate::server::stream::TargetId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// One heard user.
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub target: TargetId,
    pub slot: Slot,
    pub talkgroup: u32,
    pub last_heard: Instant,
}

/// TTL map of recently heard users.
#[derive(Debug)]
pub struct UserCache {
    entries: HashMap<u32, UserEntry>,
    ttl: Duration,
}

impl UserCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Upsert a user sighting and refresh its TTL.
    pub fn update(&mut self, radio_id: u32, target: TargetId, slot: Slot, talkgroup: u32, now: Instant) {
        self.entries.insert(
            radio_id,
            UserEntry {
                target,
                slot,
                talkgroup,
                last_heard: now,
            },
        );
    }

    /// Look up a user, evicting the entry if it has expired.
    pub fn lookup(&mut self, radio_id: u32, now: Instant) -> Option<&UserEntry> {
        let expired = match self.entries.get(&radio_id) {
            Some(entry) => now.duration_since(entry.last_heard) > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(&radio_id);
            debug!(radio_id, "evicted expired user cache entry");
            return None;
        }
        self.entries.get(&radio_id)
    }

    /// The endpoint a private call to `radio_id` should be routed to.
    pub fn peer_for(&mut self, radio_id: u32, now: Instant) -> Option<TargetId> {
        self.lookup(radio_id, now).map(|entry| entry.target)
    }

    /// Bulk-evict expired entries. Returns the number removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_heard) <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn test_update_and_lookup() {
        let now = Instant::now();
        let mut cache = UserCache::new(TTL);
        cache.update(3106000, TargetId::Peer(312345), Slot::Ts2, 3100, now);

        let entry = cache.lookup(3106000, now).unwrap();
        assert_eq!(entry.target, TargetId::Peer(312345));
        assert_eq!(entry.slot, Slot::Ts2);
        assert_eq!(entry.talkgroup, 3100);
    }

    #[test]
    fn test_update_moves_user() {
        let now = Instant::now();
        let mut cache = UserCache::new(TTL);
        cache.update(3106000, TargetId::Peer(312345), Slot::Ts2, 3100, now);
        cache.update(3106000, TargetId::Peer(312346), Slot::Ts1, 3101, now);

        let entry = cache.lookup(3106000, now).unwrap();
        assert_eq!(entry.target, TargetId::Peer(312346));
        assert_eq!(entry.slot, Slot::Ts1);
        assert_eq!(entry.talkgroup, 3101);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lazy_expiry_on_lookup() {
        let now = Instant::now();
        let mut cache = UserCache::new(Duration::from_secs(1));
        cache.update(3106000, TargetId::Peer(312345), Slot::Ts2, 3100, now);

        assert!(cache.lookup(3106000, now).is_some());
        assert!(cache
            .lookup(3106000, now + Duration::from_millis(1100))
            .is_none());
        // The expired entry was evicted, not just hidden.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_peer_for_private_routing() {
        let now = Instant::now();
        let mut cache = UserCache::new(TTL);
        cache.update(3106000, TargetId::Outbound(1), Slot::Ts1, 3100, now);

        assert_eq!(cache.peer_for(3106000, now), Some(TargetId::Outbound(1)));
        assert_eq!(cache.peer_for(9999999, now), None);
    }

    #[test]
    fn test_sweep_bulk_evicts() {
        let now = Instant::now();
        let mut cache = UserCache::new(Duration::from_secs(60));
        for i in 0..10 {
            cache.update(3106000 + i, TargetId::Peer(312345), Slot::Ts2, 3100, now);
        }
        for i in 0..5 {
            cache.update(
                3107000 + i,
                TargetId::Peer(312345),
                Slot::Ts2,
                3100,
                now + Duration::from_secs(120),
            );
        }

        let removed = cache.sweep(now + Duration::from_secs(150));
        assert_eq!(removed, 10);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_refresh_extends_ttl() {
        let now = Instant::now();
        let mut cache = UserCache::new(Duration::from_secs(10));
        cache.update(3106000, TargetId::Peer(1), Slot::Ts1, 9, now);
        cache.update(
            3106000,
            TargetId::Peer(1),
            Slot::Ts1,
            9,
            now + Duration::from_secs(8),
        );
        assert!(cache
            .lookup(3106000, now + Duration::from_secs(15))
            .is_some());
    }
}
