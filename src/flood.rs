use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxBuildHasher;

/// Identity of a repeated query: the datagram minus its transaction id, plus
/// the sender's IP. Retransmissions with fresh ids still collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FloodKey {
    body: Bytes,
    client: IpAddr,
}

impl FloodKey {
    pub fn new(packet: &[u8], client: IpAddr) -> Self {
        let body = packet.get(2..).unwrap_or_default();
        Self {
            body: Bytes::copy_from_slice(body),
            client,
        }
    }

    pub fn client(&self) -> IpAddr {
        self.client
    }
}

#[derive(Debug, Clone, Copy)]
struct QueryHistory {
    count: u32,
    first_seen: Instant,
}

/// Per-client throttle for identical queries inside a sliding window.
pub struct FloodGuard {
    history: DashMap<FloodKey, QueryHistory, FxBuildHasher>,
    window: Duration,
    max_repeats: u32,
}

impl FloodGuard {
    pub fn new(window: Duration, max_repeats: u32) -> Self {
        Self {
            history: DashMap::with_hasher(FxBuildHasher::default()),
            window,
            max_repeats,
        }
    }

    /// Records one occurrence of `key` and reports whether it may be
    /// answered. Once `max_repeats` occurrences have been seen inside the
    /// window every further one is refused, and the count keeps growing.
    pub fn admit(&self, key: FloodKey, now: Instant) -> bool {
        match self.history.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(QueryHistory {
                    count: 1,
                    first_seen: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let history = slot.get_mut();
                if now.saturating_duration_since(history.first_seen) >= self.window {
                    *history = QueryHistory {
                        count: 1,
                        first_seen: now,
                    };
                    return true;
                }
                history.count = history.count.saturating_add(1);
                history.count <= self.max_repeats
            }
        }
    }

    /// Drops every counter whose window has passed. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.history.len();
        self.history
            .retain(|_, history| now.saturating_duration_since(history.first_seen) <= self.window);
        before.saturating_sub(self.history.len())
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }
}
