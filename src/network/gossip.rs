//! Gossip bookkeeping: which items were already relayed and which ones were
//! requested from whom.

use crate::network::message::Item;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Bounded set of recently seen items; the oldest entry is forgotten first.
pub struct SeenCache {
    capacity: usize,
    items: HashSet<Item>,
    order: VecDeque<Item>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `item`. Returns `false` if it was already present.
    pub fn insert(&mut self, item: Item) -> bool {
        if !self.items.insert(item) {
            return false;
        }
        self.order.push_back(item);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.items.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, item: &Item) -> bool {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outstanding `GetData` requests, one peer per item.
#[derive(Default)]
pub struct InFlight {
    requests: HashMap<Item, (SocketAddr, Instant)>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request of `item` from `peer`. Returns `false` if the item is
    /// already being fetched from someone.
    pub fn request(&mut self, item: Item, peer: SocketAddr, now: Instant) -> bool {
        if self.requests.contains_key(&item) {
            return false;
        }
        self.requests.insert(item, (peer, now));
        true
    }

    /// Completes a request. Returns `false` if `item` was not requested from
    /// `peer`, in which case nothing changes.
    pub fn fulfil(&mut self, item: &Item, peer: SocketAddr) -> bool {
        match self.requests.get(item) {
            Some((asked, _)) if *asked == peer => {
                self.requests.remove(item);
                true
            }
            _ => false,
        }
    }

    /// Drops requests older than `timeout` so the items can be asked again.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.requests.len();
        self.requests
            .retain(|_, (_, sent)| now.saturating_duration_since(*sent) < timeout);
        before - self.requests.len()
    }

    /// Drops every request addressed to `peer`.
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.requests.retain(|_, (asked, _)| *asked != peer);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
