//! A size-bounded lookup cache in front of the `PaymentBag` preimage table
//! (§9 design note). Both Core B FSMs read through this rather than calling
//! the persistence bag inline, since an FSM transition never awaits I/O
//! (§5): the driving loop keeps the cache warm by feeding writes through
//! [`PreimageCache::insert`] whenever it durably persists a preimage via
//! `PaymentBag::set_preimage`, and the FSMs only ever take the synchronous
//! read path.
//!
//! Invalidation is explicit, on write, exactly as the design note asks --
//! there is no background expiry thread. Capacity is enforced by evicting
//! the oldest insertion once the bound is reached, same shape as any plain
//! bounded LRU, but without pulling in an external crate for something this
//! small.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use lightning::ln::{PaymentHash, PaymentPreimage};

struct Inner {
    capacity: usize,
    entries: HashMap<PaymentHash, PaymentPreimage>,
    order: VecDeque<PaymentHash>,
}

/// Cloneable handle onto one shared, bounded preimage cache.
#[derive(Clone)]
pub struct PreimageCache(Arc<Mutex<Inner>>);

impl PreimageCache {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(Inner {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        })))
    }

    pub fn get(&self, hash: PaymentHash) -> Option<PaymentPreimage> {
        self.0.lock().unwrap().entries.get(&hash).copied()
    }

    pub fn insert(&self, hash: PaymentHash, preimage: PaymentPreimage) {
        let mut inner = self.0.lock().unwrap();
        if inner.entries.insert(hash, preimage).is_none() {
            inner.order.push_back(hash);
            if inner.order.len() > inner.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash(byte: u8) -> PaymentHash {
        PaymentHash([byte; 32])
    }

    fn preimage(byte: u8) -> PaymentPreimage {
        PaymentPreimage([byte; 32])
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = PreimageCache::new(4);
        cache.insert(hash(1), preimage(1));
        assert_eq!(cache.get(hash(1)), Some(preimage(1)));
    }

    #[test]
    fn miss_returns_none() {
        let cache = PreimageCache::new(4);
        assert_eq!(cache.get(hash(9)), None);
    }

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let cache = PreimageCache::new(2);
        cache.insert(hash(1), preimage(1));
        cache.insert(hash(2), preimage(2));
        cache.insert(hash(3), preimage(3));
        assert_eq!(cache.get(hash(1)), None);
        assert_eq!(cache.get(hash(2)), Some(preimage(2)));
        assert_eq!(cache.get(hash(3)), Some(preimage(3)));
    }
}
