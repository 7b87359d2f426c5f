//! The process-wide current block height.
//!
//! Per the source design notes, `blockCount` is one of only two primitives
//! shared *synchronously* across every FSM in the workspace (the other is
//! `lastDisconnect`, owned by the wallet's connection loop) -- everything
//! else flows through message passing. Modeled the same way the teacher
//! tracks its background fee estimates: a cloneable handle around an
//! `Arc<AtomicU32>`, read with `Ordering::Relaxed` since it's advisory
//! bookkeeping (CLTV comparisons), not a synchronization point.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct BlockCount(Arc<AtomicU32>);

impl BlockCount {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the current height. Monotonic in practice (the wallet FSM never
    /// observes a lower tip without first disconnecting), but this does not
    /// itself enforce that -- it's a plain store.
    pub fn set(&self, height: u32) {
        self.0.store(height, Ordering::Relaxed);
    }
}

impl Default for BlockCount {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let count = BlockCount::new(0);
        count.set(700_000);
        assert_eq!(count.get(), 700_000);
    }

    #[test]
    fn clones_share_the_same_counter() {
        let count = BlockCount::new(10);
        let clone = count.clone();
        clone.set(20);
        assert_eq!(count.get(), 20);
    }
}
