//! Nonce replay cache, scoped to one key epoch.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::{EpochTime, NONCE_SIZE};

/// Remembers every nonce observed during the current key epoch and
/// rejects repeats. The set is cleared whenever the epoch tag changes.
pub struct NonceCache {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    epoch: EpochTime,
    seen: HashSet<[u8; NONCE_SIZE]>,
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                epoch: EpochTime::default(),
                seen: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// True exactly when `nonce` has not been seen in epoch `t`; a true
    /// result records the nonce.
    pub fn verify(&self, nonce: &[u8; NONCE_SIZE], t: EpochTime) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != t {
            let capacity = inner.capacity;
            inner.epoch = t;
            inner.seen = HashSet::with_capacity(capacity);
        }
        inner.seen.insert(*nonce)
    }
}
