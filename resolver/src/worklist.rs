// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coalescing FIFO worklists.
//!
//! Each list keeps at most one entry per key. Re-enqueueing an already
//! queued key replaces its value in place without changing its drain
//! position, so a burst of updates for the same key is processed once,
//! with the latest value.

use common::lock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

struct Inner<K, V> {
    order: VecDeque<K>,
    entries: BTreeMap<K, V>,
}

pub struct WorkList<K: Ord + Clone, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Ord + Clone, V> Default for WorkList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V> WorkList<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Queue `value` under `key`. Returns true if the key was not
    /// already queued.
    pub fn enqueue(&self, key: K, value: V) -> bool {
        let mut inner = lock!(self.inner);
        let fresh = inner.entries.insert(key.clone(), value).is_none();
        if fresh {
            inner.order.push_back(key);
        }
        fresh
    }

    pub fn pop(&self) -> Option<(K, V)> {
        let mut inner = lock!(self.inner);
        let key = inner.order.pop_front()?;
        let value = inner
            .entries
            .remove(&key)
            .expect("worklist entry for queued key");
        Some((key, value))
    }

    pub fn len(&self) -> usize {
        lock!(self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
