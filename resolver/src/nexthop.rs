// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracked next hops and the paths that depend on them.
//!
//! A [`ResolverNexthop`] exists for every distinct next hop address
//! some resolution-flagged path points at. It is refcounted by the
//! paths using it and owns the condition listener registered for its
//! host prefix. Teardown is deferred: a next hop with no users moves
//! to `PendingUnregister` while the listener teardown is in flight and
//! only becomes `Reclaimable` once the table acknowledges it. A next
//! hop re-acquired while pending is re-registered instead of
//! reclaimed.

use common::lock;
use rtb::{ListenerId, Prefix, ResolvingSnapshot};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub type NexthopKey = Prefix;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NexthopState {
    /// In use, or idle with no teardown in flight.
    Active,
    /// Listener teardown requested, acknowledgment outstanding.
    PendingUnregister,
    /// Acknowledged; the registry entry may be dropped.
    Reclaimable,
}

pub struct ResolverNexthop {
    pub key: NexthopKey,
    /// Partition owning this next hop's bookkeeping, derived from the
    /// key. All state transitions happen on that partition's task.
    pub partition: usize,
    refcount: AtomicUsize,
    state: Mutex<NexthopState>,
    snapshot: RwLock<Option<ResolvingSnapshot>>,
    generation: AtomicU64,
    listener: Mutex<Option<ListenerId>>,
    paths: Mutex<BTreeMap<u64, Arc<ResolverPath>>>,
}

impl ResolverNexthop {
    pub fn new(key: NexthopKey, partition: usize) -> Self {
        Self {
            key,
            partition,
            refcount: AtomicUsize::new(0),
            state: Mutex::new(NexthopState::Active),
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
            listener: Mutex::new(None),
            paths: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn state(&self) -> NexthopState {
        *lock!(self.state)
    }

    pub fn set_state(&self, state: NexthopState) {
        *lock!(self.state) = state;
    }

    pub fn acquire(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference, returning the count that remains.
    pub fn release(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<ResolvingSnapshot> {
        common::read_lock!(self.snapshot).clone()
    }

    /// Replace the resolving state wholesale and bump the generation.
    pub fn set_snapshot(&self, snapshot: Option<ResolvingSnapshot>) -> u64 {
        *common::write_lock!(self.snapshot) = snapshot;
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn listener(&self) -> Option<ListenerId> {
        *lock!(self.listener)
    }

    pub fn set_listener(&self, id: ListenerId) {
        *lock!(self.listener) = Some(id);
    }

    pub fn take_listener(&self) -> Option<ListenerId> {
        lock!(self.listener).take()
    }

    pub fn link_path(&self, path: Arc<ResolverPath>) {
        lock!(self.paths).insert(path.id, path);
    }

    pub fn unlink_path(&self, id: u64) {
        lock!(self.paths).remove(&id);
    }

    /// The dependent paths at this instant, in id order.
    pub fn dependent_paths(&self) -> Vec<Arc<ResolverPath>> {
        lock!(self.paths).values().cloned().collect()
    }
}

/// One incarnation of resolution for one unresolved path. A fresh
/// incarnation (with a fresh id) is minted every time resolution
/// starts for a path, so deferred work for an old incarnation cannot
/// be confused with work for its successor.
pub struct ResolverPath {
    pub id: u64,
    pub prefix: Prefix,
    /// Peer that originated the unresolved path. Together with a
    /// forwarding next hop address this identifies a resolved path.
    pub peer: IpAddr,
    /// Partition owning `prefix` in the table.
    pub partition: usize,
    pub nexthop: Arc<ResolverNexthop>,
    stopped: AtomicBool,
}

impl ResolverPath {
    pub fn new(
        id: u64,
        prefix: Prefix,
        peer: IpAddr,
        partition: usize,
        nexthop: Arc<ResolverNexthop>,
    ) -> Self {
        Self {
            id,
            prefix,
            peer,
            partition,
            nexthop,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The registry of tracked next hops, keyed by host prefix.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<NexthopKey, Arc<ResolverNexthop>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the entry for `key`, taking a reference on it.
    /// Returns the entry and whether it was created by this call.
    pub fn locate(
        &self,
        key: NexthopKey,
        partition: usize,
    ) -> (Arc<ResolverNexthop>, bool) {
        let mut entries = lock!(self.entries);
        let (nexthop, created) = match entries.get(&key) {
            Some(nh) => (nh.clone(), false),
            None => {
                let nh = Arc::new(ResolverNexthop::new(key, partition));
                entries.insert(key, nh.clone());
                (nh, true)
            }
        };
        nexthop.acquire();
        (nexthop, created)
    }

    pub fn get(&self, key: &NexthopKey) -> Option<Arc<ResolverNexthop>> {
        lock!(self.entries).get(key).cloned()
    }

    /// Drop the entry for `key` if nothing references it, returning
    /// whether the entry is now gone. The refcount check and the
    /// removal happen under the entries lock, the same lock `locate`
    /// acquires references under, so an entry observed unreferenced
    /// here cannot gain a user before it leaves the registry. An entry
    /// is marked `Reclaimable` only on this path, so `locate` never
    /// hands out a reclaimed entry.
    pub fn remove_if_unreferenced(&self, key: &NexthopKey) -> bool {
        let mut entries = lock!(self.entries);
        let Some(nexthop) = entries.get(key) else {
            return true;
        };
        if nexthop.refcount() > 0 {
            return false;
        }
        nexthop.set_state(NexthopState::Reclaimable);
        entries.remove(key);
        true
    }

    pub fn len(&self) -> usize {
        lock!(self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
