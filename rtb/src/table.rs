// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partitioned in-memory route table.
//!
//! Routes are sharded across [`PARTITION_COUNT`] partitions by prefix
//! hash. Mutations go through the asynchronous request interface
//! [`Table::enqueue`]; lookups through the synchronous [`Table::find`].
//! Two notification paths hang off the table:
//!
//! - Per-partition input callbacks, installed once with
//!   [`Table::watch`], fire after every applied mutation.
//!
//! - Condition listeners, registered per exact prefix with
//!   [`Table::register`], fire when the resolving state of the watched
//!   prefix appears, changes, or disappears. Unregistration is
//!   acknowledged asynchronously through the same callback with a
//!   final `Unregistered` event, after which no further events for
//!   that listener are delivered.

use crate::error::Error;
use crate::log::rtb_log;
use crate::types::*;
use crate::PARTITION_COUNT;
use common::lock;
use slog::Logger;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

pub type InputCallback = Arc<dyn Fn(InputEvent) + Send + Sync>;
pub type ConditionCallback = Arc<dyn Fn(ConditionEvent) + Send + Sync>;

struct CondListener {
    prefix: Prefix,
    callback: ConditionCallback,
    /// The resolving state last delivered. Decides Match vs Change vs
    /// Delete on the next evaluation; evaluations that leave it
    /// unchanged deliver nothing.
    last: Option<ResolvingSnapshot>,
}

#[derive(Default)]
struct CondState {
    next_id: u64,
    listeners: BTreeMap<u64, CondListener>,
}

pub struct Table {
    pub name: String,
    pub family: AddressFamily,
    partitions: Vec<Mutex<BTreeMap<Prefix, RouteEntry>>>,
    input_callbacks: RwLock<Vec<InputCallback>>,
    cond: Mutex<CondState>,
    log: Logger,
}

impl Table {
    pub fn new(name: &str, family: AddressFamily, log: Logger) -> Arc<Self> {
        let partitions =
            (0..PARTITION_COUNT).map(|_| Mutex::new(BTreeMap::new())).collect();
        Arc::new(Self {
            name: name.into(),
            family,
            partitions,
            input_callbacks: RwLock::new(Vec::new()),
            cond: Mutex::new(CondState::default()),
            log,
        })
    }

    pub fn partition_of(prefix: &Prefix) -> usize {
        let mut h = DefaultHasher::new();
        prefix.hash(&mut h);
        (h.finish() as usize) % PARTITION_COUNT
    }

    /// Install the per-partition input callbacks, one per partition.
    /// Call once, before mutations begin.
    pub fn watch(&self, callbacks: Vec<InputCallback>) {
        let mut cbs = common::write_lock!(self.input_callbacks);
        assert_eq!(callbacks.len(), PARTITION_COUNT);
        *cbs = callbacks;
    }

    pub fn find(&self, prefix: &Prefix) -> Option<RouteEntry> {
        let part = lock!(self.partitions[Self::partition_of(prefix)]);
        part.get(prefix).cloned()
    }

    /// Apply a mutation. The mutation is applied inline under the
    /// owning partition lock; notifications are delivered after the
    /// lock is dropped, on the caller's thread.
    pub fn enqueue(&self, request: TableRequest) -> Result<(), Error> {
        match request {
            TableRequest::AddChange { prefix, path } => {
                self.check_family(&prefix)?;
                let pid = Self::partition_of(&prefix);
                let source = path.source;
                let nexthop = path.attrs.nexthop;
                let resolve = path.resolve;
                let op = {
                    let mut part = lock!(self.partitions[pid]);
                    let entry = part
                        .entry(prefix)
                        .or_insert_with(|| RouteEntry::new(prefix));
                    let op = if entry.paths.contains_key(&source) {
                        InputOp::Change
                    } else {
                        InputOp::Add
                    };
                    entry.paths.insert(source, path);
                    op
                };
                self.notify_input(InputEvent {
                    partition: pid,
                    prefix,
                    source,
                    nexthop,
                    resolve,
                    op,
                });
                self.notify_condition(&prefix);
            }
            TableRequest::Delete { prefix, source } => {
                self.check_family(&prefix)?;
                let pid = Self::partition_of(&prefix);
                let removed = {
                    let mut part = lock!(self.partitions[pid]);
                    let Some(entry) = part.get_mut(&prefix) else {
                        rtb_log!(self, debug,
                            "delete for absent prefix {}", prefix);
                        return Ok(());
                    };
                    let removed = entry.paths.remove(&source);
                    if entry.paths.is_empty() {
                        part.remove(&prefix);
                    }
                    removed
                };
                let Some(removed) = removed else {
                    rtb_log!(self, debug,
                        "delete for absent path on {}", prefix);
                    return Ok(());
                };
                self.notify_input(InputEvent {
                    partition: pid,
                    prefix,
                    source,
                    nexthop: removed.attrs.nexthop,
                    resolve: removed.resolve,
                    op: InputOp::Delete,
                });
                self.notify_condition(&prefix);
            }
        }
        Ok(())
    }

    /// Register a condition listener for an exact prefix. If the
    /// prefix is already usable as a resolving route a `Match` event
    /// is delivered before this returns.
    pub fn register(
        &self,
        prefix: Prefix,
        callback: ConditionCallback,
    ) -> Result<ListenerId, Error> {
        self.check_family(&prefix)?;
        let mut cond = lock!(self.cond);
        let id = cond.next_id;
        cond.next_id += 1;
        let snapshot =
            self.find(&prefix).and_then(|e| e.resolving_snapshot());
        let listener = CondListener {
            prefix,
            callback: callback.clone(),
            last: snapshot.clone(),
        };
        if let Some(s) = snapshot {
            (callback)(ConditionEvent {
                key: prefix,
                kind: ConditionEventKind::Match(s),
            });
        }
        cond.listeners.insert(id, listener);
        rtb_log!(self, trace, "registered {} for {}", ListenerId(id), prefix);
        Ok(ListenerId(id))
    }

    /// Tear down a condition listener. The teardown is acknowledged
    /// with a final `Unregistered` event through the listener's own
    /// callback; no events for the listener follow it.
    pub fn unregister(&self, id: ListenerId) {
        let removed = {
            let mut cond = lock!(self.cond);
            cond.listeners.remove(&id.0)
        };
        let Some(listener) = removed else {
            rtb_log!(self, warn, "unregister for unknown {}", id);
            return;
        };
        (listener.callback)(ConditionEvent {
            key: listener.prefix,
            kind: ConditionEventKind::Unregistered,
        });
        rtb_log!(self, trace, "unregistered {} for {}", id, listener.prefix);
    }

    fn check_family(&self, prefix: &Prefix) -> Result<(), Error> {
        if prefix.family() != self.family {
            return Err(Error::Family(format!(
                "{} table {} cannot hold {}",
                self.family, self.name, prefix,
            )));
        }
        Ok(())
    }

    fn notify_input(&self, event: InputEvent) {
        let cbs = common::read_lock!(self.input_callbacks);
        if let Some(cb) = cbs.get(event.partition) {
            (cb)(event);
        }
    }

    fn notify_condition(&self, prefix: &Prefix) {
        let snapshot =
            self.find(prefix).and_then(|e| e.resolving_snapshot());
        let mut cond = lock!(self.cond);
        for listener in cond.listeners.values_mut() {
            if listener.prefix != *prefix {
                continue;
            }
            if listener.last == snapshot {
                continue;
            }
            let kind = match (&listener.last, &snapshot) {
                (None, Some(s)) => ConditionEventKind::Match(s.clone()),
                (Some(_), Some(s)) => ConditionEventKind::Change(s.clone()),
                (Some(_), None) => ConditionEventKind::Delete,
                (None, None) => continue,
            };
            listener.last = snapshot.clone();
            (listener.callback)(ConditionEvent { key: *prefix, kind });
        }
    }
}
