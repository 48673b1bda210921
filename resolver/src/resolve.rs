// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The path resolver.
//!
//! One worker thread per table partition. Each worker receives the
//! table's input events for its partition plus condition events for
//! the next hops whose host prefix hashes to it, parks deferred work
//! in the partition's coalescing worklists, and drains whichever
//! lists are administratively enabled after every message.
//!
//! Resolution state lives in two maps: the next hop registry (one
//! entry per distinct next hop address in use) and the path map (the
//! live resolution incarnation per unresolved path). Starting
//! resolution mints a fresh incarnation; stopping one marks it and
//! queues it so its resolved paths are withdrawn by the partition
//! task rather than inline.

use crate::log::resolver_log;
use crate::materialize;
use crate::nexthop::{
    NexthopKey, NexthopState, Registry, ResolverNexthop, ResolverPath,
};
use crate::worklist::WorkList;
use common::lock;
use rtb::table::{ConditionCallback, InputCallback};
use rtb::{
    ConditionEvent, ConditionEventKind, InputEvent, InputOp, PathSource,
    Prefix, ResolvingSnapshot, Table, TableRequest, PARTITION_COUNT,
};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum WorkMessage {
    Input(InputEvent),
    Condition(ConditionEvent),
    Wake,
    Stop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegOp {
    Register,
    Unregister,
}

#[derive(Default)]
struct PartitionLists {
    reg_unreg: WorkList<NexthopKey, RegOp>,
    nexthop_update: WorkList<NexthopKey, Option<ResolvingSnapshot>>,
    path_update: WorkList<u64, Arc<ResolverPath>>,
}

struct PartitionHandle {
    tx: Sender<WorkMessage>,
    lists: Arc<PartitionLists>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Gates {
    reg_unreg: AtomicBool,
    nexthop_update: AtomicBool,
    path_update: AtomicBool,
}

impl Default for Gates {
    fn default() -> Self {
        Self {
            reg_unreg: AtomicBool::new(true),
            nexthop_update: AtomicBool::new(true),
            path_update: AtomicBool::new(true),
        }
    }
}

pub struct PathResolver {
    pub table: Arc<Table>,
    registry: Registry,
    paths: Mutex<BTreeMap<(Prefix, IpAddr), Arc<ResolverPath>>>,
    partitions: Vec<PartitionHandle>,
    gates: Gates,
    next_path_id: AtomicU64,
    shutting_down: AtomicBool,
    log: Logger,
}

impl PathResolver {
    /// Attach a resolver to `table`. This installs the table's input
    /// callbacks, so there can be only one resolver per table.
    pub fn new(table: Arc<Table>, log: Logger) -> Arc<Self> {
        let mut partitions = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..PARTITION_COUNT {
            let (tx, rx) = channel();
            partitions.push(PartitionHandle {
                tx,
                lists: Arc::new(PartitionLists::default()),
                handle: Mutex::new(None),
            });
            receivers.push(rx);
        }
        let resolver = Arc::new(Self {
            table: table.clone(),
            registry: Registry::new(),
            paths: Mutex::new(BTreeMap::new()),
            partitions,
            gates: Gates::default(),
            next_path_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            log,
        });
        for (pid, rx) in receivers.into_iter().enumerate() {
            let r = resolver.clone();
            let handle = std::thread::spawn(move || r.run_partition(pid, rx));
            *lock!(resolver.partitions[pid].handle) = Some(handle);
        }
        let callbacks: Vec<InputCallback> = resolver
            .partitions
            .iter()
            .map(|p| {
                let tx = p.tx.clone();
                let cb: InputCallback = Arc::new(move |e: InputEvent| {
                    let _ = tx.send(WorkMessage::Input(e));
                });
                cb
            })
            .collect();
        table.watch(callbacks);
        resolver_log!(resolver, info, "path resolver started");
        resolver
    }

    // Worker side.

    fn run_partition(&self, pid: usize, rx: Receiver<WorkMessage>) {
        loop {
            let message = match rx.recv() {
                Ok(m) => m,
                Err(_) => break,
            };
            match message {
                WorkMessage::Input(e) => self.handle_input(e),
                WorkMessage::Condition(e) => self.handle_condition(pid, e),
                WorkMessage::Wake => {}
                WorkMessage::Stop => break,
            }
            self.drain(pid);
        }
    }

    fn handle_input(&self, event: InputEvent) {
        let PathSource::Bgp { peer } = event.source else {
            return;
        };
        match event.op {
            InputOp::Add | InputOp::Change => {
                if event.resolve {
                    self.start_or_update(&event, peer);
                } else {
                    // resolution no longer requested for this path
                    self.stop_if_tracked(event.prefix, peer);
                }
            }
            InputOp::Delete => {
                if event.resolve {
                    self.stop_if_tracked(event.prefix, peer);
                }
            }
        }
    }

    fn start_or_update(&self, event: &InputEvent, peer: IpAddr) {
        let key = NexthopKey::host(event.nexthop);
        let mut paths = lock!(self.paths);
        if let Some(existing) = paths.get(&(event.prefix, peer)) {
            if existing.nexthop.key == key {
                // same next hop, new attributes
                let rp = existing.clone();
                drop(paths);
                self.queue_path_update(rp);
                return;
            }
        }
        let old = paths.remove(&(event.prefix, peer));
        let (nexthop, created) =
            self.registry.locate(key, Table::partition_of(&key));
        let id = self.next_path_id.fetch_add(1, Ordering::SeqCst);
        let rp = Arc::new(ResolverPath::new(
            id,
            event.prefix,
            peer,
            event.partition,
            nexthop.clone(),
        ));
        nexthop.link_path(rp.clone());
        paths.insert((event.prefix, peer), rp.clone());
        drop(paths);
        resolver_log!(self, debug,
            "start resolution of {} via {} (incarnation {})",
            event.prefix, key, id);
        if let Some(old) = old {
            self.stop_incarnation(old);
        }
        if created {
            self.queue_reg_unreg(&nexthop, RegOp::Register);
        } else if nexthop.snapshot().is_some() {
            self.queue_path_update(rp);
        }
    }

    fn stop_if_tracked(&self, prefix: Prefix, peer: IpAddr) {
        let removed = lock!(self.paths).remove(&(prefix, peer));
        if let Some(rp) = removed {
            resolver_log!(self, debug,
                "stop resolution of {} (incarnation {})", prefix, rp.id);
            self.stop_incarnation(rp);
        }
    }

    /// Unlink an incarnation from its next hop and queue it so the
    /// owning partition withdraws its resolved paths. The next hop's
    /// listener teardown is queued once the last user is gone.
    fn stop_incarnation(&self, rp: Arc<ResolverPath>) {
        rp.stop();
        rp.nexthop.unlink_path(rp.id);
        let remaining = rp.nexthop.release();
        let nexthop = rp.nexthop.clone();
        self.queue_path_update(rp);
        if remaining == 0 {
            self.queue_reg_unreg(&nexthop, RegOp::Unregister);
        }
    }

    fn handle_condition(&self, pid: usize, event: ConditionEvent) {
        match event.kind {
            ConditionEventKind::Match(s) | ConditionEventKind::Change(s) => {
                self.partitions[pid]
                    .lists
                    .nexthop_update
                    .enqueue(event.key, Some(s));
            }
            ConditionEventKind::Delete => {
                self.partitions[pid]
                    .lists
                    .nexthop_update
                    .enqueue(event.key, None);
            }
            ConditionEventKind::Unregistered => {
                self.complete_unregister(event.key);
            }
        }
    }

    /// The table acknowledged a listener teardown. If the next hop was
    /// re-acquired while the teardown was in flight, register again;
    /// otherwise the entry is reclaimable and leaves the registry. The
    /// reclaim is conditional under the registry lock: a reference
    /// taken after the teardown was queued keeps the entry alive.
    fn complete_unregister(&self, key: NexthopKey) {
        let Some(nexthop) = self.registry.get(&key) else {
            resolver_log!(self, warn, "unregister ack for unknown next hop {}", key);
            return;
        };
        if self.registry.remove_if_unreferenced(&key) {
            resolver_log!(self, debug, "next hop {} reclaimed", key);
        } else {
            nexthop.set_state(NexthopState::Active);
            self.queue_reg_unreg(&nexthop, RegOp::Register);
        }
    }

    fn drain(&self, pid: usize) {
        let lists = &self.partitions[pid].lists;
        loop {
            let mut did_work = false;
            if self.gates.reg_unreg.load(Ordering::SeqCst) {
                while let Some((key, op)) = lists.reg_unreg.pop() {
                    self.process_reg_unreg(key, op);
                    did_work = true;
                }
            }
            if self.gates.nexthop_update.load(Ordering::SeqCst) {
                while let Some((key, snapshot)) = lists.nexthop_update.pop() {
                    self.process_nexthop_update(key, snapshot);
                    did_work = true;
                }
            }
            if self.gates.path_update.load(Ordering::SeqCst) {
                while let Some((_, rp)) = lists.path_update.pop() {
                    self.process_path_update(rp);
                    did_work = true;
                }
            }
            if !did_work {
                break;
            }
        }
    }

    /// Reconcile a next hop's listener with its current use. The
    /// queued op is advisory; the decision is made from the state at
    /// drain time, so a register coalesced with a later unregister
    /// resolves to whatever the refcount says now.
    fn process_reg_unreg(&self, key: NexthopKey, _op: RegOp) {
        let Some(nexthop) = self.registry.get(&key) else {
            return;
        };
        if nexthop.refcount() == 0 {
            if nexthop.state() != NexthopState::Active {
                // teardown already in flight
                return;
            }
            if let Some(id) = nexthop.take_listener() {
                nexthop.set_state(NexthopState::PendingUnregister);
                self.table.unregister(id);
            } else if self.registry.remove_if_unreferenced(&key) {
                // never registered, reclaim immediately
                resolver_log!(self, debug, "next hop {} reclaimed", key);
            } else {
                // re-acquired between the idle observation and the
                // reclaim, reconcile again
                self.queue_reg_unreg(&nexthop, RegOp::Register);
            }
        } else if nexthop.state() == NexthopState::Active
            && nexthop.listener().is_none()
        {
            let tx = self.partitions[nexthop.partition].tx.clone();
            let cb: ConditionCallback = Arc::new(move |e: ConditionEvent| {
                let _ = tx.send(WorkMessage::Condition(e));
            });
            match self.table.register(key, cb) {
                Ok(id) => nexthop.set_listener(id),
                Err(e) => {
                    resolver_log!(self, error,
                        "listener registration for {} failed: {}", key, e);
                }
            }
        }
        // PendingUnregister with users: the ack path re-registers.
    }

    fn process_nexthop_update(
        &self,
        key: NexthopKey,
        snapshot: Option<ResolvingSnapshot>,
    ) {
        let Some(nexthop) = self.registry.get(&key) else {
            return;
        };
        let generation = nexthop.set_snapshot(snapshot);
        resolver_log!(self, debug,
            "next hop {} updated (generation {})", key, generation);
        for rp in nexthop.dependent_paths() {
            self.queue_path_update(rp);
        }
    }

    /// Converge the resolved paths for one incarnation. Everything is
    /// recomputed from current state: the unresolved path's attributes
    /// are read back from the table and the forwarding set comes from
    /// the next hop's snapshot, empty if the incarnation was stopped.
    fn process_path_update(&self, rp: Arc<ResolverPath>) {
        let entry = self.table.find(&rp.prefix);
        let existing: Vec<IpAddr> = entry
            .as_ref()
            .map(|e| {
                e.resolved_for_peer(rp.peer)
                    .iter()
                    .filter_map(|p| match p.source {
                        PathSource::Resolved { nexthop, .. } => Some(nexthop),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let unresolved = entry.as_ref().and_then(|e| {
            e.paths.get(&PathSource::Bgp { peer: rp.peer }).cloned()
        });
        let snapshot = if rp.stopped() {
            None
        } else {
            rp.nexthop.snapshot()
        };

        let mut keep = BTreeSet::new();
        if let (Some(up), Some(snap)) =
            (unresolved.filter(|p| p.resolve), snapshot)
        {
            for hop in &snap.nexthops {
                keep.insert(hop.address);
                let path =
                    materialize::resolved_path(rp.peer, &up.attrs, &snap, hop);
                if let Err(e) = self.table.enqueue(TableRequest::AddChange {
                    prefix: rp.prefix,
                    path,
                }) {
                    resolver_log!(self, error,
                        "resolved path install on {} failed: {}",
                        rp.prefix, e);
                }
            }
        }
        for address in existing.into_iter().filter(|a| !keep.contains(a)) {
            if let Err(e) = self.table.enqueue(TableRequest::Delete {
                prefix: rp.prefix,
                source: PathSource::Resolved {
                    peer: rp.peer,
                    nexthop: address,
                },
            }) {
                resolver_log!(self, error,
                    "resolved path withdraw on {} failed: {}", rp.prefix, e);
            }
        }
    }

    fn queue_path_update(&self, rp: Arc<ResolverPath>) {
        let pid = rp.partition;
        self.partitions[pid].lists.path_update.enqueue(rp.id, rp);
        self.wake(pid);
    }

    fn queue_reg_unreg(&self, nexthop: &Arc<ResolverNexthop>, op: RegOp) {
        let pid = nexthop.partition;
        self.partitions[pid].lists.reg_unreg.enqueue(nexthop.key, op);
        self.wake(pid);
    }

    fn wake(&self, pid: usize) {
        let _ = self.partitions[pid].tx.send(WorkMessage::Wake);
    }

    fn wake_all(&self) {
        for pid in 0..self.partitions.len() {
            self.wake(pid);
        }
    }

    // Administrative surface.

    pub fn disable_reg_unreg_processing(&self) {
        self.gates.reg_unreg.store(false, Ordering::SeqCst);
    }

    pub fn enable_reg_unreg_processing(&self) {
        self.gates.reg_unreg.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn disable_nexthop_update_processing(&self) {
        self.gates.nexthop_update.store(false, Ordering::SeqCst);
    }

    pub fn enable_nexthop_update_processing(&self) {
        self.gates.nexthop_update.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn disable_path_update_processing(&self) {
        self.gates.path_update.store(false, Ordering::SeqCst);
    }

    pub fn enable_path_update_processing(&self) {
        self.gates.path_update.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    /// Queued registration/unregistration work, summed over all
    /// partitions.
    pub fn reg_unreg_list_size(&self) -> usize {
        self.partitions.iter().map(|p| p.lists.reg_unreg.len()).sum()
    }

    pub fn nexthop_update_list_size(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lists.nexthop_update.len())
            .sum()
    }

    pub fn path_update_list_size(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lists.path_update.len())
            .sum()
    }

    /// Distinct next hops currently tracked.
    pub fn nexthop_count(&self) -> usize {
        self.registry.len()
    }

    /// Unresolved paths with a live resolution incarnation.
    pub fn path_count(&self) -> usize {
        lock!(self.paths).len()
    }

    pub fn initiate_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        resolver_log!(self, info, "shutdown initiated");
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether shutdown can complete: no tracked state and no queued
    /// work anywhere. Disabled lists hold this false until re-enabled
    /// and drained.
    pub fn deletable(&self) -> bool {
        self.shutting_down()
            && self.registry.is_empty()
            && lock!(self.paths).is_empty()
            && self.reg_unreg_list_size() == 0
            && self.nexthop_update_list_size() == 0
            && self.path_update_list_size() == 0
    }

    /// Stop the partition workers. Messages already queued ahead of
    /// the stop are processed first.
    pub fn stop(&self) {
        for p in &self.partitions {
            let _ = p.tx.send(WorkMessage::Stop);
        }
        for p in &self.partitions {
            let handle = lock!(p.handle).take();
            if let Some(h) = handle {
                if h.join().is_err() {
                    resolver_log!(self, error, "partition worker panicked");
                }
            }
        }
    }
}
