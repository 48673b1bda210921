// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transmit work queue.
//!
//! A producer/consumer queue with a dedicated drain thread. Producers
//! call [`TxQueue::enqueue`] from any thread; the drain thread applies
//! the handler to each item in order and invokes the empty callback
//! every time the queue drains to empty. Shutdown drains whatever is
//! still queued before the thread exits.

use common::lock;
use slog::Logger;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum TxOp<T> {
    Item(T),
    Stop,
}

#[derive(Default)]
pub struct TxQueueStats {
    pub enqueues: AtomicU64,
    pub dequeues: AtomicU64,
    pub len: AtomicUsize,
    pub max_len: AtomicUsize,
}

pub struct TxQueue<T: Send + 'static> {
    tx: Mutex<Sender<TxOp<T>>>,
    stats: Arc<TxQueueStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl<T: Send + 'static> TxQueue<T> {
    pub fn new<H, E>(name: &str, mut handler: H, mut on_empty: E, log: Logger) -> Self
    where
        H: FnMut(T) + Send + 'static,
        E: FnMut() + Send + 'static,
    {
        let (tx, rx) = channel::<TxOp<T>>();
        let stats = Arc::new(TxQueueStats::default());
        let wstats = stats.clone();
        slog::info!(log, "starting txq {name}";
            "component" => crate::COMPONENT_RTB,
            "module" => crate::MOD_TXQ,
        );
        let handle = std::thread::spawn(move || {
            let mut stop = false;
            while !stop {
                let op = match rx.recv() {
                    Ok(op) => op,
                    Err(_) => break,
                };
                let mut burst = Some(op);
                loop {
                    match burst.take() {
                        Some(TxOp::Item(item)) => {
                            wstats.len.fetch_sub(1, Ordering::Relaxed);
                            wstats
                                .dequeues
                                .fetch_add(1, Ordering::Relaxed);
                            handler(item);
                        }
                        Some(TxOp::Stop) => stop = true,
                        None => {}
                    }
                    match rx.try_recv() {
                        Ok(op) => burst = Some(op),
                        Err(TryRecvError::Empty)
                        | Err(TryRecvError::Disconnected) => break,
                    }
                }
                on_empty();
            }
        });
        Self {
            tx: Mutex::new(tx),
            stats,
            handle: Mutex::new(Some(handle)),
            log,
        }
    }

    pub fn enqueue(&self, item: T) {
        let len = self.stats.len.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.enqueues.fetch_add(1, Ordering::Relaxed);
        self.stats.max_len.fetch_max(len, Ordering::Relaxed);
        if lock!(self.tx).send(TxOp::Item(item)).is_err() {
            slog::warn!(self.log, "txq enqueue after shutdown";
                "component" => crate::COMPONENT_RTB,
                "module" => crate::MOD_TXQ,
            );
        }
    }

    pub fn stats(&self) -> &TxQueueStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.stats.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the drain thread. Items already queued are processed
    /// before the thread exits.
    pub fn shutdown(&self) {
        if lock!(self.tx).send(TxOp::Stop).is_err() {
            return;
        }
        let handle = lock!(self.handle).take();
        if let Some(h) = handle {
            if h.join().is_err() {
                slog::error!(self.log, "txq drain thread panicked";
                    "component" => crate::COMPONENT_RTB,
                    "module" => crate::MOD_TXQ,
                );
            }
        }
    }
}
