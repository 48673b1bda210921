// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::table::{ConditionCallback, InputCallback, Table};
use crate::txq::TxQueue;
use crate::types::*;
use crate::PARTITION_COUNT;
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn test_logger(name: &str) -> slog::Logger {
    common::log::init_file_logger(&format!("/tmp/rtb-test-{name}.log"))
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn hop(address: &str, label: u32) -> ForwardingNexthop {
    ForwardingNexthop {
        address: addr(address),
        label,
        source_rd: None,
    }
}

#[test]
fn prefix_host_bits() {
    let p = Prefix4::new("10.1.2.3".parse().unwrap(), 24);
    assert_eq!(p.to_string(), "10.1.2.0/24");
    assert!(Prefix4::host("10.1.2.3".parse().unwrap()).within(&p));
    assert!(!Prefix4::host("10.1.3.1".parse().unwrap()).within(&p));

    let p = Prefix6::new("fd00::1".parse().unwrap(), 64);
    assert_eq!(p.to_string(), "fd00::/64");
    assert!(Prefix6::host("fd00::2".parse().unwrap()).within(&p));
}

#[test]
fn prefix_parse() {
    let p = Prefix::from_str("10.1.0.1/32").unwrap();
    assert_eq!(p.family(), AddressFamily::Ipv4);
    assert_eq!(p.addr(), addr("10.1.0.1"));
    assert_eq!(p.length(), 32);

    let p = Prefix::from_str("::ffff:10.1.0.1/128").unwrap();
    assert_eq!(p.family(), AddressFamily::Ipv6);
    assert_eq!(p.length(), 128);

    assert!(Prefix::from_str("10.1.0.1").is_err());
    assert!(Prefix::from_str("10.1.0.1/x").is_err());
    assert!(matches!(
        Prefix4::from_str("10.1.0.z/32"),
        Err(Error::Address(_))
    ));
    assert!(matches!(
        Prefix6::from_str("fd00::zz/64"),
        Err(Error::Address(_))
    ));
    assert!(matches!(
        Prefix4::from_str("10.1.0.1/33"),
        Err(Error::Prefix(_))
    ));

    assert_eq!(
        Prefix::host(addr("192.168.1.1")),
        Prefix::V4(Prefix4 {
            value: Ipv4Addr::new(192, 168, 1, 1),
            length: 32
        })
    );
    assert_eq!(
        Prefix::host(addr("::ffff:192.168.1.1")),
        Prefix::V6(Prefix6 {
            value: Ipv6Addr::from_str("::ffff:192.168.1.1").unwrap(),
            length: 128
        })
    );
}

fn collecting_callbacks(
    events: Arc<Mutex<Vec<InputEvent>>>,
) -> Vec<InputCallback> {
    (0..PARTITION_COUNT)
        .map(|_| {
            let events = events.clone();
            let cb: InputCallback = Arc::new(move |e: InputEvent| {
                events.lock().unwrap().push(e);
            });
            cb
        })
        .collect()
}

#[test]
fn table_add_change_delete() {
    let table =
        Table::new("blue", AddressFamily::Ipv4, test_logger("table-acd"));
    let events = Arc::new(Mutex::new(Vec::new()));
    table.watch(collecting_callbacks(events.clone()));

    let prefix = Prefix::from_str("10.1.0.1/32").unwrap();
    let peer = addr("192.168.1.1");
    let path = Path::bgp(peer, PathAttrs::new(addr("192.168.1.100")), true);

    table
        .enqueue(TableRequest::AddChange {
            prefix,
            path: path.clone(),
        })
        .unwrap();
    let entry = table.find(&prefix).unwrap();
    assert_eq!(entry.paths.len(), 1);
    {
        let ev = events.lock().unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].op, InputOp::Add);
        assert_eq!(ev[0].prefix, prefix);
        assert_eq!(ev[0].nexthop, addr("192.168.1.100"));
        assert!(ev[0].resolve);
        assert_eq!(ev[0].partition, Table::partition_of(&prefix));
    }

    let mut changed = path.clone();
    changed.attrs.med = 100;
    table
        .enqueue(TableRequest::AddChange {
            prefix,
            path: changed,
        })
        .unwrap();
    assert_eq!(events.lock().unwrap()[1].op, InputOp::Change);
    assert_eq!(
        table
            .find(&prefix)
            .unwrap()
            .paths
            .get(&PathSource::Bgp { peer })
            .unwrap()
            .attrs
            .med,
        100
    );

    table
        .enqueue(TableRequest::Delete {
            prefix,
            source: PathSource::Bgp { peer },
        })
        .unwrap();
    assert_eq!(events.lock().unwrap()[2].op, InputOp::Delete);
    assert!(table.find(&prefix).is_none());

    // deleting again is a no-op and produces no event
    table
        .enqueue(TableRequest::Delete {
            prefix,
            source: PathSource::Bgp { peer },
        })
        .unwrap();
    assert_eq!(events.lock().unwrap().len(), 3);
}

#[test]
fn table_family_mismatch() {
    let table =
        Table::new("blue", AddressFamily::Ipv4, test_logger("table-family"));
    let prefix = Prefix::from_str("::ffff:10.1.0.1/128").unwrap();
    let path =
        Path::bgp(addr("192.168.1.1"), PathAttrs::new(addr("::1")), false);
    assert!(table
        .enqueue(TableRequest::AddChange { prefix, path })
        .is_err());
    assert!(table
        .register(prefix, Arc::new(|_| {}))
        .is_err());
}

#[test]
fn condition_listener_lifecycle() {
    let table =
        Table::new("blue", AddressFamily::Ipv4, test_logger("table-cond"));
    let key = Prefix::from_str("192.168.1.1/32").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let cb: ConditionCallback = Arc::new(move |e: ConditionEvent| {
        sink.lock().unwrap().push(e);
    });

    let id = table.register(key, cb).unwrap();
    assert!(events.lock().unwrap().is_empty());

    // overlay path appears: Match with its forwarding state
    let overlay = Path::overlay(
        addr("10.0.0.2"),
        PathAttrs::new(addr("10.0.0.2")),
        vec![hop("172.16.1.1", 10000)],
    );
    table
        .enqueue(TableRequest::AddChange {
            prefix: key,
            path: overlay.clone(),
        })
        .unwrap();
    {
        let ev = events.lock().unwrap();
        assert_eq!(ev.len(), 1);
        let ConditionEventKind::Match(ref s) = ev[0].kind else {
            panic!("expected match, got {:?}", ev[0].kind);
        };
        assert_eq!(s.nexthops, vec![hop("172.16.1.1", 10000)]);
    }

    // label change: Change with the new state
    let mut overlay2 = overlay.clone();
    overlay2.nexthops = vec![hop("172.16.1.1", 10001)];
    table
        .enqueue(TableRequest::AddChange {
            prefix: key,
            path: overlay2,
        })
        .unwrap();
    {
        let ev = events.lock().unwrap();
        assert_eq!(ev.len(), 2);
        let ConditionEventKind::Change(ref s) = ev[1].kind else {
            panic!("expected change, got {:?}", ev[1].kind);
        };
        assert_eq!(s.nexthops, vec![hop("172.16.1.1", 10001)]);
    }

    // a non-overlay path on the same prefix does not alter the
    // resolving state, so no event is delivered for it
    table
        .enqueue(TableRequest::AddChange {
            prefix: key,
            path: Path::bgp(
                addr("10.0.0.3"),
                PathAttrs::new(addr("10.0.0.3")),
                false,
            ),
        })
        .unwrap();
    assert_eq!(events.lock().unwrap().len(), 2);

    // with the overlay path gone the listener sees Delete
    table
        .enqueue(TableRequest::Delete {
            prefix: key,
            source: PathSource::Overlay {
                peer: addr("10.0.0.2"),
            },
        })
        .unwrap();
    {
        let ev = events.lock().unwrap();
        assert_eq!(ev.len(), 3);
        assert_eq!(ev[2].kind, ConditionEventKind::Delete);
    }

    // teardown is acknowledged with a final Unregistered event
    table.unregister(id);
    {
        let ev = events.lock().unwrap();
        assert_eq!(ev.len(), 4);
        assert_eq!(ev[3].kind, ConditionEventKind::Unregistered);
        assert_eq!(ev[3].key, key);
    }

    // no further events after the ack
    table
        .enqueue(TableRequest::AddChange {
            prefix: key,
            path: overlay,
        })
        .unwrap();
    assert_eq!(events.lock().unwrap().len(), 4);
}

#[test]
fn condition_listener_immediate_match() {
    let table =
        Table::new("blue", AddressFamily::Ipv4, test_logger("table-imm"));
    let key = Prefix::from_str("192.168.1.1/32").unwrap();
    table
        .enqueue(TableRequest::AddChange {
            prefix: key,
            path: Path::overlay(
                addr("10.0.0.2"),
                PathAttrs::new(addr("10.0.0.2")),
                vec![hop("172.16.1.1", 10000)],
            ),
        })
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    table
        .register(
            key,
            Arc::new(move |e: ConditionEvent| {
                sink.lock().unwrap().push(e);
            }),
        )
        .unwrap();
    let ev = events.lock().unwrap();
    assert_eq!(ev.len(), 1);
    assert!(matches!(ev[0].kind, ConditionEventKind::Match(_)));
}

#[test]
fn txq_drains_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let empties = Arc::new(AtomicUsize::new(0));
    let sink = seen.clone();
    let e = empties.clone();
    let q = TxQueue::new(
        "test",
        move |x: u32| sink.lock().unwrap().push(x),
        move || {
            e.fetch_add(1, Ordering::Relaxed);
        },
        test_logger("txq"),
    );
    for i in 0..100 {
        q.enqueue(i);
    }
    q.shutdown();
    assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<u32>>());
    assert_eq!(q.stats().enqueues.load(Ordering::Relaxed), 100);
    assert_eq!(q.stats().dequeues.load(Ordering::Relaxed), 100);
    assert!(q.stats().max_len.load(Ordering::Relaxed) >= 1);
    assert!(q.is_empty());
    assert!(empties.load(Ordering::Relaxed) >= 1);
}
