// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl Prefix4 {
    /// Create a new prefix ensuring the host bits are clear.
    pub fn new(value: Ipv4Addr, length: u8) -> Self {
        Self { value, length }.unset_host_bits()
    }

    /// A host prefix covering exactly `value`.
    pub fn host(value: Ipv4Addr) -> Self {
        Self { value, length: 32 }
    }

    pub fn unset_host_bits(self) -> Self {
        let addr: u32 = self.value.into();
        Self {
            length: self.length,
            value: (addr & Self::mask(self.length)).into(),
        }
    }

    pub fn within(&self, x: &Prefix4) -> bool {
        let a: u32 = self.value.into();
        let b: u32 = x.value.into();
        let mask = Self::mask(x.length);
        (a & mask) == (b & mask) && self.length >= x.length
    }

    fn mask(length: u8) -> u32 {
        if length == 0 {
            0
        } else {
            u32::MAX << (32 - length)
        }
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 {
            return Err(Error::Prefix(s.into()));
        }
        let length: u8 =
            parts[1].parse().map_err(|_| Error::Prefix(s.into()))?;
        if length > 32 {
            return Err(Error::Prefix(s.into()));
        }
        Ok(Self {
            value: parts[0]
                .parse()
                .map_err(|_| Error::Address(parts[0].into()))?,
            length,
        })
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl Prefix6 {
    pub fn new(value: Ipv6Addr, length: u8) -> Self {
        Self { value, length }.unset_host_bits()
    }

    pub fn host(value: Ipv6Addr) -> Self {
        Self { value, length: 128 }
    }

    pub fn unset_host_bits(self) -> Self {
        let addr: u128 = self.value.into();
        Self {
            length: self.length,
            value: (addr & Self::mask(self.length)).into(),
        }
    }

    pub fn within(&self, x: &Prefix6) -> bool {
        let a: u128 = self.value.into();
        let b: u128 = x.value.into();
        let mask = Self::mask(x.length);
        (a & mask) == (b & mask) && self.length >= x.length
    }

    fn mask(length: u8) -> u128 {
        if length == 0 {
            0
        } else {
            u128::MAX << (128 - length)
        }
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix6 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 {
            return Err(Error::Prefix(s.into()));
        }
        let length: u8 =
            parts[1].parse().map_err(|_| Error::Prefix(s.into()))?;
        if length > 128 {
            return Err(Error::Prefix(s.into()));
        }
        Ok(Self {
            value: parts[0]
                .parse()
                .map_err(|_| Error::Address(parts[0].into()))?,
            length,
        })
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Prefix {
    /// A host prefix covering exactly `addr`, in the family of `addr`.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Self::V4(Prefix4::host(a)),
            IpAddr::V6(a) => Self::V6(Prefix6::host(a)),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p) => p.length,
            Self::V6(p) => p.length,
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Self::V4(p) => p.value.into(),
            Self::V6(p) => p.value.into(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Self::V4(_) => AddressFamily::Ipv4,
            Self::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(p) => p.fmt(f),
            Self::V6(p) => p.fmt(f),
        }
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(p) = Prefix4::from_str(s) {
            return Ok(Self::V4(p));
        }
        if let Ok(p) = Prefix6::from_str(s) {
            return Ok(Self::V6(p));
        }
        Err(Error::Prefix(s.into()))
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "inet"),
            Self::Ipv6 => write!(f, "inet6"),
        }
    }
}

/// A route distinguisher identifying the overlay source of a forwarding
/// next hop, in `address:index` form.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct RouteDistinguisher {
    pub address: Ipv4Addr,
    pub index: u16,
}

impl RouteDistinguisher {
    pub fn new(address: Ipv4Addr, index: u16) -> Self {
        Self { address, index }
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.index)
    }
}

/// Opaque load balance field selection carried as an extended
/// attribute on overlay routes.
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct LoadBalance(pub [u8; 8]);

impl LoadBalance {
    pub fn is_default(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

/// Extended attributes replicated from an overlay route onto the
/// resolved paths that depend on it.
#[derive(
    Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
pub struct ExtAttrs {
    pub security_groups: Vec<u32>,
    pub tunnel_encaps: BTreeSet<String>,
    pub load_balance: Option<LoadBalance>,
    pub source_rd: Option<RouteDistinguisher>,
}

/// Core path attributes. The extended set rides along in `ext`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PathAttrs {
    pub nexthop: IpAddr,
    pub med: u32,
    pub as_path: Vec<u32>,
    pub communities: Vec<u32>,
    pub ext: ExtAttrs,
}

impl PathAttrs {
    pub fn new(nexthop: IpAddr) -> Self {
        Self {
            nexthop,
            med: 0,
            as_path: Vec::new(),
            communities: Vec::new(),
            ext: ExtAttrs::default(),
        }
    }
}

/// One forwarding next hop carried by an overlay route. An overlay
/// route with several of these is an ECMP route.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct ForwardingNexthop {
    pub address: IpAddr,
    pub label: u32,
    pub source_rd: Option<RouteDistinguisher>,
}

/// Identity of a path within a route entry. A route entry holds at
/// most one path per source.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum PathSource {
    /// A path learned from a BGP peer.
    Bgp { peer: IpAddr },
    /// An overlay path carrying forwarding next hops.
    Overlay { peer: IpAddr },
    /// A path derived by resolution, keyed by the originating peer and
    /// the forwarding next hop address it resolved through.
    Resolved { peer: IpAddr, nexthop: IpAddr },
}

impl PathSource {
    pub fn peer(&self) -> IpAddr {
        match self {
            Self::Bgp { peer }
            | Self::Overlay { peer }
            | Self::Resolved { peer, .. } => *peer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Path {
    pub source: PathSource,
    pub attrs: PathAttrs,
    pub label: u32,
    /// Resolution is requested for this path. Only meaningful on BGP
    /// paths; the resolver ignores the rest.
    pub resolve: bool,
    /// Forwarding next hops, present on overlay paths.
    pub nexthops: Vec<ForwardingNexthop>,
}

impl Path {
    pub fn bgp(peer: IpAddr, attrs: PathAttrs, resolve: bool) -> Self {
        Self {
            source: PathSource::Bgp { peer },
            attrs,
            label: 0,
            resolve,
            nexthops: Vec::new(),
        }
    }

    pub fn overlay(
        peer: IpAddr,
        attrs: PathAttrs,
        nexthops: Vec<ForwardingNexthop>,
    ) -> Self {
        Self {
            source: PathSource::Overlay { peer },
            attrs,
            label: 0,
            resolve: false,
            nexthops,
        }
    }
}

/// A route entry: every path known for one prefix, keyed by source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub paths: BTreeMap<PathSource, Path>,
}

impl RouteEntry {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            paths: BTreeMap::new(),
        }
    }

    /// The resolving state this entry contributes when used as a next
    /// hop route: the forwarding next hops and extended attributes of
    /// the best overlay path. None when no usable overlay path exists.
    pub fn resolving_snapshot(&self) -> Option<ResolvingSnapshot> {
        self.paths
            .values()
            .find(|p| {
                matches!(p.source, PathSource::Overlay { .. })
                    && !p.nexthops.is_empty()
            })
            .map(|p| ResolvingSnapshot {
                nexthops: p.nexthops.clone(),
                ext: p.attrs.ext.clone(),
            })
    }

    /// Resolved paths originated by `peer`.
    pub fn resolved_for_peer(&self, peer: IpAddr) -> Vec<&Path> {
        self.paths
            .values()
            .filter(|p| {
                matches!(p.source,
                    PathSource::Resolved { peer: x, .. } if x == peer)
            })
            .collect()
    }
}

/// A mutation request accepted by [`Table::enqueue`].
#[derive(Debug, Clone)]
pub enum TableRequest {
    AddChange { prefix: Prefix, path: Path },
    Delete { prefix: Prefix, source: PathSource },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputOp {
    Add,
    Change,
    Delete,
}

/// Notification delivered to per-partition input callbacks after a
/// table mutation has been applied.
#[derive(Debug, Clone)]
pub struct InputEvent {
    pub partition: usize,
    pub prefix: Prefix,
    pub source: PathSource,
    pub nexthop: IpAddr,
    pub resolve: bool,
    pub op: InputOp,
}

/// The resolving state observed for a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvingSnapshot {
    pub nexthops: Vec<ForwardingNexthop>,
    pub ext: ExtAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionEventKind {
    /// The watched prefix became usable as a resolving route.
    Match(ResolvingSnapshot),
    /// The watched prefix changed while remaining usable.
    Change(ResolvingSnapshot),
    /// The watched prefix is no longer usable.
    Delete,
    /// Acknowledgment that the listener has been torn down and no
    /// further events for it will be delivered.
    Unregistered,
}

/// Event delivered to a condition listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionEvent {
    pub key: Prefix,
    pub kind: ConditionEventKind,
}

/// Handle for a registered condition listener.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
