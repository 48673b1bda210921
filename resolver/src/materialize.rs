// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of resolved paths.
//!
//! A resolved path merges two sources: the unresolved path contributes
//! its routing attributes (MED, AS path, communities), the resolving
//! state contributes the forwarding side (next hop address, label,
//! source route distinguisher per hop, and the extended attributes
//! shared by all hops of the overlay route).

use rtb::{
    ExtAttrs, ForwardingNexthop, Path, PathAttrs, PathSource,
    ResolvingSnapshot,
};
use std::net::IpAddr;

pub fn resolved_path(
    peer: IpAddr,
    unresolved: &PathAttrs,
    snapshot: &ResolvingSnapshot,
    hop: &ForwardingNexthop,
) -> Path {
    Path {
        source: PathSource::Resolved {
            peer,
            nexthop: hop.address,
        },
        attrs: PathAttrs {
            nexthop: hop.address,
            med: unresolved.med,
            as_path: unresolved.as_path.clone(),
            communities: unresolved.communities.clone(),
            ext: ExtAttrs {
                security_groups: snapshot.ext.security_groups.clone(),
                tunnel_encaps: snapshot.ext.tunnel_encaps.clone(),
                load_balance: snapshot.ext.load_balance,
                source_rd: hop.source_rd,
            },
        },
        label: hop.label,
        resolve: false,
        nexthops: Vec::new(),
    }
}
