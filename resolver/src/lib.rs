// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive next hop resolution.
//!
//! BGP paths flagged for resolution do not carry usable forwarding
//! state of their own; their next hop address names a host route in
//! the same table whose overlay path carries the forwarding next hops.
//! This crate tracks those dependencies through the table's condition
//! listener interface and materializes one resolved path per
//! forwarding next hop, keeping the resolved set converged as either
//! side changes.
//!
//! All bookkeeping runs on per-partition worker tasks fed by the
//! table's input callbacks. Deferred work lives in three coalescing
//! worklists per partition (registration/unregistration, next hop
//! updates, path updates); each can be administratively disabled,
//! which parks entries without blocking enqueue.

pub mod materialize;
pub mod nexthop;
pub mod resolve;
pub mod worklist;

pub use resolve::PathResolver;

mod log;


pub const COMPONENT_RESOLVER: &str = "resolver";
pub const MOD_RESOLVE: &str = "resolve";
