// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The routing table base (rtb).
//!
//! This crate holds the route and attribute model shared by the resolver,
//! a partitioned in-memory route table with an asynchronous request
//! interface and a change-notification subsystem, and the peripheral
//! transmit queue that bridges table requests to a completion callback.

pub mod error;
pub mod table;
pub mod txq;
pub mod types;

pub use table::Table;
pub use types::*;

mod log;

#[cfg(test)]
mod test;

/// Number of partitions in every table. Routes are sharded across
/// partitions by prefix hash; consumers may process partitions in
/// parallel but must serialize within one.
pub const PARTITION_COUNT: usize = 4;

pub const COMPONENT_RTB: &str = "rtb";
pub const MOD_TABLE: &str = "table";
pub const MOD_TXQ: &str = "txq";
