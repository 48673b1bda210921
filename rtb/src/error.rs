// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed prefix {0}")]
    Prefix(String),

    #[error("malformed address {0}")]
    Address(String),

    #[error("address family mismatch: {0}")]
    Family(String),
}
