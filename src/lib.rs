// This file is part of GridSQL.
//
// Copyright (C) 2022 The GridSQL Authors.
//
// GridSQL is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// GridSQL is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with GridSQL. If not, see <https://www.gnu.org/licenses/>.

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod base;
pub mod channel;
pub mod consensus;
pub mod consistent;
pub mod crypto;
pub mod error;
pub mod metric;
pub mod pow;
pub mod producer;
pub mod rpc;
pub mod storage;
pub mod twopc;
pub mod worker;

pub use base::schema::{
    Block, DatabaseId, Node, NodeId, Peers, ResourceMeta, ServiceInstance, UpdateService,
};
pub use crypto::{KeyPair, PublicKey};
pub use error::{Error, ErrorKind, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
