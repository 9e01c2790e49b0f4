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

//! Consistent-hashing ring lookup, as seen by the coordinator.
//!
//! The ring implementation lives outside this crate; the allocator only
//! needs neighbour lookup for a routing key.

use crate::base::schema::Node;

#[cfg(test)]
use mockall::automock;

/// Neighbour lookup over the node ring.
#[cfg_attr(test, automock)]
pub trait ConsistentRing: Send + Sync {
    /// Return up to `count` nodes close to `key` on the ring, nearest first.
    fn get_neighbors(&self, key: &str, count: usize) -> Vec<Node>;
}
