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

//! Core types and facilities shared by every other component.

pub mod schema;
pub mod serialize;

/// Mutex type used all over the project.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// RwLock type used all over the project.
pub type RwLock<T> = parking_lot::RwLock<T>;

pub use schema::{
    Block, BlockData, DatabaseId, Node, NodeId, Peers, PeersData, ResourceMeta, Server, ServerRole,
    ServiceInstance, UpdateService,
};
