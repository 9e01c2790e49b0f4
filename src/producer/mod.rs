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

//! Coordinator (block producer) components.
//!
//! The coordinator owns the database lifecycle: it mints database ids by
//! proof of work, allocates worker nodes over the consistent-hashing ring,
//! signs the replica membership and propagates lifecycle commands to the
//! workers, keeping the authoritative service map.

pub mod db_service;
pub mod service_map;

pub use db_service::{DbService, DbServiceConfig, DEFAULT_ALLOCATION_ROUNDS};
pub use service_map::ServiceMap;
