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

//! Worker node components.
//!
//! A worker hosts database instances on behalf of the coordinator. The
//! manager keeps the registry of live instances and reconciles it against
//! the coordinator's authoritative list at boot; each instance binds its
//! local storage participant to a consensus group.

pub mod database;
pub mod dbms;

pub use database::{Database, DbConfig};
pub use dbms::{Dbms, DbmsConfig, DB_META_FILE_NAME};
