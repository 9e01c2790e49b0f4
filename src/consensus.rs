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

//! Consensus engine boundary.
//!
//! The replication engine lives outside this crate. A database instance
//! registers its storage participant under its database id and drives the
//! group through the returned handle: writes are sequenced across replicas
//! and come back to the local participant as prepare/commit/rollback.

use crate::{
    base::schema::{Block, DatabaseId, Peers},
    twopc::{Participant, WriteBatch},
    Result,
};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Handle on a registered consensus group.
#[cfg_attr(test, automock)]
pub trait ConsensusHandle: Send + Sync {
    /// Submit a write batch for replicated execution. Returns once the
    /// group has committed (or rolled back, with an error) the batch.
    fn apply(&self, batch: &WriteBatch) -> Result<()>;

    /// Deliver a membership change to the group.
    fn update_peers(&self, peers: &Peers) -> Result<()>;

    /// Leave the group and release transport registrations.
    fn shutdown(&self) -> Result<()>;
}

/// Consensus engine: registry of replication groups hosted by this node.
#[cfg_attr(test, automock)]
pub trait Consensus: Send + Sync {
    /// Register `participant` as the local resource of the `database_id`
    /// group and join it with the given membership.
    fn register(
        &self,
        database_id: &DatabaseId,
        participant: Arc<dyn Participant>,
        peers: &Peers,
        genesis: Option<Block>,
    ) -> Result<Box<dyn ConsensusHandle>>;
}
