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

//! Two-phase-commit participant contract.
//!
//! The consensus driver moves opaque write batches around; only the final
//! participant gives them a meaning by unpacking the payload into its own
//! batch type.

use crate::{base::serialize, Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

/// Opaque write batch moved between the consensus driver and a participant.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct WriteBatch {
    /// MessagePack encoded participant batch.
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl WriteBatch {
    /// Pack a participant batch type into an opaque write batch.
    pub fn pack<T: Serialize>(value: &T) -> Result<WriteBatch> {
        let payload = serialize::rmp_serialize(value)?;
        Ok(WriteBatch { payload })
    }

    /// Unpack the payload into the participant batch type.
    ///
    /// # Errors
    ///
    /// Returns a `BadBatch` error kind when the payload is not a valid
    /// encoding of the requested type.
    pub fn unpack<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        serialize::rmp_deserialize(&self.payload)
            .map_err(|err| Error::new_ext(ErrorKind::BadBatch, err.to_string_full()))
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Participant role of the two-phase commit protocol.
///
/// The driver guarantees that `commit` and `rollback` are invoked only after
/// a `prepare` carrying the same transaction identity, but a participant must
/// still defend its own state: see the storage implementation.
#[cfg_attr(test, automock)]
pub trait Participant: Send + Sync {
    /// First phase. Validate the batch and stage it without executing.
    fn prepare(&self, batch: &WriteBatch) -> Result<()>;

    /// Second phase, positive outcome. Execute and persist the staged batch.
    fn commit(&self, batch: &WriteBatch) -> Result<()>;

    /// Second phase, negative outcome. Discard the staged batch.
    fn rollback(&self, batch: &WriteBatch) -> Result<()>;
}
