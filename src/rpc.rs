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

//! RPC dispatch, as seen by the two node roles.
//!
//! The transport lives outside this crate. Requests and responses cross the
//! caller boundary as MessagePack payloads; method names are stable.

use crate::{base::serialize, base::schema::NodeId, Result};
use serde::{de::DeserializeOwned, Serialize};

#[cfg(test)]
use mockall::automock;

/// Coordinator database service name.
pub const BP_DB_SERVICE_NAME: &str = "BPDB";
/// Worker database service name.
pub const DB_SERVICE_NAME: &str = "DBS";
/// Worker database consensus multiplexer name. Owned by the consensus engine.
pub const DB_CONSENSUS_NAME: &str = "DBC";
/// Worker SQL-chain multiplexer name. Owned by the consensus engine.
pub const SQL_CHAIN_NAME: &str = "SQLC";

/// Stable RPC method names.
pub mod method {
    /// Coordinator endpoints.
    pub const CREATE_DATABASE: &str = "BPDB.CreateDatabase";
    pub const DROP_DATABASE: &str = "BPDB.DropDatabase";
    pub const GET_DATABASE: &str = "BPDB.GetDatabase";
    pub const GET_NODE_DATABASES: &str = "BPDB.GetNodeDatabases";

    /// Worker endpoints.
    pub const UPDATE: &str = "DBS.Update";
    pub const QUERY: &str = "DBS.Query";
    pub const ACK: &str = "DBS.Ack";
}

/// Node-to-node call dispatch.
#[cfg_attr(test, automock)]
pub trait RpcCaller: Send + Sync {
    /// Call `method` on `node` with an encoded request, returning the
    /// encoded response.
    fn call_node(&self, node: &NodeId, method: &str, req: &[u8]) -> Result<Vec<u8>>;
}

/// Typed wrapper around [`RpcCaller::call_node`].
pub fn call<Req, Res>(caller: &dyn RpcCaller, node: &NodeId, method: &str, req: &Req) -> Result<Res>
where
    Req: Serialize,
    Res: DeserializeOwned,
{
    let buf = serialize::rmp_serialize(req)?;
    let res = caller.call_node(node, method, &buf)?;
    serialize::rmp_deserialize(&res)
}
