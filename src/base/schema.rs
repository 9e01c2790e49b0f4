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

use crate::{
    base::serialize::MessagePack,
    crypto::{Hash, KeyPair, PublicKey},
    Error, ErrorKind, Result,
};
use std::collections::HashSet;
use std::fmt;

/// Genesis block version tag.
pub const BLOCK_VERSION: u32 = 0x0100_0000;

/// Node identifier within the network.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_owned())
    }
}

/// Globally unique database identifier, derived from a proof-of-work hash.
///
/// Minted by the coordinator on database creation and immutable afterwards.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
pub struct DatabaseId(pub String);

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(s: &str) -> Self {
        DatabaseId(s.to_owned())
    }
}

/// Public node record as exposed by the consistent-hashing ring.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// Node public key.
    pub public_key: PublicKey,
}

/// Role taken by a server within a replication group.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServerRole {
    #[serde(rename = "leader")]
    Leader,
    #[serde(rename = "follower")]
    Follower,
}

/// Member of a replication group.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Server {
    /// Role within the group.
    pub role: ServerRole,
    /// Node identifier.
    pub id: NodeId,
    /// Node public key.
    pub public_key: PublicKey,
}

/// Peer set payload.
///
/// The signature over the serialized payload lives in the enclosing [`Peers`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct PeersData {
    /// Monotonically increasing configuration term.
    pub term: u64,
    /// Identifier of the leader server.
    pub leader: NodeId,
    /// Group members, in ring neighbour order.
    pub servers: Vec<Server>,
    /// Signer (coordinator) public key.
    pub public_key: PublicKey,
}

impl PeersData {
    /// Sign the peer set payload.
    /// Serialization is performed using message pack format without field names.
    pub fn sign(&self, keypair: &KeyPair) -> Result<Vec<u8>> {
        let data = self.serialize();
        keypair.sign(&data)
    }

    /// Peer set payload signature verification.
    pub fn verify(&self, public_key: &PublicKey, sig: &[u8]) -> Result<()> {
        let data = self.serialize();
        match public_key.verify(&data, sig) {
            true => Ok(()),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }
}

/// Signed replication group membership descriptor.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Peers {
    /// Peer set payload.
    pub data: PeersData,
    /// Payload signature verifiable using the `public_key` within the `data`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Peers {
    /// Build and sign a peer set in one go.
    pub fn new(data: PeersData, keypair: &KeyPair) -> Result<Peers> {
        let signature = data.sign(keypair)?;
        Ok(Peers { data, signature })
    }

    /// Verify the signature against the signer key embedded in the payload.
    pub fn verify(&self) -> Result<()> {
        self.data.verify(&self.data.public_key, &self.signature)
    }

    /// Check that the membership is well formed: servers are distinct, exactly
    /// one carries the leader role and the `leader` field names it.
    pub fn check_integrity(&self) -> Result<()> {
        if self.data.servers.is_empty() {
            return Err(Error::new_ext(ErrorKind::MalformedData, "empty peer set"));
        }
        let mut ids = HashSet::new();
        let mut leaders = 0;
        for server in &self.data.servers {
            if !ids.insert(&server.id) {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    "duplicated server in peer set",
                ));
            }
            if server.role == ServerRole::Leader {
                leaders += 1;
                if server.id != self.data.leader {
                    return Err(Error::new_ext(
                        ErrorKind::MalformedData,
                        "leader field does not match leader server",
                    ));
                }
            }
        }
        if leaders != 1 {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "peer set requires exactly one leader",
            ));
        }
        Ok(())
    }

    /// Group members identifiers, preserving the servers order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.data.servers.iter().map(|s| s.id.clone()).collect()
    }

    /// Leader server record, if any.
    pub fn leader(&self) -> Option<&Server> {
        self.data
            .servers
            .iter()
            .find(|s| s.role == ServerRole::Leader)
    }
}

/// Resource requirements attached to a database creation request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct ResourceMeta {
    /// Requested number of replica nodes.
    pub node_count: u16,
    /// Minimum free memory per node, in bytes.
    pub memory: u64,
    /// Optional minimum free filesystem space per node, in bytes.
    pub storage: Option<u64>,
}

/// Genesis block payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockData {
    /// Block format version.
    pub version: u32,
    /// Producer (coordinator) node identifier.
    pub producer: NodeId,
    /// Hash of the chain genesis block. Empty for the genesis itself.
    pub genesis_hash: Hash,
    /// Previous block hash. Empty for the genesis block.
    pub parent_hash: Hash,
    /// Block creation time, seconds since the UNIX epoch (UTC).
    pub timestamp: u64,
    /// Producer public key.
    pub signee: PublicKey,
}

impl BlockData {
    /// Sign the block payload.
    pub fn sign(&self, keypair: &KeyPair) -> Result<Vec<u8>> {
        let data = self.serialize();
        keypair.sign(&data)
    }

    /// Block payload signature verification.
    pub fn verify(&self, public_key: &PublicKey, sig: &[u8]) -> Result<()> {
        let data = self.serialize();
        match public_key.verify(&data, sig) {
            true => Ok(()),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }
}

/// Signed block.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Block {
    /// Block payload.
    pub data: BlockData,
    /// Payload signature.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Block {
    /// Build and sign a block in one go.
    pub fn new(data: BlockData, keypair: &KeyPair) -> Result<Block> {
        let signature = data.sign(keypair)?;
        Ok(Block { data, signature })
    }

    /// Verify the signature against the signee key embedded in the payload.
    pub fn verify(&self) -> Result<()> {
        self.data.verify(&self.data.signee, &self.signature)
    }
}

/// Authoritative record binding a database to its replication group.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServiceInstance {
    /// Database identifier.
    pub database_id: DatabaseId,
    /// Signed replication group descriptor.
    pub peers: Peers,
    /// Resource requirements the database was created with.
    pub resource_meta: ResourceMeta,
    /// Genesis block. Carried on creation, not persisted in the service map.
    pub genesis_block: Option<Block>,
}

/// Worker database service update command.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(tag = "op")]
pub enum UpdateService {
    /// Provision a new database instance on the target worker.
    #[serde(rename = "create_db")]
    CreateDb { instance: ServiceInstance },
    /// Drop a database instance from the target worker.
    #[serde(rename = "drop_db")]
    DropDb { database_id: DatabaseId },
    /// Replace the replication group membership of a hosted database.
    #[serde(rename = "update_peers")]
    UpdatePeers {
        database_id: DatabaseId,
        peers: Peers,
    },
}

/// Worker database service update response. Only the error flag matters.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct UpdateServiceResponse {}

/// Query type.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum QueryType {
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "write")]
    Write,
}

/// Query request header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RequestHeader {
    /// Read or write request.
    pub query_type: QueryType,
    /// Requesting node identifier.
    pub node_id: NodeId,
    /// Target database identifier.
    pub database_id: DatabaseId,
    /// Client connection identifier.
    pub connection_id: u64,
    /// Request sequence number within the connection.
    pub seq_no: u64,
    /// Client-side request time, nanoseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// Query request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Request {
    /// Request header.
    pub header: RequestHeader,
    /// SQL statements, executed in order.
    pub queries: Vec<String>,
}

/// A single value as reported by the underlying SQL driver.
///
/// Values keep the driver's original storage class, no implicit conversion
/// is performed on the way out.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub enum SqlValue {
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "int")]
    Integer(i64),
    #[serde(rename = "real")]
    Real(f64),
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "blob")]
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Query response row.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct ResponseRow {
    /// Column values of the row.
    pub values: Vec<SqlValue>,
}

/// Query response header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ResponseHeader {
    /// Header of the request this response answers.
    pub request: RequestHeader,
    /// Responding node identifier.
    pub node_id: NodeId,
    /// Response time, nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Number of returned rows.
    pub row_count: u64,
}

/// Query response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Response {
    /// Response header.
    pub header: ResponseHeader,
    /// Result set column names.
    pub columns: Vec<String>,
    /// Result set column types as declared by the driver.
    pub decl_types: Vec<String>,
    /// Result set rows.
    pub rows: Vec<ResponseRow>,
}

/// Response acknowledgement header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AckHeader {
    /// Header of the acknowledged response.
    pub response: ResponseHeader,
    /// Acknowledging node identifier.
    pub node_id: NodeId,
    /// Acknowledge time, nanoseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// Response acknowledgement.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Ack {
    /// Acknowledgement header.
    pub header: AckHeader,
}

impl Ack {
    /// Identifier of the database the acknowledged response belongs to.
    pub fn database_id(&self) -> &DatabaseId {
        &self.header.response.request.database_id
    }
}

/// Coordinator create database request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct CreateDatabaseRequest {
    /// Requesting node identifier, used as proof-of-work subject.
    pub node_id: NodeId,
    /// Requested resources.
    pub resource_meta: ResourceMeta,
}

/// Coordinator create database response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct CreateDatabaseResponse {
    /// The newly created instance record.
    pub instance: ServiceInstance,
}

/// Coordinator drop database request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct DropDatabaseRequest {
    /// Database to drop.
    pub database_id: DatabaseId,
}

/// Coordinator drop database response. Only the error flag matters.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct DropDatabaseResponse {}

/// Coordinator get database request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct GetDatabaseRequest {
    /// Database to look up.
    pub database_id: DatabaseId,
}

/// Coordinator get database response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct GetDatabaseResponse {
    /// The instance record.
    pub instance: ServiceInstance,
}

/// Worker registration request, sent during worker boot reconciliation.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct InitService {
    /// Worker node identifier.
    pub node_id: NodeId,
}

/// Worker registration response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct InitServiceResponse {
    /// Instances the worker is expected to host.
    pub instances: Vec<ServiceInstance>,
}
