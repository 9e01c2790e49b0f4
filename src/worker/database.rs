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

//! A single hosted database instance.
//!
//! Binds the local storage participant to a consensus group. Reads are
//! served locally; writes are turned into an execution log and sequenced
//! across the replicas by the consensus driver, which calls back into the
//! participant to prepare and commit.

use crate::{
    base::{
        schema::{
            Ack, Block, DatabaseId, NodeId, Peers, QueryType, Request, Response, ResponseHeader,
            ResponseRow,
        },
        Mutex,
    },
    consensus::{Consensus, ConsensusHandle},
    storage::{ExecLog, QueryResult, Storage, TxId},
    Error, ErrorKind, Result,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Storage file name within the instance data directory.
pub const STORAGE_FILE_NAME: &str = "storage.db3";

/// Database instance configuration.
pub struct DbConfig {
    /// Database identifier.
    pub database_id: DatabaseId,
    /// Instance data directory, owned exclusively by this instance.
    pub data_dir: PathBuf,
}

/// A hosted database instance.
pub struct Database {
    cfg: DbConfig,
    /// Local node identifier, stamped on response headers.
    node_id: NodeId,
    /// Local two-phase-commit participant.
    storage: Arc<Storage>,
    /// Consensus group handle.
    handle: Box<dyn ConsensusHandle>,
    /// Membership term currently applied.
    term: Mutex<u64>,
}

impl Database {
    /// Create the instance: verify the membership descriptor, open the
    /// local storage and register it with the consensus engine.
    pub fn new(
        cfg: DbConfig,
        consensus: &impl Consensus,
        node_id: NodeId,
        peers: &Peers,
        genesis: Option<Block>,
    ) -> Result<Database> {
        peers.verify()?;
        peers.check_integrity()?;

        fs::create_dir_all(&cfg.data_dir).map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        let path = cfg.data_dir.join(STORAGE_FILE_NAME);
        let path = path
            .to_str()
            .ok_or_else(|| Error::new_ext(ErrorKind::Other, "non utf-8 data dir"))?;
        let storage = Arc::new(Storage::new(path)?);

        let handle = consensus.register(&cfg.database_id, storage.clone(), peers, genesis)?;

        Ok(Database {
            cfg,
            node_id,
            storage,
            handle,
            term: Mutex::new(peers.data.term),
        })
    }

    /// Database identifier.
    pub fn database_id(&self) -> &DatabaseId {
        &self.cfg.database_id
    }

    /// Handle a query request.
    ///
    /// Reads run on the local storage; writes are submitted to the consensus
    /// driver which sequences them across the replicas before the local
    /// participant executes them.
    pub fn query(&self, request: &Request) -> Result<Response> {
        if request.header.database_id != self.cfg.database_id {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "request routed to the wrong database",
            ));
        }
        match request.header.query_type {
            QueryType::Read => {
                let result = self.storage.query(&request.queries)?;
                Ok(self.build_response(request, result))
            }
            QueryType::Write => {
                let log = ExecLog {
                    tx_id: TxId {
                        connection_id: request.header.connection_id,
                        seq_no: request.header.seq_no,
                        timestamp: request.header.timestamp,
                    },
                    queries: request.queries.clone(),
                };
                self.handle.apply(&log.to_batch()?)?;
                Ok(self.build_response(request, QueryResult::default()))
            }
        }
    }

    /// Consume a response acknowledgement.
    ///
    /// Ordering and deduplication live in the consensus driver; here the
    /// acknowledgement is only validated against the hosted database.
    pub fn ack(&self, ack: &Ack) -> Result<()> {
        if ack.database_id() != &self.cfg.database_id {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "ack routed to the wrong database",
            ));
        }
        debug!(
            "database {}: ack from {} for seq {}",
            self.cfg.database_id,
            ack.header.node_id,
            ack.header.response.request.seq_no
        );
        Ok(())
    }

    /// Apply a membership change. The term must strictly increase.
    pub fn update_peers(&self, peers: &Peers) -> Result<()> {
        peers.verify()?;
        peers.check_integrity()?;

        let mut term = self.term.lock();
        if peers.data.term <= *term {
            return Err(Error::new_ext(
                ErrorKind::InconsistentState,
                format!(
                    "non-increasing peers term: current = {}, incoming = {}",
                    *term, peers.data.term
                ),
            ));
        }
        self.handle.update_peers(peers)?;
        *term = peers.data.term;
        Ok(())
    }

    /// Flush and release. Leaves data files on disk.
    pub fn shutdown(&self) -> Result<()> {
        self.handle.shutdown()?;
        self.storage.close()
    }

    /// Shutdown and delete the instance data directory.
    pub fn destroy(&self) -> Result<()> {
        self.shutdown()?;
        fs::remove_dir_all(&self.cfg.data_dir).map_err(|err| Error::new_ext(ErrorKind::Other, err))
    }

    fn build_response(&self, request: &Request, result: QueryResult) -> Response {
        Response {
            header: ResponseHeader {
                request: request.header.clone(),
                node_id: self.node_id.clone(),
                timestamp: unix_nanos(),
                row_count: result.rows.len() as u64,
            },
            columns: result.columns,
            decl_types: result.decl_types,
            rows: result
                .rows
                .into_iter()
                .map(|values| ResponseRow { values })
                .collect(),
        }
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_keypair, create_test_peers};
    use crate::base::schema::{RequestHeader, SqlValue};
    use crate::consensus::{MockConsensus, MockConsensusHandle};
    use crate::crypto::KeyPair;
    use std::path::Path;
    use tempfile::TempDir;

    /// Consensus engine double whose handle drives the registered
    /// participant through a local prepare/commit exchange.
    pub fn create_test_consensus() -> MockConsensus {
        let mut consensus = MockConsensus::new();
        consensus
            .expect_register()
            .returning(|_, participant, _, _| {
                let mut handle = MockConsensusHandle::new();
                let part = participant.clone();
                handle.expect_apply().returning(move |batch| {
                    part.prepare(batch)?;
                    part.commit(batch)
                });
                handle.expect_update_peers().returning(|_| Ok(()));
                handle.expect_shutdown().returning(|| Ok(()));
                Ok(Box::new(handle))
            });
        consensus
    }

    fn create_test_database(dir: &Path, keypair: &KeyPair) -> Database {
        let consensus = create_test_consensus();
        let peers = create_test_peers(keypair);
        Database::new(
            DbConfig {
                database_id: DatabaseId::from("beef"),
                data_dir: dir.join("beef"),
            },
            &consensus,
            NodeId::from("n1"),
            &peers,
            None,
        )
        .unwrap()
    }

    fn request(query_type: QueryType, seq_no: u64, queries: &[&str]) -> Request {
        Request {
            header: RequestHeader {
                query_type,
                node_id: NodeId::from("client"),
                database_id: DatabaseId::from("beef"),
                connection_id: 1,
                seq_no,
                timestamp: 1_647_429_000,
            },
            queries: queries.iter().map(|q| q.to_string()).collect(),
        }
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let keypair = create_test_keypair();
        let db = create_test_database(dir.path(), &keypair);

        db.query(&request(
            QueryType::Write,
            1,
            &["CREATE TABLE t (v TEXT)"],
        ))
        .unwrap();
        db.query(&request(
            QueryType::Write,
            2,
            &["INSERT INTO t VALUES ('x')"],
        ))
        .unwrap();

        let response = db
            .query(&request(QueryType::Read, 3, &["SELECT v FROM t"]))
            .unwrap();

        assert_eq!(response.header.row_count, 1);
        assert_eq!(response.columns, vec!["v"]);
        assert_eq!(response.rows[0].values[0], SqlValue::Text("x".to_owned()));
        assert_eq!(response.header.node_id, NodeId::from("n1"));
    }

    #[test]
    fn query_wrong_database() {
        let dir = TempDir::new().unwrap();
        let keypair = create_test_keypair();
        let db = create_test_database(dir.path(), &keypair);

        let mut req = request(QueryType::Read, 1, &["SELECT 1"]);
        req.header.database_id = DatabaseId::from("feed");

        let err = db.query(&req).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn update_peers_term_must_increase() {
        let dir = TempDir::new().unwrap();
        let keypair = create_test_keypair();
        let db = create_test_database(dir.path(), &keypair);

        // Same term as construction time.
        let same_term = create_test_peers(&keypair);
        let err = db.update_peers(&same_term).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InconsistentState);

        let mut data = create_test_peers(&keypair).data;
        data.term = 2;
        let next = Peers::new(data, &keypair).unwrap();
        db.update_peers(&next).unwrap();

        // Replaying the applied term is rejected as well.
        let mut data = create_test_peers(&keypair).data;
        data.term = 2;
        let replay = Peers::new(data, &keypair).unwrap();
        let err = db.update_peers(&replay).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InconsistentState);
    }

    #[test]
    fn update_peers_bad_signature() {
        let dir = TempDir::new().unwrap();
        let keypair = create_test_keypair();
        let db = create_test_database(dir.path(), &keypair);

        let mut peers = create_test_peers(&keypair);
        peers.data.term = 5;

        let err = db.update_peers(&peers).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn shutdown_keeps_data_destroy_removes_it() {
        let dir = TempDir::new().unwrap();
        let keypair = create_test_keypair();

        let db = create_test_database(dir.path(), &keypair);
        db.shutdown().unwrap();
        assert!(dir.path().join("beef").exists());

        let db = create_test_database(dir.path(), &keypair);
        db.destroy().unwrap();
        assert!(!dir.path().join("beef").exists());
    }
}
