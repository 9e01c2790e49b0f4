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

//! Worker database manager.
//!
//! Keeps the registry of hosted instances and the durable meta file under
//! the worker root directory. At boot the registry is reconciled against the
//! authoritative instance list fetched from a coordinator: missing instances
//! are created first, stale ones are dropped afterwards, so that a transient
//! overlap never loses data.
//!
//! Lookups take the registry read lock; insertions and the meta rewrite are
//! serialized under the write lock.

use crate::{
    base::{
        schema::{
            Ack, DatabaseId, InitService, InitServiceResponse, NodeId, Peers, Request, Response,
            ServiceInstance, UpdateService, UpdateServiceResponse,
        },
        serialize::{rmp_deserialize, rmp_serialize},
        RwLock,
    },
    consensus::Consensus,
    crypto::NodeCredentials,
    rpc::{self, method, RpcCaller},
    worker::database::{Database, DbConfig},
    Error, ErrorKind, Result,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

/// Meta file name under the worker root directory.
pub const DB_META_FILE_NAME: &str = "db.meta";

/// Durable set of locally hosted database ids.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
struct DbmsMeta {
    databases: BTreeSet<DatabaseId>,
}

/// Worker database manager configuration.
pub struct DbmsConfig {
    /// Worker root directory. Hosts the meta file and one subdirectory per
    /// database.
    pub root_dir: PathBuf,
    /// Known coordinator nodes.
    pub coordinators: Vec<NodeId>,
}

/// Worker database manager.
pub struct Dbms<E: Consensus, C: RpcCaller> {
    cfg: DbmsConfig,
    credentials: Arc<NodeCredentials>,
    consensus: Arc<E>,
    rpc: Arc<C>,
    db_map: RwLock<HashMap<DatabaseId, Arc<Database>>>,
}

impl<E: Consensus, C: RpcCaller> Dbms<E, C> {
    /// Create a new manager rooted at `cfg.root_dir`.
    pub fn new(
        cfg: DbmsConfig,
        credentials: Arc<NodeCredentials>,
        consensus: Arc<E>,
        rpc: Arc<C>,
    ) -> Result<Self> {
        fs::create_dir_all(&cfg.root_dir).map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        Ok(Dbms {
            cfg,
            credentials,
            consensus,
            rpc,
            db_map: RwLock::new(HashMap::new()),
        })
    }

    /// Reconcile the local state against the coordinator's authoritative
    /// instance list.
    ///
    /// Instances reported by the coordinator are created (reattaching to any
    /// data already on disk); ids found only in the local meta file are
    /// dropped afterwards.
    pub fn init(&self) -> Result<()> {
        let local_meta = self.read_meta()?;
        let instances = self.get_mapped_instances()?;

        let mut current = BTreeSet::new();
        for instance in &instances {
            current.insert(instance.database_id.clone());
            self.create(instance, false)?;
        }

        for database_id in local_meta.difference(&current) {
            debug!("dropping stale database {}", database_id);
            match self.drop_database(database_id) {
                Ok(_) => (),
                Err(err) if err.kind == ErrorKind::NotExists => {
                    // Listed in the meta file but never constructed during
                    // this boot: only leftover data files to remove.
                    let data_dir = self.cfg.root_dir.join(database_id.to_string());
                    if data_dir.exists() {
                        fs::remove_dir_all(&data_dir)
                            .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        // Persist the reconciled registry even when nothing was created.
        let map = self.db_map.write();
        self.write_meta(&map)
    }

    /// Add a new database instance to the registry.
    ///
    /// With `cleanup` set any preexisting data directory is wiped first.
    pub fn create(&self, instance: &ServiceInstance, cleanup: bool) -> Result<()> {
        if self.db_map.read().contains_key(&instance.database_id) {
            return Err(ErrorKind::AlreadyExists.into());
        }

        let data_dir = self.cfg.root_dir.join(instance.database_id.to_string());
        if cleanup && data_dir.exists() {
            fs::remove_dir_all(&data_dir).map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        }

        let cfg = DbConfig {
            database_id: instance.database_id.clone(),
            data_dir,
        };
        let db = match Database::new(
            cfg,
            &*self.consensus,
            self.credentials.node_id.clone(),
            &instance.peers,
            instance.genesis_block.clone(),
        ) {
            Ok(db) => db,
            Err(err) => {
                // Roll back the partial creation.
                let mut map = self.db_map.write();
                map.remove(&instance.database_id);
                let _ = self.write_meta(&map);
                return Err(err);
            }
        };

        let mut map = self.db_map.write();
        if map.contains_key(&instance.database_id) {
            let _ = db.shutdown();
            return Err(ErrorKind::AlreadyExists.into());
        }
        map.insert(instance.database_id.clone(), Arc::new(db));
        self.write_meta(&map)
    }

    /// Remove a database instance from the registry, destroying its local
    /// data.
    pub fn drop_database(&self, database_id: &DatabaseId) -> Result<()> {
        let db = self
            .db_map
            .read()
            .get(database_id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotExists))?;

        db.destroy()?;

        let mut map = self.db_map.write();
        map.remove(database_id);
        self.write_meta(&map)
    }

    /// Apply a new membership descriptor to a hosted database.
    pub fn update_peers(&self, database_id: &DatabaseId, peers: &Peers) -> Result<()> {
        self.lookup(database_id)?.update_peers(peers)
    }

    /// Dispatch a service update command received from the coordinator.
    pub fn update_service(&self, req: &UpdateService) -> Result<UpdateServiceResponse> {
        match req {
            UpdateService::CreateDb { instance } => self.create(instance, true)?,
            UpdateService::DropDb { database_id } => self.drop_database(database_id)?,
            UpdateService::UpdatePeers { database_id, peers } => {
                self.update_peers(database_id, peers)?
            }
        }
        Ok(UpdateServiceResponse::default())
    }

    /// Route a query request to the target instance.
    pub fn query(&self, request: &Request) -> Result<Response> {
        self.lookup(&request.header.database_id)?.query(request)
    }

    /// Route a response acknowledgement to the target instance.
    pub fn ack(&self, ack: &Ack) -> Result<()> {
        self.lookup(ack.database_id())?.ack(ack)
    }

    /// Identifiers of the currently hosted databases.
    pub fn hosted_databases(&self) -> BTreeSet<DatabaseId> {
        self.db_map.read().keys().cloned().collect()
    }

    /// Shutdown every hosted instance and persist the meta file.
    ///
    /// Instance errors are logged and swallowed so that every instance gets
    /// its shutdown attempt.
    pub fn shutdown(&self) -> Result<()> {
        let map = self.db_map.write();
        for (database_id, db) in map.iter() {
            if let Err(err) = db.shutdown() {
                error!(
                    "database {} shutdown failure: {}",
                    database_id,
                    err.to_string_full()
                );
            }
        }
        self.write_meta(&map)
    }

    fn lookup(&self, database_id: &DatabaseId) -> Result<Arc<Database>> {
        self.db_map
            .read()
            .get(database_id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotExists))
    }

    fn meta_path(&self) -> PathBuf {
        self.cfg.root_dir.join(DB_META_FILE_NAME)
    }

    fn read_meta(&self) -> Result<BTreeSet<DatabaseId>> {
        let content = match fs::read(self.meta_path()) {
            Ok(content) => content,
            // Absent meta file: fresh worker, empty set.
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(Error::new_ext(ErrorKind::Other, err)),
        };
        let meta: DbmsMeta = rmp_deserialize(&content)?;
        Ok(meta.databases)
    }

    /// Whole-file meta replacement. Caller holds the registry lock.
    fn write_meta(&self, map: &HashMap<DatabaseId, Arc<Database>>) -> Result<()> {
        let meta = DbmsMeta {
            databases: map.keys().cloned().collect(),
        };
        let buf = rmp_serialize(&meta)?;
        fs::write(self.meta_path(), buf).map_err(|err| Error::new_ext(ErrorKind::Other, err))
    }

    fn get_mapped_instances(&self) -> Result<Vec<ServiceInstance>> {
        let coordinators = &self.cfg.coordinators;
        if coordinators.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::BadNetwork,
                "no known coordinators",
            ));
        }
        let idx = (self.credentials.nonce.d % coordinators.len() as u64) as usize;
        let coordinator = &coordinators[idx];

        let req = InitService {
            node_id: self.credentials.node_id.clone(),
        };
        let res: InitServiceResponse = rpc::call(
            &*self.rpc,
            coordinator,
            method::GET_NODE_DATABASES,
            &req,
        )?;
        Ok(res.instances)
    }
}
