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

//! Coordinator database service.
//!
//! Create walks four phases: mine a fresh database id over the requesting
//! node identifier, allocate workers over the ring within the resource
//! floors, sign the membership and the genesis block, then propagate the
//! creation to every allocated worker in parallel. Any worker rejection
//! triggers a best-effort compensating drop on all of them.

use crate::{
    base::schema::{
        Block, BlockData, CreateDatabaseRequest, CreateDatabaseResponse, DatabaseId,
        DropDatabaseRequest, DropDatabaseResponse, GetDatabaseRequest, GetDatabaseResponse,
        InitService, InitServiceResponse, Node, NodeId, Peers, PeersData, ResourceMeta, Server,
        ServerRole, ServiceInstance, UpdateService, UpdateServiceResponse, BLOCK_VERSION,
    },
    channel::{simple_channel, Receiver, Sender},
    consistent::ConsistentRing,
    crypto::{Hash, NodeCredentials},
    metric::{metric_value, MetricMap, NodeMetrics, METRIC_FREE_FS_BYTES, METRIC_FREE_MEMORY_BYTES},
    pow::{CpuMiner, MiningBlock, NonceInfo, Uint256},
    producer::service_map::ServiceMap,
    rpc::{self, method, RpcCaller},
    Error, ErrorKind, Result,
};
use async_std::task;
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of node allocation rounds.
pub const DEFAULT_ALLOCATION_ROUNDS: usize = 3;

/// Difficulty of the database id proof of work, in leading zero bits.
/// Uniqueness comes from the service map check, so this stays low.
pub const ID_MINING_DIFFICULTY: u32 = 4;

/// Coordinator database service configuration.
pub struct DbServiceConfig {
    /// Max rounds of the node allocation loop.
    pub allocation_rounds: usize,
}

impl Default for DbServiceConfig {
    fn default() -> Self {
        DbServiceConfig {
            allocation_rounds: DEFAULT_ALLOCATION_ROUNDS,
        }
    }
}

/// Coordinator database service.
pub struct DbService<R: ConsistentRing, M: NodeMetrics, C: RpcCaller> {
    cfg: DbServiceConfig,
    service_map: Arc<ServiceMap>,
    ring: Arc<R>,
    metrics: Arc<M>,
    rpc: Arc<C>,
    credentials: Arc<NodeCredentials>,
    /// Closing this side aborts in-flight id mining.
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
}

impl<R: ConsistentRing, M: NodeMetrics, C: RpcCaller + 'static> DbService<R, M, C> {
    pub fn new(
        cfg: DbServiceConfig,
        service_map: Arc<ServiceMap>,
        ring: Arc<R>,
        metrics: Arc<M>,
        rpc: Arc<C>,
        credentials: Arc<NodeCredentials>,
    ) -> Self {
        let (quit_tx, quit_rx) = simple_channel();
        DbService {
            cfg,
            service_map,
            ring,
            metrics,
            rpc,
            credentials,
            quit_tx,
            quit_rx,
        }
    }

    /// Stop the service, aborting any in-flight id mining.
    pub fn stop(&self) {
        self.quit_tx.close();
    }

    /// Create a new replicated database.
    pub fn create_database(&self, req: &CreateDatabaseRequest) -> Result<CreateDatabaseResponse> {
        let (database_id, nonce) = self.generate_database_id(&req.node_id)?;
        let peers = self.allocate_nodes(0, &database_id, &req.resource_meta, nonce.nonce.d)?;
        let genesis_block = self.generate_genesis_block()?;

        let init_req = UpdateService::CreateDb {
            instance: ServiceInstance {
                database_id: database_id.clone(),
                peers: peers.clone(),
                resource_meta: req.resource_meta.clone(),
                genesis_block: Some(genesis_block),
            },
        };
        let rollback_req = UpdateService::DropDb {
            database_id: database_id.clone(),
        };
        self.batch_send_svc_req(&init_req, Some(&rollback_req), &peers.node_ids())?;

        let instance = ServiceInstance {
            database_id,
            peers,
            resource_meta: req.resource_meta.clone(),
            genesis_block: None,
        };
        if let Err(err) = self.service_map.set(instance.clone()) {
            // The workers accepted the creation but the authoritative map
            // could not record it: distributed state diverged from the map.
            // Workers re-read the authoritative state on their next boot.
            error!(
                "service map update failed after worker propagation, \
                 state diverged for database {}: {}",
                instance.database_id,
                err.to_string_full()
            );
            return Err(err);
        }

        Ok(CreateDatabaseResponse { instance })
    }

    /// Drop a database on every peer, then remove it from the map.
    ///
    /// The map entry is removed only after all workers acknowledged the
    /// drop.
    pub fn drop_database(&self, req: &DropDatabaseRequest) -> Result<DropDatabaseResponse> {
        let instance = self.service_map.get(&req.database_id)?;

        let drop_req = UpdateService::DropDb {
            database_id: req.database_id.clone(),
        };
        self.batch_send_svc_req(&drop_req, None, &instance.peers.node_ids())?;

        self.service_map.delete(&req.database_id)?;
        Ok(DropDatabaseResponse::default())
    }

    /// Look up a database instance.
    pub fn get_database(&self, req: &GetDatabaseRequest) -> Result<GetDatabaseResponse> {
        let instance = self.service_map.get(&req.database_id)?;
        Ok(GetDatabaseResponse { instance })
    }

    /// Instances mapped to a worker node, used by workers during their boot
    /// reconciliation.
    pub fn get_node_databases(&self, req: &InitService) -> Result<InitServiceResponse> {
        let instances = self.service_map.get_databases(&req.node_id)?;
        Ok(InitServiceResponse { instances })
    }

    /// Mine a database id not present in the service map.
    ///
    /// The miner streams candidate nonces from a dedicated thread; the first
    /// hash the map does not know is accepted. Closing the service quit
    /// channel aborts the search.
    fn generate_database_id(&self, node_id: &NodeId) -> Result<(DatabaseId, NonceInfo)> {
        let (nonce_tx, nonce_rx) = simple_channel();
        let quit = self.quit_rx.clone();
        let data = node_id.to_string().into_bytes();

        let handle = thread::spawn(move || {
            let miner = CpuMiner::new(quit);
            let block = MiningBlock { data, nonce_tx };
            miner.compute_block_nonce(&block, Uint256::default(), ID_MINING_DIFFICULTY);
        });

        let result = loop {
            let info = match nonce_rx.recv_sync() {
                Ok(info) => info,
                Err(err) => break Err(Error::new_ext(ErrorKind::Other, err)),
            };
            let database_id = DatabaseId(info.hash.to_hex());
            match self.service_map.get(&database_id) {
                Err(err) if err.kind == ErrorKind::NoSuchDatabase => {
                    break Ok((database_id, info));
                }
                // Hash collision with a live database: try the next nonce.
                Ok(_) => continue,
                Err(err) => break Err(err),
            }
        };

        nonce_rx.close();
        let _ = handle.join();
        result
    }

    /// Allocate workers for a database, widening the ring neighbourhood on
    /// every failed round.
    fn allocate_nodes(
        &self,
        last_term: u64,
        database_id: &DatabaseId,
        resource: &ResourceMeta,
        seed: u64,
    ) -> Result<Peers> {
        if resource.node_count == 0 {
            return Err(Error::new_ext(
                ErrorKind::AllocationFailed,
                "at least one node is required",
            ));
        }
        let required = resource.node_count as usize;
        let mut cur_range = required;
        let mut excluded: HashSet<NodeId> = HashSet::new();

        for round in 0..self.cfg.allocation_rounds {
            debug!("node allocation round {}", round + 1);

            let nodes = self.ring.get_neighbors(&database_id.to_string(), cur_range);
            debug!("found {} neighbour nodes", nodes.len());

            let candidates: Vec<&Node> = nodes
                .iter()
                .filter(|node| !excluded.contains(&node.id))
                .collect();
            let candidate_ids: Vec<NodeId> =
                candidates.iter().map(|node| node.id.clone()).collect();

            let metrics = self.metrics.get_metrics(&candidate_ids);
            debug!(
                "got {} metric records for {} nodes",
                metrics.len(),
                candidate_ids.len()
            );

            let mut allocated: Vec<&Node> = Vec::new();
            for node in &candidates {
                if node_fits(&metrics, node, resource) {
                    allocated.push(*node);
                } else {
                    excluded.insert(node.id.clone());
                }
            }

            if allocated.len() >= required {
                allocated.truncate(required);
                return self.build_peers(last_term + 1, &allocated, seed);
            }

            cur_range += required;
        }

        Err(Error::new(ErrorKind::AllocationFailed))
    }

    /// Build the signed membership for the allocated nodes, in ring order.
    fn build_peers(&self, term: u64, allocated: &[&Node], seed: u64) -> Result<Peers> {
        // TODO: replace the uniform pick with a load-aware leader selection.
        let mut rng = Pcg32::seed_from_u64(seed);
        let leader_idx = (rng.next_u32() as usize) % allocated.len();

        let mut servers = Vec::with_capacity(allocated.len());
        for (idx, node) in allocated.iter().enumerate() {
            let role = if idx == leader_idx {
                ServerRole::Leader
            } else {
                ServerRole::Follower
            };
            servers.push(Server {
                role,
                id: node.id.clone(),
                public_key: node.public_key.clone(),
            });
        }

        let data = PeersData {
            term,
            leader: allocated[leader_idx].id.clone(),
            servers,
            public_key: self.credentials.public_key(),
        };
        Peers::new(data, &self.credentials.keypair)
    }

    fn generate_genesis_block(&self) -> Result<Block> {
        let data = BlockData {
            version: BLOCK_VERSION,
            producer: self.credentials.node_id.clone(),
            genesis_hash: Hash::default(),
            parent_hash: Hash::default(),
            timestamp: unix_secs(),
            signee: self.credentials.public_key(),
        };
        Block::new(data, &self.credentials.keypair)
    }

    /// Fan out a service request; on any failure dispatch the compensating
    /// request to every node that received the forward one.
    fn batch_send_svc_req(
        &self,
        req: &UpdateService,
        rollback_req: Option<&UpdateService>,
        nodes: &[NodeId],
    ) -> Result<()> {
        if let Err(err) = self.batch_send_single_svc_req(req, nodes) {
            if let Some(rollback_req) = rollback_req {
                // Best effort: the original error is the one reported.
                if let Err(rb_err) = self.batch_send_single_svc_req(rollback_req, nodes) {
                    warn!(
                        "compensating request dispatch failure: {}",
                        rb_err.to_string_full()
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Send one service request to every node in parallel. All replies are
    /// awaited; the first error is reported.
    fn batch_send_single_svc_req(&self, req: &UpdateService, nodes: &[NodeId]) -> Result<()> {
        let (err_tx, err_rx) = simple_channel();

        for node in nodes {
            let rpc = self.rpc.clone();
            let req = req.clone();
            let node = node.clone();
            let err_tx = err_tx.clone();
            task::spawn(async move {
                let res: Result<UpdateServiceResponse> =
                    rpc::call(&*rpc, &node, method::UPDATE, &req);
                let _ = err_tx.send(res.map(|_| ())).await;
            });
        }

        let mut first = Ok(());
        for _ in 0..nodes.len() {
            match err_rx.recv_sync() {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    if first.is_ok() {
                        first = Err(err);
                    }
                }
                Err(err) => {
                    if first.is_ok() {
                        first = Err(Error::new_ext(ErrorKind::BadNetwork, err));
                    }
                }
            }
        }
        first
    }
}

fn node_fits(metrics: &HashMap<NodeId, MetricMap>, node: &Node, resource: &ResourceMeta) -> bool {
    let node_metrics = match metrics.get(&node.id) {
        Some(node_metrics) => node_metrics,
        None => {
            debug!("no metrics collected for node {}", node.id);
            return false;
        }
    };

    let memory = match metric_value(node_metrics, METRIC_FREE_MEMORY_BYTES) {
        Ok(memory) => memory,
        Err(_) => {
            debug!("get node {} memory metric failed", node.id);
            return false;
        }
    };
    if memory < resource.memory {
        debug!("node {} memory does not meet the requested floor", node.id);
        return false;
    }

    if let Some(floor) = resource.storage {
        match metric_value(node_metrics, METRIC_FREE_FS_BYTES) {
            Ok(space) if space >= floor => (),
            _ => {
                debug!("node {} filesystem does not meet the requested floor", node.id);
                return false;
            }
        }
    }

    true
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
