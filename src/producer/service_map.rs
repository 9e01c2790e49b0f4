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

//! Authoritative instance directory.
//!
//! Forward mapping from database id to service instance, with a
//! node-indexed inverse used by workers during boot reconciliation. Every
//! mutation keeps the two sides consistent.

use crate::{
    base::{
        schema::{DatabaseId, NodeId, ServiceInstance},
        Mutex,
    },
    Error, ErrorKind, Result,
};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct ServiceMapInner {
    /// Forward map: database id to instance record.
    instances: HashMap<DatabaseId, ServiceInstance>,
    /// Inverse index: node id to the databases it serves.
    node_index: HashMap<NodeId, HashSet<DatabaseId>>,
}

/// Coordinator-side directory of service instances.
#[derive(Default)]
pub struct ServiceMap {
    inner: Mutex<ServiceMapInner>,
}

impl ServiceMap {
    pub fn new() -> Self {
        ServiceMap::default()
    }

    /// Look up an instance by database id.
    ///
    /// A missing id yields the distinguished `NoSuchDatabase` error kind;
    /// the id-generation loop terminates on it.
    pub fn get(&self, database_id: &DatabaseId) -> Result<ServiceInstance> {
        self.inner
            .lock()
            .instances
            .get(database_id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NoSuchDatabase))
    }

    /// Insert or replace an instance record, updating the inverse index.
    pub fn set(&self, instance: ServiceInstance) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.instances.remove(&instance.database_id) {
            unindex(&mut inner, &previous);
        }
        for node_id in instance.peers.node_ids() {
            inner
                .node_index
                .entry(node_id)
                .or_insert_with(HashSet::new)
                .insert(instance.database_id.clone());
        }
        inner
            .instances
            .insert(instance.database_id.clone(), instance);
        Ok(())
    }

    /// Delete an instance record and its inverse entries.
    pub fn delete(&self, database_id: &DatabaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        let previous = inner
            .instances
            .remove(database_id)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchDatabase))?;
        unindex(&mut inner, &previous);
        Ok(())
    }

    /// Instances served by the given node. Unknown nodes serve nothing.
    pub fn get_databases(&self, node_id: &NodeId) -> Result<Vec<ServiceInstance>> {
        let inner = self.inner.lock();
        let mut instances = Vec::new();
        if let Some(ids) = inner.node_index.get(node_id) {
            let mut ids: Vec<_> = ids.iter().cloned().collect();
            ids.sort();
            for id in ids {
                if let Some(instance) = inner.instances.get(&id) {
                    instances.push(instance.clone());
                }
            }
        }
        Ok(instances)
    }
}

fn unindex(inner: &mut ServiceMapInner, instance: &ServiceInstance) {
    for node_id in instance.peers.node_ids() {
        if let Some(set) = inner.node_index.get_mut(&node_id) {
            set.remove(&instance.database_id);
            if set.is_empty() {
                inner.node_index.remove(&node_id);
            }
        }
    }
}
