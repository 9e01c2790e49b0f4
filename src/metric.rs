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

//! Node metrics access, as seen by the coordinator allocator.
//!
//! The collector lives outside this crate; the allocator only reads a
//! couple of free-resource gauges.

use crate::{base::schema::NodeId, ErrorKind, Result};
use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;

/// Metric name for free memory on a worker node.
pub const METRIC_FREE_MEMORY_BYTES: &str = "node_memory_free_bytes_total";
/// Metric name for free filesystem space on a worker node.
pub const METRIC_FREE_FS_BYTES: &str = "node_filesystem_free_bytes_total";

/// A collected metric sample.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum MetricValue {
    Gauge(f64),
    Counter(f64),
}

/// Metrics of a single node, by metric name.
pub type MetricMap = HashMap<String, MetricValue>;

/// Access to the last collected metrics of a set of nodes.
#[cfg_attr(test, automock)]
pub trait NodeMetrics: Send + Sync {
    /// Metrics of the requested nodes. Nodes with no collected metrics are
    /// absent from the result.
    fn get_metrics(&self, nodes: &[NodeId]) -> HashMap<NodeId, MetricMap>;
}

/// Extract a metric as an unsigned integer.
///
/// Both gauge and counter families are accepted; a missing metric yields a
/// `MetricNotCollected` error kind.
pub fn metric_value(metrics: &MetricMap, key: &str) -> Result<u64> {
    match metrics.get(key) {
        Some(MetricValue::Gauge(value)) => Ok(*value as u64),
        Some(MetricValue::Counter(value)) => Ok(*value as u64),
        None => ErrorKind::MetricNotCollected.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_and_counter_accepted() {
        let mut metrics = MetricMap::new();
        metrics.insert(
            METRIC_FREE_MEMORY_BYTES.to_owned(),
            MetricValue::Gauge(2048.0),
        );
        metrics.insert(
            METRIC_FREE_FS_BYTES.to_owned(),
            MetricValue::Counter(4096.0),
        );

        assert_eq!(metric_value(&metrics, METRIC_FREE_MEMORY_BYTES).unwrap(), 2048);
        assert_eq!(metric_value(&metrics, METRIC_FREE_FS_BYTES).unwrap(), 4096);
    }

    #[test]
    fn missing_metric() {
        let metrics = MetricMap::new();

        let err = metric_value(&metrics, METRIC_FREE_MEMORY_BYTES).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MetricNotCollected);
    }
}
