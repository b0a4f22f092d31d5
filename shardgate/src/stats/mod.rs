//! Runtime counters and the status/schema report shapes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::net::DataType;

/// Latency summary over the recent window.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Health of one shard as reported by the status endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardHealth {
    pub id: String,
    pub healthy: bool,
    pub engine: String,
    pub query_count: u64,
    pub error_count: u64,
    /// Epoch milliseconds of the last query, 0 when idle since start.
    pub last_query: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyPercentiles>,
}

/// Whole-gateway status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterStatus {
    pub keyspace: String,
    pub shard_count: usize,
    pub engine: String,
    pub shards: Vec<ShardHealth>,
    pub total_queries: u64,
    pub total_errors: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaObjectKind {
    Table,
    View,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub kind: SchemaObjectKind,
    pub columns: Vec<ColumnSchema>,
}

const LATENCY_WINDOW: usize = 1024;

/// Per-shard counters. One writer per tablet, readers anywhere.
#[derive(Debug, Default)]
pub struct ShardCounters {
    queries: AtomicU64,
    errors: AtomicU64,
    last_query_ms: AtomicI64,
    latencies: Mutex<Vec<f64>>,
}

impl ShardCounters {
    pub fn record_query(&self, duration_ms: f64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.last_query_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        let mut latencies = self.latencies.lock();
        if latencies.len() >= LATENCY_WINDOW {
            latencies.remove(0);
        }
        latencies.push(duration_ms);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_query(&self) -> i64 {
        self.last_query_ms.load(Ordering::Relaxed)
    }

    /// Percentiles over the window; `None` until a query has run.
    pub fn latency(&self) -> Option<LatencyPercentiles> {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return None;
        }
        let mut sorted = latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let at = |q: f64| {
            let index = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[index.min(sorted.len() - 1)]
        };
        Some(LatencyPercentiles {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        })
    }
}
