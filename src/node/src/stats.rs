// Copyright 2024 TideKV Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-worker request statistics. Each client worker owns one shard and
//! updates it without contending with the others; `INFOSTATS` sums the
//! shards on demand.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tidekv_proto::client::TableStats;

#[derive(Clone, Copy, Debug, Default)]
struct TableCounters {
    total_queries: u64,
    last_queries: u64,
    qps: u64,
    bytes: u64,
}

/// One client worker's counters, keyed by table.
#[derive(Default)]
pub struct WorkerStats {
    tables: Mutex<HashMap<String, TableCounters>>,
}

impl WorkerStats {
    pub fn record(&self, table: &str, bytes: u64) {
        let mut tables = self.tables.lock();
        let counters = tables.entry(table.to_string()).or_default();
        counters.total_queries += 1;
        counters.bytes += bytes;
    }

    /// Recomputes the qps window. Called from the server cron.
    fn refresh(&self, interval_secs: u64) {
        let mut tables = self.tables.lock();
        for counters in tables.values_mut() {
            counters.qps = (counters.total_queries - counters.last_queries) / interval_secs.max(1);
            counters.last_queries = counters.total_queries;
        }
    }
}

pub struct ServerStats {
    workers: Vec<Arc<WorkerStats>>,
}

impl ServerStats {
    pub fn new(worker_num: usize) -> Self {
        Self {
            workers: (0..worker_num).map(|_| Arc::default()).collect(),
        }
    }

    pub fn worker(&self, index: usize) -> Arc<WorkerStats> {
        self.workers[index % self.workers.len()].clone()
    }

    pub fn refresh(&self, interval_secs: u64) {
        for worker in &self.workers {
            worker.refresh(interval_secs);
        }
    }

    /// Sums the per-worker shards. An empty `table_name` covers all tables.
    pub fn table_stats(&self, table_name: &str) -> Vec<TableStats> {
        let mut summed: HashMap<String, TableCounters> = HashMap::new();
        for worker in &self.workers {
            for (name, counters) in worker.tables.lock().iter() {
                if !table_name.is_empty() && name != table_name {
                    continue;
                }
                let entry = summed.entry(name.clone()).or_default();
                entry.total_queries += counters.total_queries;
                entry.qps += counters.qps;
                entry.bytes += counters.bytes;
            }
        }
        let mut stats: Vec<TableStats> = summed
            .into_iter()
            .map(|(table_name, counters)| TableStats {
                table_name,
                qps: counters.qps,
                total_queries: counters.total_queries,
            })
            .collect();
        stats.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_summed_across_workers() {
        let stats = ServerStats::new(2);
        stats.worker(0).record("t", 10);
        stats.worker(0).record("t", 10);
        stats.worker(1).record("t", 5);
        stats.worker(1).record("other", 1);

        let all = stats.table_stats("");
        assert_eq!(all.len(), 2);
        let t = all.iter().find(|s| s.table_name == "t").unwrap();
        assert_eq!(t.total_queries, 3);

        let filtered = stats.table_stats("other");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].total_queries, 1);
    }

    #[test]
    fn test_qps_window() {
        let stats = ServerStats::new(1);
        for _ in 0..30 {
            stats.worker(0).record("t", 1);
        }
        stats.refresh(10);
        assert_eq!(stats.table_stats("t")[0].qps, 3);

        // No traffic in the next window.
        stats.refresh(10);
        assert_eq!(stats.table_stats("t")[0].qps, 0);
    }
}
