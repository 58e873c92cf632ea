//! The worker pool: one thread per shard, each running to completion on
//! whatever batch its ring hands it, with no synchronization between
//! shards on the fast path.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use flowtap_common::metrics::EngineStats;
use tracing::debug;

use crate::buffer::{PacketBatch, Ring, DEFAULT_BATCH_SIZE, DEFAULT_RING_DEPTH};
use crate::key::FlowKey;
use crate::table::{ExportedRecord, GraphFactory, ShardTable, TableConfig};

/// Engine-wide knobs: shard count, batch geometry, and the timeouts every
/// shard's flows share.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub ring_depth: usize,
    pub table: TableConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            ring_depth: DEFAULT_RING_DEPTH,
            table: TableConfig {
                idle_timeout_ns: crate::flow::DEFAULT_IDLE_TIMEOUT_NS,
                active_timeout_ns: crate::flow::DEFAULT_ACTIVE_TIMEOUT_NS,
                tcp_expiry: true,
            },
        }
    }
}

/// Sentinel `expire_when` used on an empty, expiring batch to mean
/// end-of-stream rather than "sweep timers due at this time".
pub const EOF_SENTINEL: i64 = -1;

/// A running engine: one ring per shard for the producer to fill, and a
/// single channel every worker's completed flow records are funneled into.
pub struct Engine {
    rings: Vec<Arc<Ring>>,
    records_rx: Receiver<ExportedRecord>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// Spawn `config.workers` worker threads, each owning one shard's
    /// [`ShardTable`] and consuming its own [`Ring`]. `graph_factory` is
    /// shared read-only across every flow in every shard.
    pub fn start(config: EngineConfig, graph_factory: GraphFactory) -> Self {
        let shards = config.workers.max(1);
        let stats = Arc::new(EngineStats::new());
        let (records_tx, records_rx): (Sender<ExportedRecord>, Receiver<ExportedRecord>) = unbounded();

        let mut rings = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);

        for shard_id in 0..shards {
            let ring = Arc::new(Ring::new(config.ring_depth, config.batch_size));
            rings.push(ring.clone());

            let table = ShardTable::new(config.table, graph_factory.clone());
            let stats = stats.clone();
            let records_tx = records_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("flowtap-shard-{shard_id}"))
                .spawn(move || run_worker(shard_id, ring, table, stats, records_tx))
                .expect("failed to spawn shard worker thread");
            workers.push(handle);
        }

        Self {
            rings,
            records_rx,
            workers,
            stats,
        }
    }

    /// Shard index a key is routed to: fixed at construction, keys never
    /// migrate between shards.
    pub fn shard_for(&self, key: &FlowKey) -> usize {
        (key.hash() % self.rings.len() as u64) as usize
    }

    /// Ring for a given shard, for the producer to acquire batches from.
    pub fn ring(&self, shard: usize) -> &Ring {
        &self.rings[shard]
    }

    /// Hand a filled batch to a shard's worker, counting it against
    /// `buffers_in_flight` until the worker recycles it. The producer
    /// should submit through this rather than `ring(shard).submit_full`
    /// directly, so the gauge stays accurate.
    pub fn submit(&self, shard: usize, batch: PacketBatch) {
        self.stats.buffers_in_flight.inc();
        self.rings[shard].submit_full(batch);
    }

    /// Number of shards this engine was started with.
    pub fn shard_count(&self) -> usize {
        self.rings.len()
    }

    /// Receiver side of the exported-record channel every shard feeds.
    pub fn records(&self) -> &Receiver<ExportedRecord> {
        &self.records_rx
    }

    /// Run-level statistics, updated from every worker thread.
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Signal end-of-stream on every shard and wait for all worker threads
    /// to drain their remaining flows and exit.
    pub fn flush(self) {
        for ring in &self.rings {
            let mut eof_batch = PacketBatch::new(0);
            eof_batch.expire = true;
            eof_batch.expire_when = EOF_SENTINEL;
            self.stats.buffers_in_flight.inc();
            ring.submit_full(eof_batch);
        }
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    shard_id: usize,
    ring: Arc<Ring>,
    mut table: ShardTable,
    stats: Arc<EngineStats>,
    out: Sender<ExportedRecord>,
) {
    debug!(shard_id, "worker started");
    while let Some(mut batch) = ring.acquire_full() {
        let expire_flag = batch.expire;
        let expire_when = batch.expire_when;
        let was_empty = batch.records().is_empty();

        for pkt in batch.drain() {
            stats.packets_seen.inc();
            let (created, export) = table.ingest(pkt);
            if created {
                stats.flows_created.inc();
            }
            if let Some(record) = export {
                stats.flows_exported.inc();
                let _ = out.send(record);
            }
        }

        if expire_flag {
            let exported = if was_empty && expire_when == EOF_SENTINEL {
                table.eof()
            } else {
                table.expire(expire_when)
            };
            for record in exported {
                stats.flows_exported.inc();
                let _ = out.send(record);
            }
        }

        stats.buffers_in_flight.dec();
        if was_empty && expire_flag && expire_when == EOF_SENTINEL {
            // EOF batch is not recycled: this shard is done.
            break;
        }
        ring.recycle(batch);
    }
    debug!(shard_id, flows_remaining = table.len(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtap_features::graph::FeatureNode;
    use flowtap_features::FeatureGraph;

    struct NoopNode;
    impl FeatureNode for NoopNode {}

    fn factory() -> GraphFactory {
        Arc::new(|| FeatureGraph::new(vec![Box::new(NoopNode)], vec![vec![]], vec![], vec![0]))
    }

    #[test]
    fn shard_for_is_stable_for_a_given_key() {
        let engine = Engine::start(
            EngineConfig {
                workers: 4,
                ..EngineConfig::default()
            },
            factory(),
        );
        let key = FlowKey::from_bytes(vec![9, 9, 9]);
        let shard = engine.shard_for(&key);
        assert_eq!(engine.shard_for(&key), shard);
        engine.flush();
    }

    #[test]
    fn flush_drains_worker_threads() {
        let engine = Engine::start(EngineConfig::default(), factory());
        engine.flush();
    }

    #[test]
    fn buffers_in_flight_settles_to_zero_after_flush() {
        let engine = Engine::start(
            EngineConfig {
                workers: 1,
                ring_depth: 2,
                batch_size: 4,
                ..EngineConfig::default()
            },
            factory(),
        );
        let batch = engine.ring(0).acquire_empty().expect("ring seeded empty");
        engine.submit(0, batch);
        let stats = engine.stats().clone();
        engine.flush();
        assert_eq!(stats.buffers_in_flight.get(), 0);
    }
}
