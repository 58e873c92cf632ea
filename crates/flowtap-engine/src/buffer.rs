//! Packet batches and the bounded ring that hands them from the producer to
//! a shard's worker thread.

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::key::FlowKey;

/// Default number of packet slots per batch.
pub const DEFAULT_BATCH_SIZE: usize = 256;
/// Default number of batches kept in flight per shard (`R` in the design
/// notes: enough for one batch draining, one filling, and a couple spare).
pub const DEFAULT_RING_DEPTH: usize = 4;

/// One decoded packet, already key-extracted and direction-canonicalized.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub key: FlowKey,
    pub forward: bool,
    pub timestamp: i64,
    pub total_len: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: Option<u8>,
    pub payload: Vec<u8>,
}

/// A fixed-capacity batch of packets moving through a shard's ring.
///
/// `expire` marks a batch that should trigger an expiry sweep on the
/// consuming worker once drained, and an empty batch with `expire` set and
/// no records is how end-of-stream is signalled to a shard (the sentinel
/// time `-1` of the expiry protocol).
pub struct PacketBatch {
    records: Vec<PacketRecord>,
    capacity: usize,
    pub expire: bool,
    pub expire_when: i64,
}

impl PacketBatch {
    /// A fresh, empty batch with room for `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
            expire: false,
            expire_when: 0,
        }
    }

    /// True once the batch cannot accept another record.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Append a record. Panics if the batch is full — callers must check
    /// [`is_full`](Self::is_full) first, since the ring relies on batches
    /// never silently dropping a packet.
    pub fn push(&mut self, record: PacketRecord) {
        assert!(!self.is_full(), "pushed into a full packet batch");
        self.records.push(record);
    }

    /// Drain and reset the batch for reuse, returning its records in
    /// arrival order.
    pub fn drain(&mut self) -> Vec<PacketRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }

    /// Reset to an empty, non-expiring state before returning to the ring's
    /// `empty` channel.
    pub fn reset(&mut self) {
        self.records.clear();
        self.expire = false;
        self.expire_when = 0;
    }

    /// Records currently held, without draining.
    pub fn records(&self) -> &[PacketRecord] {
        &self.records
    }
}

/// The bounded producer/consumer hand-off for one shard: `R` preallocated
/// batches cycle `empty -> filling -> full -> draining -> empty`. The
/// producer blocks popping `empty` when the worker is behind; the worker
/// blocks popping `full` when there's nothing to do. This is the pipeline's
/// only synchronization point on the fast path.
pub struct Ring {
    empty_tx: Sender<PacketBatch>,
    empty_rx: Receiver<PacketBatch>,
    full_tx: Sender<PacketBatch>,
    full_rx: Receiver<PacketBatch>,
}

impl Ring {
    /// Build a ring with `depth` batches of `batch_size` capacity each, all
    /// starting in the `empty` channel.
    pub fn new(depth: usize, batch_size: usize) -> Self {
        let (empty_tx, empty_rx) = bounded(depth);
        let (full_tx, full_rx) = bounded(depth);
        for _ in 0..depth {
            empty_tx
                .send(PacketBatch::new(batch_size))
                .expect("ring channel just created, cannot be closed");
        }
        Self {
            empty_tx,
            empty_rx,
            full_tx,
            full_rx,
        }
    }

    /// Producer side: take the next empty batch to fill, blocking until one
    /// is available.
    pub fn acquire_empty(&self) -> Option<PacketBatch> {
        self.empty_rx.recv().ok()
    }

    /// Producer side: hand a filled batch to the worker.
    pub fn submit_full(&self, batch: PacketBatch) {
        let _ = self.full_tx.send(batch);
    }

    /// Worker side: take the next full batch to drain, blocking until one
    /// is available. Returns `None` once the producer has dropped its
    /// sender (no more batches will ever arrive).
    pub fn acquire_full(&self) -> Option<PacketBatch> {
        self.full_rx.recv().ok()
    }

    /// Worker side: return a drained batch to the producer's empty pool.
    pub fn recycle(&self, mut batch: PacketBatch) {
        batch.reset();
        let _ = self.empty_tx.send(batch);
    }

    /// Producer-side sender for `full`, cloneable so the producer can be
    /// dropped (closing the channel) independently of the ring.
    pub fn full_sender(&self) -> Sender<PacketBatch> {
        self.full_tx.clone()
    }

    /// Worker-side receiver for `full`, used to detect producer shutdown.
    pub fn full_receiver(&self) -> Receiver<PacketBatch> {
        self.full_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: u8) -> PacketRecord {
        PacketRecord {
            key: FlowKey::from_bytes(vec![key]),
            forward: true,
            timestamp: 0,
            total_len: 64,
            src_port: 1,
            dst_port: 2,
            protocol: 6,
            tcp_flags: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn batch_rejects_push_past_capacity() {
        let mut batch = PacketBatch::new(1);
        batch.push(record(1));
        assert!(batch.is_full());
    }

    #[test]
    fn ring_round_trips_a_batch() {
        let ring = Ring::new(2, 4);
        let mut batch = ring.acquire_empty().expect("ring seeded with empty batches");
        batch.push(record(1));
        ring.submit_full(batch);

        let full = ring.acquire_full().expect("batch just submitted");
        assert_eq!(full.records().len(), 1);
        ring.recycle(full);

        let recycled = ring.acquire_empty().expect("batch just recycled");
        assert!(recycled.records().is_empty());
    }
}
