//! Run-level statistics for a flowtap pipeline invocation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::AtomicCounter;

/// Counters updated from the producer and worker threads without locking.
///
/// Every field corresponds to a quantity the pipeline promises to report;
/// decode/key-extraction failures are absorbed rather than propagated as
/// errors, so they must still be observable here.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Packets that failed header decode and were dropped.
    pub decode_errors: AtomicCounter,
    /// Packets that decoded but lacked a field required by the flow key.
    pub key_errors: AtomicCounter,
    /// Packets successfully attributed to a flow.
    pub packets_seen: AtomicCounter,
    /// Flows created (first packet of a new key).
    pub flows_created: AtomicCounter,
    /// Flow records emitted by the exporter.
    pub flows_exported: AtomicCounter,
    /// Batches currently between the producer and a worker's ring.
    pub buffers_in_flight: AtomicCounter,
}

impl EngineStats {
    /// New, all-zero stats block.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Packet/byte throughput meter, sampled on demand.
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    packets: AtomicU64,
    bytes: AtomicU64,
    last_snapshot: RwLock<(u64, u64, u64)>, // (timestamp_ns, packets, bytes)
}

impl ThroughputMeter {
    /// Record one packet of `bytes` length.
    #[inline(always)]
    pub fn record(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current rates (packets/sec, bytes/sec) since the last call.
    pub fn rates(&self) -> (f64, f64) {
        let now = crate::Timestamp::now().as_nanos();

        let current_packets = self.packets.load(Ordering::Relaxed);
        let current_bytes = self.bytes.load(Ordering::Relaxed);

        let (last_ts, last_pkts, last_bytes) = *self.last_snapshot.read();

        if last_ts == 0 {
            *self.last_snapshot.write() = (now, current_packets, current_bytes);
            return (0.0, 0.0);
        }

        let elapsed_secs = (now - last_ts) as f64 / 1_000_000_000.0;
        if elapsed_secs < 0.001 {
            return (0.0, 0.0);
        }

        let pps = (current_packets - last_pkts) as f64 / elapsed_secs;
        let bps = (current_bytes - last_bytes) as f64 / elapsed_secs;

        *self.last_snapshot.write() = (now, current_packets, current_bytes);
        (pps, bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.decode_errors.get(), 0);
        assert_eq!(stats.flows_exported.get(), 0);
    }

    #[test]
    fn throughput_meter_first_call_is_zero() {
        let meter = ThroughputMeter::default();
        assert_eq!(meter.rates(), (0.0, 0.0));
        meter.record(1500);
    }
}
