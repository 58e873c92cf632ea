//! A single shard's flow map: the worker-owned `HashMap` that replaces the
//! teacher's lock-free open-addressing table, since each shard is only ever
//! touched by the one worker thread that owns it.

use std::collections::HashMap;
use std::sync::Arc;

use flowtap_features::{EndReason, FeatureGraph, Value};

use crate::buffer::PacketRecord;
use crate::flow::Flow;
use crate::key::FlowKey;

/// Builds a fresh [`FeatureGraph`] for each new flow. Shared across shards,
/// so it must not carry per-flow state itself.
pub type GraphFactory = Arc<dyn Fn() -> FeatureGraph + Send + Sync>;

/// Timeouts and behavior shared by every flow a shard owns.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    pub idle_timeout_ns: i64,
    pub active_timeout_ns: i64,
    pub tcp_expiry: bool,
}

/// One completed flow's exported values, in declared field order.
#[derive(Debug, Clone)]
pub struct ExportedRecord {
    pub reason: EndReason,
    pub when: i64,
    pub values: Vec<Option<Value>>,
}

/// The flows owned by one shard.
pub struct ShardTable {
    flows: HashMap<FlowKey, Flow>,
    config: TableConfig,
    graph_factory: GraphFactory,
}

impl ShardTable {
    pub fn new(config: TableConfig, graph_factory: GraphFactory) -> Self {
        Self {
            flows: HashMap::new(),
            config,
            graph_factory,
        }
    }

    /// Number of flows currently tracked.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Attribute one packet to its flow, creating the flow if this is its
    /// first packet. Returns an export if the packet itself ended the flow
    /// (TCP FIN/RST), since that doesn't wait for the next timer sweep.
    pub fn ingest(&mut self, pkt: PacketRecord) -> (bool, Option<ExportedRecord>) {
        let created = !self.flows.contains_key(&pkt.key);
        let flow = self.flows.entry(pkt.key.clone()).or_insert_with(|| {
            Flow::new(
                pkt.key.clone(),
                (self.graph_factory)(),
                pkt.timestamp,
                self.config.idle_timeout_ns,
                self.config.active_timeout_ns,
                self.config.tcp_expiry,
            )
        });
        flow.event(&pkt);

        if flow.tcp_ended() {
            let mut flow = self.flows.remove(&pkt.key).expect("just inserted");
            let values = flow.export(EndReason::TcpEnd, pkt.timestamp);
            return (
                created,
                Some(ExportedRecord {
                    reason: EndReason::TcpEnd,
                    when: pkt.timestamp,
                    values,
                }),
            );
        }
        (created, None)
    }

    /// Expire every flow whose timer is due at or before `when`.
    pub fn expire(&mut self, when: i64) -> Vec<ExportedRecord> {
        let due: Vec<FlowKey> = self
            .flows
            .iter_mut()
            .filter_map(|(key, flow)| flow.expire(when).map(|_| key.clone()))
            .collect();

        due.into_iter()
            .filter_map(|key| {
                let mut flow = self.flows.remove(&key)?;
                let reason = flow.expire(when).unwrap_or(EndReason::Forced);
                let values = flow.export(reason, when);
                Some(ExportedRecord { reason, when, values })
            })
            .collect()
    }

    /// Earliest fire time across every flow in this shard, or `None` if the
    /// shard is empty.
    pub fn next_expire(&self) -> Option<i64> {
        self.flows.values().filter_map(Flow::next_expire).min()
    }

    /// Drain and export every remaining flow at end of stream. The expiry
    /// protocol's sentinel time `-1` means "use the flow's last observed
    /// timestamp"; resolved here rather than carried downstream, since this
    /// is the only place that still has each flow's own history.
    pub fn eof(&mut self) -> Vec<ExportedRecord> {
        self.flows
            .drain()
            .map(|(_, mut flow)| {
                let when = flow.last_timestamp();
                let values = flow.export(EndReason::Eof, when);
                ExportedRecord {
                    reason: EndReason::Eof,
                    when,
                    values,
                }
            })
            .collect()
    }
}
