//! A single flow's timers and feature state.

use std::collections::BTreeMap;

use flowtap_features::graph::tcp_flags;
use flowtap_features::{EndReason, FeatureGraph, FlowContext, RawPacketView};

use crate::buffer::PacketRecord;
use crate::key::FlowKey;

/// Default idle timeout: 300 seconds, in nanoseconds.
pub const DEFAULT_IDLE_TIMEOUT_NS: i64 = 300 * 1_000_000_000;
/// Default active timeout: 1800 seconds, in nanoseconds.
pub const DEFAULT_ACTIVE_TIMEOUT_NS: i64 = 1800 * 1_000_000_000;

/// Which terminal condition a flow's timer fires for. Kept as three
/// distinct kinds so the active timer can never be mistaken for the idle
/// one at export time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Idle,
    Active,
}

impl TimerKind {
    fn end_reason(self) -> EndReason {
        match self {
            TimerKind::Idle => EndReason::Idle,
            TimerKind::Active => EndReason::Active,
        }
    }
}

/// A flow's mutable state between the table owning it and its feature
/// graph: the arming timers, protocol-driven end detection, and the graph
/// itself.
pub struct Flow {
    pub key: FlowKey,
    timers: BTreeMap<TimerKind, i64>,
    idle_timeout_ns: i64,
    active_timeout_ns: i64,
    tcp_expiry: bool,
    tcp_ended: bool,
    pub packets_seen: u64,
    last_timestamp: i64,
    pub graph: FeatureGraph,
}

impl Flow {
    /// Start a new flow for `key`, arming its graph at `when`.
    pub fn new(
        key: FlowKey,
        mut graph: FeatureGraph,
        when: i64,
        idle_timeout_ns: i64,
        active_timeout_ns: i64,
        tcp_expiry: bool,
    ) -> Self {
        graph.start(&FlowContext { when, forward: true });
        let mut timers = BTreeMap::new();
        timers.insert(TimerKind::Idle, when + idle_timeout_ns);
        timers.insert(TimerKind::Active, when + active_timeout_ns);
        Self {
            key,
            timers,
            idle_timeout_ns,
            active_timeout_ns,
            tcp_expiry,
            tcp_ended: false,
            packets_seen: 0,
            last_timestamp: when,
            graph,
        }
    }

    /// Timestamp of the most recent packet this flow observed, used to
    /// resolve the EOF expiry sentinel to a real time.
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    /// Earliest fire time still armed, used by the table to compute when the
    /// next expiry sweep across all flows needs to happen.
    pub fn next_expire(&self) -> Option<i64> {
        self.timers.values().copied().min()
    }

    /// Feed one packet to the flow: re-arms the idle timer, arms the active
    /// timer only once, runs the packet through the feature graph, and
    /// tracks TCP FIN/RST for protocol-driven expiry.
    pub fn event(&mut self, pkt: &PacketRecord) {
        self.packets_seen += 1;
        self.last_timestamp = pkt.timestamp;
        self.timers.insert(TimerKind::Idle, pkt.timestamp + self.idle_timeout_ns);
        self.timers
            .entry(TimerKind::Active)
            .or_insert(pkt.timestamp + self.active_timeout_ns);

        if self.tcp_expiry && pkt.protocol == 6 {
            if let Some(flags) = pkt.tcp_flags {
                if flags & (tcp_flags::RST | tcp_flags::FIN) != 0 {
                    self.tcp_ended = true;
                }
            }
        }

        let ctx = FlowContext {
            when: pkt.timestamp,
            forward: pkt.forward,
        };
        let view = RawPacketView {
            timestamp: pkt.timestamp,
            total_len: pkt.total_len,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
            tcp_flags: pkt.tcp_flags,
            forward: pkt.forward,
            payload: &pkt.payload,
        };
        self.graph.on_packet(&view, &ctx);
    }

    /// True once a FIN or RST has been observed on this flow — the
    /// TCP-specific expiry condition alongside the idle/active timers. A
    /// single control packet in either direction is enough (§4.3: "an
    /// observed FIN/RST causes the flow to export").
    pub fn tcp_ended(&self) -> bool {
        self.tcp_expiry && self.tcp_ended
    }

    /// Run one expiry check at time `when`: fires the earliest timer at or
    /// before `when`, if any. Idle and active both terminate the flow, so
    /// this returns the first qualifying reason rather than continuing a
    /// sweep across the remaining timer.
    pub fn expire(&mut self, when: i64) -> Option<EndReason> {
        self.timers
            .iter()
            .filter(|(_, &fire)| fire <= when)
            .min_by_key(|(kind, &fire)| (fire, **kind))
            .map(|(&kind, _)| kind.end_reason())
    }

    /// Finalize the flow's feature graph for `reason` at time `when`,
    /// returning the exported record's values in declared field order.
    pub fn export(&mut self, reason: EndReason, when: i64) -> Vec<Option<flowtap_features::Value>> {
        let ctx = FlowContext { when, forward: true };
        self.graph.stop(reason, &ctx)
    }
}
