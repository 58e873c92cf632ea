//! The per-flow feature evaluation DAG.
//!
//! A [`FeatureGraph`] owns one [`FeatureNode`] trait object per feature in a
//! flow's configured feature list, plus the wiring between them. It is
//! cloned fresh for every new flow (nodes carry no cross-flow state).

use std::collections::HashMap;

use crate::value::Value;

/// Index of a node within a [`FeatureGraph`].
pub type NodeId = usize;

/// Context passed to every node callback: the current event time and
/// whatever the node needs to know about the flow it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext {
    /// Event or expiry time, in nanoseconds.
    pub when: i64,
    /// True if the triggering packet travelled in the flow's forward
    /// direction (as fixed by the first packet observed for this key).
    pub forward: bool,
}

/// Why a flow's features are being finalized.
///
/// `Idle` and `Active` are kept distinct on purpose: the timer that arms one
/// does not fire the other's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Idle,
    Active,
    TcpEnd,
    Eof,
    Forced,
}

/// The handful of packet fields raw-packet features read directly, decoded
/// once per packet by the ingestion side of the pipeline and handed to every
/// root node in the graph.
#[derive(Debug, Clone, Copy)]
pub struct RawPacketView<'a> {
    pub timestamp: i64,
    pub total_len: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: Option<u8>,
    pub forward: bool,
    pub payload: &'a [u8],
}

/// TCP control bits, matching the wire layout of the TCP flags octet.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}

/// Capability set every feature node implements. A node overrides only the
/// callbacks relevant to its kind:
///
/// - raw-packet nodes override `observe_packet`
/// - per-packet / selection / multi nodes override `event`
/// - every node that contributes to the exported record overrides `stop`
/// - nodes with variable arity (the `get`/logic aggregators) override
///   `set_arguments`
pub trait FeatureNode: Send {
    /// Called once when the flow is created, before any packet is seen.
    fn start(&mut self, _ctx: &FlowContext) {}

    /// Called for every packet, only on nodes with no upstream input.
    fn observe_packet(&mut self, _pkt: &RawPacketView<'_>, _ctx: &FlowContext) -> Option<Value> {
        None
    }

    /// Called when an upstream node this node depends on produced a value.
    /// Returns `Some` to propagate a value to this node's own downstream
    /// consumers in the same tick.
    fn event(&mut self, _value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        None
    }

    /// Called once at flow termination. Nodes that contribute to the
    /// exported record return their final value here.
    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        None
    }

    /// Wires variadic/indexed arguments (the `n`-ary logic features and
    /// `get`) to the node ids that feed them, in declared argument order.
    fn set_arguments(&mut self, _arg_idx: usize, _nodes: &[NodeId]) {}
}

/// Per-node buffer for multi-input ("n-ary") features: each upstream source
/// fills one slot; the node fires once every slot has a value for the
/// current tick, then resets for the next one.
#[derive(Debug, Default)]
pub struct MultiSlotBuffer {
    slot_of: HashMap<NodeId, usize>,
    slots: Vec<Option<Value>>,
}

impl MultiSlotBuffer {
    /// Build a buffer with one slot per id in `nodes`, in that order.
    pub fn new(nodes: &[NodeId]) -> Self {
        let slot_of = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        Self {
            slot_of,
            slots: vec![None; nodes.len()],
        }
    }

    /// Record a value arriving from `source`. Returns `true` once every
    /// slot for the current tick has been filled.
    pub fn fill(&mut self, source: NodeId, value: Value) -> bool {
        if let Some(&idx) = self.slot_of.get(&source) {
            self.slots[idx] = Some(value);
        }
        self.slots.iter().all(Option::is_some)
    }

    /// Snapshot of the current slot values, in declared order. Only
    /// meaningful once [`fill`](Self::fill) has returned `true`.
    pub fn values(&self) -> Vec<&Value> {
        self.slots.iter().filter_map(|v| v.as_ref()).collect()
    }

    /// Clear all slots ahead of the next tick.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// One feature DAG, instantiated fresh per flow.
pub struct FeatureGraph {
    nodes: Vec<Box<dyn FeatureNode>>,
    /// For each node, the ids of the nodes that consume its output.
    outputs: Vec<Vec<NodeId>>,
    /// Nodes with no upstream input — the entry points for each packet.
    roots: Vec<NodeId>,
    /// Nodes whose `stop` value is written to the exported record, in
    /// declared field order.
    exports: Vec<NodeId>,
}

impl FeatureGraph {
    /// Build a graph from already-constructed nodes and their wiring.
    /// `edges[i]` lists the node ids that node `i` feeds.
    pub fn new(
        nodes: Vec<Box<dyn FeatureNode>>,
        edges: Vec<Vec<NodeId>>,
        roots: Vec<NodeId>,
        exports: Vec<NodeId>,
    ) -> Self {
        debug_assert_eq!(nodes.len(), edges.len());
        Self {
            nodes,
            outputs: edges,
            roots,
            exports,
        }
    }

    /// Run `start` on every node, in construction order.
    pub fn start(&mut self, ctx: &FlowContext) {
        for node in &mut self.nodes {
            node.start(ctx);
        }
    }

    /// Feed one packet into the graph, propagating any produced values
    /// through the DAG in the same tick.
    pub fn on_packet(&mut self, pkt: &RawPacketView<'_>, ctx: &FlowContext) {
        for idx in 0..self.roots.len() {
            let root = self.roots[idx];
            if let Some(value) = self.nodes[root].observe_packet(pkt, ctx) {
                self.propagate(root, value, ctx);
            }
        }
    }

    fn propagate(&mut self, source: NodeId, value: Value, ctx: &FlowContext) {
        let consumers = self.outputs[source].clone();
        for consumer in consumers {
            if let Some(next) = self.nodes[consumer].event(&value, ctx, source) {
                self.propagate(consumer, next, ctx);
            }
        }
    }

    /// Run `stop` on every node and return the exported record's values, in
    /// declared field order. Nodes are stopped in construction order so a
    /// later node's `stop` may still observe earlier ones via shared state
    /// set up through `set_arguments`, mirroring how `event` propagation
    /// runs construction-ordered within a tick.
    pub fn stop(&mut self, reason: EndReason, ctx: &FlowContext) -> Vec<Option<Value>> {
        let mut results = vec![None; self.nodes.len()];
        for (i, node) in self.nodes.iter_mut().enumerate() {
            results[i] = node.stop(reason, ctx);
        }
        self.exports.iter().map(|&id| results[id].clone()).collect()
    }
}
