//! Built-in feature nodes: the raw-packet extractors needed by the test
//! scenarios, and the generic per-flow aggregators every custom feature
//! expression is eventually built out of.

use std::collections::{HashMap, HashSet};

use crate::graph::{tcp_flags, EndReason, FeatureNode, FlowContext, MultiSlotBuffer, NodeId, RawPacketView};
use crate::value::{upconvert, Value};

fn value_key(v: &Value) -> Vec<u8> {
    match v {
        Value::Int(x) => [&[0u8][..], &x.to_be_bytes()].concat(),
        Value::UInt(x) => [&[1u8][..], &x.to_be_bytes()].concat(),
        Value::Float(x) => [&[2u8][..], &x.to_bits().to_be_bytes()].concat(),
        Value::Time(_, x) => [&[3u8][..], &x.to_be_bytes()].concat(),
        Value::Bytes(b) => [&[4u8][..], b.as_slice()].concat(),
        Value::Str(s) => [&[5u8][..], s.as_bytes()].concat(),
        Value::Ip(ip) => [&[6u8][..], ip.to_string().as_bytes()].concat(),
        Value::Bool(b) => vec![7u8, *b as u8],
        Value::List(items) => {
            let mut out = vec![8u8];
            for item in items {
                out.extend(value_key(item));
            }
            out
        }
    }
}

/// Total order used by `min`/`max`/`median`/`mode`: numeric comparison when
/// both sides convert, lexicographic when both are strings, and a stable
/// byte-key fallback otherwise (per §4.4, "smaller numerically or
/// lexicographically").
fn value_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.to_float(), b.to_float()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => match (a, b) {
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            _ => value_key(a).cmp(&value_key(b)),
        },
    }
}

// ---------------------------------------------------------------------
// raw-packet extractors
// ---------------------------------------------------------------------

/// `packetTotalCount`: number of packets observed by the flow.
#[derive(Debug, Default)]
pub struct PacketTotalCount {
    count: u64,
}

impl FeatureNode for PacketTotalCount {
    fn observe_packet(&mut self, _pkt: &RawPacketView<'_>, _ctx: &FlowContext) -> Option<Value> {
        self.count += 1;
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::UInt(self.count))
    }
}

/// `octetTotalCount`: running sum of each packet's total length.
#[derive(Debug, Default)]
pub struct OctetTotalCount {
    total: u64,
}

impl FeatureNode for OctetTotalCount {
    fn observe_packet(&mut self, pkt: &RawPacketView<'_>, _ctx: &FlowContext) -> Option<Value> {
        self.total += pkt.total_len as u64;
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::UInt(self.total))
    }
}

/// Which TCP control bit a [`TcpFlagCount`] tallies.
#[derive(Debug, Clone, Copy)]
pub enum TcpFlag {
    Syn,
    Fin,
}

impl TcpFlag {
    fn mask(self) -> u8 {
        match self {
            TcpFlag::Syn => tcp_flags::SYN,
            TcpFlag::Fin => tcp_flags::FIN,
        }
    }
}

/// `tcpSynTotalCount` / `tcpFinTotalCount`: packets in the flow carrying the
/// given TCP control bit.
#[derive(Debug)]
pub struct TcpFlagCount {
    flag: TcpFlag,
    count: u64,
}

impl TcpFlagCount {
    pub fn new(flag: TcpFlag) -> Self {
        Self { flag, count: 0 }
    }
}

impl FeatureNode for TcpFlagCount {
    fn observe_packet(&mut self, pkt: &RawPacketView<'_>, _ctx: &FlowContext) -> Option<Value> {
        if let Some(flags) = pkt.tcp_flags {
            if flags & self.flag.mask() != 0 {
                self.count += 1;
            }
        }
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::UInt(self.count))
    }
}

/// `sourceTransportPort`: transport-layer source port of each observed
/// packet, as carried on the wire. Emits once per packet, so downstream
/// aggregators see the whole series; its own `stop` reports the most
/// recently observed port for direct export.
#[derive(Debug, Default)]
pub struct SourceTransportPort {
    last: Option<u16>,
}

impl FeatureNode for SourceTransportPort {
    fn observe_packet(&mut self, pkt: &RawPacketView<'_>, _ctx: &FlowContext) -> Option<Value> {
        self.last = Some(pkt.src_port);
        Some(Value::UInt(pkt.src_port as u64))
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        self.last.map(|p| Value::UInt(p as u64))
    }
}

/// `asString`: renders any upstream value as text, for aggregators (like
/// `median`) whose downstream ordering should be lexicographic rather than
/// numeric.
#[derive(Debug, Default)]
pub struct AsString;

impl FeatureNode for AsString {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        Some(Value::Str(display_value(value)))
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Int(x) => x.to_string(),
        Value::UInt(x) => x.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Time(_, x) => x.to_string(),
        Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        Value::Str(s) => s.clone(),
        Value::Ip(ip) => ip.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => items.iter().map(display_value).collect::<Vec<_>>().join(";"),
    }
}

// ---------------------------------------------------------------------
// generic per-flow aggregators (fed by an upstream selection/raw node)
// ---------------------------------------------------------------------

/// `count`: number of events seen, regardless of value.
#[derive(Debug, Default)]
pub struct Count {
    count: u64,
}

impl FeatureNode for Count {
    fn event(&mut self, _value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        self.count += 1;
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::UInt(self.count))
    }
}

/// `mean`: arithmetic mean of every value seen. Emits nothing if no events
/// arrived.
#[derive(Debug, Default)]
pub struct Mean {
    total: f64,
    count: u64,
}

impl FeatureNode for Mean {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        if let Some(v) = value.to_float() {
            self.total += v;
            self.count += 1;
        }
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        if self.count == 0 {
            None
        } else {
            Some(Value::Float(self.total / self.count as f64))
        }
    }
}

/// Which extreme a [`MinMax`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Min,
    Max,
}

/// `min`/`minimum`/`max`/`maximum`: the smallest or largest value seen,
/// upconverted against the running extreme on each event.
#[derive(Debug)]
pub struct MinMax {
    extreme: Extreme,
    current: Option<Value>,
}

impl MinMax {
    pub fn new(extreme: Extreme) -> Self {
        Self { extreme, current: None }
    }
}

impl FeatureNode for MinMax {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        self.current = Some(match self.current.take() {
            None => value.clone(),
            Some(current) => {
                let (a, b) = upconvert(current, value.clone());
                let ord = value_cmp(&b, &a);
                let take_b = match self.extreme {
                    Extreme::Min => ord == std::cmp::Ordering::Less,
                    Extreme::Max => ord == std::cmp::Ordering::Greater,
                };
                if take_b {
                    b
                } else {
                    a
                }
            }
        });
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        self.current.clone()
    }
}

/// Shared Welford accumulator for [`Stdev`]/[`Variance`].
#[derive(Debug, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn add(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }
}

/// `stdev`: sample standard deviation via Welford's online algorithm.
#[derive(Debug, Default)]
pub struct Stdev(Welford);

impl FeatureNode for Stdev {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        if let Some(v) = value.to_float() {
            self.0.add(v);
        }
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        if self.0.count == 0 {
            None
        } else {
            Some(Value::Float((self.0.m2 / (self.0.count as f64 - 1.0)).sqrt()))
        }
    }
}

/// `variance`: sample variance via the same accumulator as [`Stdev`].
#[derive(Debug, Default)]
pub struct Variance(Welford);

impl FeatureNode for Variance {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        if let Some(v) = value.to_float() {
            self.0.add(v);
        }
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        if self.0.count > 1 {
            Some(Value::Float(self.0.m2 / (self.0.count as f64 - 1.0)))
        } else {
            None
        }
    }
}

/// `median`: order statistic via partial selection. When the sample size is
/// even, numeric middle pairs are averaged; non-numeric middle pairs yield
/// the smaller of the two per §4.4.
#[derive(Debug, Default)]
pub struct Median {
    values: Vec<Value>,
}

impl FeatureNode for Median {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        self.values.push(value.clone());
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        let k = self.values.len();
        if k == 0 {
            return None;
        }
        let mut data = self.values.clone();
        if k % 2 == 1 {
            let mid = k / 2;
            let (_, median, _) = data.select_nth_unstable_by(mid, |a, b| value_cmp(a, b));
            Some(median.clone())
        } else {
            let hi = k / 2;
            let (lower_half, upper, _) = data.select_nth_unstable_by(hi, |a, b| value_cmp(a, b));
            let upper = upper.clone();
            let lower = lower_half
                .iter()
                .cloned()
                .reduce(|acc, v| if value_cmp(&v, &acc) == std::cmp::Ordering::Greater { v } else { acc })
                .expect("even sample size implies a non-empty lower half");
            match (lower.to_float(), upper.to_float()) {
                (Some(a), Some(b)) => Some(Value::Float((a + b) / 2.0)),
                _ if value_cmp(&lower, &upper) == std::cmp::Ordering::Less => Some(lower),
                _ => Some(upper),
            }
        }
    }
}

/// `mode`/`modeCount`: most frequent value, breaking ties toward the
/// smaller value. Set `emit_count` to report the winning count instead of
/// the value itself.
#[derive(Debug, Default)]
pub struct Mode {
    counts: HashMap<Vec<u8>, (Value, u64)>,
    emit_count: bool,
}

impl Mode {
    pub fn new(emit_count: bool) -> Self {
        Self {
            counts: HashMap::new(),
            emit_count,
        }
    }
}

impl FeatureNode for Mode {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        let key = value_key(value);
        let entry = self.counts.entry(key).or_insert_with(|| (value.clone(), 0));
        entry.1 += 1;
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        if self.counts.is_empty() {
            return if self.emit_count {
                Some(Value::Float(f64::NAN))
            } else {
                None
            };
        }
        let mut best: Option<&(Value, u64)> = None;
        for candidate in self.counts.values() {
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if candidate.1 > current.1
                        || (candidate.1 == current.1
                            && value_cmp(&candidate.0, &current.0) == std::cmp::Ordering::Less)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        let (value, count) = best.unwrap();
        Some(if self.emit_count {
            Value::UInt(*count)
        } else {
            value.clone()
        })
    }
}

/// `distinct`: number of distinct values seen.
#[derive(Debug, Default)]
pub struct Distinct {
    seen: HashSet<Vec<u8>>,
}

impl FeatureNode for Distinct {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        self.seen.insert(value_key(value));
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::UInt(self.seen.len() as u64))
    }
}

/// `set`: insertion-ordered list of distinct values seen.
#[derive(Debug, Default)]
pub struct SetAgg {
    seen: HashSet<Vec<u8>>,
    values: Vec<Value>,
}

impl FeatureNode for SetAgg {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        if self.seen.insert(value_key(value)) {
            self.values.push(value.clone());
        }
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        Some(Value::List(self.values.clone()))
    }
}

/// `get(i, x)`: the value of `x` at its `i`-th occurrence (0-indexed).
#[derive(Debug)]
pub struct Get {
    index: u64,
    seen: u64,
    captured: Option<Value>,
}

impl Get {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            seen: 0,
            captured: None,
        }
    }
}

impl FeatureNode for Get {
    fn event(&mut self, value: &Value, _ctx: &FlowContext, _source: NodeId) -> Option<Value> {
        if self.seen == self.index && self.captured.is_none() {
            self.captured = Some(value.clone());
        }
        self.seen += 1;
        None
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        self.captured.clone()
    }
}

/// Whether a [`Logic`] node evaluates `and` or `or`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// Whether a [`Logic`] node fires per-packet (propagates each resolved
/// tick) or per-flow (only its `stop` value matters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicKind {
    Packet,
    Flow,
}

/// `and`/`or` over `n` upstream boolean inputs, short-circuiting within a
/// tick once the result is determined.
#[derive(Debug)]
pub struct Logic {
    op: LogicOp,
    kind: LogicKind,
    buffer: MultiSlotBuffer,
    last: Option<bool>,
}

impl Logic {
    pub fn new(op: LogicOp, kind: LogicKind) -> Self {
        Self {
            op,
            kind,
            buffer: MultiSlotBuffer::default(),
            last: None,
        }
    }

    fn identity(&self) -> bool {
        self.op == LogicOp::And
    }
}

impl FeatureNode for Logic {
    fn set_arguments(&mut self, _arg_idx: usize, nodes: &[NodeId]) {
        self.buffer = MultiSlotBuffer::new(nodes);
    }

    fn event(&mut self, value: &Value, _ctx: &FlowContext, source: NodeId) -> Option<Value> {
        let ready = self.buffer.fill(source, value.clone());
        if !ready {
            return None;
        }
        let result = self.buffer.values().iter().fold(self.identity(), |acc, v| {
            let b = matches!(v, Value::Bool(true));
            match self.op {
                LogicOp::And => acc && b,
                LogicOp::Or => acc || b,
            }
        });
        self.buffer.reset();
        self.last = Some(result);
        match self.kind {
            LogicKind::Packet => Some(Value::Bool(result)),
            LogicKind::Flow => None,
        }
    }

    fn stop(&mut self, _reason: EndReason, _ctx: &FlowContext) -> Option<Value> {
        self.last.map(Value::Bool)
    }
}
