//! Process-wide feature registry: maps a feature name from a configuration
//! document to a constructor for the node that implements it. Built once at
//! startup and read concurrently afterwards — no further mutation.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::builtins::*;
use crate::graph::FeatureNode;

/// How many upstream arguments a registered feature expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// No upstream input; the node reads packets directly (raw-packet
    /// features).
    RawPacket,
    /// Exactly one upstream input (the common per-flow aggregator shape).
    Unary,
    /// Two upstream inputs, the first of which is a constant (`get`).
    Indexed,
    /// Any number of upstream inputs (`and`/`or`).
    Variadic,
}

type Ctor = fn() -> Box<dyn FeatureNode>;

/// One entry in the registry: how to build the node and how many arguments
/// it expects.
#[derive(Clone, Copy)]
pub struct FeatureDef {
    pub arity: Arity,
    pub ctor: Ctor,
}

fn builtins() -> HashMap<&'static str, FeatureDef> {
    let mut m: HashMap<&'static str, FeatureDef> = HashMap::new();

    let raw = |name: &'static str, ctor: Ctor| {
        (
            name,
            FeatureDef {
                arity: Arity::RawPacket,
                ctor,
            },
        )
    };
    let unary = |name: &'static str, ctor: Ctor| {
        (
            name,
            FeatureDef {
                arity: Arity::Unary,
                ctor,
            },
        )
    };

    for (name, def) in [
        raw("packetTotalCount", || Box::new(PacketTotalCount::default())),
        raw("octetTotalCount", || Box::new(OctetTotalCount::default())),
        raw("tcpSynTotalCount", || Box::new(TcpFlagCount::new(TcpFlag::Syn))),
        raw("tcpFinTotalCount", || Box::new(TcpFlagCount::new(TcpFlag::Fin))),
        raw("sourceTransportPort", || Box::new(SourceTransportPort::default())),
        unary("count", || Box::new(Count::default())),
        unary("mean", || Box::new(Mean::default())),
        unary("min", || Box::new(MinMax::new(Extreme::Min))),
        unary("minimum", || Box::new(MinMax::new(Extreme::Min))),
        unary("max", || Box::new(MinMax::new(Extreme::Max))),
        unary("maximum", || Box::new(MinMax::new(Extreme::Max))),
        unary("stdev", || Box::new(Stdev::default())),
        unary("variance", || Box::new(Variance::default())),
        unary("median", || Box::new(Median::default())),
        unary("mode", || Box::new(Mode::new(false))),
        unary("modeCount", || Box::new(Mode::new(true))),
        unary("distinct", || Box::new(Distinct::default())),
        unary("set", || Box::new(SetAgg::default())),
        unary("asString", || Box::new(AsString)),
    ] {
        m.insert(name, def);
    }

    m.insert(
        "and",
        FeatureDef {
            arity: Arity::Variadic,
            ctor: || Box::new(Logic::new(LogicOp::And, LogicKind::Flow)),
        },
    );
    m.insert(
        "or",
        FeatureDef {
            arity: Arity::Variadic,
            ctor: || Box::new(Logic::new(LogicOp::Or, LogicKind::Flow)),
        },
    );
    m.insert(
        "get",
        FeatureDef {
            arity: Arity::Indexed,
            ctor: || Box::new(Get::new(0)),
        },
    );

    m
}

static REGISTRY: OnceLock<HashMap<&'static str, FeatureDef>> = OnceLock::new();

/// Look up a built-in feature by name. Returns `None` for names the
/// configuration's feature catalog doesn't define — the caller should treat
/// that as a configuration error, not an internal one.
pub fn lookup(name: &str) -> Option<FeatureDef> {
    REGISTRY.get_or_init(builtins).get(name).copied()
}

/// Every registered feature name, for the `flowtap features` CLI command.
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.get_or_init(builtins).keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_total_count_is_registered_raw() {
        let def = lookup("packetTotalCount").expect("registered");
        assert_eq!(def.arity, Arity::RawPacket);
    }

    #[test]
    fn unknown_feature_is_absent() {
        assert!(lookup("notAFeature").is_none());
    }
}
