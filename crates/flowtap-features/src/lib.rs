//! flowtap-features - the per-flow feature evaluation DAG.
//!
//! A flow's feature list compiles to a [`graph::FeatureGraph`]: a fixed set
//! of [`graph::FeatureNode`] trait objects wired together, instantiated
//! fresh per flow by [`registry`] lookups. [`value`] carries the type-erased
//! numeric value these nodes pass around, with the promotion rules needed
//! whenever two differently-typed values meet.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod builtins;
pub mod graph;
pub mod registry;
pub mod value;

pub use graph::{EndReason, FeatureGraph, FeatureNode, FlowContext, NodeId, RawPacketView};
pub use value::{upconvert, TimeUnit, Value};
