//! flowtap-io - packet decoding, sources, and exporters.
//!
//! This crate is the boilerplate surface around the core engine: turning raw
//! bytes into [`flowtap_engine::buffer::PacketRecord`]s ([`decode`]),
//! reading those bytes from somewhere ([`source`]), and writing finished
//! flow records somewhere else ([`export`]). None of it is load-bearing for
//! the flow table or feature DAG themselves.

#![warn(missing_docs)]

pub mod decode;
pub mod export;
pub mod source;

pub use decode::{decode_frame, KeyField};
pub use export::{CsvExporter, Exporter, IpfixExporter, NullExporter, SqlExporter};
pub use source::{PacketSource, PcapFileSource, SyntheticSource};
