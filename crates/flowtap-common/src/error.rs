//! Error taxonomy shared across the flowtap crates.

use thiserror::Error;

/// Error taxonomy for the flowtap pipeline.
///
/// Variants map to the buckets the pipeline distinguishes operationally:
/// configuration errors are fatal before the engine starts, decode/key errors
/// are counted and the offending packet is dropped, source/exporter I/O errors
/// propagate and end the run, and invariant violations abort.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Malformed or inconsistent configuration, caught before the engine starts.
    #[error("config error: {0}")]
    Config(String),

    /// A packet could not be decoded into header fields.
    #[error("decode error: {0}")]
    Decode(String),

    /// A decoded packet lacked a field required by the configured flow key.
    #[error("key rejected: {0}")]
    KeyReject(String),

    /// The packet source failed.
    #[error("source error: {0}")]
    SourceIo(#[source] std::io::Error),

    /// The exporter failed to write a record.
    #[error("exporter error: {0}")]
    ExporterIo(#[source] std::io::Error),

    /// An internal invariant was violated; the engine cannot continue safely.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Result type used throughout the flowtap pipeline.
pub type FlowResult<T> = Result<T, FlowError>;
