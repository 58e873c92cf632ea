//! flowtap-common - shared primitives for the flowtap flow exporter
//!
//! Holds the error taxonomy, nanosecond timestamps, and the lock-free
//! counters used by the engine and CLI to report run statistics.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;

pub use error::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// Nanosecond timestamp. Packet timestamps and timer fire-times are carried
/// as raw `i64`/`u64` nanoseconds throughout the engine; this wrapper is only
/// used where a monotonic wall-clock reading is needed (CLI, metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time in nanoseconds since the epoch.
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        Self(nanos)
    }

    /// Nanoseconds value.
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

/// Lock-free atomic counter used for the run-level statistics
/// (`decode_errors`, `key_errors`, `flows_created`, `flows_exported`, ...).
/// Most fields only ever grow; `buffers_in_flight` is the one gauge that
/// also goes down, via [`dec`](Self::dec).
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// New counter starting at `value`.
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment by one, returning the previous value.
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrement by one, returning the previous value.
    #[inline(always)]
    pub fn dec(&self) -> u64 {
        self.0.fetch_sub(1, Ordering::Relaxed)
    }

    /// Add `val`, returning the previous value.
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
