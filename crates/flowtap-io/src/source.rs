//! Packet sources: where raw frames come from before decoding.

use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::Path;

use flowtap_common::{FlowError, FlowResult};
use flowtap_engine::buffer::PacketRecord;

use crate::decode::{decode_frame, KeyField};

/// A stream of raw Ethernet frames with their capture timestamps, yielding
/// decoded records. Sources are single-threaded iterators; the producer
/// loop sharding them into rings lives in the CLI's pipeline runner.
pub trait PacketSource {
    /// Pull the next frame, decode it into a [`PacketRecord`], or `Ok(None)`
    /// once the source is exhausted.
    fn next_record(&mut self) -> FlowResult<Option<PacketRecord>>;
}

/// Minimal PCAP (classic, not pcapng) file reader: global header, then a
/// sequence of `(per-packet header, frame bytes)` records.
pub struct PcapFileSource {
    reader: BufReader<File>,
    swapped: bool,
    fields: Vec<KeyField>,
    bidirectional: bool,
}

const PCAP_MAGIC_LE: u32 = 0xa1b2c3d4;
const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3b2a1;

impl PcapFileSource {
    /// Open a pcap file and validate its global header.
    pub fn open(path: &Path, fields: Vec<KeyField>, bidirectional: bool) -> FlowResult<Self> {
        let file = File::open(path).map_err(FlowError::SourceIo)?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; 24];
        reader.read_exact(&mut header).map_err(FlowError::SourceIo)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let swapped = match magic {
            PCAP_MAGIC_LE => false,
            PCAP_MAGIC_SWAPPED => true,
            other => {
                return Err(FlowError::Decode(format!(
                    "not a pcap file (magic {other:#010x})"
                )))
            }
        };
        Ok(Self {
            reader,
            swapped,
            fields,
            bidirectional,
        })
    }

    fn read_u32(&mut self) -> FlowResult<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(Some(if self.swapped {
                u32::from_be_bytes(buf)
            } else {
                u32::from_le_bytes(buf)
            })),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(FlowError::SourceIo(e)),
        }
    }
}

impl PacketSource for PcapFileSource {
    fn next_record(&mut self) -> FlowResult<Option<PacketRecord>> {
        let ts_sec = match self.read_u32()? {
            Some(v) => v,
            None => return Ok(None),
        };
        let ts_usec = self
            .read_u32()?
            .ok_or_else(|| FlowError::Decode("truncated pcap packet header".into()))?;
        let incl_len = self
            .read_u32()?
            .ok_or_else(|| FlowError::Decode("truncated pcap packet header".into()))?;
        let _orig_len = self
            .read_u32()?
            .ok_or_else(|| FlowError::Decode("truncated pcap packet header".into()))?;

        let mut frame = vec![0u8; incl_len as usize];
        self.reader.read_exact(&mut frame).map_err(FlowError::SourceIo)?;

        let timestamp = ts_sec as i64 * 1_000_000_000 + ts_usec as i64 * 1_000;
        decode_frame(&frame, timestamp, &self.fields, self.bidirectional).map(Some)
    }
}

/// A deterministic in-memory source for tests and demos: replays a fixed
/// list of pre-built Ethernet frames with monotonically increasing
/// timestamps.
pub struct SyntheticSource {
    frames: std::vec::IntoIter<(i64, Vec<u8>)>,
    fields: Vec<KeyField>,
    bidirectional: bool,
}

impl SyntheticSource {
    /// Build a source from `(timestamp_ns, frame_bytes)` pairs.
    pub fn new(frames: Vec<(i64, Vec<u8>)>, fields: Vec<KeyField>, bidirectional: bool) -> Self {
        Self {
            frames: frames.into_iter(),
            fields,
            bidirectional,
        }
    }
}

impl PacketSource for SyntheticSource {
    fn next_record(&mut self) -> FlowResult<Option<PacketRecord>> {
        match self.frames.next() {
            Some((timestamp, frame)) => {
                decode_frame(&frame, timestamp, &self.fields, self.bidirectional).map(Some)
            }
            None => Ok(None),
        }
    }
}
