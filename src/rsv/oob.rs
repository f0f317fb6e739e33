//! This module contains the code to read and write the OOB header carried by every page of a
//! reserved-area record.
//!
//! The first 8 bytes follow the boot ROM's format: a 4-byte region magic, a little-endian 16-bit
//! erase count, and a little-endian 16-bit word holding a 15-bit timestamp plus a flag in the top
//! bit marking the last page of a record. A little-endian 32-bit record length follows, so a read
//! can return exactly the bytes that were written.

use deku::prelude::*;
use thiserror::Error;

/// Size of the boot ROM's part of the header
pub const OOB_HEADER_LEN: usize = 8;

/// Size of the whole header including the record-length trailer
pub const OOB_RECORD_LEN: usize = OOB_HEADER_LEN + 4;

/// Timestamps live in the low 15 bits of the stamp word
pub const TIMESTAMP_MASK: u16 = 0x7FFF;

const TAIL_FLAG: u16 = 0x8000;

/// Erased flash reads back as all ones, so an erase count of 0xFFFF means "unknown"
const ERASED_EC: u16 = 0xFFFF;

/// The raw, on-flash form of the header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RawOob {
    magic: [u8; 4],
    ec: u16,
    stamp: u16,
    len: u32,
}

/// This represents the fields of a record page header
///
/// This is meant to be more ergonomic to work with than RawOob, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct OobHeader {
    pub magic: [u8; 4],
    pub erase_count: u16,

    /// 15-bit wrapping counter, see [is_newer]
    pub timestamp: u16,

    /// Set on the last page of a record
    pub tail: bool,

    /// Length in bytes of the whole record this page belongs to
    pub record_len: u32,
}

impl OobHeader {
    pub fn new(magic: [u8; 4], erase_count: u16, timestamp: u16) -> Self {
        Self {
            magic,
            erase_count,
            timestamp: timestamp & TIMESTAMP_MASK,
            ..Default::default()
        }
    }

    pub fn tail(mut self, tail: bool) -> Self {
        self.tail = tail;
        self
    }

    pub fn record_len(mut self, len: u32) -> Self {
        self.record_len = len;
        self
    }

    /// The erase count, with the erased pattern read as zero
    pub fn known_erase_count(&self) -> u16 {
        match self.erase_count {
            ERASED_EC => 0,
            ec => ec,
        }
    }
}

impl From<RawOob> for OobHeader {
    fn from(value: RawOob) -> Self {
        let RawOob {
            magic,
            ec,
            stamp,
            len,
        } = value;

        Self {
            magic,
            erase_count: ec,
            timestamp: stamp & TIMESTAMP_MASK,
            tail: stamp & TAIL_FLAG != 0,
            record_len: len,
        }
    }
}

impl From<OobHeader> for RawOob {
    fn from(value: OobHeader) -> Self {
        let OobHeader {
            magic,
            erase_count,
            timestamp,
            tail,
            record_len,
        } = value;

        let tail = if tail { TAIL_FLAG } else { 0 };
        Self {
            magic,
            ec: erase_count,
            stamp: (timestamp & TIMESTAMP_MASK) | tail,
            len: record_len,
        }
    }
}

/// The OOB area handed to the codec is too short to hold a header at the configured offset
#[derive(Debug, Error, Eq, PartialEq)]
#[error("{len}-byte OOB area cannot hold a record header at offset {offset}")]
pub struct CorruptHeader {
    pub len: usize,
    pub offset: usize,
}

/// Turns record pages into (data, OOB) pairs for programming, and back
#[derive(Debug, Copy, Clone)]
pub struct RecordCodec {
    page_size: usize,
    oob_offset: usize,
}

impl RecordCodec {
    pub fn new(page_size: usize, oob_offset: usize) -> Self {
        Self {
            page_size,
            oob_offset,
        }
    }

    /// Build the data and OOB buffers for one page. `payload` is zero-padded to the page size;
    /// the OOB bytes ahead of the header are left erased.
    pub fn encode(&self, header: OobHeader, payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = vec![0u8; self.page_size];
        let len = payload.len().min(self.page_size);
        data[..len].copy_from_slice(&payload[..len]);

        let mut oob = vec![0xFFu8; self.oob_offset];
        let raw = RawOob::from(header)
            .to_bytes()
            .expect("fixed-width header always serializes");
        oob.extend_from_slice(&raw);

        (data, oob)
    }

    /// Pull the header out of a page's OOB bytes
    pub fn decode(&self, oob: &[u8]) -> Result<OobHeader, CorruptHeader> {
        let corrupt = || CorruptHeader {
            len: oob.len(),
            offset: self.oob_offset,
        };

        let bytes = oob
            .get(self.oob_offset..self.oob_offset + OOB_RECORD_LEN)
            .ok_or_else(corrupt)?;
        let (_, raw) = RawOob::from_bytes((bytes, 0)).map_err(|_| corrupt())?;

        Ok(raw.into())
    }
}

/// Is timestamp `a` newer than `b`, allowing for the counter wrapping around?
///
/// Two timestamps compare as serial numbers: `a` is newer when it is ahead of `b` by less than
/// half the counter range.
pub fn is_newer(a: u16, b: u16) -> bool {
    let distance = a.wrapping_sub(b) & TIMESTAMP_MASK;
    distance != 0 && distance < 0x4000
}

/// The timestamp that follows `ts`
pub fn next_timestamp(ts: u16) -> u16 {
    ts.wrapping_add(1) & TIMESTAMP_MASK
}

#[test]
fn test_header_bytes() -> anyhow::Result<()> {
    let codec = RecordCodec::new(16, 2);
    let header = OobHeader::new(*b"nenv", 0x0102, 0x0304)
        .tail(true)
        .record_len(0x11223344);

    let (data, oob) = codec.encode(header, b"hello");
    assert_eq!(data, b"hello\0\0\0\0\0\0\0\0\0\0\0");
    assert_eq!(
        oob,
        [
            0xFF, 0xFF, b'n', b'e', b'n', b'v', 0x02, 0x01, 0x04, 0x83, 0x44, 0x33, 0x22, 0x11
        ]
    );

    assert_eq!(codec.decode(&oob)?, header);
    Ok(())
}

#[test]
fn test_header_erased() -> anyhow::Result<()> {
    let codec = RecordCodec::new(16, 0);
    let header = codec.decode(&[0xFF; 16])?;

    assert_eq!(header.magic, [0xFF; 4]);
    assert!(header.tail);
    assert_eq!(header.timestamp, TIMESTAMP_MASK);
    assert_eq!(header.known_erase_count(), 0);

    assert_eq!(
        codec.decode(&[0xFF; 8]),
        Err(CorruptHeader { len: 8, offset: 0 })
    );
    Ok(())
}

#[test]
fn test_timestamp_order() {
    assert!(is_newer(1, 0));
    assert!(!is_newer(0, 1));
    assert!(!is_newer(5, 5));
    assert!(is_newer(0, 0x7FFF));
    assert!(is_newer(2, 0x7FF0));
    assert!(!is_newer(0x7FF0, 2));
    assert_eq!(next_timestamp(0x7FFF), 0);
    assert_eq!(next_timestamp(41), 42);
}
