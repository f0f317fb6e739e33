//! The reserved-area manager: small, crash-safe records (bad-block table, environment, keys,
//! device tree) kept in a fixed set of blocks near the start of the NAND.
//!
//! Every region is a ring of blocks. Records are appended page-wise to the current block until it
//! is full; then the next record goes to a fresh block taken from the region's free pool, and the
//! old block is returned to the pool once the new record has been read back. Each page carries an
//! OOB header (see [oob]) so that a scan after power loss can find the newest complete record.

use thiserror::Error;

use crate::nand::NandError;

pub mod bbt;
pub mod env;
mod manager;
pub mod oob;
pub mod pool;
pub mod region;
pub mod scan;
pub mod seed;

pub use bbt::{BadBlockTable, BlockStatus};
pub use manager::{ErasePolicy, RegionSnapshot, RsvManager, ScanResult, ScanState};
pub use oob::{OobHeader, RecordCodec};
pub use pool::{FreeBlock, FreeBlockPool, RESERVED_BLOCK_NUM};
pub use region::{
    PointerStatus, RegionDescriptor, RegionKind, RsvConfig, RsvLayout, ValidPointer,
};
pub use seed::{BadBlockSeeder, VendorProfile};

/// Errors surfaced by the reserved-area manager
#[derive(Debug, Error)]
pub enum RsvError {
    #[error(transparent)]
    Io(#[from] NandError),

    #[error("{region} record at block {block}, page {page} is corrupt")]
    Corrupt {
        region: RegionKind,
        block: u32,
        page: u32,
    },

    #[error("no valid {0} record")]
    NoValidRecord(RegionKind),

    #[error("block {0} belongs to the reserved area and is erase-protected")]
    ProtectedBlock(u32),

    #[error("writing {region} record to block {block} failed")]
    WriteFailed { region: RegionKind, block: u32 },

    #[error("no usable block left in the {0} region")]
    PoolExhausted(RegionKind),

    #[error("{len}-byte {region} record exceeds the {size}-byte region size")]
    TooLarge {
        region: RegionKind,
        len: usize,
        size: usize,
    },

    #[error("invalid reserved-area layout: {0}")]
    InvalidLayout(String),

    #[error(transparent)]
    Env(#[from] env::EnvError),
}

impl RsvError {
    /// Did the device lose power? Nothing more can be done until it comes back.
    pub fn is_power_loss(&self) -> bool {
        matches!(self, Self::Io(NandError::PowerLoss))
    }
}

pub type RsvResult<T> = Result<T, RsvError>;
