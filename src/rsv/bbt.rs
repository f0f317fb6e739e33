//! The bad-block table, as persisted in the BBT region: one status byte per block of the device.

use bytes::Bytes;

/// What the table says about one block
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum BlockStatus {
    #[default]
    Good = 0,

    /// Went bad in the field (failed erase, program or verify)
    WornBad = 1,

    /// Carried a factory bad-block marker when the table was first built
    FactoryBad = 2,
}

impl BlockStatus {
    pub fn is_bad(self) -> bool {
        self != Self::Good
    }
}

impl From<u8> for BlockStatus {
    /// Unknown values are treated as bad: a block is only usable when the table says so.
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Good,
            2 => Self::FactoryBad,
            _ => Self::WornBad,
        }
    }
}

/// In-memory copy of the bad-block table
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BadBlockTable {
    status: Vec<BlockStatus>,
}

impl BadBlockTable {
    /// An all-good table for a device with this many blocks
    pub fn new(blocks: u32) -> Self {
        Self {
            status: vec![BlockStatus::Good; blocks as usize],
        }
    }

    /// Load a table from its persisted form. Blocks past the end of `bytes` are taken as good;
    /// extra bytes are ignored.
    pub fn from_bytes(bytes: &[u8], blocks: u32) -> Self {
        let mut table = Self::new(blocks);
        for (status, &byte) in table.status.iter_mut().zip(bytes) {
            *status = byte.into();
        }
        table
    }

    pub fn to_bytes(&self) -> Bytes {
        self.status.iter().map(|&x| x as u8).collect()
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    /// Status of a block; blocks off the end of the device read as bad
    pub fn get(&self, block: u32) -> BlockStatus {
        self.status
            .get(block as usize)
            .copied()
            .unwrap_or(BlockStatus::WornBad)
    }

    pub fn is_bad(&self, block: u32) -> bool {
        self.get(block).is_bad()
    }

    /// Record a block as worn out. Returns whether the table changed; factory-bad entries are
    /// never downgraded.
    pub fn mark_worn(&mut self, block: u32) -> bool {
        self.set_if_good(block, BlockStatus::WornBad)
    }

    /// Record a factory bad-block marker. Returns whether the table changed.
    pub fn mark_factory(&mut self, block: u32) -> bool {
        match self.status.get_mut(block as usize) {
            Some(status) if *status != BlockStatus::FactoryBad => {
                *status = BlockStatus::FactoryBad;
                true
            }
            _ => false,
        }
    }

    /// Record a block as good again. Only for correcting a misdetected factory marker.
    pub fn forget(&mut self, block: u32) {
        if let Some(status) = self.status.get_mut(block as usize) {
            *status = BlockStatus::Good;
        }
    }

    fn set_if_good(&mut self, block: u32, new: BlockStatus) -> bool {
        match self.status.get_mut(block as usize) {
            Some(status) if *status == BlockStatus::Good => {
                *status = new;
                true
            }
            _ => false,
        }
    }

    /// All blocks that are not good, with their status
    pub fn bad_blocks(&self) -> impl Iterator<Item = (u32, BlockStatus)> + '_ {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, status)| status.is_bad())
            .map(|(block, &status)| (block as u32, status))
    }
}

#[test]
fn test_bbt_bytes() {
    let mut table = BadBlockTable::new(6);
    assert!(table.mark_factory(1));
    assert!(table.mark_worn(4));
    assert!(!table.mark_worn(4));

    // Factory-bad stays factory-bad
    assert!(!table.mark_worn(1));
    assert_eq!(table.get(1), BlockStatus::FactoryBad);

    let bytes = table.to_bytes();
    assert_eq!(&bytes[..], [0, 2, 0, 0, 1, 0]);
    assert_eq!(BadBlockTable::from_bytes(&bytes, 6), table);

    let bad: Vec<_> = table.bad_blocks().collect();
    assert_eq!(
        bad,
        [(1, BlockStatus::FactoryBad), (4, BlockStatus::WornBad)]
    );
}

#[test]
fn test_bbt_short_record() {
    let table = BadBlockTable::from_bytes(&[0, 7], 4);
    assert_eq!(table.get(1), BlockStatus::WornBad);
    assert!(!table.is_bad(3));
    assert!(table.is_bad(4));
}
