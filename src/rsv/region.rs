//! Static layout of the reserved area: which blocks belong to which record class, how large each
//! record is, and the per-region cursor pointing at the current record.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use super::oob::OOB_RECORD_LEN;
use super::seed::VendorProfile;
use super::RsvError;
use crate::nand::NandLayout;

/// The four record classes kept in the reserved area, in on-flash order
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RegionKind {
    /// The bad-block table; scanned first, because it decides which blocks the others may use
    Bbt,

    /// The boot environment variables
    Env,

    /// The key store blob
    Key,

    /// The device-tree blob
    Dtb,
}

impl RegionKind {
    pub const ALL: [RegionKind; 4] = [Self::Bbt, Self::Env, Self::Key, Self::Dtb];

    /// The 4-byte tag carried in the OOB header of every page of this region
    pub fn magic(self) -> [u8; 4] {
        match self {
            Self::Bbt => *b"nbbt",
            Self::Env => *b"nenv",
            Self::Key => *b"nkey",
            Self::Dtb => *b"ndtb",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bbt => "bbt",
            Self::Env => "env",
            Self::Key => "key",
            Self::Dtb => "dtb",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or(anyhow::anyhow!("unknown region {s:?}, expected bbt/env/key/dtb"))
    }
}

/// Static layout metadata for one region
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionDescriptor {
    pub kind: RegionKind,

    /// First block of the region
    pub start: u32,

    /// One past the last block of the region
    pub end: u32,

    /// Maximum byte size of one record
    pub size: usize,
}

impl RegionDescriptor {
    pub fn blocks(&self) -> Range<u32> {
        self.start..self.end
    }

    pub fn contains(&self, block: u32) -> bool {
        self.blocks().contains(&block)
    }

    pub fn magic(&self) -> [u8; 4] {
        self.kind.magic()
    }
}

/// Flags describing how the last scan found the current record
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PointerStatus(u8);

impl PointerStatus {
    /// The last commit in the block was cut short (torn record found after the pointer)
    pub const POWER_ABNORMAL: PointerStatus = PointerStatus(1 << 0);

    /// At least one page of the block failed ECC correction
    pub const ECC_ABNORMAL: PointerStatus = PointerStatus(1 << 1);

    pub fn contains(self, flag: PointerStatus) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: PointerStatus) {
        self.0 |= flag.0;
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

/// Where the most recent complete record of a region lives
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ValidPointer {
    pub block: u32,

    /// First page of the record within `block`
    pub page: u32,

    /// Erase count of `block`, as recorded in its OOB headers
    pub erase_count: u16,

    pub timestamp: u16,
    pub status: PointerStatus,
}

/// Tunables for the reserved area. The defaults match the usual boot-loader layout.
///
/// Fields can be set directly or through the builder-style methods of the same name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RsvConfig {
    /// Pages occupied by the boot loader copies at the start of the device
    pub boot_pages: u32,

    /// Blocks left unused between the boot loader and the first region
    pub gap_blocks: u32,

    pub bbt_blocks: u32,
    pub env_blocks: u32,
    pub key_blocks: u32,
    pub dtb_blocks: u32,

    /// Upper bound for the span from the end of the boot area to the end of the last region
    pub reserved_blocks: u32,

    pub env_size: usize,
    pub key_size: usize,
    pub dtb_size: usize,

    /// Where the record header starts within the free OOB bytes of a page
    pub oob_offset: usize,

    /// How factory bad-block markers are encoded on this flash
    pub vendor: VendorProfile,

    /// Whether generic erases of reserved blocks are refused
    pub protect: bool,
}

impl Default for RsvConfig {
    fn default() -> Self {
        Self {
            boot_pages: 1024,
            gap_blocks: 4,
            bbt_blocks: 4,
            env_blocks: 8,
            key_blocks: 8,
            dtb_blocks: 4,
            reserved_blocks: 48,
            env_size: 64 * 1024,
            key_size: 64 * 1024,
            dtb_size: 128 * 1024,
            oob_offset: 2,
            vendor: VendorProfile::Generic,
            protect: true,
        }
    }
}

impl RsvConfig {
    pub fn boot_pages(mut self, pages: u32) -> Self {
        self.boot_pages = pages;
        self
    }

    pub fn gap_blocks(mut self, blocks: u32) -> Self {
        self.gap_blocks = blocks;
        self
    }

    pub fn reserved_blocks(mut self, blocks: u32) -> Self {
        self.reserved_blocks = blocks;
        self
    }

    /// Set how many blocks a region spans
    pub fn region_blocks(mut self, kind: RegionKind, blocks: u32) -> Self {
        match kind {
            RegionKind::Bbt => self.bbt_blocks = blocks,
            RegionKind::Env => self.env_blocks = blocks,
            RegionKind::Key => self.key_blocks = blocks,
            RegionKind::Dtb => self.dtb_blocks = blocks,
        }
        self
    }

    /// Set the record size of a region. The BBT size always follows the device block count, so
    /// it cannot be set.
    pub fn record_size(mut self, kind: RegionKind, size: usize) -> Self {
        match kind {
            RegionKind::Bbt => {}
            RegionKind::Env => self.env_size = size,
            RegionKind::Key => self.key_size = size,
            RegionKind::Dtb => self.dtb_size = size,
        }
        self
    }

    pub fn oob_offset(mut self, offset: usize) -> Self {
        self.oob_offset = offset;
        self
    }

    pub fn vendor(mut self, vendor: VendorProfile) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    fn blocks_for(&self, kind: RegionKind) -> u32 {
        match kind {
            RegionKind::Bbt => self.bbt_blocks,
            RegionKind::Env => self.env_blocks,
            RegionKind::Key => self.key_blocks,
            RegionKind::Dtb => self.dtb_blocks,
        }
    }
}

/// The reserved area laid out on a concrete device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RsvLayout {
    pub nand: NandLayout,

    /// Where the record header starts within the free OOB bytes
    pub oob_offset: usize,

    /// Blocks occupied by the boot loader
    pub boot_blocks: u32,

    regions: [RegionDescriptor; 4],
}

impl RsvLayout {
    /// Place the regions back to back after the boot area and the gap, checking that everything
    /// fits the device.
    pub fn new(nand: NandLayout, config: &RsvConfig) -> Result<Self, RsvError> {
        let invalid = |msg: String| Err(RsvError::InvalidLayout(msg));

        if nand.pages_per_block == 0 || nand.bytes_per_page == 0 {
            return invalid("device has empty blocks".into());
        }
        if config.oob_offset + OOB_RECORD_LEN > nand.oob_bytes {
            return invalid(format!(
                "record header needs {} OOB bytes at offset {}, page has {}",
                OOB_RECORD_LEN, config.oob_offset, nand.oob_bytes
            ));
        }

        let boot_blocks = config.boot_pages.div_ceil(nand.pages_per_block);
        let mut vernier = boot_blocks + config.gap_blocks;

        let mut regions = RegionKind::ALL.map(|kind| RegionDescriptor {
            kind,
            start: 0,
            end: 0,
            size: 0,
        });

        for region in regions.iter_mut() {
            let count = config.blocks_for(region.kind);
            if count == 0 {
                return invalid(format!("region {} has no blocks", region.kind));
            }

            region.start = vernier;
            region.end = vernier + count;
            region.size = match region.kind {
                RegionKind::Bbt => nand.blocks as usize,
                RegionKind::Env => config.env_size,
                RegionKind::Key => config.key_size,
                RegionKind::Dtb => config.dtb_size,
            };
            vernier = region.end;

            if nand.pages_for(region.size) > nand.pages_per_block {
                return invalid(format!(
                    "{}-byte {} record does not fit in a {}-byte block",
                    region.size,
                    region.kind,
                    nand.block_size()
                ));
            }
        }

        if vernier > nand.blocks {
            return invalid(format!(
                "reserved area ends at block {vernier}, device has {}",
                nand.blocks
            ));
        }
        if vernier - boot_blocks > config.reserved_blocks {
            return invalid(format!(
                "reserved area spans {} blocks, limit is {}",
                vernier - boot_blocks,
                config.reserved_blocks
            ));
        }

        Ok(Self {
            nand,
            oob_offset: config.oob_offset,
            boot_blocks,
            regions,
        })
    }

    pub fn region(&self, kind: RegionKind) -> &RegionDescriptor {
        &self.regions[kind.index()]
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionDescriptor> {
        self.regions.iter()
    }

    /// Which region (if any) owns this block?
    pub fn region_of(&self, block: u32) -> Option<RegionKind> {
        self.regions
            .iter()
            .find(|region| region.contains(block))
            .map(|region| region.kind)
    }

    /// How many pages one record of this region occupies
    pub fn pages_per_record(&self, kind: RegionKind) -> u32 {
        self.nand.pages_for(self.region(kind).size)
    }

    /// How many records of this region fit in one block
    pub fn records_per_block(&self, kind: RegionKind) -> u32 {
        self.nand.pages_per_block / self.pages_per_record(kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
        oob_bytes: 64,
    };

    #[test]
    fn test_default_layout() -> anyhow::Result<()> {
        let layout = RsvLayout::new(LAYOUT, &RsvConfig::default())?;

        // 1024 boot pages = 16 blocks, then a gap of 4
        assert_eq!(layout.boot_blocks, 16);
        assert_eq!(layout.region(RegionKind::Bbt).blocks(), 20..24);
        assert_eq!(layout.region(RegionKind::Env).blocks(), 24..32);
        assert_eq!(layout.region(RegionKind::Key).blocks(), 32..40);
        assert_eq!(layout.region(RegionKind::Dtb).blocks(), 40..44);

        assert_eq!(layout.region(RegionKind::Bbt).size, 1024);
        assert_eq!(layout.pages_per_record(RegionKind::Bbt), 1);
        assert_eq!(layout.pages_per_record(RegionKind::Env), 32);
        assert_eq!(layout.records_per_block(RegionKind::Env), 2);

        assert_eq!(layout.region_of(19), None);
        assert_eq!(layout.region_of(20), Some(RegionKind::Bbt));
        assert_eq!(layout.region_of(43), Some(RegionKind::Dtb));
        assert_eq!(layout.region_of(44), None);

        Ok(())
    }

    #[test]
    fn test_invalid_layouts() {
        let too_big = RsvConfig::default().record_size(RegionKind::Dtb, 256 * 1024);
        assert!(matches!(
            RsvLayout::new(LAYOUT, &too_big),
            Err(RsvError::InvalidLayout(_))
        ));

        let too_many = RsvConfig::default().region_blocks(RegionKind::Key, 40);
        assert!(RsvLayout::new(LAYOUT, &too_many).is_err());

        let small_oob = NandLayout {
            oob_bytes: 8,
            ..LAYOUT
        };
        assert!(RsvLayout::new(small_oob, &RsvConfig::default()).is_err());

        let tiny = NandLayout {
            blocks: 30,
            ..LAYOUT
        };
        assert!(RsvLayout::new(tiny, &RsvConfig::default()).is_err());
    }

    #[test]
    fn test_region_names() -> anyhow::Result<()> {
        assert_eq!("ENV".parse::<RegionKind>()?, RegionKind::Env);
        assert_eq!(RegionKind::Dtb.to_string(), "dtb");
        assert!("boot".parse::<RegionKind>().is_err());
        Ok(())
    }

    #[test]
    fn test_pointer_status() {
        let mut status = PointerStatus::default();
        assert!(status.is_clean());
        status.insert(PointerStatus::ECC_ABNORMAL);
        assert!(status.contains(PointerStatus::ECC_ABNORMAL));
        assert!(!status.contains(PointerStatus::POWER_ABNORMAL));
        assert_eq!(status.bits(), 2);
    }
}
