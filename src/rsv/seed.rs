//! Building the first bad-block table from the factory markers left by the flash vendor.
//!
//! Vendors disagree on where the marker lives and what it looks like, so the probe is driven by a
//! [VendorProfile] chosen from the manufacturer ID.

use std::ops::Range;
use std::str::FromStr;

use tracing::{debug, info, warn};

use super::bbt::BadBlockTable;
use crate::nand::BlockDevice;

/// How a flash vendor marks blocks bad at the factory
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum VendorProfile {
    /// First OOB byte of the probed pages is not 0xFF
    #[default]
    Generic,

    /// First data byte or first OOB byte is not 0xFF
    GigaDevice,

    Macronix,
    Winbond,
    Hynix,
    Dosilicon,
    Ato,

    /// Both the first data byte and the first OOB byte are not 0xFF
    Samsung,
    Toshiba,

    /// First OOB byte is zero
    Micron,

    /// Any of the first six data bytes is zero
    SanDisk,
}

impl VendorProfile {
    /// Pick the profile for a JEDEC manufacturer ID; unknown vendors get [VendorProfile::Generic]
    pub fn from_manufacturer_id(id: u8) -> Self {
        match id {
            0xC8 => Self::GigaDevice,
            0xC2 => Self::Macronix,
            0xEF => Self::Winbond,
            0xAD => Self::Hynix,
            0xE5 => Self::Dosilicon,
            0x9B => Self::Ato,
            0xEC => Self::Samsung,
            0x98 => Self::Toshiba,
            0x2C => Self::Micron,
            0x45 => Self::SanDisk,
            _ => Self::Generic,
        }
    }

    /// The two pages of a block that carry the marker
    pub fn probe_pages(self, pages_per_block: u32) -> [u32; 2] {
        let last = pages_per_block.saturating_sub(1);
        match self {
            Self::SanDisk | Self::Generic => [0, last.min(1)],
            _ => [0, last],
        }
    }

    /// Does this raw page content carry the vendor's bad-block marker?
    pub fn is_marked_bad(self, data: &[u8], oob: &[u8]) -> bool {
        let data0 = data.first().copied().unwrap_or(0xFF);
        let oob0 = oob.first().copied().unwrap_or(0xFF);

        match self {
            Self::GigaDevice => data0 != 0xFF || oob0 != 0xFF,
            Self::Samsung | Self::Toshiba => data0 != 0xFF && oob0 != 0xFF,
            Self::Micron => oob0 == 0x00,
            Self::SanDisk => data.iter().take(6).any(|&x| x == 0x00),
            Self::Macronix
            | Self::Winbond
            | Self::Hynix
            | Self::Dosilicon
            | Self::Ato
            | Self::Generic => oob0 != 0xFF,
        }
    }
}

impl FromStr for VendorProfile {
    type Err = anyhow::Error;

    /// Accepts a vendor name or a manufacturer ID such as "0xc8"
    fn from_str(s: &str) -> anyhow::Result<Self> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return Ok(Self::from_manufacturer_id(u8::from_str_radix(hex, 16)?));
        }

        Ok(match s.to_ascii_lowercase().as_str() {
            "generic" => Self::Generic,
            "gigadevice" => Self::GigaDevice,
            "macronix" => Self::Macronix,
            "winbond" => Self::Winbond,
            "hynix" => Self::Hynix,
            "dosilicon" => Self::Dosilicon,
            "ato" => Self::Ato,
            "samsung" => Self::Samsung,
            "toshiba" => Self::Toshiba,
            "micron" => Self::Micron,
            "sandisk" => Self::SanDisk,
            _ => anyhow::bail!("unknown flash vendor {s:?}"),
        })
    }
}

/// Probes blocks for factory bad-block markers
#[derive(Debug, Copy, Clone)]
pub struct BadBlockSeeder {
    vendor: VendorProfile,
}

impl BadBlockSeeder {
    pub fn new(vendor: VendorProfile) -> Self {
        Self { vendor }
    }

    /// Is this block factory-marked bad? A block whose probe pages cannot be read is taken as good
    /// for now; it will be caught by a failed erase or program later.
    pub fn probe<D: BlockDevice>(&self, device: &mut D, block: u32) -> bool {
        let pages = self.vendor.probe_pages(device.layout().pages_per_block);

        for page in pages {
            match device.read_page_raw(block, page) {
                Ok(read) if self.vendor.is_marked_bad(&read.data, &read.oob) => {
                    debug!(target: "nand_rsv::seed", block, page, "factory bad-block marker found");
                    return true;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(target: "nand_rsv::seed", block, page, %error, "marker probe failed, assuming good");
                    return false;
                }
            }
        }

        false
    }

    /// Build a table for the whole device, probing every block in `range`. Blocks outside the
    /// range are recorded as good; blocks the device itself already reports bad are recorded as
    /// worn.
    pub fn seed<D: BlockDevice>(&self, device: &mut D, range: Range<u32>) -> BadBlockTable {
        let blocks = device.layout().blocks;
        let mut table = BadBlockTable::new(blocks);
        let range = range.start.min(blocks)..range.end.min(blocks);

        let rpt = howudoin::new()
            .label("Probing factory bad blocks")
            .set_len(u64::from(range.end - range.start));

        for block in range {
            if device.is_bad(block) {
                table.mark_worn(block);
            } else if self.probe(device, block) {
                table.mark_factory(block);
            }
            rpt.inc();
        }
        rpt.close();

        info!(
            target: "nand_rsv::seed",
            vendor = ?self.vendor,
            bad = table.bad_blocks().count(),
            "bad-block table seeded"
        );

        table
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};
    use crate::rsv::bbt::BlockStatus;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 32,
        pages_per_block: 8,
        bytes_per_page: 64,
        oob_bytes: 16,
    };

    #[test]
    fn test_vendor_rules() {
        let erased = [0xFFu8; 8];
        let zero = [0u8; 8];

        assert!(VendorProfile::GigaDevice.is_marked_bad(&zero, &erased));
        assert!(!VendorProfile::Samsung.is_marked_bad(&zero, &erased));
        assert!(VendorProfile::Samsung.is_marked_bad(&zero, &zero));
        assert!(VendorProfile::Micron.is_marked_bad(&erased, &zero));
        assert!(!VendorProfile::Micron.is_marked_bad(&erased, &[0x12; 8]));
        assert!(VendorProfile::Winbond.is_marked_bad(&erased, &[0x12; 8]));

        let mut sandisk = [0xFFu8; 8];
        sandisk[5] = 0;
        assert!(VendorProfile::SanDisk.is_marked_bad(&sandisk, &erased));
        sandisk[5] = 0xFF;
        sandisk[6] = 0;
        assert!(!VendorProfile::SanDisk.is_marked_bad(&sandisk, &erased));

        assert_eq!(VendorProfile::Generic.probe_pages(64), [0, 1]);
        assert_eq!(VendorProfile::Toshiba.probe_pages(64), [0, 63]);
    }

    #[test]
    fn test_vendor_parse() -> anyhow::Result<()> {
        assert_eq!("0xC8".parse::<VendorProfile>()?, VendorProfile::GigaDevice);
        assert_eq!("micron".parse::<VendorProfile>()?, VendorProfile::Micron);
        assert_eq!("0x01".parse::<VendorProfile>()?, VendorProfile::Generic);
        assert!("acme".parse::<VendorProfile>().is_err());
        Ok(())
    }

    #[test]
    fn test_seed() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.imprint_factory_bad(3)?;
        nand.imprint_factory_bad(20)?;
        nand.mark_bad(21)?;

        // Ordinary data in the first page must not look like a marker
        let data = vec![0x5Au8; TEST_LAYOUT.bytes_per_page];
        nand.write_page(22, 0, &data, &[0xFF, 0xFF, b'n', b'e'])?;

        let seeder = BadBlockSeeder::new(VendorProfile::Generic);
        let table = seeder.seed(&mut nand, 4..TEST_LAYOUT.blocks);

        // Block 3 lies outside the probed range
        assert_eq!(table.get(3), BlockStatus::Good);
        assert_eq!(table.get(20), BlockStatus::FactoryBad);
        assert_eq!(table.get(21), BlockStatus::WornBad);
        assert_eq!(table.get(22), BlockStatus::Good);
        assert_eq!(table.bad_blocks().count(), 2);

        Ok(())
    }
}
