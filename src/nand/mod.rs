//! Abstractions and code to access raw NAND flash, including the out-of-band (OOB) area

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes: usize,
}

impl NandLayout {
    /// Number of bytes in one erase block (main area only)
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// Number of pages needed to hold `len` bytes of main-area data (at least one)
    pub fn pages_for(&self, len: usize) -> u32 {
        let pages = len.div_ceil(self.bytes_per_page).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTES+OOB"
///
/// When the OOB size is omitted, the common 1/32 ratio is assumed (64 bytes for a 2 KiB page).
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (geometry, oob) = match s.split_once('+') {
            Some((geometry, oob)) => (geometry, Some(oob)),
            None => (s, None),
        };

        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = geometry
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[+#]"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let oob_bytes = match oob {
            Some(oob) => oob.parse()?,
            None => bytes_per_page / 32,
        };

        anyhow::ensure!(pages_per_block > 0, "a block needs at least one page");
        anyhow::ensure!(bytes_per_page > 0, "pages cannot be empty");

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes,
        })
    }
}

/// The outcome of the ECC engine for one page read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EccStatus {
    /// No bitflips were seen
    Clean,

    /// This many bitflips were seen and corrected; the data is good
    Corrected(u32),

    /// More bitflips than the ECC strength; the data must not be trusted
    Uncorrectable,
}

impl EccStatus {
    /// Can the page content be used?
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Uncorrectable)
    }
}

/// The content of one page as returned by [BlockDevice::read_page]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PageRead {
    pub data: Bytes,
    pub oob: Bytes,
    pub ecc: EccStatus,
}

/// Transport-level errors from a [BlockDevice]
#[derive(Debug, Error)]
pub enum NandError {
    #[error("block {0} out of range")]
    BlockOutOfRange(u32),

    #[error("block {block}, page {page} out of range")]
    PageOutOfRange { block: u32, page: u32 },

    #[error("buffer of {len} bytes does not fit a {expected}-byte area")]
    NotPageSized { len: usize, expected: usize },

    #[error("block {block}, page {page} written in already-written area")]
    AlreadyProgrammed { block: u32, page: u32 },

    #[error("block {0} failed to erase")]
    EraseFailed(u32),

    #[error("block {block}, page {page} failed to program")]
    ProgramFailed { block: u32, page: u32 },

    #[error("block {0} is marked bad")]
    BadBlock(u32),

    #[error("power lost during flash operation")]
    PowerLoss,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

pub type NandResult<T> = Result<T, NandError>;

/// Represents a raw NAND flash device, addressed by block and page
pub trait BlockDevice {
    /// Get the layout of the NAND
    fn layout(&self) -> NandLayout;

    /// Is this block marked bad?
    ///
    /// Blocks out of range are reported bad.
    fn is_bad(&self, block: u32) -> bool;

    /// Mark a block bad; it will be reported bad from now on
    fn mark_bad(&mut self, block: u32) -> NandResult<()>;

    /// Erase a block, making all of its pages writable again
    fn erase(&mut self, block: u32) -> NandResult<()>;

    /// Read the main area and the free OOB bytes of one page, through ECC
    fn read_page(&mut self, block: u32, page: u32) -> NandResult<PageRead>;

    /// Read one page including the raw OOB area, where factory bad-block markers live
    fn read_page_raw(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        self.read_page(block, page)
    }

    /// Program one page. `oob` may be shorter than the OOB area; the rest stays erased.
    ///
    /// Pages must be programmed in ascending order within a block, as required by MLC NANDs.
    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> NandResult<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn layout(&self) -> NandLayout {
        (**self).layout()
    }
    fn is_bad(&self, block: u32) -> bool {
        (**self).is_bad(block)
    }
    fn mark_bad(&mut self, block: u32) -> NandResult<()> {
        (**self).mark_bad(block)
    }
    fn erase(&mut self, block: u32) -> NandResult<()> {
        (**self).erase(block)
    }
    fn read_page(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        (**self).read_page(block, page)
    }
    fn read_page_raw(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        (**self).read_page_raw(block, page)
    }
    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> NandResult<()> {
        (**self).write_page(block, page, data, oob)
    }
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Besides plain storage, it can inject the faults a reserved-area manager has to survive:
/// ECC failures on chosen pages, blocks that refuse to erase or program, and a power cut after a
/// given number of page programs.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,

    /// ECC outcome to report for specific (block, page) pairs, until the block is erased
    ecc_faults: HashMap<(u32, u32), EccStatus>,

    /// Blocks whose erase and program operations fail
    failing: HashSet<u32>,

    /// Page programs left before power is cut; `None` means unlimited
    power_budget: Option<u64>,

    /// Set once the power budget ran out; every operation fails until power is restored
    powered_off: bool,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// The OOB bytes of the written pages, `oob_size` per page, kept in step with `data`
    oob: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// How many OOB bytes per page
    oob_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many times this block was erased
    erase_count: u32,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            ecc_faults: HashMap::new(),
            failing: HashSet::new(),
            power_budget: None,
            powered_off: false,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// The image holds every page as main-area bytes immediately followed by its OOB bytes.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut data = vec![0; self.layout.bytes_per_page];
        let mut oob = vec![0; self.layout.oob_bytes];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.clear();
            for page in 0..block.page_count {
                read.read_exact(&mut data)?;
                read.read_exact(&mut oob)?;
                block.write_page(page, &data, &oob)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    ///
    /// Bad blocks are written as a recognizable 0xBD fill.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut data = vec![0; self.layout.bytes_per_page];
        let mut oob = vec![0; self.layout.oob_bytes];

        for block in self.blocks.iter() {
            for page in 0..block.page_count {
                if block.marked_bad {
                    data.fill(0xBD);
                    oob.fill(0xBD);
                } else {
                    block.read_page(page, &mut data, &mut oob)?;
                }
                write.write_all(&data)?;
                write.write_all(&oob)?;
            }
        }

        Ok(())
    }

    /// Report `status` for every read of this page until its block is erased
    pub fn inject_ecc(&mut self, block: u32, page: u32, status: EccStatus) {
        self.ecc_faults.insert((block, page), status);
    }

    /// Make every erase and program of this block fail, like a worn-out block
    pub fn fail_block(&mut self, block: u32) {
        self.failing.insert(block);
    }

    /// Cut power after `pages` more successful page programs.
    ///
    /// The program that runs into the cut leaves a torn page behind: its bytes land on flash, but
    /// it reads back as uncorrectable.
    pub fn cut_power_after(&mut self, pages: u64) {
        self.power_budget = Some(pages);
    }

    /// Bring the device back after a power cut, as on the next boot
    pub fn restore_power(&mut self) {
        self.power_budget = None;
        self.powered_off = false;
    }

    /// Has the simulated power been cut?
    pub fn is_powered_off(&self) -> bool {
        self.powered_off
    }

    /// How many times has this block been erased?
    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks.get(block as usize).map_or(0, |x| x.erase_count)
    }

    /// Is any page of this block programmed?
    pub fn is_block_erased(&self, block: u32) -> bool {
        self.blocks.get(block as usize).map_or(true, |x| x.data.is_empty())
    }

    /// Imprint the factory bad-block marker on a block, as a flash vendor does.
    ///
    /// Every probe site used by the supported vendors (first byte of data and OOB in the first,
    /// second and last page) is zeroed, and the block is left unmarked in the device's own table.
    pub fn imprint_factory_bad(&mut self, block: u32) -> NandResult<()> {
        let layout = self.layout;
        let block = self.block_mut(block)?;
        block.clear();

        let data = vec![0u8; layout.bytes_per_page];
        let oob = vec![0u8; layout.oob_bytes];
        for page in 0..layout.pages_per_block {
            block.write_page(page, &data, &oob)?;
        }

        Ok(())
    }

    fn block_mut(&mut self, index: u32) -> NandResult<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(NandError::BlockOutOfRange(index))
    }

    fn check_power(&self) -> NandResult<()> {
        if self.powered_off {
            Err(NandError::PowerLoss)
        } else {
            Ok(())
        }
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            oob: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            oob_size: layout.oob_bytes,
            marked_bad: false,
            erase_count: 0,
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.oob.clear();
    }

    fn write_page(&mut self, index: u32, content: &[u8], oob: &[u8]) -> NandResult<()> {
        if content.len() != self.page_size {
            return Err(NandError::NotPageSized {
                len: content.len(),
                expected: self.page_size,
            });
        }
        if oob.len() > self.oob_size {
            return Err(NandError::NotPageSized {
                len: oob.len(),
                expected: self.oob_size,
            });
        }
        if index >= self.page_count {
            return Err(NandError::PageOutOfRange {
                block: 0,
                page: index,
            });
        }

        let begin = index as usize * self.page_size;
        if begin < self.data.len() {
            return Err(NandError::AlreadyProgrammed {
                block: 0,
                page: index,
            });
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() || !oob.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);

            let oob_begin = index as usize * self.oob_size;
            self.oob.resize(oob_begin, 0xFF);
            self.oob.extend_from_slice(oob);
            self.oob.resize(oob_begin + self.oob_size, 0xFF);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8], oob: &mut [u8]) -> NandResult<()> {
        if index >= self.page_count {
            return Err(NandError::PageOutOfRange {
                block: 0,
                page: index,
            });
        }

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        let oob_begin = index as usize * self.oob_size;
        let oob_end = oob_begin + self.oob_size;
        if let Some(page) = self.oob.get(oob_begin..oob_end) {
            oob.copy_from_slice(page);
        } else {
            oob.fill(0xFF);
        }

        Ok(())
    }
}

impl BlockDevice for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn is_bad(&self, block: u32) -> bool {
        self.blocks
            .get(block as usize)
            .map_or(true, |x| x.marked_bad)
    }

    fn mark_bad(&mut self, block: u32) -> NandResult<()> {
        self.check_power()?;
        let block = self.block_mut(block)?;
        block.clear();
        block.marked_bad = true;
        Ok(())
    }

    fn erase(&mut self, index: u32) -> NandResult<()> {
        self.check_power()?;
        if self.is_bad(index) {
            return Err(NandError::BadBlock(index));
        }
        if self.failing.contains(&index) {
            return Err(NandError::EraseFailed(index));
        }

        self.ecc_faults.retain(|&(block, _), _| block != index);
        let block = self.block_mut(index)?;
        block.clear();
        block.erase_count += 1;

        Ok(())
    }

    fn read_page(&mut self, index: u32, page: u32) -> NandResult<PageRead> {
        self.check_power()?;
        if self.is_bad(index) {
            return Err(NandError::BadBlock(index));
        }

        let mut data = vec![0; self.layout.bytes_per_page];
        let mut oob = vec![0; self.layout.oob_bytes];
        self.block_mut(index)?
            .read_page(page, &mut data, &mut oob)
            .map_err(|_| NandError::PageOutOfRange { block: index, page })?;

        let ecc = self
            .ecc_faults
            .get(&(index, page))
            .copied()
            .unwrap_or(EccStatus::Clean);

        Ok(PageRead {
            data: data.into(),
            oob: oob.into(),
            ecc,
        })
    }

    fn write_page(&mut self, index: u32, page: u32, data: &[u8], oob: &[u8]) -> NandResult<()> {
        self.check_power()?;
        if self.is_bad(index) {
            return Err(NandError::BadBlock(index));
        }
        if self.failing.contains(&index) {
            return Err(NandError::ProgramFailed { block: index, page });
        }

        let torn = match self.power_budget.as_mut() {
            Some(0) => true,
            Some(budget) => {
                *budget -= 1;
                false
            }
            None => false,
        };

        self.block_mut(index)?
            .write_page(page, data, oob)
            .map_err(|e| match e {
                NandError::AlreadyProgrammed { .. } => {
                    NandError::AlreadyProgrammed { block: index, page }
                }
                NandError::PageOutOfRange { .. } => NandError::PageOutOfRange { block: index, page },
                e => e,
            })?;

        if torn {
            self.ecc_faults
                .insert((index, page), EccStatus::Uncorrectable);
            self.powered_off = true;
            return Err(NandError::PowerLoss);
        }

        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_bytes: 16,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0));
    assert!(!nand.is_bad(TEST_LAYOUT.blocks - 1));
    assert!(nand.is_bad(TEST_LAYOUT.blocks));
    assert!(matches!(
        nand.read_page(TEST_LAYOUT.blocks, 0),
        Err(NandError::BadBlock(_))
    ));
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0));
    nand.mark_bad(0).unwrap();
    assert!(nand.is_bad(0));
    assert!(nand.erase(0).is_err());
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let oob_in = [1u8, 2, 3, 4];

    nand.write_page(0, 2, &data_in, &oob_in)?;
    assert!(nand.write_page(0, 1, &data_in, &oob_in).is_err());

    let page = nand.read_page(0, 1)?;
    assert!(page.data.is_erased());
    assert!(page.oob.is_erased());

    let page = nand.read_page(0, 2)?;
    assert_eq!(page.data, data_in);
    assert_eq!(page.oob[..4], oob_in);
    assert!(page.oob[4..].is_erased());
    assert_eq!(page.ecc, EccStatus::Clean);

    let page = nand.read_page(0, 3)?;
    assert!(page.data.is_erased());

    nand.erase(0)?;
    assert!(nand.read_page(0, 2)?.data.is_erased());
    assert_eq!(nand.erase_count(0), 1);

    Ok(())
}

#[test]
fn test_sim_power_cut() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data = vec![0x11u8; TEST_LAYOUT.bytes_per_page];

    nand.cut_power_after(2);
    nand.write_page(1, 0, &data, &[])?;
    nand.write_page(1, 1, &data, &[])?;
    assert!(matches!(
        nand.write_page(1, 2, &data, &[]),
        Err(NandError::PowerLoss)
    ));
    assert!(nand.is_powered_off());
    assert!(nand.erase(2).is_err());

    nand.restore_power();
    assert_eq!(nand.read_page(1, 1)?.ecc, EccStatus::Clean);
    assert_eq!(nand.read_page(1, 2)?.ecc, EccStatus::Uncorrectable);

    Ok(())
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8))?;

    let page = nand.read_page(0, 0)?;
    assert!(page.data.iter().all(|&x| x == 0x55u8));
    assert!(page.oob.iter().all(|&x| x == 0x55u8));

    let mut image = Vec::new();
    nand.save(&mut image)?;
    let per_page = TEST_LAYOUT.bytes_per_page + TEST_LAYOUT.oob_bytes;
    assert_eq!(
        image.len(),
        per_page * (TEST_LAYOUT.pages_per_block * TEST_LAYOUT.blocks) as usize
    );

    Ok(())
}

#[test]
fn test_layout_from_str() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x64x2048".parse()?;
    assert_eq!(layout.oob_bytes, 64);
    assert_eq!(layout.block_size(), 128 * 1024);

    let layout: NandLayout = "16x16x128+8".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            blocks: 16,
            pages_per_block: 16,
            bytes_per_page: 128,
            oob_bytes: 8,
        }
    );
    assert_eq!(layout.pages_for(0), 1);
    assert_eq!(layout.pages_for(129), 2);

    assert!("16x16".parse::<NandLayout>().is_err());
    Ok(())
}
