//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{BlockDevice, EccStatus, NandError, NandLayout, NandResult, PageRead};

use anyhow::bail;
use nix::errno::Errno;
use tracing::warn;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::path::Path;

/// How many free OOB bytes to exchange per page when the caller doesn't say otherwise
const DEFAULT_FREE_OOB: usize = 16;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,

    /// The full OOB size, as seen by raw reads
    raw_oob_bytes: usize,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        let raw_oob_bytes = info.oobsize as usize;
        let layout = info.try_into()?;

        Ok(Self {
            file,
            layout,
            raw_oob_bytes,
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Set how many free (ECC-protected) OOB bytes the controller exposes per page
    pub fn free_oob(mut self, bytes: usize) -> Self {
        self.layout.oob_bytes = bytes.min(self.raw_oob_bytes);
        self
    }

    /// Compute the /dev/mtdX offset of a page, checking that it lies on the device
    fn offset_for(&self, block: u32, page: u32) -> NandResult<u64> {
        if block >= self.layout.blocks {
            return Err(NandError::BlockOutOfRange(block));
        }
        if page >= self.layout.pages_per_block {
            return Err(NandError::PageOutOfRange { block, page });
        }

        let block_base = self.layout.block_size() as u64 * u64::from(block);
        Ok(block_base + (self.layout.bytes_per_page as u64) * u64::from(page))
    }

    /// Issue a MEMREAD for one page, in the given OOB mode
    fn read_in_mode(&self, block: u32, page: u32, mode: u8, ooblen: usize) -> NandResult<PageRead> {
        let mut data = vec![0u8; self.layout.bytes_per_page];
        let mut oob = vec![0u8; ooblen];

        let mut req = ioctl::mtd_read_req {
            start: self.offset_for(block, page)?,
            len: data.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: data.as_mut_ptr() as u64,
            usr_oob: oob.as_mut_ptr() as u64,
            mode,
            padding: [0; 7],
            ecc_stats: Default::default(),
        };

        let result = unsafe { ioctl::memread(self.file.as_raw_fd(), &mut req) };
        let ecc = match result {
            Ok(_) | Err(Errno::EUCLEAN) => match req.ecc_stats.corrected_bitflips {
                0 => EccStatus::Clean,
                n => EccStatus::Corrected(n),
            },
            Err(Errno::EBADMSG) => EccStatus::Uncorrectable,
            Err(e) => return Err(e.into()),
        };

        Ok(PageRead {
            data: data.into(),
            oob: oob.into(),
            ecc,
        })
    }

    /// The device offset of a block, as the erase/bad-block ioctls expect it
    fn block_base(&self, block: u32) -> NandResult<u64> {
        self.offset_for(block, 0)
    }
}

impl BlockDevice for MtdNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn is_bad(&self, block: u32) -> bool {
        let Ok(block_base) = self.block_base(block) else {
            return true;
        };

        match unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) } {
            Ok(bad) => bad != 0,
            Err(errno) => {
                warn!(target: "nand_rsv::mtd", block, %errno, "bad block query failed");
                true
            }
        }
    }

    fn mark_bad(&mut self, block: u32) -> NandResult<()> {
        let block_base = self.block_base(block)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }

    fn erase(&mut self, block: u32) -> NandResult<()> {
        let erase_info = ioctl::erase_info_user {
            start: u32::try_from(self.block_base(block)?)
                .map_err(|_| NandError::BlockOutOfRange(block))?,
            length: u32::try_from(self.layout.block_size())
                .map_err(|_| NandError::BlockOutOfRange(block))?,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)
                .map_err(|_| NandError::EraseFailed(block))?;
        }
        Ok(())
    }

    fn read_page(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        self.read_in_mode(block, page, ioctl::MTD_OPS_AUTO_OOB, self.layout.oob_bytes)
    }

    fn read_page_raw(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        self.read_in_mode(block, page, ioctl::MTD_OPS_RAW, self.raw_oob_bytes)
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> NandResult<()> {
        if data.len() != self.layout.bytes_per_page {
            return Err(NandError::NotPageSized {
                len: data.len(),
                expected: self.layout.bytes_per_page,
            });
        }
        if oob.len() > self.layout.oob_bytes {
            return Err(NandError::NotPageSized {
                len: oob.len(),
                expected: self.layout.oob_bytes,
            });
        }

        let mut req = ioctl::mtd_write_req {
            start: self.offset_for(block, page)?,
            len: data.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: oob.as_ptr() as u64,
            mode: ioctl::MTD_OPS_AUTO_OOB,
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.file.as_raw_fd(), &mut req)
                .map_err(|_| NandError::ProgramFailed { block, page })?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{NandLayout, DEFAULT_FREE_OOB};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    pub const MTD_OPS_AUTO_OOB: u8 = 1;
    pub const MTD_OPS_RAW: u8 = 2;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(self.erasesize != 0, "MTD reports zero erasesize");
            ensure!(self.writesize > 1, "MTD device is not page-addressed NAND");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;
            let oob_bytes = DEFAULT_FREE_OOB.min(self.oobsize as usize);

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
                oob_bytes,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);

    #[repr(C)]
    #[derive(Default)]
    pub struct mtd_read_req_ecc_stats {
        pub uncorrectable_errors: u32,
        pub corrected_bitflips: u32,
        pub max_bitflips: u32,
    }

    #[repr(C)]
    pub struct mtd_read_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
        pub ecc_stats: mtd_read_req_ecc_stats,
    }
    ioctl_readwrite!(memread, MTD_IOC_MAGIC, 26, mtd_read_req);
}
