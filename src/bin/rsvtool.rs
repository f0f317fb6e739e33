//! A tool for inspecting and editing the reserved area of a NAND flash.
//!
//! It works against a real MTD device on Linux, or against a simulated NAND loaded from (and
//! optionally written back to) an image file, which is handy for examining dumps.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_rsv::nand::mtd::MtdNand;
use nand_rsv::{
    nand::{BlockDevice, NandLayout, NandResult, PageRead, SimNand},
    rsv::{
        env::{load_env, save_env, Environment},
        RegionKind, RsvConfig, RsvManager, VendorProfile,
    },
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Free OOB bytes the MTD controller exposes per page
    #[cfg(target_os = "linux")]
    #[clap(long)]
    mtd_free_oob: Option<usize>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES[+OOB]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path).with_context(|| path.display().to_string())?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mut mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };
                if let Some(bytes) = self.mtd_free_oob {
                    mtd = mtd.free_oob(bytes);
                }

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// Forward every operation to whichever device was opened
macro_rules! dispatch {
    ($self:expr, $nand:ident => $body:expr) => {
        match $self {
            NandImpl::Sim($nand) => $body,

            #[cfg(target_os = "linux")]
            NandImpl::Mtd($nand) => $body,
        }
    };
}

impl BlockDevice for NandImpl {
    fn layout(&self) -> NandLayout {
        dispatch!(self, nand => nand.layout())
    }

    fn is_bad(&self, block: u32) -> bool {
        dispatch!(self, nand => nand.is_bad(block))
    }

    fn mark_bad(&mut self, block: u32) -> NandResult<()> {
        dispatch!(self, nand => nand.mark_bad(block))
    }

    fn erase(&mut self, block: u32) -> NandResult<()> {
        dispatch!(self, nand => nand.erase(block))
    }

    fn read_page(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        dispatch!(self, nand => nand.read_page(block, page))
    }

    fn read_page_raw(&mut self, block: u32, page: u32) -> NandResult<PageRead> {
        dispatch!(self, nand => nand.read_page_raw(block, page))
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> NandResult<()> {
        dispatch!(self, nand => nand.write_page(block, page, data, oob))
    }
}

#[derive(Args, Debug)]
struct RsvOptions {
    /// Flash vendor (name or manufacturer ID such as 0xc8), for factory bad-block markers
    #[clap(long, default_value = "generic")]
    vendor: VendorProfile,

    /// Offset of the record header within the free OOB bytes
    #[clap(long)]
    oob_offset: Option<usize>,

    /// Pages occupied by the boot loader
    #[clap(long)]
    boot_pages: Option<u32>,

    /// Allow erasing reserved blocks with the `erase` command
    #[clap(long)]
    no_protect: bool,
}

impl RsvOptions {
    fn config(&self) -> RsvConfig {
        let mut config = RsvConfig::default()
            .vendor(self.vendor)
            .protect(!self.no_protect);
        if let Some(offset) = self.oob_offset {
            config = config.oob_offset(offset);
        }
        if let Some(pages) = self.boot_pages {
            config = config.boot_pages(pages);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the layout, current record and free blocks of every region
    Overview,

    /// Read the current record of a region
    Read {
        /// bbt, env, key or dtb
        region: RegionKind,

        /// Write the record to this file instead of printing a hex dump
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Commit the content of a file as the new record of a region
    Write {
        /// bbt, env, key or dtb
        region: RegionKind,

        /// The file to commit
        path: PathBuf,
    },

    /// Erase a block, honoring the reserved-area protection
    Erase { block: u32 },

    /// Retire a block as worn-bad
    MarkBad { block: u32 },

    /// Erase every block of a region
    Free { region: RegionKind },

    /// Print the boot environment
    Env,

    /// Set one boot environment variable and commit the environment
    Setenv { name: String, value: String },
}

impl Command {
    fn execute(self, rsv: &RsvManager<NandImpl>) -> Result<()> {
        match self {
            Command::Overview => {
                let layout = rsv.layout();
                println!(
                    "boot: blocks 0..{}, device: {} blocks",
                    layout.boot_blocks, layout.nand.blocks
                );

                for kind in RegionKind::ALL {
                    let snapshot = rsv.snapshot(kind);
                    let region = snapshot.descriptor;
                    println!(
                        "{kind}: blocks {}..{}, {} bytes/record, {:?}",
                        region.start, region.end, region.size, snapshot.state
                    );
                    match snapshot.valid {
                        Some(valid) => println!("    valid => {valid:?}"),
                        None => println!("    valid => none"),
                    }
                    for free in snapshot.free_pool {
                        println!("    free  => {free:?}");
                    }
                    for block in snapshot.quarantined {
                        println!("    unreadable => {block}");
                    }
                }

                for (block, status) in rsv.bad_blocks() {
                    println!("{block:4} => {status:?}");
                }
            }

            Command::Read { region, out } => {
                let record = rsv.read(region)?;
                match out {
                    Some(path) => File::create(&path)
                        .and_then(|mut file| file.write_all(&record))
                        .with_context(|| path.display().to_string())?,
                    None => hexdump(&record),
                }
            }

            Command::Write { region, path } => {
                let record =
                    std::fs::read(&path).with_context(|| path.display().to_string())?;
                rsv.write(region, &record)?;
            }

            Command::Erase { block } => rsv.erase_block(block)?,

            Command::MarkBad { block } => rsv.mark_bad(block)?,

            Command::Free { region } => rsv.free(region)?,

            Command::Env => {
                let env = load_env(rsv, &Environment::new())?;
                for (name, value) in env.iter() {
                    println!("{name}={value}");
                }
            }

            Command::Setenv { name, value } => {
                let mut env = load_env(rsv, &Environment::new())?;
                env.set(&name, &value)?;
                save_env(rsv, &env)?;
            }
        };

        Ok(())
    }
}

fn hexdump(bytes: &[u8]) {
    println!("{} bytes", bytes.len());
    for (i, line) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|x| format!("{x:02x}")).collect();
        println!("{:08x}  {}", i * 16, hex.join(" "));
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How the reserved area is laid out
    #[clap(flatten)]
    rsv: RsvOptions,

    /// The command to run against the reserved area
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let rsv = RsvManager::mount(nand, &args.rsv.config())?;
    args.cmd.execute(&rsv)?;
    args.nand.cleanup(rsv.into_device())?;
    Ok(())
}
