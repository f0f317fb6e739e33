//! Management of the reserved area at the start of a raw NAND flash.
//!
//! The [nand] module abstracts the flash itself (a Linux MTD device, or a simulated one), and
//! [rsv] keeps the bad-block table, boot environment, keys and device tree as crash-safe records
//! in a fixed set of blocks behind the boot loader.

pub mod nand;
pub mod rsv;
