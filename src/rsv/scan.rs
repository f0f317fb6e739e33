//! This module contains code to scan the blocks of a region and find its most recent complete
//! record.
//!
//! Scanning only reads flash, so it can be repeated at will and always reaches the same verdict
//! for the same flash contents.

use retry::delay::NoDelay;
use retry::{retry, OperationResult};
use tracing::{debug, info, warn};

use super::bbt::BadBlockTable;
use super::oob::{is_newer, OobHeader, RecordCodec};
use super::pool::{FreeBlock, FreeBlockPool, NodeArena};
use super::region::{PointerStatus, RegionKind, RsvLayout, ValidPointer};
use crate::nand::{BlockDevice, PageUtil};

/// How many header reads to try per block before giving up on it
const SCAN_ATTEMPTS: usize = 6;

/// The outcome of scanning one region
#[derive(Debug, Default)]
pub struct RegionScan {
    /// Where the newest complete record lives, if there is one
    pub valid: Option<ValidPointer>,

    /// The blocks available for the next rotation. Its nodes live in the arena passed to
    /// [scan_region].
    pub pool: FreeBlockPool,

    /// Blocks whose header could not be read at all; they are neither used nor reclaimed
    pub quarantined: Vec<u32>,

    /// Blocks left out because the arena ran out of nodes
    pub unclassified: Vec<u32>,
}

/// A block whose header carries the region's magic
#[derive(Debug, Copy, Clone)]
struct Candidate {
    block: u32,
    erase_count: u16,
    timestamp: u16,
}

/// What the first-pass probe found in a block
struct Probe {
    header: OobHeader,

    /// The first page was read and is fully erased
    erased: bool,
}

/// Scan every block of a region. Bad blocks are skipped, blocks tagged with the region's magic
/// compete for the valid pointer, and everything else usable becomes free-pool material.
pub fn scan_region<D: BlockDevice>(
    device: &mut D,
    layout: &RsvLayout,
    kind: RegionKind,
    bbt: &BadBlockTable,
    arena: &mut NodeArena,
) -> RegionScan {
    let region = layout.region(kind);
    let codec = RecordCodec::new(layout.nand.bytes_per_page, layout.oob_offset);
    let pages_per_record = layout.pages_per_record(kind);

    let mut result = RegionScan::default();
    let mut matched: Vec<Candidate> = Vec::new();
    let mut free: Vec<FreeBlock> = Vec::new();

    for block in region.blocks() {
        // Before the table is loaded it is all-good, and only the device's own marks count
        if bbt.is_bad(block) || device.is_bad(block) {
            debug!(target: "nand_rsv::scan", %kind, block, "skipping bad block");
            continue;
        }

        let Some(Probe { header, erased }) =
            probe_block(device, &codec, block, pages_per_record)
        else {
            warn!(target: "nand_rsv::scan", %kind, block, "no readable header, quarantining block");
            result.quarantined.push(block);
            continue;
        };

        if header.magic == region.magic() {
            matched.push(Candidate {
                block,
                erase_count: header.known_erase_count(),
                timestamp: header.timestamp,
            });
        } else {
            free.push(FreeBlock {
                block,
                erase_count: header.known_erase_count(),
                dirty: !erased,
            });
        }
    }

    while let Some(candidate) = pick_newest(kind, &mut matched) {
        match locate_record(device, &codec, layout, kind, candidate, pages_per_record) {
            Some(pointer) => {
                result.valid = Some(pointer);
                break;
            }
            None => {
                warn!(
                    target: "nand_rsv::scan",
                    %kind,
                    block = candidate.block,
                    "newest block holds no complete record, falling back"
                );
                free.push(candidate.into());
            }
        }
    }
    free.extend(matched.into_iter().map(FreeBlock::from));

    free.sort_by_key(|entry| entry.block);
    for entry in free {
        if let Err(entry) = result.pool.push_back(arena, entry) {
            warn!(target: "nand_rsv::scan", %kind, block = entry.block, "free-block arena full");
            result.unclassified.push(entry.block);
        }
    }

    match result.valid {
        Some(ValidPointer {
            block,
            page,
            timestamp,
            status,
            ..
        }) => info!(
            target: "nand_rsv::scan",
            %kind,
            block,
            page,
            timestamp,
            status = status.bits(),
            free = result.pool.len(),
            "region scanned"
        ),
        None => info!(
            target: "nand_rsv::scan",
            %kind,
            free = result.pool.len(),
            "region scanned, no valid record"
        ),
    }

    result
}

impl From<Candidate> for FreeBlock {
    fn from(value: Candidate) -> Self {
        Self {
            block: value.block,
            erase_count: value.erase_count,
            dirty: true,
        }
    }
}

/// Read the header of a block, trying the start page of each record slot in turn until one of
/// them reads cleanly.
fn probe_block<D: BlockDevice>(
    device: &mut D,
    codec: &RecordCodec,
    block: u32,
    pages_per_record: u32,
) -> Option<Probe> {
    let pages_per_block = device.layout().pages_per_block;
    let mut next_page = 0;

    retry(NoDelay.take(SCAN_ATTEMPTS - 1), || {
        let page = next_page;
        if page >= pages_per_block {
            return OperationResult::Err(());
        }
        next_page += pages_per_record;

        match device.read_page(block, page) {
            Ok(read) if read.ecc.is_usable() => match codec.decode(&read.oob) {
                Ok(header) => OperationResult::Ok(Probe {
                    header,
                    erased: page == 0 && read.data.is_erased() && read.oob.is_erased(),
                }),
                Err(_) => OperationResult::Retry(()),
            },
            _ => OperationResult::Retry(()),
        }
    })
    .ok()
}

/// Choose the newest candidate and take it out of the list. On a timestamp tie the first block
/// found wins.
fn pick_newest(kind: RegionKind, matched: &mut Vec<Candidate>) -> Option<Candidate> {
    let mut best: Option<usize> = None;

    for (index, candidate) in matched.iter().enumerate() {
        let Some(current) = best.map(|i| matched[i]) else {
            best = Some(index);
            continue;
        };

        if is_newer(candidate.timestamp, current.timestamp) {
            best = Some(index);
        } else if candidate.timestamp == current.timestamp {
            warn!(
                target: "nand_rsv::scan",
                %kind,
                kept = current.block,
                other = candidate.block,
                timestamp = current.timestamp,
                "two blocks share a timestamp"
            );
        }
    }

    best.map(|index| matched.remove(index))
}

/// Walk the pages of a candidate block and find its last complete record
fn locate_record<D: BlockDevice>(
    device: &mut D,
    codec: &RecordCodec,
    layout: &RsvLayout,
    kind: RegionKind,
    candidate: Candidate,
    pages_per_record: u32,
) -> Option<ValidPointer> {
    let block = candidate.block;
    let pages_per_block = layout.nand.pages_per_block;
    let magic = kind.magic();

    let mut headers: Vec<Option<OobHeader>> = vec![None; pages_per_block as usize];
    let mut last_good: Option<u32> = None;
    let mut status = PointerStatus::default();

    for page in 0..pages_per_block {
        let read = match device.read_page(block, page) {
            Ok(read) if read.ecc.is_usable() => read,
            _ => {
                debug!(target: "nand_rsv::scan", %kind, block, page, "unreadable page");
                status.insert(PointerStatus::ECC_ABNORMAL);
                continue;
            }
        };

        match codec.decode(&read.oob) {
            Ok(header) if header.magic == magic => {
                headers[page as usize] = Some(header);
                last_good = Some(page);
            }
            _ => break,
        }
    }

    let last_good = last_good?;
    if (last_good + 1) % pages_per_record != 0 {
        status.insert(PointerStatus::POWER_ABNORMAL);
    }

    let records = pages_per_block / pages_per_record;
    (0..records).rev().find_map(|record| {
        let start = record * pages_per_record;
        let group = &headers[start as usize..(start + pages_per_record) as usize];

        let first = group.first().copied().flatten()?;
        let complete = group.iter().all(|header| {
            header.is_some_and(|h| h.timestamp == first.timestamp && h.record_len == first.record_len)
        });
        let tail = group.last().copied().flatten().is_some_and(|h| h.tail);

        if !complete || !tail {
            if record * pages_per_record <= last_good {
                status.insert(PointerStatus::POWER_ABNORMAL);
            }
            return None;
        }

        Some(ValidPointer {
            block,
            page: start,
            erase_count: first.known_erase_count(),
            timestamp: first.timestamp,
            status,
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{EccStatus, NandLayout, SimNand};
    use crate::rsv::pool::RESERVED_BLOCK_NUM;
    use crate::rsv::region::RsvConfig;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 64,
        pages_per_block: 8,
        bytes_per_page: 128,
        oob_bytes: 16,
    };

    fn test_layout() -> anyhow::Result<RsvLayout> {
        // Env records are 2 pages, so 4 fit in a block; env spans blocks 12..20
        let config = RsvConfig::default()
            .boot_pages(32)
            .record_size(RegionKind::Env, 200)
            .record_size(RegionKind::Key, 128)
            .record_size(RegionKind::Dtb, 128);
        Ok(RsvLayout::new(TEST_LAYOUT, &config)?)
    }

    /// Program one env record by hand
    fn put_record(
        nand: &mut SimNand,
        layout: &RsvLayout,
        block: u32,
        start: u32,
        ec: u16,
        ts: u16,
    ) -> anyhow::Result<()> {
        let codec = RecordCodec::new(layout.nand.bytes_per_page, layout.oob_offset);
        let pages = layout.pages_per_record(RegionKind::Env);
        for i in 0..pages {
            let header = OobHeader::new(*b"nenv", ec, ts)
                .tail(i == pages - 1)
                .record_len(200);
            let (data, oob) = codec.encode(header, &[ts as u8; 128]);
            nand.write_page(block, start + i, &data, &oob)?;
        }
        Ok(())
    }

    #[test]
    fn test_scan_empty() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);

        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        assert_eq!(scan.valid, None);
        assert_eq!(scan.pool.len(), 8);
        assert!(scan.pool.iter(&arena).all(|x| !x.dirty && x.erase_count == 0));

        Ok(())
    }

    #[test]
    fn test_scan_picks_newest() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env, 0, 3, 10)?;
        put_record(&mut nand, &layout, env, 2, 3, 11)?;
        put_record(&mut nand, &layout, env + 2, 0, 5, 12)?;
        put_record(&mut nand, &layout, env + 2, 2, 5, 13)?;

        // Not ours: a block of another region's magic sitting in the env range
        let codec = RecordCodec::new(128, layout.oob_offset);
        let (data, oob) = codec.encode(OobHeader::new(*b"nkey", 9, 0), &[]);
        nand.write_page(env + 3, 0, &data, &oob)?;

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);

        assert_eq!(
            scan.valid,
            Some(ValidPointer {
                block: env + 2,
                page: 2,
                erase_count: 5,
                timestamp: 13,
                status: PointerStatus::default(),
            })
        );

        let pool: Vec<FreeBlock> = scan.pool.iter(&arena).collect();
        assert_eq!(pool.len(), 7);
        assert!(pool.contains(&FreeBlock {
            block: env,
            erase_count: 3,
            dirty: true,
        }));
        assert!(pool.contains(&FreeBlock {
            block: env + 3,
            erase_count: 9,
            dirty: true,
        }));

        Ok(())
    }

    #[test]
    fn test_scan_wrapped_timestamps() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env + 1, 0, 1, 0x7FFF)?;
        put_record(&mut nand, &layout, env + 4, 0, 1, 0)?;

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        assert_eq!(scan.valid.map(|x| x.block), Some(env + 4));

        Ok(())
    }

    #[test]
    fn test_scan_timestamp_tie() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env + 1, 0, 2, 6)?;
        put_record(&mut nand, &layout, env + 4, 0, 3, 6)?;

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);

        // The lower block is seen first and keeps the pointer
        assert_eq!(scan.valid.map(|x| (x.block, x.timestamp)), Some((env + 1, 6)));
        let pool: Vec<FreeBlock> = scan.pool.iter(&arena).collect();
        assert!(pool.contains(&FreeBlock {
            block: env + 4,
            erase_count: 3,
            dirty: true,
        }));
        assert!(pool.iter().all(|x| x.block != env + 1));

        Ok(())
    }

    #[test]
    fn test_scan_arena_overflow() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);

        // Other regions already hold all but three nodes
        let mut arena = NodeArena::new();
        let mut other = FreeBlockPool::default();
        for block in 0..(RESERVED_BLOCK_NUM - 3) as u32 {
            let entry = FreeBlock {
                block,
                erase_count: 0,
                dirty: false,
            };
            assert!(other.push_back(&mut arena, entry).is_ok());
        }

        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);

        assert_eq!(scan.valid, None);
        assert_eq!(scan.pool.len(), 3);
        assert_eq!(scan.unclassified, (env + 3..env + 8).collect::<Vec<_>>());
        assert!(arena.is_full());

        Ok(())
    }

    #[test]
    fn test_scan_torn_record() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env, 0, 1, 4)?;

        // Second record loses power on its last page
        nand.cut_power_after(1);
        assert!(put_record(&mut nand, &layout, env, 2, 1, 5).is_err());
        nand.restore_power();

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        let valid = scan.valid.expect("first record survives");

        assert_eq!((valid.block, valid.page, valid.timestamp), (env, 0, 4));
        assert!(valid.status.contains(PointerStatus::POWER_ABNORMAL));
        assert!(valid.status.contains(PointerStatus::ECC_ABNORMAL));

        Ok(())
    }

    #[test]
    fn test_scan_falls_back_to_older_block() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env + 1, 0, 2, 7)?;

        // A rotation into env+5 died after its first page
        nand.cut_power_after(1);
        assert!(put_record(&mut nand, &layout, env + 5, 0, 1, 8).is_err());
        nand.restore_power();

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        let valid = scan.valid.expect("older block is used");

        assert_eq!((valid.block, valid.timestamp), (env + 1, 7));
        assert!(scan.pool.contains(&arena, env + 5));

        Ok(())
    }

    #[test]
    fn test_scan_skips_bad_and_quarantines() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_bad(env)?;
        for page in 0..TEST_LAYOUT.pages_per_block {
            nand.inject_ecc(env + 6, page, EccStatus::Uncorrectable);
        }

        let mut arena = NodeArena::new();
        let mut bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        bbt.mark_worn(env + 1);

        let scan = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        assert_eq!(scan.quarantined, [env + 6]);
        assert!(!scan.pool.contains(&arena, env));
        assert!(!scan.pool.contains(&arena, env + 1));
        assert_eq!(scan.pool.len(), 5);

        Ok(())
    }

    #[test]
    fn test_scan_is_idempotent() -> anyhow::Result<()> {
        let layout = test_layout()?;
        let env = layout.region(RegionKind::Env).start;
        let mut nand = SimNand::new(TEST_LAYOUT);
        put_record(&mut nand, &layout, env + 2, 0, 1, 3)?;
        nand.inject_ecc(env + 2, 1, EccStatus::Corrected(2));

        let mut arena = NodeArena::new();
        let bbt = BadBlockTable::new(TEST_LAYOUT.blocks);
        let mut first = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        let first_pool: Vec<FreeBlock> = first.pool.iter(&arena).collect();
        first.pool.clear(&mut arena);

        let second = scan_region(&mut nand, &layout, RegionKind::Env, &bbt, &mut arena);
        let second_pool: Vec<FreeBlock> = second.pool.iter(&arena).collect();

        assert_eq!(first.valid, second.valid);
        assert_eq!(first_pool, second_pool);
        assert!(first.valid.is_some_and(|x| x.status.is_clean()));

        Ok(())
    }
}
