//! The reserved-area manager proper: owns the device, the bad-block table and the per-region
//! pointers and pools, and implements the read/append/rotate protocol on top of them.

use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use retry::delay::NoDelay;
use retry::{retry, OperationResult};
use tracing::{debug, error, info, warn};

use super::bbt::{BadBlockTable, BlockStatus};
use super::oob::{next_timestamp, OobHeader, RecordCodec};
use super::pool::{FreeBlock, FreeBlockPool, NodeArena};
use super::region::{
    PointerStatus, RegionDescriptor, RegionKind, RsvConfig, RsvLayout, ValidPointer,
};
use super::scan::scan_region;
use super::seed::{BadBlockSeeder, VendorProfile};
use super::{RsvError, RsvResult};
use crate::nand::{BlockDevice, NandError, PageRead};

/// How many times a record page is read before it is declared corrupt
const READ_ATTEMPTS: usize = 3;

/// Where a region stands in its scan life cycle
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ScanState {
    /// Not scanned since mount or since [RsvManager::free]; the next access scans it
    #[default]
    Unscanned,

    /// A scan is in progress
    Scanning,

    /// A complete record was found
    Valid,

    /// The region holds no complete record
    Empty,
}

/// Whether generic erases of reserved blocks are refused
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ErasePolicy {
    protect: bool,
}

impl ErasePolicy {
    pub fn new(protect: bool) -> Self {
        Self { protect }
    }

    pub fn is_protected(&self) -> bool {
        self.protect
    }

    /// Lift protection until the returned guard is dropped
    fn disprotect(&mut self) -> Disprotect<'_> {
        let saved = self.protect;
        self.protect = false;
        Disprotect {
            policy: self,
            saved,
        }
    }
}

/// Restores the erase policy it was taken from when dropped
struct Disprotect<'a> {
    policy: &'a mut ErasePolicy,
    saved: bool,
}

impl Deref for Disprotect<'_> {
    type Target = ErasePolicy;

    fn deref(&self) -> &ErasePolicy {
        self.policy
    }
}

impl Drop for Disprotect<'_> {
    fn drop(&mut self) {
        self.policy.protect = self.saved;
    }
}

/// Erase a block, unless it is reserved and the policy protects reserved blocks
fn erase_checked<D: BlockDevice>(
    device: &mut D,
    policy: &ErasePolicy,
    layout: &RsvLayout,
    block: u32,
) -> RsvResult<()> {
    if policy.is_protected() {
        if let Some(kind) = layout.region_of(block) {
            warn!(target: "nand_rsv::manager", block, %kind, "refusing to erase protected block");
            return Err(RsvError::ProtectedBlock(block));
        }
    }

    device.erase(block)?;
    Ok(())
}

/// What a fresh [RsvManager::scan] of a region found
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanResult {
    pub valid: Option<ValidPointer>,
    pub free_pool: Vec<FreeBlock>,
}

/// Everything the manager currently knows about a region, without touching flash
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegionSnapshot {
    pub descriptor: RegionDescriptor,
    pub state: ScanState,
    pub valid: Option<ValidPointer>,
    pub free_pool: Vec<FreeBlock>,

    /// Blocks whose headers could not be read during the last scan
    pub quarantined: Vec<u32>,
}

#[derive(Debug, Default)]
struct RegionState {
    state: ScanState,
    valid: Option<ValidPointer>,
    pool: FreeBlockPool,
    quarantined: Vec<u32>,
}

#[derive(Debug)]
struct Inner<D> {
    device: D,
    layout: RsvLayout,
    codec: RecordCodec,
    bbt: BadBlockTable,
    arena: NodeArena,
    regions: [RegionState; 4],
    policy: ErasePolicy,

    /// The in-memory table has changes that are not yet committed to the BBT region
    bbt_dirty: bool,
}

/// Manages the reserved regions of one NAND device.
///
/// All operations are serialized by one lock, so the manager can be shared between threads
/// (given a `Send` device); region operations never interleave.
#[derive(Debug)]
pub struct RsvManager<D: BlockDevice> {
    inner: Mutex<Inner<D>>,
}

impl<D: BlockDevice> RsvManager<D> {
    /// Lay out the reserved area on `device`, load (or build and commit) the bad-block table, and
    /// scan the other regions.
    pub fn mount(device: D, config: &RsvConfig) -> RsvResult<Self> {
        let layout = RsvLayout::new(device.layout(), config)?;
        let mut inner = Inner {
            codec: RecordCodec::new(layout.nand.bytes_per_page, layout.oob_offset),
            bbt: BadBlockTable::new(layout.nand.blocks),
            arena: NodeArena::new(),
            regions: Default::default(),
            policy: ErasePolicy::new(config.protect),
            bbt_dirty: false,
            device,
            layout,
        };

        inner.mount(Some(config.vendor))?;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unmount, handing the device back
    pub fn into_device(self) -> D {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .device
    }

    pub fn layout(&self) -> RsvLayout {
        self.lock().layout
    }

    /// Rescan every region from flash, reloading the bad-block table but never re-seeding it
    pub fn rescan(&self) -> RsvResult<()> {
        self.lock().mount(None)
    }

    /// Rescan one region from flash
    pub fn scan(&self, kind: RegionKind) -> ScanResult {
        let mut inner = self.lock();
        inner.scan(kind);

        let state = &inner.regions[kind.index()];
        ScanResult {
            valid: state.valid,
            free_pool: state.pool.iter(&inner.arena).collect(),
        }
    }

    /// What the manager knows about a region, without rescanning
    pub fn snapshot(&self, kind: RegionKind) -> RegionSnapshot {
        let inner = self.lock();
        let state = &inner.regions[kind.index()];

        RegionSnapshot {
            descriptor: *inner.layout.region(kind),
            state: state.state,
            valid: state.valid,
            free_pool: state.pool.iter(&inner.arena).collect(),
            quarantined: state.quarantined.clone(),
        }
    }

    /// Read the current record of a region
    pub fn read(&self, kind: RegionKind) -> RsvResult<Bytes> {
        let mut inner = self.lock();
        inner.ensure_scanned(kind);

        match inner.read_record(kind) {
            Err(error @ RsvError::Corrupt { .. }) => {
                let before = inner.regions[kind.index()].valid;
                warn!(target: "nand_rsv::manager", %kind, %error, "rescanning region after failed read");
                inner.scan(kind);

                let after = inner.regions[kind.index()].valid;
                let moved = after.map(|x| (x.block, x.page)) != before.map(|x| (x.block, x.page));
                if after.is_some() && moved {
                    inner.read_record(kind)
                } else {
                    Err(error)
                }
            }
            result => result,
        }
    }

    /// Commit a new record for a region
    pub fn write(&self, kind: RegionKind, payload: &[u8]) -> RsvResult<()> {
        let mut inner = self.lock();
        inner.ensure_scanned(kind);

        let before = (kind == RegionKind::Bbt).then(|| inner.bbt.clone());
        let result = inner.write_record(kind, payload);
        if let (Some(before), Ok(())) = (&before, &result) {
            inner.adopt_bbt(payload, before);
        }
        if !matches!(&result, Err(e) if e.is_power_loss()) {
            inner.flush_bbt();
        }

        result
    }

    /// Wipe a region: its blocks are erased, its pointer dropped and its pool nodes returned to the
    /// arena. The region is rescanned on next use.
    pub fn free(&self, kind: RegionKind) -> RsvResult<()> {
        let mut inner = self.lock();
        let result = inner.free_region(kind);
        inner.flush_bbt();
        result
    }

    /// Erase any block of the device, subject to the erase-protection policy
    pub fn erase_block(&self, block: u32) -> RsvResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        erase_checked(&mut inner.device, &inner.policy, &inner.layout, block)
    }

    /// Turn erase protection of the reserved blocks on or off
    pub fn set_protect(&self, protect: bool) {
        self.lock().policy = ErasePolicy::new(protect);
    }

    pub fn is_protected(&self) -> bool {
        self.lock().policy.is_protected()
    }

    /// Retire a block: record it as worn-bad, mark it on the device and commit the table
    pub fn mark_bad(&self, block: u32) -> RsvResult<()> {
        let mut inner = self.lock();
        if block >= inner.layout.nand.blocks {
            return Err(NandError::BlockOutOfRange(block).into());
        }

        inner.retire_block(block);
        inner.flush_bbt();
        Ok(())
    }

    pub fn block_status(&self, block: u32) -> BlockStatus {
        self.lock().bbt.get(block)
    }

    /// All blocks the table lists as bad
    pub fn bad_blocks(&self) -> Vec<(u32, BlockStatus)> {
        self.lock().bbt.bad_blocks().collect()
    }

    pub fn get_bbt(&self) -> RsvResult<Bytes> {
        self.read(RegionKind::Bbt)
    }

    pub fn put_bbt(&self, table: &[u8]) -> RsvResult<()> {
        self.write(RegionKind::Bbt, table)
    }

    pub fn get_env(&self) -> RsvResult<Bytes> {
        self.read(RegionKind::Env)
    }

    pub fn put_env(&self, env: &[u8]) -> RsvResult<()> {
        self.write(RegionKind::Env, env)
    }

    pub fn get_key(&self) -> RsvResult<Bytes> {
        self.read(RegionKind::Key)
    }

    pub fn put_key(&self, key: &[u8]) -> RsvResult<()> {
        self.write(RegionKind::Key, key)
    }

    pub fn get_dtb(&self) -> RsvResult<Bytes> {
        self.read(RegionKind::Dtb)
    }

    pub fn put_dtb(&self, dtb: &[u8]) -> RsvResult<()> {
        self.write(RegionKind::Dtb, dtb)
    }
}

impl<D: BlockDevice> Inner<D> {
    /// Scan the BBT, adopt it (or seed a new one when `vendor` is given), then scan the rest
    fn mount(&mut self, vendor: Option<VendorProfile>) -> RsvResult<()> {
        let rpt = howudoin::new()
            .label("Scanning reserved area")
            .set_len(RegionKind::ALL.len() as u64);

        self.scan(RegionKind::Bbt);
        rpt.inc();

        match self.read_record(RegionKind::Bbt) {
            Ok(table) => {
                self.bbt = BadBlockTable::from_bytes(&table, self.layout.nand.blocks);
                info!(
                    target: "nand_rsv::manager",
                    bad = self.bbt.bad_blocks().count(),
                    "bad-block table loaded"
                );
            }
            Err(error) if error.is_power_loss() => return Err(error),
            Err(error) => match vendor {
                Some(vendor) => {
                    warn!(target: "nand_rsv::manager", %error, "no usable bad-block table, building one");
                    self.seed(vendor);
                }
                None => {
                    warn!(target: "nand_rsv::manager", %error, "no usable bad-block table, keeping the current one");
                }
            },
        }
        self.drop_bad_from_pools();

        for kind in [RegionKind::Env, RegionKind::Key, RegionKind::Dtb] {
            self.scan(kind);
            rpt.inc();
        }
        rpt.close();

        Ok(())
    }

    /// Build the table from factory markers and commit it
    fn seed(&mut self, vendor: VendorProfile) {
        let seeder = BadBlockSeeder::new(vendor);
        let range = self.layout.boot_blocks..self.layout.nand.blocks;
        self.bbt = seeder.seed(&mut self.device, range);

        // Some vendor rules also match ordinary record data; blocks holding records of ours were
        // written by us and are not factory-bad.
        for kind in RegionKind::ALL {
            for block in self.layout.region(kind).blocks() {
                if self.bbt.get(block) == BlockStatus::FactoryBad && self.carries_record(block) {
                    debug!(target: "nand_rsv::manager", block, %kind, "keeping block that holds a record");
                    self.bbt.forget(block);
                }
            }
        }

        self.drop_bad_from_pools();
        self.bbt_dirty = true;
        self.flush_bbt();
    }

    /// Take a caller-written table as the in-memory one. Blocks retired since `before` was taken
    /// (by the very write that committed `payload`) stay bad, and the merged table is queued for
    /// commit.
    fn adopt_bbt(&mut self, payload: &[u8], before: &BadBlockTable) {
        let mut table = BadBlockTable::from_bytes(payload, self.layout.nand.blocks);
        for (block, _) in self.bbt.bad_blocks() {
            if !before.is_bad(block) && table.mark_worn(block) {
                self.bbt_dirty = true;
            }
        }
        self.bbt = table;
        self.drop_bad_from_pools();
    }

    /// The BBT region is scanned before its table is known; take out whatever the table has
    /// since declared bad
    fn drop_bad_from_pools(&mut self) {
        for (block, status) in self.bbt.bad_blocks() {
            for state in self.regions.iter_mut() {
                if state.pool.remove(&mut self.arena, block).is_some() {
                    debug!(target: "nand_rsv::manager", block, ?status, "dropping bad block from pool");
                }
            }
        }
    }

    /// Does the first page of this block carry the header of any region?
    fn carries_record(&mut self, block: u32) -> bool {
        let Ok(read) = self.device.read_page(block, 0) else {
            return false;
        };

        read.ecc.is_usable()
            && self.codec.decode(&read.oob).is_ok_and(|header| {
                RegionKind::ALL
                    .iter()
                    .any(|kind| kind.magic() == header.magic)
            })
    }

    fn ensure_scanned(&mut self, kind: RegionKind) {
        if self.regions[kind.index()].state == ScanState::Unscanned {
            self.scan(kind);
        }
    }

    fn scan(&mut self, kind: RegionKind) {
        let state = &mut self.regions[kind.index()];
        state.pool.clear(&mut self.arena);
        state.valid = None;
        state.state = ScanState::Scanning;

        let scan = scan_region(
            &mut self.device,
            &self.layout,
            kind,
            &self.bbt,
            &mut self.arena,
        );

        state.state = match scan.valid {
            Some(_) => ScanState::Valid,
            None => ScanState::Empty,
        };
        state.valid = scan.valid;
        state.pool = scan.pool;
        state.quarantined = scan.quarantined;
    }

    fn is_block_bad(&self, block: u32) -> bool {
        self.bbt.is_bad(block) || self.device.is_bad(block)
    }

    /// Erase a reserved block on behalf of its own region, bypassing the protection policy
    fn erase_reserved(&mut self, block: u32) -> RsvResult<()> {
        let policy = self.policy.disprotect();
        erase_checked(&mut self.device, &policy, &self.layout, block)
    }

    /// Read one page, retrying while the ECC engine gives up on it. `None` means the page stayed
    /// uncorrectable.
    fn read_page_retrying(&mut self, block: u32, page: u32) -> RsvResult<Option<PageRead>> {
        let device = &mut self.device;
        let mut failure: Option<NandError> = None;

        let result = retry(NoDelay.take(READ_ATTEMPTS - 1), || {
            match device.read_page(block, page) {
                Ok(read) if read.ecc.is_usable() => OperationResult::Ok(read),
                Ok(_) => {
                    failure = None;
                    OperationResult::Retry(())
                }
                Err(NandError::PowerLoss) => {
                    failure = Some(NandError::PowerLoss);
                    OperationResult::Err(())
                }
                Err(e) => {
                    failure = Some(e);
                    OperationResult::Retry(())
                }
            }
        });

        match (result, failure) {
            (Ok(read), _) => Ok(Some(read)),
            (Err(_), Some(e)) => Err(e.into()),
            (Err(_), None) => Ok(None),
        }
    }

    fn read_record(&mut self, kind: RegionKind) -> RsvResult<Bytes> {
        let ptr = self.regions[kind.index()]
            .valid
            .ok_or(RsvError::NoValidRecord(kind))?;
        let pages = self.layout.pages_per_record(kind);
        let size = self.layout.region(kind).size;

        let mut record = BytesMut::with_capacity(pages as usize * self.layout.nand.bytes_per_page);
        let mut record_len: Option<u32> = None;

        for i in 0..pages {
            let page = ptr.page + i;
            let corrupt = || RsvError::Corrupt {
                region: kind,
                block: ptr.block,
                page,
            };

            let read = self.read_page_retrying(ptr.block, page)?.ok_or_else(corrupt)?;
            let header = self.codec.decode(&read.oob).map_err(|_| corrupt())?;

            if header.magic != kind.magic()
                || header.timestamp != ptr.timestamp
                || header.tail != (i == pages - 1)
                || record_len.is_some_and(|len| len != header.record_len)
            {
                debug!(target: "nand_rsv::manager", %kind, block = ptr.block, page, ?header, "header mismatch");
                return Err(corrupt());
            }

            record_len = Some(header.record_len);
            record.extend_from_slice(&read.data);
        }

        let len = record_len.unwrap_or(0) as usize;
        if len > size {
            return Err(RsvError::Corrupt {
                region: kind,
                block: ptr.block,
                page: ptr.page,
            });
        }
        record.truncate(len);

        Ok(record.freeze())
    }

    /// Program a record starting at `start` and read it back
    fn program_record(
        &mut self,
        kind: RegionKind,
        block: u32,
        start: u32,
        erase_count: u16,
        timestamp: u16,
        payload: &[u8],
    ) -> RsvResult<()> {
        let pages = self.layout.pages_per_record(kind);
        let page_size = self.layout.nand.bytes_per_page;
        let record_len = payload.len() as u32;

        let mut chunks = payload.chunks(page_size);
        let mut written = Vec::with_capacity(pages as usize);
        for i in 0..pages {
            let header = OobHeader::new(kind.magic(), erase_count, timestamp)
                .tail(i == pages - 1)
                .record_len(record_len);
            let (data, oob) = self.codec.encode(header, chunks.next().unwrap_or(&[]));
            self.device.write_page(block, start + i, &data, &oob)?;
            written.push((header, data));
        }

        for (page, (header, data)) in (start..).zip(written) {
            let read = self.device.read_page(block, page)?;
            let intact = read.ecc.is_usable()
                && read.data == data
                && self.codec.decode(&read.oob).is_ok_and(|x| x == header);

            if !intact {
                return Err(RsvError::Corrupt {
                    region: kind,
                    block,
                    page,
                });
            }
        }

        Ok(())
    }

    fn write_record(&mut self, kind: RegionKind, payload: &[u8]) -> RsvResult<()> {
        let size = self.layout.region(kind).size;
        if payload.len() > size {
            return Err(RsvError::TooLarge {
                region: kind,
                len: payload.len(),
                size,
            });
        }

        let pages = self.layout.pages_per_record(kind);
        let pages_per_block = self.layout.nand.pages_per_block;

        if let Some(ptr) = self.regions[kind.index()].valid {
            let next = ptr.page + pages;
            if ptr.status.is_clean() && next + pages <= pages_per_block {
                let timestamp = next_timestamp(ptr.timestamp);
                match self.program_record(kind, ptr.block, next, ptr.erase_count, timestamp, payload)
                {
                    Ok(()) => {
                        self.regions[kind.index()].valid = Some(ValidPointer {
                            page: next,
                            timestamp,
                            status: PointerStatus::default(),
                            ..ptr
                        });
                        debug!(target: "nand_rsv::manager", %kind, block = ptr.block, page = next, timestamp, "record appended");
                        return Ok(());
                    }
                    Err(error) if error.is_power_loss() => return Err(error),
                    Err(error) => {
                        warn!(target: "nand_rsv::manager", %kind, block = ptr.block, page = next, %error, "append failed, rotating");
                        if let Some(valid) = self.regions[kind.index()].valid.as_mut() {
                            valid.status.insert(PointerStatus::ECC_ABNORMAL);
                        }
                    }
                }
            }
        }

        self.rotate(kind, payload)
    }

    /// Write the record to the head of the free pool; only after it verifies is the old block
    /// given back to the pool.
    fn rotate(&mut self, kind: RegionKind, payload: &[u8]) -> RsvResult<()> {
        let old = self.regions[kind.index()].valid;
        let timestamp = old.map_or(0, |x| next_timestamp(x.timestamp));

        let target = loop {
            let Some(entry) = self.regions[kind.index()].pool.pop_front(&mut self.arena) else {
                break None;
            };
            if self.is_block_bad(entry.block) {
                debug!(target: "nand_rsv::manager", %kind, block = entry.block, "dropping bad block from pool");
                continue;
            }
            break Some(entry);
        };

        let Some(FreeBlock {
            block,
            mut erase_count,
            dirty,
        }) = target
        else {
            return match old {
                Some(old) => self.reuse_valid_block(kind, old, timestamp, payload),
                None => Err(RsvError::PoolExhausted(kind)),
            };
        };

        if dirty {
            if let Err(error) = self.erase_reserved(block) {
                return self.fail_rotation(kind, block, error);
            }
            erase_count = erase_count.saturating_add(1);
        }

        let mut result = self.program_record(kind, block, 0, erase_count, timestamp, payload);
        if !dirty && matches!(&result, Err(e) if !e.is_power_loss()) {
            // Blocks believed erased may still hold stray pages; erase and try once more
            debug!(target: "nand_rsv::manager", %kind, block, "program of clean block failed, erasing");
            if let Err(error) = self.erase_reserved(block) {
                return self.fail_rotation(kind, block, error);
            }
            erase_count = erase_count.saturating_add(1);
            result = self.program_record(kind, block, 0, erase_count, timestamp, payload);
        }
        if let Err(error) = result {
            return self.fail_rotation(kind, block, error);
        }

        let state = &mut self.regions[kind.index()];
        state.valid = Some(ValidPointer {
            block,
            page: 0,
            erase_count,
            timestamp,
            status: PointerStatus::default(),
        });
        state.state = ScanState::Valid;
        info!(
            target: "nand_rsv::manager",
            %kind,
            from = ?old.map(|x| x.block),
            to = block,
            erase_count,
            timestamp,
            "region rotated"
        );

        if let Some(old) = old {
            self.reclaim(kind, old);
        }

        Ok(())
    }

    /// The pool is empty: erase the valid block itself and write the record there
    fn reuse_valid_block(
        &mut self,
        kind: RegionKind,
        old: ValidPointer,
        timestamp: u16,
        payload: &[u8],
    ) -> RsvResult<()> {
        let block = old.block;
        warn!(target: "nand_rsv::manager", %kind, block, "free pool empty, rewriting the valid block in place");

        if let Err(error) = self.erase_reserved(block) {
            if error.is_power_loss() {
                return Err(error);
            }
            self.retire_block(block);
            return Err(RsvError::PoolExhausted(kind));
        }

        let state = &mut self.regions[kind.index()];
        state.valid = None;
        state.state = ScanState::Empty;

        let erase_count = old.erase_count.saturating_add(1);
        match self.program_record(kind, block, 0, erase_count, timestamp, payload) {
            Ok(()) => {
                let state = &mut self.regions[kind.index()];
                state.valid = Some(ValidPointer {
                    block,
                    page: 0,
                    erase_count,
                    timestamp,
                    status: PointerStatus::default(),
                });
                state.state = ScanState::Valid;
                Ok(())
            }
            Err(error) if error.is_power_loss() => Err(error),
            Err(error) => {
                error!(target: "nand_rsv::manager", %kind, block, %error, "in-place rewrite failed, record lost");
                self.retire_block(block);
                Err(RsvError::PoolExhausted(kind))
            }
        }
    }

    fn fail_rotation(&mut self, kind: RegionKind, block: u32, error: RsvError) -> RsvResult<()> {
        if error.is_power_loss() {
            return Err(error);
        }

        warn!(target: "nand_rsv::manager", %kind, block, %error, "rotation target failed");
        self.retire_block(block);
        Err(RsvError::WriteFailed {
            region: kind,
            block,
        })
    }

    /// Erase a block that no longer holds the valid record and put it at the tail of the pool
    fn reclaim(&mut self, kind: RegionKind, old: ValidPointer) {
        let block = old.block;
        match self.erase_reserved(block) {
            Ok(()) => {}
            Err(error) if error.is_power_loss() => return,
            Err(error) => {
                warn!(target: "nand_rsv::manager", %kind, block, %error, "reclaimed block failed to erase");
                self.retire_block(block);
                return;
            }
        }

        let entry = FreeBlock {
            block,
            erase_count: old.erase_count.saturating_add(1),
            dirty: false,
        };
        if let Err(entry) = self.regions[kind.index()]
            .pool
            .push_back(&mut self.arena, entry)
        {
            warn!(target: "nand_rsv::manager", %kind, block = entry.block, "free-block arena full, block left unclassified");
        }
    }

    /// Record a block as worn-bad everywhere and make sure no pool hands it out again
    fn retire_block(&mut self, block: u32) {
        warn!(target: "nand_rsv::manager", block, "marking block bad");

        if self.bbt.mark_worn(block) {
            self.bbt_dirty = true;
        }
        if let Err(error) = self.device.mark_bad(block) {
            warn!(target: "nand_rsv::manager", block, %error, "device refused bad-block mark");
        }

        for state in self.regions.iter_mut() {
            state.pool.remove(&mut self.arena, block);
        }

        // A region whose record sat in this block has to find its newest surviving record
        for kind in RegionKind::ALL {
            if self.regions[kind.index()]
                .valid
                .is_some_and(|x| x.block == block)
            {
                self.scan(kind);
            }
        }
    }

    /// Commit the in-memory table if it changed; failures are logged and retried on a later call
    fn flush_bbt(&mut self) {
        if !self.bbt_dirty {
            return;
        }
        self.bbt_dirty = false;

        self.ensure_scanned(RegionKind::Bbt);
        let table = self.bbt.to_bytes();
        if let Err(error) = self.write_record(RegionKind::Bbt, &table) {
            warn!(target: "nand_rsv::manager", %error, "bad-block table not committed");
            self.bbt_dirty = true;
        }
    }

    fn free_region(&mut self, kind: RegionKind) -> RsvResult<()> {
        let state = &mut self.regions[kind.index()];
        state.pool.clear(&mut self.arena);
        state.valid = None;
        state.quarantined.clear();
        state.state = ScanState::Unscanned;

        let mut first_error = None;
        for block in self.layout.region(kind).blocks() {
            if self.is_block_bad(block) {
                continue;
            }

            match self.erase_reserved(block) {
                Ok(()) => {}
                Err(error) if error.is_power_loss() => return Err(error),
                Err(error) => {
                    warn!(target: "nand_rsv::manager", %kind, block, %error, "erase failed while freeing region");
                    self.retire_block(block);
                    first_error.get_or_insert(error);
                }
            }
        }

        info!(target: "nand_rsv::manager", %kind, "region freed");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{EccStatus, NandLayout, SimNand};

    /// 2 KiB pages, 64 pages per block
    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 128,
        pages_per_block: 64,
        bytes_per_page: 2048,
        oob_bytes: 64,
    };

    /// A 16 KiB env, so 8 records fit in a block, and a 2-page dtb
    fn test_config() -> RsvConfig {
        RsvConfig::default()
            .record_size(RegionKind::Env, 16 * 1024)
            .record_size(RegionKind::Dtb, 4096)
    }

    fn payload(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn mount_fresh() -> anyhow::Result<RsvManager<SimNand>> {
        Ok(RsvManager::mount(SimNand::new(TEST_LAYOUT), &test_config())?)
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;

        assert!(matches!(
            rsv.get_env(),
            Err(RsvError::NoValidRecord(RegionKind::Env))
        ));

        let env = payload(1, 1000);
        let key = payload(2, 64 * 1024);
        let dtb = payload(3, 5);
        rsv.put_env(&env)?;
        rsv.put_key(&key)?;
        rsv.put_dtb(&dtb)?;
        rsv.put_dtb(&[])?;

        assert_eq!(rsv.get_env()?, env);
        assert_eq!(rsv.get_key()?, key);
        assert!(rsv.get_dtb()?.is_empty());

        // Everything is found again after a remount
        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert_eq!(rsv.get_env()?, env);
        assert_eq!(rsv.get_key()?, key);
        assert_eq!(rsv.get_bbt()?.len(), TEST_LAYOUT.blocks as usize);

        Ok(())
    }

    #[test]
    fn test_too_large() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        assert!(matches!(
            rsv.put_env(&payload(0, 16 * 1024 + 1)),
            Err(RsvError::TooLarge { len: 16385, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_rotation() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;

        rsv.put_env(&payload(0, 100))?;
        let first = rsv.snapshot(RegionKind::Env).valid.expect("record written");
        let pool_before = rsv.snapshot(RegionKind::Env).free_pool;
        assert_eq!(first.timestamp, 0);

        for i in 1..8 {
            rsv.put_env(&payload(i, 100))?;
        }
        let eighth = rsv.snapshot(RegionKind::Env).valid.expect("record written");
        assert_eq!(eighth.block, first.block);
        assert_eq!(eighth.page, 7 * 8);
        assert_eq!(eighth.timestamp, 7);

        rsv.put_env(&payload(8, 100))?;
        let snapshot = rsv.snapshot(RegionKind::Env);
        let ninth = snapshot.valid.expect("record written");
        assert_ne!(ninth.block, first.block);
        assert_eq!((ninth.page, ninth.timestamp), (0, 8));
        assert_eq!(ninth.block, pool_before[0].block);

        // The old block is back at the tail of the pool, erased once more
        let reclaimed = snapshot.free_pool.last().copied();
        assert_eq!(
            reclaimed,
            Some(FreeBlock {
                block: first.block,
                erase_count: first.erase_count + 1,
                dirty: false,
            })
        );
        assert_eq!(rsv.get_env()?, payload(8, 100));

        Ok(())
    }

    #[test]
    fn test_crash_during_rotation() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        for i in 0..8 {
            rsv.put_env(&payload(i, 16 * 1024))?;
        }

        // The 9th write rotates; power fails while programming its 5th page
        let mut nand = rsv.into_device();
        nand.cut_power_after(4);
        let rsv = RsvManager::mount(nand, &test_config())?;
        let result = rsv.put_env(&payload(8, 16 * 1024));
        assert!(result.as_ref().is_err_and(|e| e.is_power_loss()));

        let mut nand = rsv.into_device();
        nand.restore_power();
        let rsv = RsvManager::mount(nand, &test_config())?;
        assert_eq!(rsv.get_env()?, payload(7, 16 * 1024));

        // And the region carries on from there
        rsv.put_env(&payload(9, 10))?;
        assert_eq!(rsv.get_env()?, payload(9, 10));
        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert_eq!(rsv.get_env()?, payload(9, 10));

        Ok(())
    }

    #[test]
    fn test_crash_during_every_page() -> anyhow::Result<()> {
        // Whatever page the power fails on, the old or the new record survives
        for pages in 0..=8 {
            let rsv = mount_fresh()?;
            rsv.put_env(&payload(1, 10_000))?;

            let mut nand = rsv.into_device();
            nand.cut_power_after(pages);
            let rsv = RsvManager::mount(nand, &test_config())?;
            let result = rsv.put_env(&payload(2, 10_000));

            let mut nand = rsv.into_device();
            nand.restore_power();
            let rsv = RsvManager::mount(nand, &test_config())?;
            let env = rsv.get_env()?;

            if result.is_ok() {
                assert_eq!(env, payload(2, 10_000));
            } else {
                assert!(env == payload(1, 10_000) || env == payload(2, 10_000));
            }
        }

        Ok(())
    }

    #[test]
    fn test_scan_is_idempotent() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        for i in 0..11 {
            rsv.put_key(&payload(i, 3000))?;
        }

        let first = rsv.scan(RegionKind::Key);
        let second = rsv.scan(RegionKind::Key);
        assert_eq!(first, second);
        assert!(first.valid.is_some());

        Ok(())
    }

    #[test]
    fn test_write_failure_marks_bad() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        rsv.put_env(&payload(1, 100))?;

        let snapshot = rsv.snapshot(RegionKind::Env);
        let valid = snapshot.valid.expect("record written");
        let target = snapshot.free_pool[0].block;

        // Fill the block, then make the next rotation target fail
        for i in 0..7 {
            rsv.put_env(&payload(i, 100))?;
        }
        let mut nand = rsv.into_device();
        nand.fail_block(target);
        let rsv = RsvManager::mount(nand, &test_config())?;

        let result = rsv.put_env(&payload(42, 100));
        assert!(matches!(
            result,
            Err(RsvError::WriteFailed { block, .. }) if block == target
        ));

        // Old record untouched, target retired everywhere
        assert_eq!(rsv.get_env()?, payload(6, 100));
        assert_eq!(rsv.snapshot(RegionKind::Env).valid.map(|x| x.block), Some(valid.block));
        assert_eq!(rsv.block_status(target), BlockStatus::WornBad);
        assert!(rsv
            .snapshot(RegionKind::Env)
            .free_pool
            .iter()
            .all(|x| x.block != target));

        // The next write moves on to another block, and the retirement survives a remount
        rsv.put_env(&payload(43, 100))?;
        assert_eq!(rsv.get_env()?, payload(43, 100));
        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert_eq!(rsv.block_status(target), BlockStatus::WornBad);

        Ok(())
    }

    #[test]
    fn test_bad_blocks_never_pooled() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let layout = RsvLayout::new(TEST_LAYOUT, &test_config())?;
        let env = layout.region(RegionKind::Env);
        nand.imprint_factory_bad(env.start + 1)?;

        let rsv = RsvManager::mount(nand, &test_config())?;
        assert_eq!(rsv.block_status(env.start + 1), BlockStatus::FactoryBad);
        rsv.mark_bad(env.start + 3)?;

        for i in 0..40 {
            rsv.put_env(&payload(i, 16 * 1024))?;
            let snapshot = rsv.snapshot(RegionKind::Env);
            let valid = snapshot.valid.expect("record written");
            for bad in [env.start + 1, env.start + 3] {
                assert_ne!(valid.block, bad);
                assert!(snapshot.free_pool.iter().all(|x| x.block != bad));
            }
        }

        Ok(())
    }

    #[test]
    fn test_bad_bbt_block_never_pooled() -> anyhow::Result<()> {
        let layout = RsvLayout::new(TEST_LAYOUT, &test_config())?;
        let bad = layout.region(RegionKind::Bbt).start + 2;
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.imprint_factory_bad(bad)?;

        let not_pooled = |pool: &[FreeBlock]| pool.iter().all(|x| x.block != bad);

        let rsv = RsvManager::mount(nand, &test_config())?;
        assert_eq!(rsv.block_status(bad), BlockStatus::FactoryBad);
        assert!(not_pooled(&rsv.snapshot(RegionKind::Bbt).free_pool));

        // Once the table is on flash, remounts and rescans keep the block out too
        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert!(not_pooled(&rsv.snapshot(RegionKind::Bbt).free_pool));
        assert!(not_pooled(&rsv.scan(RegionKind::Bbt).free_pool));
        rsv.rescan()?;
        assert!(not_pooled(&rsv.snapshot(RegionKind::Bbt).free_pool));
        assert_eq!(rsv.snapshot(RegionKind::Bbt).free_pool.len(), 2);

        Ok(())
    }

    #[test]
    fn test_bbt_write_keeps_retired_block() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        let first = rsv.snapshot(RegionKind::Bbt).valid.expect("table seeded");
        assert_eq!(first.page, 0);
        let table = rsv.get_bbt()?;

        for _ in 1..TEST_LAYOUT.pages_per_block {
            rsv.put_bbt(&table)?;
        }
        assert_eq!(
            rsv.snapshot(RegionKind::Bbt).valid.map(|x| (x.block, x.page)),
            Some((first.block, TEST_LAYOUT.pages_per_block - 1))
        );

        // The next table rotates, and the old block then refuses to erase
        let mut nand = rsv.into_device();
        nand.fail_block(first.block);
        let rsv = RsvManager::mount(nand, &test_config())?;
        rsv.put_bbt(&table)?;

        let moved = rsv.snapshot(RegionKind::Bbt).valid.expect("table written");
        assert_ne!(moved.block, first.block);
        assert_eq!(rsv.block_status(first.block), BlockStatus::WornBad);
        assert_eq!(
            rsv.get_bbt()?[first.block as usize],
            BlockStatus::WornBad as u8
        );

        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert_eq!(rsv.block_status(first.block), BlockStatus::WornBad);

        Ok(())
    }

    #[test]
    fn test_erase_protection() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        let layout = rsv.layout();

        for region in layout.regions() {
            assert!(matches!(
                rsv.erase_block(region.start),
                Err(RsvError::ProtectedBlock(block)) if block == region.start
            ));
        }
        rsv.erase_block(layout.region(RegionKind::Dtb).end)?;
        rsv.erase_block(0)?;

        // Rotations still erase their own blocks
        for i in 0..20 {
            rsv.put_env(&payload(i, 16 * 1024))?;
        }
        assert!(rsv.is_protected());

        rsv.set_protect(false);
        rsv.erase_block(layout.region(RegionKind::Key).start)?;

        Ok(())
    }

    #[test]
    fn test_ecc_abnormal_forces_rotation() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        rsv.put_dtb(&payload(1, 3000))?;
        rsv.put_dtb(&payload(2, 3000))?;
        let valid = rsv.snapshot(RegionKind::Dtb).valid.expect("record written");
        assert_eq!(valid.page, 2);

        let mut nand = rsv.into_device();
        nand.inject_ecc(valid.block, 0, EccStatus::Uncorrectable);
        let rsv = RsvManager::mount(nand, &test_config())?;

        let valid = rsv.snapshot(RegionKind::Dtb).valid.expect("record found");
        assert!(valid.status.contains(PointerStatus::ECC_ABNORMAL));
        assert_eq!(rsv.get_dtb()?, payload(2, 3000));

        rsv.put_dtb(&payload(3, 3000))?;
        let rotated = rsv.snapshot(RegionKind::Dtb).valid.expect("record written");
        assert_ne!(rotated.block, valid.block);
        assert!(rotated.status.is_clean());
        assert_eq!(rsv.get_dtb()?, payload(3, 3000));

        Ok(())
    }

    #[test]
    fn test_corrupt_record() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        rsv.put_env(&payload(1, 5000))?;
        let valid = rsv.snapshot(RegionKind::Env).valid.expect("record written");

        let mut nand = rsv.into_device();
        nand.inject_ecc(valid.block, 1, EccStatus::Uncorrectable);
        let rsv = RsvManager::mount(nand, &test_config())?;

        // The only record is torn by the ECC failure, so the scan finds nothing complete
        assert!(matches!(
            rsv.get_env(),
            Err(RsvError::NoValidRecord(RegionKind::Env))
        ));

        // Corrected bitflips are harmless
        let rsv = mount_fresh()?;
        rsv.put_env(&payload(1, 5000))?;
        let valid = rsv.snapshot(RegionKind::Env).valid.expect("record written");
        let mut nand = rsv.into_device();
        nand.inject_ecc(valid.block, 1, EccStatus::Corrected(3));
        let rsv = RsvManager::mount(nand, &test_config())?;
        assert_eq!(rsv.get_env()?, payload(1, 5000));

        Ok(())
    }

    #[test]
    fn test_free_region() -> anyhow::Result<()> {
        let rsv = mount_fresh()?;
        for i in 0..10 {
            rsv.put_key(&payload(i, 64 * 1024))?;
        }
        let arena_before = rsv.snapshot(RegionKind::Key).free_pool.len();
        assert!(arena_before > 0);

        rsv.free(RegionKind::Key)?;
        let snapshot = rsv.snapshot(RegionKind::Key);
        assert_eq!(snapshot.state, ScanState::Unscanned);
        assert!(snapshot.free_pool.is_empty());

        assert!(matches!(
            rsv.get_key(),
            Err(RsvError::NoValidRecord(RegionKind::Key))
        ));
        assert_eq!(rsv.snapshot(RegionKind::Key).free_pool.len(), 8);

        rsv.put_key(b"fresh")?;
        assert_eq!(rsv.get_key()?, &b"fresh"[..]);

        Ok(())
    }

    #[test]
    fn test_pool_exhausted() -> anyhow::Result<()> {
        let config = test_config().region_blocks(RegionKind::Dtb, 1);
        let rsv = RsvManager::mount(SimNand::new(TEST_LAYOUT), &config)?;
        let dtb = rsv.layout().region(RegionKind::Dtb).start;

        // One block: 32 two-page records fit, then the block is rewritten in place
        for i in 0..70 {
            rsv.put_dtb(&payload(i, 100))?;
        }
        assert_eq!(rsv.get_dtb()?, payload(69, 100));
        assert_eq!(rsv.snapshot(RegionKind::Dtb).valid.map(|x| x.block), Some(dtb));

        rsv.mark_bad(dtb)?;
        assert!(matches!(
            rsv.put_dtb(b"nowhere"),
            Err(RsvError::PoolExhausted(RegionKind::Dtb))
        ));

        Ok(())
    }

    #[test]
    fn test_seeded_table_persists() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.imprint_factory_bad(100)?;
        let rsv = RsvManager::mount(nand, &test_config())?;
        assert_eq!(rsv.bad_blocks(), [(100, BlockStatus::FactoryBad)]);

        rsv.mark_bad(101)?;
        rsv.mark_bad(100)?;
        let rsv = RsvManager::mount(rsv.into_device(), &test_config())?;
        assert_eq!(
            rsv.bad_blocks(),
            [(100, BlockStatus::FactoryBad), (101, BlockStatus::WornBad)]
        );
        assert_eq!(
            rsv.mark_bad(TEST_LAYOUT.blocks).err().map(|e| e.to_string()),
            Some(format!("block {} out of range", TEST_LAYOUT.blocks))
        );

        Ok(())
    }
}
