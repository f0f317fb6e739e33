//! Free-block bookkeeping for the reserved regions.
//!
//! All regions draw their list nodes from one fixed-capacity [NodeArena], so the total number of
//! blocks the pools can track is bounded by [RESERVED_BLOCK_NUM] no matter how the blocks are
//! spread over the regions. Each region keeps its own FIFO [FreeBlockPool] over that arena.

/// Capacity of the node arena shared by all regions
pub const RESERVED_BLOCK_NUM: usize = 48;

const _: () = assert!(RESERVED_BLOCK_NUM <= u64::BITS as usize);

/// A block that is available for the next rotation of a region
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeBlock {
    pub block: u32,
    pub erase_count: u16,

    /// The block may hold data and must be erased before it is programmed
    pub dirty: bool,
}

#[derive(Debug, Copy, Clone)]
struct FreeNode {
    entry: FreeBlock,
    next: Option<usize>,
}

const EMPTY_NODE: FreeNode = FreeNode {
    entry: FreeBlock {
        block: 0,
        erase_count: 0,
        dirty: false,
    },
    next: None,
};

/// Fixed storage for the list nodes of every region, with a bitmap of the slots in use
#[derive(Debug, Clone)]
pub struct NodeArena {
    nodes: [FreeNode; RESERVED_BLOCK_NUM],
    used: u64,
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            nodes: [EMPTY_NODE; RESERVED_BLOCK_NUM],
            used: 0,
        }
    }

    /// How many nodes are currently handed out
    pub fn in_use(&self) -> usize {
        self.used.count_ones() as usize
    }

    pub fn is_full(&self) -> bool {
        self.in_use() == RESERVED_BLOCK_NUM
    }

    fn alloc(&mut self, entry: FreeBlock) -> Option<usize> {
        let id = (!self.used).trailing_zeros() as usize;
        if id >= RESERVED_BLOCK_NUM {
            return None;
        }

        self.used |= 1 << id;
        self.nodes[id] = FreeNode { entry, next: None };
        Some(id)
    }

    fn release(&mut self, id: usize) {
        self.used &= !(1 << id);
        self.nodes[id] = EMPTY_NODE;
    }
}

/// One region's queue of free blocks. Blocks are taken from the head and returned to the tail, so
/// that wear spreads over all of them.
#[derive(Debug, Default, Clone)]
pub struct FreeBlockPool {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FreeBlockPool {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a block at the tail. When the arena has no room left, the entry is handed back.
    pub fn push_back(&mut self, arena: &mut NodeArena, entry: FreeBlock) -> Result<(), FreeBlock> {
        let id = arena.alloc(entry).ok_or(entry)?;

        match self.tail {
            Some(tail) => arena.nodes[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;

        Ok(())
    }

    /// Take the block at the head
    pub fn pop_front(&mut self, arena: &mut NodeArena) -> Option<FreeBlock> {
        let id = self.head?;
        let FreeNode { entry, next } = arena.nodes[id];

        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        arena.release(id);

        Some(entry)
    }

    /// Unlink a specific block from the pool, wherever it is
    pub fn remove(&mut self, arena: &mut NodeArena, block: u32) -> Option<FreeBlock> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let FreeNode { entry, next } = arena.nodes[id];
            if entry.block == block {
                match prev {
                    Some(prev) => arena.nodes[prev].next = next,
                    None => self.head = next,
                }
                if self.tail == Some(id) {
                    self.tail = prev;
                }
                self.len -= 1;
                arena.release(id);
                return Some(entry);
            }

            prev = Some(id);
            cursor = next;
        }

        None
    }

    /// Drop every entry, returning the nodes to the arena
    pub fn clear(&mut self, arena: &mut NodeArena) {
        while self.pop_front(arena).is_some() {}
    }

    pub fn iter<'a>(&self, arena: &'a NodeArena) -> impl Iterator<Item = FreeBlock> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = arena.nodes[cursor?];
            cursor = node.next;
            Some(node.entry)
        })
    }

    pub fn contains(&self, arena: &NodeArena, block: u32) -> bool {
        self.iter(arena).any(|entry| entry.block == block)
    }
}
