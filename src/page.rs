//! Per-page self-modifying code bookkeeping.
//!
//! Every physical page carries two granularities of tracking. At page
//! granularity a `u64` covers the page in 64-byte regions; at byte granularity
//! each of the 64 rows of the page gets its own `u64`, one bit per byte. For
//! both, a code-present set records which regions hold translated code and a
//! dirty set records which of those have been written since.

use std::collections::{HashMap, VecDeque};

use crate::arena::BlockArena;
use crate::block::{BlockFlags, BlockIndex};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

pub const REGION_SHIFT: u32 = 6;
pub const ROW_SIZE: u32 = 1 << REGION_SHIFT;
pub const ROWS: usize = 64;

pub fn page_number(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

/// Row of the page holding `addr`, in `0..64`.
pub fn byte_row(addr: u32) -> usize {
    ((addr >> REGION_SHIFT) & (ROWS as u32 - 1)) as usize
}

/// Bits `first..=last`.
pub fn region_mask(first: u32, last: u32) -> u64 {
    debug_assert!(first <= last && last < 64, "bad region range {first}..={last}");
    (u64::MAX >> (63 - last)) & (u64::MAX << first)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// 64 regions of 64 bytes per 4 KiB page.
    Page,
    /// 64 regions of one byte within a single 64-byte row.
    Byte,
}

impl Granularity {
    pub fn of(flags: BlockFlags) -> Self {
        if flags.contains(BlockFlags::BYTE_MASK) {
            Self::Byte
        } else {
            Self::Page
        }
    }

    /// Number of the unit (page or row) a mask of this granularity covers.
    pub fn unit(self, addr: u32) -> u32 {
        match self {
            Self::Page => addr >> PAGE_SHIFT,
            Self::Byte => addr >> REGION_SHIFT,
        }
    }

    /// Bit index of `addr` inside its unit.
    pub fn region(self, addr: u32) -> u32 {
        match self {
            Self::Page => (addr & PAGE_OFFSET_MASK) >> REGION_SHIFT,
            Self::Byte => addr & (ROW_SIZE - 1),
        }
    }

    pub fn dirty_ref(self, phys: u32) -> DirtyRef {
        DirtyRef {
            page: page_number(phys),
            row: match self {
                Self::Page => None,
                Self::Byte => Some(byte_row(phys) as u8),
            },
        }
    }

    /// Masks for a block covering `pc..=end_pc`, first unit and second unit.
    pub fn span_masks(self, pc: u32, end_pc: u32) -> (u64, u64) {
        let start = self.region(pc);
        if self.unit(pc) == self.unit(end_pc) {
            let end = self.region(end_pc);
            let end = if end < start { 63 } else { end };
            (region_mask(start, end), 0)
        } else {
            (region_mask(start, 63), region_mask(0, self.region(end_pc)))
        }
    }

    /// Adds one instruction's bytes to a block's masks.
    pub fn mark_span(self, masks: &mut (u64, u64), block_pc: u32, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end = start.wrapping_add(len - 1);
        let first = self.region(start);
        let last = self.region(end);

        if self.unit(start) != self.unit(block_pc) {
            masks.1 |= region_mask(first, last.max(first));
        } else if self.unit(end) != self.unit(block_pc) {
            masks.0 |= region_mask(first, 63);
            masks.1 |= region_mask(0, last);
        } else {
            masks.0 |= region_mask(first, last.max(first));
        }
    }
}

/// Names the dirty bitset a block is checked against: the page-wide set, or
/// one byte row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRef {
    pub page: u32,
    pub row: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub(crate) code_present: u64,
    pub(crate) dirty: u64,
    pub(crate) byte_code_present: [u64; ROWS],
    pub(crate) byte_dirty: [u64; ROWS],

    pub(crate) block: Option<BlockIndex>,
    pub(crate) block_2: Option<BlockIndex>,

    pub(crate) flush_count: u32,
    pub(crate) byte_granular: bool,
    pub(crate) in_evict_list: bool,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            code_present: 0,
            dirty: 0,
            byte_code_present: [0; ROWS],
            byte_dirty: [0; ROWS],
            block: None,
            block_2: None,
            flush_count: 0,
            byte_granular: false,
            in_evict_list: false,
        }
    }
}

impl Page {
    pub fn code_present(&self) -> u64 {
        self.code_present
    }

    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    pub fn byte_code_present(&self, row: usize) -> u64 {
        self.byte_code_present[row]
    }

    pub fn byte_dirty(&self, row: usize) -> u64 {
        self.byte_dirty[row]
    }

    pub fn is_byte_granular(&self) -> bool {
        self.byte_granular
    }

    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    pub fn has_overlap(&self) -> bool {
        self.code_present & self.dirty != 0
            || self
                .byte_code_present
                .iter()
                .zip(&self.byte_dirty)
                .any(|(code, dirty)| code & dirty != 0)
    }

    pub fn is_unused(&self) -> bool {
        self.block.is_none() && self.block_2.is_none()
    }

    fn dirty_bits(&self, row: Option<u8>) -> u64 {
        match row {
            None => self.dirty,
            Some(row) => self.byte_dirty[row as usize],
        }
    }

    fn add_code(&mut self, row: Option<u8>, mask: u64) {
        match row {
            None => self.code_present |= mask,
            Some(row) => self.byte_code_present[row as usize] |= mask,
        }
    }

    /// Records a write to page offsets `first..=last`. Only regions holding
    /// code are tracked.
    fn record_write(&mut self, first: u32, last: u32) {
        let first_row = first >> REGION_SHIFT;
        let last_row = last >> REGION_SHIFT;

        self.dirty |= region_mask(first_row, last_row) & self.code_present;

        for row in first_row..=last_row {
            let lo = if row == first_row { first & (ROW_SIZE - 1) } else { 0 };
            let hi = if row == last_row { last & (ROW_SIZE - 1) } else { 63 };
            let row = row as usize;
            self.byte_dirty[row] |= region_mask(lo, hi) & self.byte_code_present[row];
        }
    }

    /// Accounts for the pending writes once the overlapping blocks are gone.
    fn settle(&mut self) {
        self.code_present &= !self.dirty;
        self.dirty = 0;
        for (code, dirty) in self.byte_code_present.iter_mut().zip(&mut self.byte_dirty) {
            *code &= !*dirty;
            *dirty = 0;
        }
    }

    fn forget_code(&mut self) {
        self.code_present = 0;
        self.dirty = 0;
        self.byte_code_present = [0; ROWS];
        self.byte_dirty = [0; ROWS];
    }
}

#[derive(Default)]
pub struct PageIndex {
    pages: HashMap<u32, Page>,
    evict_list: VecDeque<u32>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page: u32) -> Option<&Page> {
        self.pages.get(&page)
    }

    pub(crate) fn entry(&mut self, page: u32) -> &mut Page {
        self.pages.entry(page).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Page)> {
        self.pages.iter().map(|(&number, page)| (number, page))
    }

    pub fn candidates(&self) -> impl Iterator<Item = u32> + '_ {
        self.evict_list.iter().copied()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.evict_list.clear();
    }

    pub fn dirty_bits(&self, dirty_ref: DirtyRef) -> u64 {
        self.pages
            .get(&dirty_ref.page)
            .map_or(0, |page| page.dirty_bits(dirty_ref.row))
    }

    /// Marks `mask` as holding code. A page that already carries pending
    /// writes there becomes an eviction candidate.
    pub fn add_code(&mut self, dirty_ref: DirtyRef, mask: u64) {
        let page = self.entry(dirty_ref.page);
        page.add_code(dirty_ref.row, mask);
        if page.dirty_bits(dirty_ref.row) & mask != 0 {
            self.add_candidate(dirty_ref.page);
        }
    }

    /// Records a guest write of `len` bytes at `phys` and returns the pages
    /// where the write hit translated code.
    pub fn record_write(&mut self, phys: u32, len: u32) -> Vec<u32> {
        let mut hit = Vec::new();
        if len == 0 {
            return hit;
        }

        let last = phys.saturating_add(len - 1);
        let mut addr = phys;
        loop {
            let number = page_number(addr);
            let end = last.min(addr | PAGE_OFFSET_MASK);

            if let Some(page) = self.pages.get_mut(&number) {
                page.record_write(addr & PAGE_OFFSET_MASK, end & PAGE_OFFSET_MASK);
                if page.has_overlap() {
                    hit.push(number);
                }
            }

            if end == last {
                break;
            }
            addr = end + 1;
        }

        for &number in &hit {
            self.add_candidate(number);
        }
        hit
    }

    pub fn first_candidate(&self) -> Option<u32> {
        self.evict_list.front().copied()
    }

    /// Clears the accounted writes of a flushed page and drops it from the
    /// candidate list. Returns the page's flush count.
    pub fn settle(&mut self, number: u32, invalidated: bool) -> u32 {
        self.remove_candidate(number);
        let page = self.entry(number);
        page.settle();
        if invalidated {
            page.flush_count += 1;
        }
        page.flush_count
    }

    pub fn promote(&mut self, number: u32) {
        self.entry(number).byte_granular = true;
    }

    /// Stops tracking code on a page whose chains are both empty.
    pub fn forget_if_unused(&mut self, number: u32) {
        if let Some(page) = self.pages.get_mut(&number) {
            if page.is_unused() {
                page.forget_code();
                self.remove_candidate(number);
            }
        }
    }

    fn add_candidate(&mut self, number: u32) {
        if let Some(page) = self.pages.get_mut(&number) {
            if !page.in_evict_list {
                page.in_evict_list = true;
                self.evict_list.push_back(number);
            }
        }
    }

    fn remove_candidate(&mut self, number: u32) {
        if let Some(page) = self.pages.get_mut(&number) {
            if page.in_evict_list {
                page.in_evict_list = false;
                self.evict_list.retain(|&n| n != number);
            }
        }
    }

    pub fn chain<'a>(
        &self,
        arena: &'a BlockArena,
        number: u32,
    ) -> impl Iterator<Item = BlockIndex> + 'a {
        let head = self.pages.get(&number).and_then(|page| page.block);
        std::iter::successors(head, |&index| arena.get(index).next)
    }

    pub fn chain_2<'a>(
        &self,
        arena: &'a BlockArena,
        number: u32,
    ) -> impl Iterator<Item = BlockIndex> + 'a {
        let head = self.pages.get(&number).and_then(|page| page.block_2);
        std::iter::successors(head, |&index| arena.get(index).next_2)
    }

    /// Pushes a masked block on the chain of its first page and, when it has
    /// a second-page mask, on the secondary chain of that page.
    pub fn link(&mut self, arena: &mut BlockArena, index: BlockIndex) {
        let block = arena.get(index);
        debug_assert!(block.page_mask != 0, "linking block {index} with empty mask");
        let (phys, phys_2, mask2) = (block.phys, block.phys_2, block.page_mask2);

        let old = self.entry(page_number(phys)).block.replace(index);
        let block = arena.get_mut(index);
        block.prev = None;
        block.next = old;
        if let Some(old) = old {
            arena.get_mut(old).prev = Some(index);
        }

        let Some(phys_2) = phys_2.filter(|_| mask2 != 0) else {
            return;
        };

        let old = self.entry(page_number(phys_2)).block_2.replace(index);
        let block = arena.get_mut(index);
        block.flags |= BlockFlags::HAS_PAGE2;
        block.prev_2 = None;
        block.next_2 = old;
        if let Some(old) = old {
            arena.get_mut(old).prev_2 = Some(index);
        }
    }

    pub fn unlink(&mut self, arena: &mut BlockArena, index: BlockIndex) {
        let block = arena.get_mut(index);
        if block.page_mask == 0 {
            return;
        }
        let (phys, prev, next) = (block.phys, block.prev.take(), block.next.take());

        match prev {
            Some(prev) => arena.get_mut(prev).next = next,
            None => self.entry(page_number(phys)).block = next,
        }
        if let Some(next) = next {
            arena.get_mut(next).prev = prev;
        }

        let block = arena.get_mut(index);
        if !block.flags.contains(BlockFlags::HAS_PAGE2) {
            debug_assert!(
                block.prev_2.is_none() && block.next_2.is_none(),
                "block {index} on a secondary chain without a second page"
            );
            return;
        }
        block.flags.remove(BlockFlags::HAS_PAGE2);

        let (phys_2, prev, next) = (block.phys_2, block.prev_2.take(), block.next_2.take());
        let Some(phys_2) = phys_2 else {
            unreachable!("block {index} has a second-page flag without an address");
        };

        match prev {
            Some(prev) => arena.get_mut(prev).next_2 = next,
            None => self.entry(page_number(phys_2)).block_2 = next,
        }
        if let Some(next) = next {
            arena.get_mut(next).prev_2 = prev;
        }
    }
}
