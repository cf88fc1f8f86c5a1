use std::collections::HashMap;

use anyhow::ensure;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::BlockArena;
use crate::block::{Block, BlockFlags, BlockHandle, BlockIndex, BlockState};
use crate::code_mem::{self, CodeAllocator, CodeRegion, WriteWindow};
use crate::config::CacheConfig;
use crate::dirty::DirtyList;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::page::{page_number, Granularity, PageIndex};
use crate::translate::{Backend, Decoded, Emitted, Frontend, GuestMemory};
use crate::tuning::{host_capability, TuningEligibility, TuningState};

/// Translated-code cache.
///
/// Owns a fixed number of block slots, the executable memory their code
/// lives in, and the per-page bookkeeping that invalidates blocks when guest
/// code is overwritten.
pub struct CodeCache {
    code: CodeAllocator,
    state: CacheState,
}

struct CacheState {
    arena: BlockArena,
    dirty: DirtyList,
    pages: PageIndex,
    // keyed by (phys, cs)
    lookup: HashMap<(u32, u32), BlockIndex>,
    metrics: CacheMetrics,
    tuning: TuningState,
    eligibility: TuningEligibility,
    byte_mask_threshold: Option<u32>,
    rng: StdRng,
    seed: u64,
    // last block handed to the dispatcher; never picked for forced eviction
    current: Option<BlockIndex>,
}

impl CodeCache {
    pub fn new(config: &CacheConfig, region: Box<dyn CodeRegion>) -> Result<Self> {
        config.validate()?;

        let code = CodeAllocator::new(region, config.chunk_size)?;
        if code.chunk_count() < config.arena_size {
            return Err(CacheError::Config(format!(
                "code region holds {} chunks, {} blocks need one each",
                code.chunk_count(),
                config.arena_size
            )));
        }

        let eligibility = config.tuning.unwrap_or_else(host_capability);
        Ok(Self {
            code,
            state: CacheState {
                arena: BlockArena::new(config.arena_size),
                dirty: DirtyList::new(config.dirty_capacity),
                pages: PageIndex::new(),
                lookup: HashMap::new(),
                metrics: CacheMetrics::default(),
                tuning: TuningState::new(eligibility),
                eligibility,
                byte_mask_threshold: config.byte_mask_threshold,
                rng: StdRng::seed_from_u64(config.seed),
                seed: config.seed,
                current: None,
            },
        })
    }

    /// A cache backed by executable host memory.
    pub fn with_host_memory(config: &CacheConfig) -> Result<Self> {
        let region = code_mem::host_region(config.code_size())?;
        Self::new(config, region)
    }

    /// Returns the block for `pc`, translating it first if there is no valid
    /// one.
    pub fn get_or_compile<F, B>(
        &mut self,
        pc: u32,
        cs: u32,
        mem: &impl GuestMemory,
        frontend: &mut F,
        backend: &mut B,
    ) -> Result<BlockHandle>
    where
        F: Frontend,
        B: Backend<F::Ir>,
    {
        let phys = mem
            .physical_lookup(pc)
            .ok_or(CacheError::Unmapped { pc })?;

        let state = &mut self.state;
        if let Some(index) = state.find_active(phys, pc, cs) {
            if !state.has_pending_writes(index) {
                state.metrics.hits += 1;
                state.tuning.record_hit();
                state.current = Some(index);
                return Ok(state.arena.handle(index));
            }
            state.flush_block_pages(&mut self.code, index);
        }

        state.metrics.misses += 1;
        state.tuning.record_miss();
        let budget = state.tuning.block_size_limit();

        let mut window = self.code.write_window()?;
        let index = state.begin(&mut window, pc, cs, phys);
        match state.fill(&mut window, index, mem, frontend, backend, budget) {
            Ok(()) => Ok(state.arena.handle(index)),
            Err(e) => {
                log::debug!("dropping block at {pc:#010x}: {e}");
                state.delete(&mut window, index);
                Err(e)
            }
        }
    }

    /// Reports a guest store and invalidates every block it overwrote.
    pub fn notify_write(&mut self, phys: u32, len: u32) {
        for page in self.state.pages.record_write(phys, len) {
            self.state.check_flush(&mut self.code, page);
        }
    }

    /// Records a guest store without flushing. Affected blocks are dropped
    /// when next looked up, or when their page is purged to free a slot.
    pub fn mark_dirty(&mut self, phys: u32, len: u32) {
        self.state.pages.record_write(phys, len);
    }

    /// Drops a block immediately, bypassing the dirty list. Stale handles are
    /// ignored.
    pub fn delete(&mut self, handle: BlockHandle) {
        if self.state.arena.resolve(handle).is_some() {
            self.state.delete(&mut self.code, handle.index());
        }
    }

    /// Frees every block and clears all counters.
    pub fn reset(&mut self) {
        let state = &mut self.state;
        let live: Vec<BlockIndex> = state
            .arena
            .iter()
            .filter(|(_, block)| block.state != BlockState::Free)
            .map(|(index, _)| index)
            .collect();

        for index in live {
            let block = state.arena.get_mut(index);
            if let Some(chunk) = block.chunk.take() {
                self.code.release(chunk);
            }
            block.next = None;
            block.prev = None;
            block.next_2 = None;
            block.prev_2 = None;
            state.arena.release(index);
        }

        state.dirty.clear();
        state.pages.clear();
        state.lookup.clear();
        state.metrics.reset();
        state.tuning = TuningState::new(state.eligibility);
        state.rng = StdRng::seed_from_u64(state.seed);
        state.current = None;
    }

    pub fn block(&self, handle: BlockHandle) -> Option<&Block> {
        self.state.arena.resolve(handle)
    }

    /// Entry point of a block's host code.
    pub fn code_ptr(&self, handle: BlockHandle) -> Option<*const u8> {
        let block = self.state.arena.resolve(handle)?;
        if block.state != BlockState::Active {
            return None;
        }
        block.chunk.map(|chunk| self.code.chunk_ptr(chunk))
    }

    /// Handle of the block registered at `phys` for code segment `cs`,
    /// including retained dirty blocks.
    pub fn lookup(&self, phys: u32, cs: u32) -> Option<BlockHandle> {
        let &index = self.state.lookup.get(&(phys, cs))?;
        Some(self.state.arena.handle(index))
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.state.metrics
    }

    pub fn tuning(&self) -> &TuningState {
        &self.state.tuning
    }

    pub fn tuning_summary(&self) -> String {
        self.state.tuning.to_string()
    }

    pub fn pages(&self) -> &PageIndex {
        &self.state.pages
    }

    pub fn code(&self) -> &CodeAllocator {
        &self.code
    }

    pub fn free_len(&self) -> usize {
        self.state.arena.free_len()
    }

    pub fn dirty_len(&self) -> usize {
        self.state.dirty.len()
    }

    /// Walks every list and page and checks the structural invariants.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        self.state.check_invariants(&self.code)
    }
}

impl CacheState {
    fn find_active(&self, phys: u32, pc: u32, cs: u32) -> Option<BlockIndex> {
        let &index = self.lookup.get(&(phys, cs))?;
        let block = self.arena.get(index);
        (block.state == BlockState::Active && block.pc == pc && block.cs == cs).then_some(index)
    }

    fn has_pending_writes(&self, index: BlockIndex) -> bool {
        let block = self.arena.get(index);
        let hit = block
            .dirty_ref
            .map_or(0, |r| self.pages.dirty_bits(r) & block.page_mask);
        let hit_2 = block
            .dirty_ref2
            .map_or(0, |r| self.pages.dirty_bits(r) & block.page_mask2);
        hit | hit_2 != 0
    }

    fn flush_block_pages(&mut self, code: &mut CodeAllocator, index: BlockIndex) {
        let block = self.arena.get(index);
        let first = page_number(block.phys);
        let second = block.phys_2.map(page_number).filter(|&page| page != first);

        self.check_flush(code, first);
        if let Some(second) = second {
            self.check_flush(code, second);
        }
    }

    /// Opens a slot for translating `pc`, taking over the block already
    /// registered at `phys` for `cs`.
    fn begin(&mut self, code: &mut CodeAllocator, pc: u32, cs: u32, phys: u32) -> BlockIndex {
        let reuse = self.lookup.get(&(phys, cs)).copied().filter(|&index| {
            matches!(
                self.arena.get(index).state,
                BlockState::Active | BlockState::Dirty
            )
        });

        let index = match reuse {
            Some(index) => {
                self.detach(code, index);
                self.metrics.recompiles += 1;
                index
            }
            None => self.allocate(code),
        };

        let byte_granular = self
            .pages
            .get(page_number(phys))
            .is_some_and(|page| page.is_byte_granular());

        let block = self.arena.get_mut(index);
        block.clear_content();
        block.generation = block.generation.wrapping_add(1);
        block.pc = pc;
        block.cs = cs;
        block.phys = phys;
        block.state = BlockState::Open;
        block.flags = BlockFlags::STATIC_TOP;
        block.flags.set(BlockFlags::BYTE_MASK, byte_granular);
        block.flags.set(BlockFlags::WAS_RECOMPILED, reuse.is_some());

        let Some(chunk) = code.allocate() else {
            panic!("code region exhausted with block {index} open");
        };
        block.chunk = Some(chunk);

        self.lookup.insert((phys, cs), index);
        self.current = Some(index);
        index
    }

    fn fill<F, B>(
        &mut self,
        window: &mut WriteWindow<'_>,
        index: BlockIndex,
        mem: &impl GuestMemory,
        frontend: &mut F,
        backend: &mut B,
        budget: usize,
    ) -> Result<()>
    where
        F: Frontend,
        B: Backend<F::Ir>,
    {
        let block = self.arena.get(index);
        let pc = block.pc;
        let Some(chunk) = block.chunk else {
            unreachable!("open block {index} without code");
        };

        let decoded = frontend
            .decode(pc, budget)
            .map_err(|cause| CacheError::Frontend { pc, cause })?;

        let buf = window.chunk_mut(chunk);
        let cap = buf.len();
        let emitted = backend
            .compile(&decoded.ir, buf)
            .map_err(|cause| CacheError::Backend { pc, cause })?;
        if emitted.len > cap {
            return Err(CacheError::CodeTooLarge {
                pc,
                len: emitted.len,
                cap,
            });
        }

        self.end(index, mem, &decoded, emitted);
        Ok(())
    }

    /// Computes the masks of a filled block and makes it reachable.
    fn end<Ir>(
        &mut self,
        index: BlockIndex,
        mem: &impl GuestMemory,
        decoded: &Decoded<Ir>,
        emitted: Emitted,
    ) {
        let block = self.arena.get(index);
        let (pc, phys) = (block.pc, block.phys);
        let end_pc = decoded.end_pc.max(pc);
        let mut flags = block.flags;

        let mut granularity = Granularity::of(flags);
        if granularity == Granularity::Byte
            && Granularity::Byte.unit(end_pc) - Granularity::Byte.unit(pc) > 1
        {
            granularity = Granularity::Page;
            flags.remove(BlockFlags::BYTE_MASK);
        }

        let mut masks = (0, 0);
        for &(start, len) in &decoded.spans {
            granularity.mark_span(&mut masks, pc, start, len);
        }
        if masks.0 == 0 {
            masks = granularity.span_masks(pc, end_pc);
        }

        let mut phys_2 = None;
        if masks.1 != 0 {
            phys_2 = mem.physical_lookup(end_pc);
            if phys_2.is_none() {
                log::debug!("block at {pc:#010x} ends on unmapped {end_pc:#010x}");
                masks.1 = 0;
            }
        }

        flags.set(BlockFlags::HAS_FPU, decoded.has_fpu);
        if !decoded.has_fpu {
            flags.remove(BlockFlags::STATIC_TOP);
        }

        let dirty_ref = granularity.dirty_ref(phys);
        let dirty_ref2 = phys_2.map(|phys_2| granularity.dirty_ref(phys_2));
        self.pages.add_code(dirty_ref, masks.0);
        if let Some(dirty_ref2) = dirty_ref2 {
            self.pages.add_code(dirty_ref2, masks.1);
        }

        self.metrics.record_block(emitted.len);

        let block = self.arena.get_mut(index);
        block.page_mask = masks.0;
        block.page_mask2 = masks.1;
        block.phys_2 = phys_2;
        block.dirty_ref = Some(dirty_ref);
        block.dirty_ref2 = dirty_ref2;
        block.flags = flags;
        block.code_len = emitted.len;
        block.cycles = emitted.cycles;
        block.ins = decoded.ins;
        block.compile_seq = self.metrics.blocks_compiled;
        block.state = BlockState::Active;

        self.pages.link(&mut self.arena, index);

        log::trace!(
            "compiled {pc:#010x}..={end_pc:#010x}: {} ins, {} bytes, masks {:#x}/{:#x}",
            decoded.ins,
            emitted.len,
            masks.0,
            masks.1
        );
    }

    /// Takes a slot: free list, then the oldest dirty block, then a purge of
    /// one eviction-candidate page, then a forced eviction.
    fn allocate(&mut self, code: &mut CodeAllocator) -> BlockIndex {
        loop {
            if let Some(index) = self.arena.pop_free() {
                return index;
            }

            if let Some(index) = self.dirty.pop_tail(&mut self.arena) {
                self.retire(index);
                continue;
            }

            if let Some(page) = self.pages.first_candidate() {
                self.metrics.purges += 1;
                log::debug!("purging page {page:#x}");
                self.check_flush(code, page);
                continue;
            }

            self.evict_random(code);
        }
    }

    fn evict_random(&mut self, code: &mut CodeAllocator) {
        let len = self.arena.len();
        let start = self.rng.gen_range(0..len);
        let blocks_compiled = self.metrics.blocks_compiled;

        for respect_hint in [true, false] {
            for offset in 0..len {
                let index = ((start + offset) % len) as BlockIndex;
                if self.current == Some(index) {
                    continue;
                }

                let block = self.arena.get(index);
                if block.state != BlockState::Active {
                    continue;
                }
                if respect_hint && self.tuning.should_preserve(block.compile_seq, blocks_compiled) {
                    continue;
                }

                log::debug!("evicting block {index} at {:#010x}", block.pc);
                self.metrics.forced_evictions += 1;
                self.delete(code, index);
                return;
            }
        }

        panic!("no block slot can be reclaimed");
    }

    /// Invalidates every block on `page` whose masks intersect the page's
    /// pending writes, then accounts for those writes.
    fn check_flush(&mut self, code: &mut CodeAllocator, page: u32) {
        let mut invalidated = 0;

        let mut cursor = self.pages.get(page).and_then(|p| p.block);
        while let Some(index) = cursor {
            let block = self.arena.get(index);
            cursor = block.next;
            debug_assert_ne!(cursor, Some(index), "page {page:#x} chain loops");

            let hit = block
                .dirty_ref
                .map_or(0, |r| self.pages.dirty_bits(r) & block.page_mask);
            if hit != 0 {
                self.invalidate(code, index);
                invalidated += 1;
            }
        }

        let mut cursor = self.pages.get(page).and_then(|p| p.block_2);
        while let Some(index) = cursor {
            let block = self.arena.get(index);
            cursor = block.next_2;
            debug_assert_ne!(cursor, Some(index), "page {page:#x} secondary chain loops");

            let hit = block
                .dirty_ref2
                .map_or(0, |r| self.pages.dirty_bits(r) & block.page_mask2);
            if hit != 0 {
                self.invalidate(code, index);
                invalidated += 1;
            }
        }

        let flushes = self.pages.settle(page, invalidated > 0);
        if invalidated > 0 {
            log::debug!("page {page:#x}: {invalidated} blocks invalidated");
        }

        if let Some(threshold) = self.byte_mask_threshold {
            let promote = self
                .pages
                .get(page)
                .is_some_and(|p| !p.is_byte_granular() && flushes >= threshold);
            if promote {
                log::debug!("page {page:#x} switched to byte granularity");
                self.pages.promote(page);
            }
        }
    }

    /// Moves an active block to the dirty list, keeping its slot and lookup
    /// entry for a later recompilation.
    fn invalidate(&mut self, code: &mut CodeAllocator, index: BlockIndex) {
        self.metrics.flushes += 1;
        self.tuning.record_flush();

        self.pages.unlink(&mut self.arena, index);

        let block = self.arena.get_mut(index);
        if let Some(chunk) = block.chunk.take() {
            code.release(chunk);
        }
        block.page_mask = 0;
        block.page_mask2 = 0;
        block.phys_2 = None;
        block.dirty_ref = None;
        block.dirty_ref2 = None;

        if self.current == Some(index) {
            self.current = None;
        }

        if let Some(old) = self.dirty.push(&mut self.arena, index) {
            self.retire(old);
        }
    }

    /// Frees a slot that has already left every list.
    fn retire(&mut self, index: BlockIndex) {
        let block = self.arena.get(index);
        let key = (block.phys, block.cs);
        if self.lookup.get(&key) == Some(&index) {
            self.lookup.remove(&key);
        }
        self.arena.release(index);
    }

    /// Takes a block out of whatever list holds it and frees its code, leaving
    /// the slot open.
    fn detach(&mut self, code: &mut CodeAllocator, index: BlockIndex) {
        match self.arena.get(index).state {
            BlockState::Dirty => self.dirty.remove(&mut self.arena, index),
            BlockState::Active => {
                let block = self.arena.get(index);
                let pages = [Some(block.phys), block.phys_2];
                self.pages.unlink(&mut self.arena, index);
                for phys in pages.into_iter().flatten() {
                    self.pages.forget_if_unused(page_number(phys));
                }
            }
            BlockState::Open => {}
            BlockState::Free => panic!("detaching free block {index}"),
        }

        let block = self.arena.get_mut(index);
        block.state = BlockState::Open;
        if let Some(chunk) = block.chunk.take() {
            code.release(chunk);
        }
    }

    fn delete(&mut self, code: &mut CodeAllocator, index: BlockIndex) {
        self.detach(code, index);
        if self.current == Some(index) {
            self.current = None;
        }
        self.retire(index);
    }

    fn check_invariants(&self, code: &CodeAllocator) -> anyhow::Result<()> {
        let len = self.arena.len();
        let mut primary = vec![0u32; len];
        let mut secondary = vec![0u32; len];

        for index in self.arena.free_list().take(len + 1) {
            ensure!(
                self.arena.get(index).state == BlockState::Free,
                "block {index} on the free list is not free"
            );
        }
        ensure!(
            self.arena.free_list().take(len + 1).count() == self.arena.free_len(),
            "free list length mismatch"
        );

        let dirty: Vec<_> = self.dirty.iter(&self.arena).take(len + 1).collect();
        ensure!(dirty.len() == self.dirty.len(), "dirty list length mismatch");
        ensure!(
            dirty.len() <= self.dirty.capacity(),
            "dirty list holds {} of {}",
            dirty.len(),
            self.dirty.capacity()
        );
        for &index in &dirty {
            ensure!(
                self.arena.get(index).state == BlockState::Dirty,
                "block {index} on the dirty list is not dirty"
            );
        }

        let mut candidates: Vec<u32> = self.pages.candidates().collect();
        candidates.sort_unstable();
        let listed = candidates.len();
        candidates.dedup();
        ensure!(candidates.len() == listed, "page listed twice as a candidate");

        for (number, page) in self.pages.iter() {
            ensure!(
                page.has_overlap() == page.in_evict_list,
                "page {number:#x} candidacy does not match its masks"
            );
            ensure!(
                page.in_evict_list == candidates.binary_search(&number).is_ok(),
                "page {number:#x} candidate flag does not match the list"
            );

            for index in self.pages.chain(&self.arena, number).take(len + 1) {
                let block = self.arena.get(index);
                ensure!(
                    block.state == BlockState::Active,
                    "non-active block {index} on page {number:#x}"
                );
                ensure!(
                    page_number(block.phys) == number,
                    "block {index} chained on foreign page {number:#x}"
                );
                primary[index as usize] += 1;
            }

            for index in self.pages.chain_2(&self.arena, number).take(len + 1) {
                let block = self.arena.get(index);
                ensure!(
                    block.state == BlockState::Active,
                    "non-active block {index} on secondary chain of {number:#x}"
                );
                ensure!(
                    block.phys_2.map(page_number) == Some(number),
                    "block {index} on foreign secondary chain {number:#x}"
                );
                secondary[index as usize] += 1;
            }
        }

        let mut live_chunks = 0;
        for (index, block) in self.arena.iter() {
            match block.state {
                BlockState::Active => {
                    ensure!(block.page_mask != 0, "active block {index} has no mask");
                    ensure!(block.dirty_ref.is_some(), "active block {index} has no dirty ref");
                    ensure!(block.chunk.is_some(), "active block {index} has no code");
                    ensure!(
                        primary[index as usize] == 1,
                        "active block {index} on {} primary chains",
                        primary[index as usize]
                    );
                    let expected = u32::from(block.flags.contains(BlockFlags::HAS_PAGE2));
                    ensure!(
                        secondary[index as usize] == expected,
                        "block {index} on {} secondary chains",
                        secondary[index as usize]
                    );
                    ensure!(
                        block.flags.contains(BlockFlags::HAS_PAGE2) == (block.page_mask2 != 0),
                        "block {index} second-page flag disagrees with its mask"
                    );
                    live_chunks += 1;
                }
                BlockState::Dirty | BlockState::Free => {
                    ensure!(block.chunk.is_none(), "block {index} holds code while retired");
                }
                BlockState::Open => live_chunks += usize::from(block.chunk.is_some()),
            }
        }

        let mut keyed = 0;
        for (&(phys, cs), &index) in &self.lookup {
            let block = self.arena.get(index);
            ensure!(
                matches!(block.state, BlockState::Active | BlockState::Dirty),
                "lookup of {phys:#x} names {:?} block {index}",
                block.state
            );
            ensure!(
                block.phys == phys && block.cs == cs,
                "lookup of {phys:#x}/{cs:#x} names block at {:#x}/{:#x}",
                block.phys,
                block.cs
            );
            keyed += 1;
        }
        let registered = self
            .arena
            .iter()
            .filter(|(_, block)| matches!(block.state, BlockState::Active | BlockState::Dirty))
            .count();
        ensure!(
            keyed == registered,
            "{} active or dirty blocks are unreachable by lookup",
            registered - keyed
        );

        ensure!(
            code.free_chunks() + live_chunks == code.chunk_count(),
            "{} code chunks leaked",
            code.chunk_count() - code.free_chunks() - live_chunks
        );
        Ok(())
    }
}
