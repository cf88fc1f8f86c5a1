use bitflags::bitflags;

use crate::code_mem::CodeChunk;
use crate::page::DirtyRef;

pub type BlockIndex = u16;

/// Handle to an arena slot.
///
/// The generation changes every time the slot is released or reopened, so a
/// handle kept across an invalidation resolves to nothing instead of to
/// whatever was compiled into the slot afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: BlockIndex,
    generation: u32,
}

impl BlockHandle {
    pub(crate) fn new(index: BlockIndex, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> BlockIndex {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u16 {
        /// Masks are tracked per byte of a 64-byte row.
        const BYTE_MASK = 1 << 0;
        /// Guest bytes continue on a second page (or row).
        const HAS_PAGE2 = 1 << 1;
        /// The slot was reused for a recompilation of the same address.
        const WAS_RECOMPILED = 1 << 2;
        /// Guest FPU stack top is static within the block.
        const STATIC_TOP = 1 << 3;
        /// The block touches guest FPU state.
        const HAS_FPU = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Free,
    Open,
    Active,
    Dirty,
}

#[derive(Debug, Default)]
pub struct Block {
    pub(crate) pc: u32,
    pub(crate) cs: u32,
    pub(crate) phys: u32,
    pub(crate) phys_2: Option<u32>,

    pub(crate) page_mask: u64,
    pub(crate) page_mask2: u64,
    pub(crate) dirty_ref: Option<DirtyRef>,
    pub(crate) dirty_ref2: Option<DirtyRef>,

    pub(crate) flags: BlockFlags,
    pub(crate) state: BlockState,
    pub(crate) generation: u32,

    // free list, dirty list or primary page chain, depending on `state`
    pub(crate) next: Option<BlockIndex>,
    pub(crate) prev: Option<BlockIndex>,
    // secondary page chain
    pub(crate) next_2: Option<BlockIndex>,
    pub(crate) prev_2: Option<BlockIndex>,

    pub(crate) chunk: Option<CodeChunk>,
    pub(crate) code_len: usize,
    pub(crate) ins: u32,
    pub(crate) cycles: i32,
    pub(crate) compile_seq: u64,
}

impl Block {
    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn cs(&self) -> u32 {
        self.cs
    }

    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn phys_2(&self) -> Option<u32> {
        self.phys_2
    }

    pub fn page_mask(&self) -> u64 {
        self.page_mask
    }

    pub fn page_mask2(&self) -> u64 {
        self.page_mask2
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn ins(&self) -> u32 {
        self.ins
    }

    pub fn cycles(&self) -> i32 {
        self.cycles
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.next.is_some() || self.prev.is_some() || self.next_2.is_some() || self.prev_2.is_some()
    }

    /// Clears everything a compilation produces, keeping the slot identity.
    pub(crate) fn clear_content(&mut self) {
        let generation = self.generation;
        *self = Self {
            generation,
            ..Self::default()
        };
    }
}
