use crate::block::{Block, BlockHandle, BlockIndex, BlockState};

/// Fixed pool of block records plus the free list threaded through them.
pub struct BlockArena {
    blocks: Vec<Block>,
    free_head: Option<BlockIndex>,
    free_len: usize,
}

impl BlockArena {
    pub fn new(size: usize) -> Self {
        assert!(
            size > 0 && size <= BlockIndex::MAX as usize + 1,
            "arena size {size} out of range"
        );

        let mut arena = Self {
            blocks: (0..size).map(|_| Block::default()).collect(),
            free_head: None,
            free_len: 0,
        };

        // pushed in reverse so that slot 0 is handed out first
        for index in (0..size).rev() {
            arena.push_free(index as BlockIndex);
        }
        arena
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn free_len(&self) -> usize {
        self.free_len
    }

    pub fn get(&self, index: BlockIndex) -> &Block {
        &self.blocks[index as usize]
    }

    pub fn get_mut(&mut self, index: BlockIndex) -> &mut Block {
        &mut self.blocks[index as usize]
    }

    pub fn handle(&self, index: BlockIndex) -> BlockHandle {
        BlockHandle::new(index, self.get(index).generation)
    }

    /// Resolves a handle, failing for free slots and stale generations.
    pub fn resolve(&self, handle: BlockHandle) -> Option<&Block> {
        let block = self.blocks.get(handle.index() as usize)?;
        (block.generation == handle.generation() && block.state != BlockState::Free)
            .then_some(block)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockIndex, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (index as BlockIndex, block))
    }

    pub fn free_list(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        std::iter::successors(self.free_head, |&index| self.get(index).next)
    }

    /// Pops the most recently freed slot.
    pub fn pop_free(&mut self) -> Option<BlockIndex> {
        let index = self.free_head?;
        let block = &mut self.blocks[index as usize];
        debug_assert_eq!(block.state, BlockState::Free);

        self.free_head = block.next.take();
        self.free_len -= 1;
        Some(index)
    }

    /// Returns a slot to the free list. The slot must already be unlinked
    /// from every other list and own no code chunk.
    pub fn release(&mut self, index: BlockIndex) {
        let block = &mut self.blocks[index as usize];

        debug_assert_ne!(block.state, BlockState::Free, "block {index} freed twice");
        debug_assert!(!block.is_linked(), "block {index} freed while linked");
        debug_assert!(block.chunk.is_none(), "block {index} freed with code");

        block.generation = block.generation.wrapping_add(1);
        block.clear_content();
        self.push_free(index);
    }

    fn push_free(&mut self, index: BlockIndex) {
        let block = &mut self.blocks[index as usize];
        block.state = BlockState::Free;
        block.next = self.free_head;
        self.free_head = Some(index);
        self.free_len += 1;
    }
}
