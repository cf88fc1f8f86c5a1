//! Bounded history of invalidated blocks.
//!
//! Blocks hit by self-modifying code are parked here instead of being freed,
//! so that a translation request for the same address can reuse the slot and
//! so that the oldest victims are the first to be recycled.

use crate::arena::BlockArena;
use crate::block::{BlockIndex, BlockState};

pub const DEFAULT_CAPACITY: usize = 64;

pub struct DirtyList {
    head: Option<BlockIndex>,
    tail: Option<BlockIndex>,
    len: usize,
    capacity: usize,
}

impl DirtyList {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "dirty list needs room for one block");
        Self {
            head: None,
            tail: None,
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head(&self) -> Option<BlockIndex> {
        self.head
    }

    pub fn tail(&self) -> Option<BlockIndex> {
        self.tail
    }

    pub fn clear(&mut self) {
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Newest to oldest.
    pub fn iter<'a>(&self, arena: &'a BlockArena) -> impl Iterator<Item = BlockIndex> + 'a {
        std::iter::successors(self.head, |&index| arena.get(index).next)
    }

    /// Parks a block at the head. When the list overflows, the oldest entry is
    /// unlinked and returned; the caller owns releasing it.
    pub fn push(&mut self, arena: &mut BlockArena, index: BlockIndex) -> Option<BlockIndex> {
        let block = arena.get_mut(index);
        debug_assert_ne!(
            block.state,
            BlockState::Dirty,
            "block {index} already in dirty list"
        );

        block.state = BlockState::Dirty;
        block.prev = None;
        block.next = self.head;

        match self.head {
            Some(old_head) => arena.get_mut(old_head).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;

        if self.len > self.capacity {
            self.pop_tail(arena)
        } else {
            None
        }
    }

    /// Unlinks the oldest entry.
    pub fn pop_tail(&mut self, arena: &mut BlockArena) -> Option<BlockIndex> {
        let index = self.tail?;
        self.remove(arena, index);
        Some(index)
    }

    pub fn remove(&mut self, arena: &mut BlockArena, index: BlockIndex) {
        let block = arena.get_mut(index);
        debug_assert_eq!(
            block.state,
            BlockState::Dirty,
            "block {index} not in dirty list"
        );
        debug_assert!(self.len > 0, "remove from empty dirty list");

        let prev = block.prev.take();
        let next = block.next.take();
        // the caller decides the next state; leaving `Open` keeps the block
        // out of every list until it does
        block.state = BlockState::Open;

        match prev {
            Some(prev) => arena.get_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena.get_mut(next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}
