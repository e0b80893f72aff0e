use crate::chain::BlockRef;
use std::collections::VecDeque;

/// Bounded window of the most recently accepted canonical blocks, contiguous
/// by height. Large enough to locate any fork point within the max reorg depth.
#[derive(Debug, Clone)]
pub struct BlockWindow {
    blocks: VecDeque<BlockRef>,
    capacity: usize,
}

impl BlockWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Seed from persisted refs (any order). Keeps the highest contiguous run.
    pub fn seed(&mut self, mut refs: Vec<BlockRef>) {
        self.blocks.clear();
        refs.sort_by_key(|r| r.height);
        refs.dedup_by_key(|r| r.height);
        for r in refs {
            if let Some(tip) = self.blocks.back()
                && r.height != tip.height + 1
            {
                self.blocks.clear();
            }
            self.push(r);
        }
    }

    /// Append the next block. A non-contiguous height restarts the window.
    pub fn push(&mut self, block: BlockRef) {
        if let Some(tip) = self.blocks.back()
            && block.height != tip.height + 1
        {
            self.blocks.clear();
        }
        if self.blocks.len() == self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
    }

    pub fn tip(&self) -> Option<&BlockRef> {
        self.blocks.back()
    }

    pub fn lowest(&self) -> Option<u64> {
        self.blocks.front().map(|b| b.height)
    }

    pub fn hash_at(&self, height: u64) -> Option<&str> {
        let base = self.lowest()?;
        let index = height.checked_sub(base)? as usize;
        self.blocks.get(index).map(|b| b.hash.as_str())
    }

    pub fn contains(&self, block: &BlockRef) -> bool {
        self.hash_at(block.height) == Some(block.hash.as_str())
    }

    /// Drop everything above `height`
    pub fn truncate_above(&mut self, height: u64) {
        while self.blocks.back().is_some_and(|b| b.height > height) {
            self.blocks.pop_back();
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn refs(&self) -> Vec<BlockRef> {
        self.blocks.iter().cloned().collect()
    }
}
