use serde::{Deserialize, Serialize};

use crate::errors::{KmerError, Result};

/// Default block size: 2^27 elements per block.
pub const DEFAULT_BLOCK_BITS: u32 = 27;
const MAX_BLOCK_BITS: u32 = 47;

pub fn check_block_bits(block_bits: u32) -> Result<()> {
    if block_bits == 0 || block_bits > MAX_BLOCK_BITS {
        return Err(KmerError::InvalidConfig(format!(
            "block bits must be in 1..={}, got {}",
            MAX_BLOCK_BITS, block_bits
        )));
    }
    Ok(())
}

/// Fixed-length array split into equally sized blocks.
///
/// Element `i` lives at `blocks[i >> block_bits][i & block_mask]`. Blocks are
/// allocated up front by the constructor; the array never reallocates a
/// block, so very large indexes don't need one contiguous allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockArray<T> {
    blocks: Vec<Vec<T>>,
    block_bits: u32,
    len: usize,
}

impl<T: Copy + Default> BlockArray<T> {
    pub fn new(len: usize) -> Self {
        Self::with_block_bits(len, DEFAULT_BLOCK_BITS)
    }

    pub fn with_block_bits(len: usize, block_bits: u32) -> Self {
        assert!(
            block_bits > 0 && block_bits <= MAX_BLOCK_BITS,
            "block bits out of range"
        );
        let block_len = 1usize << block_bits;
        let mut blocks = Vec::with_capacity(len.div_ceil(block_len));
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(block_len);
            blocks.push(vec![T::default(); n]);
            remaining -= n;
        }
        BlockArray {
            blocks,
            block_bits,
            len,
        }
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.len, "index {} out of bounds {}", index, self.len);
        (index >> self.block_bits, index & ((1usize << self.block_bits) - 1))
    }

    #[inline]
    pub fn get(&self, index: usize) -> T {
        let (block, offset) = self.locate(index);
        self.blocks[block][offset]
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: T) {
        let (block, offset) = self.locate(index);
        self.blocks[block][offset] = value;
    }

    #[inline]
    pub fn update(&mut self, index: usize, f: impl FnOnce(T) -> T) {
        let (block, offset) = self.locate(index);
        let cell = &mut self.blocks[block][offset];
        *cell = f(*cell);
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        let va = self.get(a);
        let vb = self.get(b);
        self.set(a, vb);
        self.set(b, va);
    }

    pub fn fill(&mut self, value: T) {
        for block in &mut self.blocks {
            block.fill(value);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_bits(&self) -> u32 {
        self.block_bits
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.blocks.iter().flat_map(|b| b.iter().copied())
    }

    /// Whether the blocks agree with `len` and `block_bits`: every block but
    /// the last is full and the element counts add up. Deserialized arrays
    /// must pass this before use.
    pub fn has_valid_layout(&self) -> bool {
        if check_block_bits(self.block_bits).is_err() {
            return false;
        }
        let block_len = 1usize << self.block_bits;
        if self.blocks.len() != self.len.div_ceil(block_len) {
            return false;
        }
        let mut remaining = self.len;
        self.blocks.iter().all(|block| {
            let expected = remaining.min(block_len);
            remaining -= expected;
            block.len() == expected
        })
    }
}
