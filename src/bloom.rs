use std::f64::consts::LN_2;
use std::path::Path;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::big_array::{check_block_bits, BlockArray, DEFAULT_BLOCK_BITS};
use crate::cgat::reverse_complement_key;
use crate::errors::{check_k, KmerError, Result};
use crate::persist;
use crate::utilities::{murmur_hash3, parity_halves};

const FILE_MAGIC: &[u8; 8] = b"TXMBLOOM";
const FACTOR_SEED: u64 = 0x5eed_cafe_f00d_0001;

/// How the per-factor bit positions are derived from a k-mer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashStrategy {
    /// Hash the packed key once per factor.
    Direct,
    /// Hash the even-position bases of the key and the odd-position bases of
    /// its reverse complement separately, then combine the two sub-hashes per
    /// factor.
    TwoHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum BitStorage {
    Flat(Vec<u64>),
    Blocked(BlockArray<u64>),
}

impl BitStorage {
    fn allocate(words: usize, block_bits: u32) -> Self {
        if words > 1usize << block_bits {
            BitStorage::Blocked(BlockArray::with_block_bits(words, block_bits))
        } else {
            BitStorage::Flat(vec![0; words])
        }
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        match self {
            BitStorage::Flat(words) => words[index],
            BitStorage::Blocked(words) => words.get(index),
        }
    }

    #[inline]
    fn set_bit(&mut self, bit: u64) {
        let index = (bit >> 6) as usize;
        let mask = 1u64 << (bit & 63);
        match self {
            BitStorage::Flat(words) => words[index] |= mask,
            BitStorage::Blocked(words) => words.update(index, |w| w | mask),
        }
    }

    #[inline]
    fn get_bit(&self, bit: u64) -> bool {
        self.word((bit >> 6) as usize) & (1u64 << (bit & 63)) != 0
    }

    fn clear(&mut self) {
        match self {
            BitStorage::Flat(words) => words.fill(0),
            BitStorage::Blocked(words) => words.fill(0),
        }
    }

    fn ones(&self) -> u64 {
        match self {
            BitStorage::Flat(words) => words.iter().map(|w| w.count_ones() as u64).sum(),
            BitStorage::Blocked(words) => words.iter().map(|w| w.count_ones() as u64).sum(),
        }
    }
}

/// Probabilistic set of encoded k-mers.
///
/// Sized from an expected insertion count and a target false positive
/// probability. Inserting more keys than declared only raises the false
/// positive rate. There is no removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    k: usize,
    fpp: f64,
    strategy: HashStrategy,
    block_bits: u32,
    expected_insertions: u64,
    bit_count: u64,
    factors: Vec<u64>,
    storage: Option<BitStorage>,
}

impl BloomFilter {
    pub fn new(
        k: usize,
        expected_insertions: u64,
        fpp: f64,
        strategy: HashStrategy,
    ) -> Result<Self> {
        let mut filter = Self::empty(k, fpp, strategy)?;
        filter.ensure_capacity(expected_insertions)?;
        Ok(filter)
    }

    /// A filter without storage. It must be sized with `ensure_capacity`
    /// before the first insert.
    pub fn empty(k: usize, fpp: f64, strategy: HashStrategy) -> Result<Self> {
        check_k(k)?;
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(KmerError::InvalidFpp(fpp));
        }
        Ok(BloomFilter {
            k,
            fpp,
            strategy,
            block_bits: DEFAULT_BLOCK_BITS,
            expected_insertions: 0,
            bit_count: 0,
            factors: Vec::new(),
            storage: None,
        })
    }

    /// Sets the number of 64-bit words per storage block (as a power of two).
    /// Storage needing more words than one block switches to blocked mode.
    /// Existing bits are discarded.
    pub fn with_block_bits(mut self, block_bits: u32) -> Result<Self> {
        self.set_block_bits(block_bits)?;
        Ok(self)
    }

    pub fn set_block_bits(&mut self, block_bits: u32) -> Result<()> {
        check_block_bits(block_bits)?;
        self.block_bits = block_bits;
        if self.storage.is_some() {
            self.storage = Some(BitStorage::allocate(self.word_count(), block_bits));
        }
        Ok(())
    }

    pub fn optimal_bit_count(expected_insertions: u64, fpp: f64) -> u64 {
        let bits = -(expected_insertions as f64) * fpp.ln() / (LN_2 * LN_2);
        (bits.ceil() as u64).max(64)
    }

    pub fn optimal_hash_count(expected_insertions: u64, bit_count: u64) -> usize {
        let hashes = (bit_count as f64 / expected_insertions as f64 * LN_2).round() as usize;
        hashes.max(1)
    }

    /// Grows the filter to hold `expected_insertions` keys at the configured
    /// false positive probability. A request that fits the current size
    /// keeps all bits; a larger one re-sizes and clears the filter.
    pub fn ensure_capacity(&mut self, expected_insertions: u64) -> Result<()> {
        if expected_insertions == 0 {
            return Err(KmerError::InvalidInsertions);
        }
        let bit_count = Self::optimal_bit_count(expected_insertions, self.fpp);
        if self.storage.is_some() && bit_count <= self.bit_count {
            return Ok(());
        }
        let hash_count = Self::optimal_hash_count(expected_insertions, bit_count);
        let mut rng = StdRng::seed_from_u64(FACTOR_SEED);
        self.factors = (0..hash_count).map(|_| rng.random::<u64>()).collect();
        self.bit_count = bit_count;
        self.expected_insertions = expected_insertions;
        self.storage = Some(BitStorage::allocate(self.word_count(), self.block_bits));
        debug!(
            "bloom filter sized: {} bits, {} hashes, large={}",
            bit_count,
            hash_count,
            self.is_large()
        );
        Ok(())
    }

    fn word_count(&self) -> usize {
        self.bit_count.div_ceil(64) as usize
    }

    pub fn insert(&mut self, key: u64) -> Result<()> {
        let storage = self.storage.as_mut().ok_or(KmerError::NotSized)?;
        for bit in bit_positions(&self.factors, self.strategy, self.k, self.bit_count, key) {
            storage.set_bit(bit);
        }
        Ok(())
    }

    /// `false` is definitive; `true` is subject to the false positive rate.
    #[inline]
    pub fn might_contain(&self, key: u64) -> bool {
        match &self.storage {
            Some(storage) => {
                bit_positions(&self.factors, self.strategy, self.k, self.bit_count, key)
                    .all(|bit| storage.get_bit(bit))
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        if let Some(storage) = self.storage.as_mut() {
            storage.clear();
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn fpp(&self) -> f64 {
        self.fpp
    }

    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn expected_insertions(&self) -> u64 {
        self.expected_insertions
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> usize {
        self.factors.len()
    }

    pub fn is_sized(&self) -> bool {
        self.storage.is_some()
    }

    pub fn is_large(&self) -> bool {
        matches!(self.storage, Some(BitStorage::Blocked(_)))
    }

    /// Fraction of set bits.
    pub fn fill_ratio(&self) -> f64 {
        match &self.storage {
            Some(storage) if self.bit_count > 0 => storage.ones() as f64 / self.bit_count as f64,
            _ => 0.0,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::save_blob(path.as_ref(), FILE_MAGIC, self.k, self)
    }

    pub fn load<P: AsRef<Path>>(path: P, expected_k: usize) -> Result<Self> {
        let path = path.as_ref();
        let filter: BloomFilter = persist::load_blob(path, FILE_MAGIC, expected_k)?;
        if filter.k != expected_k {
            return Err(KmerError::format(path, "header and body disagree on k"));
        }
        filter
            .check_consistency()
            .map_err(|detail| KmerError::format(path, detail))?;
        Ok(filter)
    }

    /// Invariants a deserialized filter must satisfy before any lookup.
    pub(crate) fn check_consistency(&self) -> std::result::Result<(), String> {
        check_k(self.k).map_err(|e| e.to_string())?;
        if !(self.fpp > 0.0 && self.fpp < 1.0) {
            return Err(format!("false positive probability {} out of range", self.fpp));
        }
        check_block_bits(self.block_bits).map_err(|e| e.to_string())?;
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if self.bit_count == 0 || self.factors.is_empty() {
            return Err("sized filter without bits or hash factors".to_string());
        }
        let words = match storage {
            BitStorage::Flat(words) => words.len(),
            BitStorage::Blocked(words) => {
                if !words.has_valid_layout() {
                    return Err("bit storage blocks are inconsistent".to_string());
                }
                words.len()
            }
        };
        if words != self.word_count() {
            return Err(format!(
                "bit storage holds {} words, {} bits need {}",
                words,
                self.bit_count,
                self.word_count()
            ));
        }
        Ok(())
    }
}

#[inline]
fn two_hash_halves(key: u64, k: usize) -> (u64, u64) {
    let (even, _) = parity_halves(key, k);
    let (_, odd) = parity_halves(reverse_complement_key(key, k), k);
    (even, odd)
}

#[inline]
fn bit_positions(
    factors: &[u64],
    strategy: HashStrategy,
    k: usize,
    bit_count: u64,
    key: u64,
) -> impl Iterator<Item = u64> + '_ {
    let halves = match strategy {
        HashStrategy::Direct => None,
        HashStrategy::TwoHash => Some(two_hash_halves(key, k)),
    };
    factors.iter().map(move |&factor| {
        let hash = match halves {
            None => murmur_hash3(key ^ factor),
            Some((even, odd)) => {
                let h1 = murmur_hash3(even ^ factor);
                let h2 = murmur_hash3(odd.wrapping_add(factor));
                h1 ^ h2.rotate_left(29)
            }
        };
        hash % bit_count
    })
}
