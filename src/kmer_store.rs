use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::big_array::{check_block_bits, BlockArray, DEFAULT_BLOCK_BITS};
use crate::bloom::{BloomFilter, HashStrategy};
use crate::errors::{check_k, KmerError, Result};
use crate::persist;

const FILE_MAGIC: &[u8; 8] = b"TXMSTORE";
const INSERTION_SORT_THRESHOLD: usize = 16;

/// Per-entry counter value that hides an entry from lookups.
pub const EXCLUDED: u8 = u8::MAX;
/// Compact indices are `u16`.
pub const MAX_VALUES: usize = u16::MAX as usize + 1;

/// Append-only bijection between values and compact `u16` indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: Deserialize<'de>"))]
pub struct ValueTable<V> {
    values: Vec<V>,
    #[serde(skip)]
    index: HashMap<V, u16>,
}

impl<V: Clone + Eq + Hash> ValueTable<V> {
    pub fn new() -> Self {
        ValueTable {
            values: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn get_or_insert(&mut self, value: V) -> Result<u16> {
        if let Some(&index) = self.index.get(&value) {
            return Ok(index);
        }
        if self.values.len() >= MAX_VALUES {
            return Err(KmerError::ValueTableFull(self.values.len()));
        }
        let index = self.values.len() as u16;
        self.index.insert(value.clone(), index);
        self.values.push(value);
        Ok(index)
    }

    pub fn index_of(&self, value: &V) -> Option<u16> {
        self.index.get(value).copied()
    }

    pub fn value(&self, index: u16) -> Option<&V> {
        self.values.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.values.iter()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u16))
            .collect();
    }
}

impl<V: Clone + Eq + Hash> Default for ValueTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entries {
    kmers: BlockArray<u64>,
    indices: BlockArray<u16>,
    counters: Option<BlockArray<u8>>,
}

impl Entries {
    #[inline]
    fn key(&self, slot: usize) -> u64 {
        self.kmers.get(slot)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.kmers.swap(a, b);
        self.indices.swap(a, b);
        if let Some(counters) = self.counters.as_mut() {
            counters.swap(a, b);
        }
    }

    fn sort(&mut self, len: usize) {
        let mut stack = vec![(0usize, len)];
        while let Some((lo, hi)) = stack.pop() {
            if hi - lo <= INSERTION_SORT_THRESHOLD {
                self.insertion_sort(lo, hi);
                continue;
            }
            let p = self.partition(lo, hi);
            // smaller side first keeps the stack logarithmic
            if p - lo > hi - p - 1 {
                stack.push((lo, p));
                stack.push((p + 1, hi));
            } else {
                stack.push((p + 1, hi));
                stack.push((lo, p));
            }
        }
    }

    fn insertion_sort(&mut self, lo: usize, hi: usize) {
        for i in lo + 1..hi {
            let mut j = i;
            while j > lo && self.key(j - 1) > self.key(j) {
                self.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    fn partition(&mut self, lo: usize, hi: usize) -> usize {
        let last = hi - 1;
        let mid = lo + (hi - lo) / 2;
        if self.key(mid) < self.key(lo) {
            self.swap(mid, lo);
        }
        if self.key(last) < self.key(lo) {
            self.swap(last, lo);
        }
        if self.key(last) < self.key(mid) {
            self.swap(last, mid);
        }
        self.swap(mid, last);
        let pivot = self.key(last);
        let mut store = lo;
        for i in lo..last {
            if self.key(i) < pivot {
                self.swap(i, store);
                store += 1;
            }
        }
        self.swap(store, last);
        store
    }

    fn binary_search(&self, len: usize, key: u64) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let found = self.key(mid);
            if found < key {
                lo = mid + 1;
            } else if found > key {
                hi = mid;
            } else {
                return Some(mid);
            }
        }
        None
    }
}

/// Authoritative k-mer to value index.
///
/// Entries are appended in insertion order during the build and found by
/// linear scan until [`KmerStore::optimize`] sorts them. After that the
/// store is sealed and lookups use binary search. An internal Bloom filter
/// answers most negative lookups and doubles as the duplicate check on
/// insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmerStore<V> {
    k: usize,
    block_bits: u32,
    capacity: usize,
    len: usize,
    optimized: bool,
    filter: BloomFilter,
    values: ValueTable<V>,
    entries: Option<Entries>,
}

impl<V: Clone + Eq + Hash> KmerStore<V> {
    pub fn new(k: usize, fpp: f64) -> Result<Self> {
        check_k(k)?;
        Ok(KmerStore {
            k,
            block_bits: DEFAULT_BLOCK_BITS,
            capacity: 0,
            len: 0,
            optimized: false,
            filter: BloomFilter::empty(k, fpp, HashStrategy::TwoHash)?,
            values: ValueTable::new(),
            entries: None,
        })
    }

    /// Replaces the filter's hash strategy. Only valid before `init_size`.
    pub fn with_hash_strategy(mut self, strategy: HashStrategy) -> Result<Self> {
        if self.entries.is_some() {
            return Err(KmerError::AlreadyInitialized);
        }
        self.filter = BloomFilter::empty(self.k, self.filter.fpp(), strategy)?;
        self.filter.set_block_bits(self.block_bits)?;
        Ok(self)
    }

    /// Sets the block size (power of two) used for entry arrays and filter
    /// storage. Only valid before `init_size`.
    pub fn with_block_bits(mut self, block_bits: u32) -> Result<Self> {
        if self.entries.is_some() {
            return Err(KmerError::AlreadyInitialized);
        }
        self.filter.set_block_bits(block_bits)?;
        self.block_bits = block_bits;
        Ok(self)
    }

    /// One-time allocation for up to `capacity` entries.
    pub fn init_size(&mut self, capacity: usize) -> Result<()> {
        if self.entries.is_some() {
            return Err(KmerError::AlreadyInitialized);
        }
        if capacity == 0 {
            return Err(KmerError::InvalidInsertions);
        }
        self.filter.ensure_capacity(capacity as u64)?;
        self.entries = Some(Entries {
            kmers: BlockArray::with_block_bits(capacity, self.block_bits),
            indices: BlockArray::with_block_bits(capacity, self.block_bits),
            counters: None,
        });
        self.capacity = capacity;
        debug!(
            "k-mer store sized for {} entries in {} block(s)",
            capacity,
            capacity.div_ceil(1usize << self.block_bits)
        );
        Ok(())
    }

    /// Appends `key -> value`.
    ///
    /// Returns `Ok(false)` without storing anything when the filter already
    /// reports the key; such keys are treated as duplicates, including the
    /// rare filter false positive.
    pub fn put(&mut self, key: u64, value: V) -> Result<bool> {
        let entries = self.entries.as_mut().ok_or(KmerError::NotInitialized)?;
        if self.optimized {
            return Err(KmerError::Sealed);
        }
        if self.len >= self.capacity {
            return Err(KmerError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if self.filter.might_contain(key) {
            return Ok(false);
        }
        let index = self.values.get_or_insert(value)?;
        entries.kmers.set(self.len, key);
        entries.indices.set(self.len, index);
        self.len += 1;
        self.filter.insert(key)?;
        Ok(true)
    }

    /// Sorts the entries by key and seals the store. Idempotent.
    pub fn optimize(&mut self) -> Result<()> {
        let entries = self.entries.as_mut().ok_or(KmerError::NotInitialized)?;
        if self.optimized {
            return Ok(());
        }
        entries.sort(self.len);
        self.optimized = true;
        info!(
            "k-mer store optimized: {} entries, {} distinct values",
            self.len,
            self.values.len()
        );
        Ok(())
    }

    /// Slot of `key` by binary search, ignoring exclusion.
    pub fn binary_search(&self, key: u64) -> Result<Option<usize>> {
        if !self.optimized {
            return Err(KmerError::NotOptimized);
        }
        Ok(self
            .entries
            .as_ref()
            .and_then(|e| e.binary_search(self.len, key)))
    }

    fn find_slot(&self, key: u64) -> Option<usize> {
        let entries = self.entries.as_ref()?;
        if !self.filter.might_contain(key) {
            return None;
        }
        if self.optimized {
            entries.binary_search(self.len, key)
        } else {
            (0..self.len).find(|&slot| entries.key(slot) == key)
        }
    }

    /// Slot and compact value index of `key`, unless absent or excluded.
    #[inline]
    pub fn lookup(&self, key: u64) -> Option<(usize, u16)> {
        let slot = self.find_slot(key)?;
        if self.is_excluded(slot) {
            return None;
        }
        self.entries
            .as_ref()
            .map(|entries| (slot, entries.indices.get(slot)))
    }

    pub fn get_slot(&self, key: u64) -> Option<usize> {
        self.lookup(key).map(|(slot, _)| slot)
    }

    pub fn get_index(&self, key: u64) -> Option<u16> {
        self.lookup(key).map(|(_, index)| index)
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        self.get_index(key).and_then(|index| self.values.value(index))
    }

    /// Replaces the value of a stored key with `f(old)`. Returns whether the
    /// key was found. Requires an optimized store; `&mut self` keeps lookups
    /// from running while values change.
    pub fn update<F>(&mut self, key: u64, f: F) -> Result<bool>
    where
        F: FnOnce(&V) -> V,
    {
        let slot = match self.binary_search(key)? {
            Some(slot) => slot,
            None => return Ok(false),
        };
        let entries = self.entries.as_mut().ok_or(KmerError::NotInitialized)?;
        let old_index = entries.indices.get(slot);
        let old = self
            .values
            .value(old_index)
            .ok_or_else(|| KmerError::InvalidConfig(format!("dangling value index {}", old_index)))?;
        let new = f(old);
        if &new != old {
            let index = self.values.get_or_insert(new)?;
            entries.indices.set(slot, index);
        }
        Ok(true)
    }

    /// Visits every entry in storage order as `(key, value index, slot)`.
    pub fn visit<F>(&self, mut visitor: F)
    where
        F: FnMut(u64, u16, usize),
    {
        if let Some(entries) = self.entries.as_ref() {
            for slot in 0..self.len {
                visitor(entries.kmers.get(slot), entries.indices.get(slot), slot);
            }
        }
    }

    pub fn enable_counters(&mut self) -> Result<()> {
        let entries = self.entries.as_mut().ok_or(KmerError::NotInitialized)?;
        if entries.counters.is_none() {
            entries.counters = Some(BlockArray::with_block_bits(self.capacity, self.block_bits));
        }
        Ok(())
    }

    pub fn has_counters(&self) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.counters.is_some())
    }

    /// Saturates one below the exclusion sentinel; excluded entries stay
    /// excluded.
    pub fn increment_counter(&mut self, slot: usize) -> Result<()> {
        self.enable_counters()?;
        if let Some(counters) = self.entries.as_mut().and_then(|e| e.counters.as_mut()) {
            counters.update(slot, |c| if c >= EXCLUDED - 1 { c } else { c + 1 });
        }
        Ok(())
    }

    pub fn counter(&self, slot: usize) -> u8 {
        self.entries
            .as_ref()
            .and_then(|e| e.counters.as_ref())
            .map_or(0, |counters| counters.get(slot))
    }

    pub fn exclude(&mut self, slot: usize) -> Result<()> {
        self.enable_counters()?;
        if let Some(counters) = self.entries.as_mut().and_then(|e| e.counters.as_mut()) {
            counters.set(slot, EXCLUDED);
        }
        Ok(())
    }

    #[inline]
    pub fn is_excluded(&self, slot: usize) -> bool {
        self.counter(slot) == EXCLUDED
    }

    /// Excludes every entry whose counter stayed below `min_count`.
    /// Returns the number of newly excluded entries.
    pub fn exclude_below(&mut self, min_count: u8) -> Result<usize> {
        self.enable_counters()?;
        let len = self.len;
        let mut excluded = 0;
        if let Some(counters) = self.entries.as_mut().and_then(|e| e.counters.as_mut()) {
            for slot in 0..len {
                let c = counters.get(slot);
                if c != EXCLUDED && c < min_count {
                    counters.set(slot, EXCLUDED);
                    excluded += 1;
                }
            }
        }
        info!("excluded {} of {} k-mers", excluded, len);
        Ok(excluded)
    }

    /// Number of entries per compact value index.
    pub fn value_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.values.len()];
        self.visit(|_, index, _| counts[index as usize] += 1);
        counts
    }

    pub fn value(&self, index: u16) -> Option<&V> {
        self.values.value(index)
    }

    pub fn index_of(&self, value: &V) -> Option<u16> {
        self.values.index_of(value)
    }

    pub fn values(&self) -> &ValueTable<V> {
        &self.values
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    pub fn k(&self) -> usize {
        self.k
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

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn is_initialized(&self) -> bool {
        self.entries.is_some()
    }
}

impl<V: Clone + Eq + Hash + Serialize + DeserializeOwned> KmerStore<V> {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::save_blob(path.as_ref(), FILE_MAGIC, self.k, self)
    }

    pub fn load<P: AsRef<Path>>(path: P, expected_k: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut store: KmerStore<V> = persist::load_blob(path, FILE_MAGIC, expected_k)?;
        if store.k != expected_k || store.filter.k() != expected_k {
            return Err(KmerError::format(path, "header and body disagree on k"));
        }
        store.values.rebuild_index();
        store
            .check_consistency()
            .map_err(|detail| KmerError::format(path, detail))?;
        Ok(store)
    }

    /// Invariants a deserialized store must satisfy before any lookup.
    fn check_consistency(&self) -> std::result::Result<(), String> {
        check_block_bits(self.block_bits).map_err(|e| e.to_string())?;
        self.filter.check_consistency()?;
        if self.len > self.capacity {
            return Err("entry count exceeds capacity".to_string());
        }
        if self.values.len() > MAX_VALUES || self.values.index.len() != self.values.len() {
            return Err("value table holds duplicate or too many values".to_string());
        }
        let Some(entries) = &self.entries else {
            if self.len > 0 || self.capacity > 0 || self.optimized {
                return Err("entries missing from an initialized store".to_string());
            }
            return Ok(());
        };
        if !self.filter.is_sized() {
            return Err("initialized store without a sized filter".to_string());
        }
        let arrays_fit = entries.kmers.len() == self.capacity
            && entries.indices.len() == self.capacity
            && entries.kmers.has_valid_layout()
            && entries.indices.has_valid_layout();
        let counters_fit = entries
            .counters
            .as_ref()
            .map_or(true, |c| c.len() == self.capacity && c.has_valid_layout());
        if !arrays_fit || !counters_fit {
            return Err(format!("entry arrays do not hold {} slots", self.capacity));
        }
        let mask = crate::cgat::kmer_mask(self.k);
        for slot in 0..self.len {
            if entries.key(slot) & !mask != 0 {
                return Err(format!("slot {} holds a key wider than k", slot));
            }
            if entries.indices.get(slot) as usize >= self.values.len() {
                return Err(format!("slot {} refers to an unknown value", slot));
            }
            if self.optimized && slot > 0 && entries.key(slot - 1) >= entries.key(slot) {
                return Err(format!("sorted entries out of order at slot {}", slot));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgat::encode_straight;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn key(s: &str) -> u64 {
        encode_straight(s.as_bytes(), 0, s.len()).unwrap()
    }

    fn random_store(n: usize, block_bits: u32) -> (KmerStore<String>, HashMap<u64, String>) {
        let mut rng = StdRng::seed_from_u64(42);
        let mut store = KmerStore::new(31, 1e-6)
            .unwrap()
            .with_block_bits(block_bits)
            .unwrap();
        store.init_size(n).unwrap();
        let mut expected = HashMap::new();
        while expected.len() < n {
            let k = rng.random::<u64>() & crate::cgat::kmer_mask(31);
            let v = format!("taxon{}", rng.random_range(0..20));
            if !expected.contains_key(&k) && store.put(k, v.clone()).unwrap() {
                expected.insert(k, v);
            }
        }
        (store, expected)
    }

    #[test]
    fn test_value_table() {
        let mut table = ValueTable::new();
        assert_eq!(table.get_or_insert("a".to_string()).unwrap(), 0);
        assert_eq!(table.get_or_insert("b".to_string()).unwrap(), 1);
        assert_eq!(table.get_or_insert("a".to_string()).unwrap(), 0);
        assert_eq!(table.value(1).map(String::as_str), Some("b"));
        assert_eq!(table.index_of(&"b".to_string()), Some(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_value_table_full() {
        let mut table = ValueTable::new();
        for i in 0..MAX_VALUES as u32 {
            table.get_or_insert(i).unwrap();
        }
        assert!(matches!(
            table.get_or_insert(MAX_VALUES as u32),
            Err(KmerError::ValueTableFull(_))
        ));
        assert_eq!(table.get_or_insert(7).unwrap(), 7);
    }

    #[test]
    fn test_put_get_unsorted_and_sorted() {
        let mut store = KmerStore::new(4, 0.001).unwrap();
        store.init_size(10).unwrap();
        assert!(store.put(key("CGAT"), "T1".to_string()).unwrap());
        assert!(store.put(key("AAAA"), "T2".to_string()).unwrap());
        assert!(!store.put(key("CGAT"), "T3".to_string()).unwrap());
        assert_eq!(store.len(), 2);

        assert_eq!(store.get(key("CGAT")).map(String::as_str), Some("T1"));
        assert_eq!(store.get(key("CCCC")), None);

        store.optimize().unwrap();
        assert_eq!(store.get(key("CGAT")).map(String::as_str), Some("T1"));
        assert_eq!(store.get(key("AAAA")).map(String::as_str), Some("T2"));
        assert_eq!(store.get(key("CCCC")), None);
    }

    #[test]
    fn test_preconditions() {
        let mut store: KmerStore<String> = KmerStore::new(4, 0.01).unwrap();
        assert!(matches!(
            store.put(1, "x".to_string()),
            Err(KmerError::NotInitialized)
        ));
        store.init_size(2).unwrap();
        assert!(matches!(store.init_size(2), Err(KmerError::AlreadyInitialized)));
        assert!(matches!(store.binary_search(1), Err(KmerError::NotOptimized)));
        assert!(matches!(
            store.update(1, |v| v.clone()),
            Err(KmerError::NotOptimized)
        ));
        store.put(1, "x".to_string()).unwrap();
        store.optimize().unwrap();
        assert!(matches!(
            store.put(2, "y".to_string()),
            Err(KmerError::Sealed)
        ));
        assert!(matches!(KmerStore::<String>::new(0, 0.01), Err(KmerError::InvalidK(0))));
        assert!(matches!(KmerStore::<String>::new(4, 1.5), Err(KmerError::InvalidFpp(_))));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut store = KmerStore::new(31, 1e-9).unwrap();
        store.init_size(100).unwrap();
        for key in 0..100u64 {
            assert!(store.put(key * 7919, "T".to_string()).unwrap());
        }
        assert!(matches!(
            store.put(1_000_003, "T".to_string()),
            Err(KmerError::CapacityExceeded { capacity: 100 })
        ));
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_sort_across_blocks() {
        let (mut store, expected) = random_store(3000, 6);
        store.optimize().unwrap();
        let mut last = None;
        store.visit(|k, _, _| {
            if let Some(prev) = last {
                assert!(prev < k);
            }
            last = Some(k);
        });
        for (k, v) in &expected {
            assert_eq!(store.get(*k), Some(v));
        }
    }

    #[test]
    fn test_optimize_idempotent() {
        let (mut store, _) = random_store(500, 27);
        store.optimize().unwrap();
        let mut first = Vec::new();
        store.visit(|k, v, s| first.push((k, v, s)));
        store.optimize().unwrap();
        let mut second = Vec::new();
        store.visit(|k, v, s| second.push((k, v, s)));
        assert_eq!(first, second);
    }

    #[test]
    fn test_update_promotes_value() {
        let mut store = KmerStore::new(4, 0.001).unwrap();
        store.init_size(4).unwrap();
        store.put(key("CGAT"), "T2".to_string()).unwrap();
        store.put(key("GGGG"), "T3".to_string()).unwrap();
        store.optimize().unwrap();
        assert!(store.update(key("CGAT"), |_| "T1".to_string()).unwrap());
        assert!(!store.update(key("TTTT"), |_| "T1".to_string()).unwrap());
        assert_eq!(store.get(key("CGAT")).map(String::as_str), Some("T1"));
        assert_eq!(store.get(key("GGGG")).map(String::as_str), Some("T3"));
        assert_eq!(store.values().len(), 3);
        assert_eq!(store.value_counts(), vec![0, 1, 1]);
    }

    #[test]
    fn test_counters_and_exclusion() {
        let mut store = KmerStore::new(4, 0.001).unwrap();
        store.init_size(4).unwrap();
        store.put(key("CGAT"), "T1".to_string()).unwrap();
        store.put(key("GGGG"), "T1".to_string()).unwrap();
        store.put(key("ACGT"), "T2".to_string()).unwrap();
        store.enable_counters().unwrap();
        store.optimize().unwrap();

        let slot = store.get_slot(key("CGAT")).unwrap();
        store.increment_counter(slot).unwrap();
        store.increment_counter(slot).unwrap();
        assert_eq!(store.counter(slot), 2);

        let acgt = store.get_slot(key("ACGT")).unwrap();
        store.exclude(acgt).unwrap();
        assert_eq!(store.get(key("ACGT")), None);
        assert_eq!(store.binary_search(key("ACGT")).unwrap(), Some(acgt));

        assert_eq!(store.exclude_below(1).unwrap(), 1);
        assert_eq!(store.get(key("GGGG")), None);
        assert_eq!(store.get(key("CGAT")).map(String::as_str), Some("T1"));
    }

    #[test]
    fn test_counter_saturates() {
        let mut store = KmerStore::new(4, 0.001).unwrap();
        store.init_size(1).unwrap();
        store.put(key("CGAT"), 1u32).unwrap();
        for _ in 0..400 {
            store.increment_counter(0).unwrap();
        }
        assert_eq!(store.counter(0), EXCLUDED - 1);
        assert_eq!(store.get(key("CGAT")), Some(&1));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.store");
        let (mut store, expected) = random_store(1000, 5);
        store.optimize().unwrap();
        store.save(&path).unwrap();

        let loaded: KmerStore<String> = KmerStore::load(&path, 31).unwrap();
        assert!(loaded.is_optimized());
        assert_eq!(loaded.len(), 1000);
        for (k, v) in &expected {
            assert_eq!(loaded.get(*k), Some(v));
        }
        assert_eq!(
            loaded.index_of(&"taxon3".to_string()),
            store.index_of(&"taxon3".to_string())
        );
        assert!(matches!(
            KmerStore::<String>::load(&path, 21),
            Err(KmerError::KMismatch { .. })
        ));
    }

    fn reload(store: &KmerStore<String>) -> Result<KmerStore<String>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.store");
        store.save(&path).unwrap();
        KmerStore::load(&path, 31)
    }

    #[test]
    fn test_load_rejects_damaged_body() {
        let (mut store, _) = random_store(100, 4);
        store.optimize().unwrap();
        assert!(reload(&store).is_ok());

        let mut bad_index = store.clone();
        bad_index.entries.as_mut().unwrap().indices.set(7, 99);
        assert!(matches!(reload(&bad_index), Err(KmerError::Format { .. })));

        let mut short_arrays = store.clone();
        short_arrays.entries.as_mut().unwrap().kmers = BlockArray::with_block_bits(10, 4);
        assert!(matches!(reload(&short_arrays), Err(KmerError::Format { .. })));

        let mut unsorted = store.clone();
        unsorted.entries.as_mut().unwrap().swap(0, 1);
        assert!(matches!(reload(&unsorted), Err(KmerError::Format { .. })));

        let mut oversized = store;
        oversized.len = oversized.capacity + 1;
        assert!(matches!(reload(&oversized), Err(KmerError::Format { .. })));
    }

    #[test]
    fn test_block_bits_out_of_range() {
        for bits in [0, 48] {
            assert!(matches!(
                KmerStore::<String>::new(21, 0.01).unwrap().with_block_bits(bits),
                Err(KmerError::InvalidConfig(_))
            ));
        }
    }
}
