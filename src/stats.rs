use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

/// Counters gathered for one taxon during a classification run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaxonStats {
    pub reads: u64,
    pub kmers: u64,
    /// Approximation: counts store slots hit for the first time in the run.
    pub unique_kmers: u64,
    pub contigs: u64,
    pub max_contig_len: u32,
    pub max_contig_descriptor: Option<Vec<u8>>,
}

impl TaxonStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_contig(&mut self, len: u32, descriptor: &[u8]) {
        self.contigs += 1;
        self.offer_longest(len, descriptor);
    }

    /// Keeps the longest contig; equal lengths keep the smaller descriptor so
    /// the result does not depend on the order reads were merged in.
    fn offer_longest(&mut self, len: u32, descriptor: &[u8]) {
        let replace = len > self.max_contig_len
            || (len > 0
                && len == self.max_contig_len
                && self
                    .max_contig_descriptor
                    .as_deref()
                    .map_or(true, |current| descriptor < current));
        if replace {
            self.max_contig_len = len;
            self.max_contig_descriptor = Some(descriptor.to_vec());
        }
    }
}

impl AddAssign<&TaxonStats> for TaxonStats {
    fn add_assign(&mut self, other: &TaxonStats) {
        self.reads += other.reads;
        self.kmers += other.kmers;
        self.unique_kmers += other.unique_kmers;
        self.contigs += other.contigs;
        if let Some(descriptor) = &other.max_contig_descriptor {
            self.offer_longest(other.max_contig_len, descriptor);
        }
    }
}

/// Contributions of a single read to one taxon, folded into the shared
/// table once the read is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaxonDelta {
    pub kmers: u64,
    pub unique_kmers: u64,
    pub contigs: u64,
    pub max_contig_len: u32,
}

impl TaxonDelta {
    pub fn apply(&self, stats: &mut TaxonStats, descriptor: &[u8]) {
        stats.reads += 1;
        stats.kmers += self.kmers;
        stats.unique_kmers += self.unique_kmers;
        stats.contigs += self.contigs;
        stats.offer_longest(self.max_contig_len, descriptor);
    }
}

/// Lazily populated per-taxon statistics shared by all workers of a run.
#[derive(Debug, Default)]
pub struct StatsTable {
    table: RwLock<HashMap<u16, Arc<Mutex<TaxonStats>>>>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `index`, created on first use.
    pub fn entry(&self, index: u16) -> Arc<Mutex<TaxonStats>> {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stats) = table.get(&index) {
                return Arc::clone(stats);
            }
        }
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(index).or_default())
    }

    pub fn apply(&self, index: u16, delta: &TaxonDelta, descriptor: &[u8]) {
        let entry = self.entry(index);
        let mut stats = entry.lock().unwrap_or_else(PoisonError::into_inner);
        delta.apply(&mut stats, descriptor);
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the table out, ordered by value index.
    pub fn snapshot(&self) -> Vec<(u16, TaxonStats)> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(u16, TaxonStats)> = table
            .iter()
            .map(|(&index, stats)| {
                let stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                (index, stats.clone())
            })
            .collect();
        out.sort_by_key(|(index, _)| *index);
        out
    }
}

/// Fixed-size bit vector with lock-free test-and-set, indexed by store slot.
#[derive(Debug)]
pub struct SlotBits {
    words: Vec<AtomicU64>,
    len: usize,
}

impl SlotBits {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        SlotBits { words, len }
    }

    /// Sets bit `index`, returning true if this call flipped it.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        let previous = self.words[index / 64].fetch_or(mask, Ordering::Relaxed);
        previous & mask == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        self.words[index / 64].load(Ordering::Relaxed) & mask != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            let mut bits = word.load(Ordering::Relaxed);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(w * 64 + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_delta_apply() {
        let mut stats = TaxonStats::new();
        let delta = TaxonDelta {
            kmers: 5,
            unique_kmers: 3,
            contigs: 2,
            max_contig_len: 4,
        };
        delta.apply(&mut stats, b"read2");
        delta.apply(&mut stats, b"read1");
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.kmers, 10);
        assert_eq!(stats.unique_kmers, 6);
        assert_eq!(stats.contigs, 4);
        assert_eq!(stats.max_contig_len, 4);
        // ties keep the smaller descriptor
        assert_eq!(stats.max_contig_descriptor.as_deref(), Some(&b"read1"[..]));
    }

    #[test]
    fn test_merge() {
        let mut a = TaxonStats::new();
        a.record_contig(3, b"x");
        let mut b = TaxonStats::new();
        b.reads = 2;
        b.record_contig(7, b"y");
        a += &b;
        assert_eq!(a.contigs, 2);
        assert_eq!(a.reads, 2);
        assert_eq!(a.max_contig_len, 7);
        assert_eq!(a.max_contig_descriptor.as_deref(), Some(&b"y"[..]));
    }

    #[test]
    fn test_concurrent_table() {
        let table = Arc::new(StatsTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..1000u16 {
                        let delta = TaxonDelta {
                            kmers: 1,
                            ..Default::default()
                        };
                        table.apply(i % 4, &delta, format!("t{}", t).as_bytes());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 4);
        for (index, (i, stats)) in snapshot.iter().enumerate() {
            assert_eq!(*i as usize, index);
            assert_eq!(stats.reads, 2000);
            assert_eq!(stats.kmers, 2000);
        }
    }

    #[test]
    fn test_slot_bits() {
        let bits = SlotBits::new(130);
        assert_eq!(bits.len(), 130);
        assert!(bits.set(0));
        assert!(!bits.set(0));
        assert!(bits.set(64));
        assert!(bits.set(129));
        assert!(bits.get(129));
        assert!(!bits.get(128));
        assert_eq!(bits.count_ones(), 3);
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![0, 64, 129]);
    }

    #[test]
    fn test_slot_bits_first_setter_wins() {
        let bits = Arc::new(SlotBits::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bits = Arc::clone(&bits);
                thread::spawn(move || (0..1000).filter(|&i| bits.set(i)).count())
            })
            .collect();
        let flipped: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(flipped, 1000);
    }
}
