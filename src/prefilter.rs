use crate::bloom::BloomFilter;
use crate::cgat::KmerWindows;

/// Cheap Bloom-only screen run before a read is matched against the store.
///
/// A read passes when enough of its windows test positive on either strand:
/// at least `min_pos_count` windows, or a `pos_ratio` fraction of all windows.
/// With both thresholds at zero every read passes.
#[derive(Debug, Clone, Copy)]
pub struct ReadPrefilter {
    min_pos_count: usize,
    pos_ratio: f64,
}

impl ReadPrefilter {
    pub fn new(min_pos_count: usize, pos_ratio: f64) -> Self {
        ReadPrefilter {
            min_pos_count,
            pos_ratio,
        }
    }

    pub fn is_active(&self) -> bool {
        self.min_pos_count > 0 || self.pos_ratio > 0.0
    }

    pub fn positive_windows(filter: &BloomFilter, bases: &[u8]) -> (usize, usize) {
        let windows = KmerWindows::new(bases, filter.k());
        let total = windows.window_count();
        let positive = windows
            .filter(|w| filter.might_contain(w.straight) || filter.might_contain(w.reverse))
            .count();
        (positive, total)
    }

    pub fn accepts(&self, filter: &BloomFilter, bases: &[u8]) -> bool {
        if !self.is_active() {
            return true;
        }
        let (positive, total) = Self::positive_windows(filter, bases);
        if self.min_pos_count > 0 && positive >= self.min_pos_count {
            return true;
        }
        self.pos_ratio > 0.0 && total > 0 && positive as f64 >= self.pos_ratio * total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::HashStrategy;
    use crate::cgat::{encode_straight, reverse_complement};

    fn filter_with(reference: &[u8], k: usize) -> BloomFilter {
        let mut filter = BloomFilter::new(k, 1000, 0.0001, HashStrategy::TwoHash).unwrap();
        for start in 0..=reference.len() - k {
            filter.insert(encode_straight(reference, start, k).unwrap()).unwrap();
        }
        filter
    }

    #[test]
    fn test_inactive_accepts_everything() {
        let filter = filter_with(b"CGATCGAT", 4);
        let screen = ReadPrefilter::new(0, 0.0);
        assert!(!screen.is_active());
        assert!(screen.accepts(&filter, b"TTTTTTTT"));
    }

    #[test]
    fn test_min_pos_count() {
        let reference = b"ACGTTGCAAGCTAGGCTAACGT";
        let filter = filter_with(reference, 8);
        let screen = ReadPrefilter::new(3, 0.0);
        assert!(screen.accepts(&filter, &reference[2..14]));
        // reverse strand windows count too
        assert!(screen.accepts(&filter, &reverse_complement(&reference[2..14])));
        assert!(!screen.accepts(&filter, b"CCCCCCCCCCCCCCCC"));
    }

    #[test]
    fn test_pos_ratio() {
        let reference = b"ACGTTGCAAGCTAGGCTAACGT";
        let filter = filter_with(reference, 8);
        // 10 windows, 5 from the reference
        let mut read = reference[..12].to_vec();
        read.extend_from_slice(b"CCCCC");
        let (positive, total) = ReadPrefilter::positive_windows(&filter, &read);
        assert_eq!(total, 10);
        assert!(positive >= 5);
        assert!(ReadPrefilter::new(0, 0.5).accepts(&filter, &read));
        assert!(!ReadPrefilter::new(0, 0.9).accepts(&filter, b"CCCCCCCCCCCC"));
        // read shorter than k has no windows
        assert!(!ReadPrefilter::new(0, 0.1).accepts(&filter, b"ACG"));
    }
}
