//! 2-bit packing of C/G/A/T sequences into `u64` keys.
//!
//! Bases map to C=0, G=1, A=2, T=3 with the first base in the most
//! significant position. The complement of a code is `code ^ 1`, which makes
//! the reverse-complement encoding a cheap per-base transform.

/// Longest k-mer that fits a `u64` below the sign bit.
pub const MAX_K: usize = 31;

const INVALID_CODE: u8 = u8::MAX;
const BITS_PER_BASE: usize = 2;
const BASES: [u8; 4] = *b"CGAT";

const fn build_lookup_table() -> [u8; 256] {
    let mut table = [INVALID_CODE; 256];
    table[b'C' as usize] = 0;
    table[b'G' as usize] = 1;
    table[b'A' as usize] = 2;
    table[b'T' as usize] = 3;
    table
}

static LOOKUP_TABLE: [u8; 256] = build_lookup_table();

#[inline]
pub fn base_code(base: u8) -> Option<u8> {
    match LOOKUP_TABLE[base as usize] {
        INVALID_CODE => None,
        code => Some(code),
    }
}

#[inline]
pub fn kmer_mask(k: usize) -> u64 {
    (1u64 << (k * BITS_PER_BASE)) - 1
}

/// Encodes `bytes[start..start + k]` as read.
///
/// `Err` carries the absolute offset of the first byte outside the alphabet,
/// or `bytes.len()` when the window runs past the end of the input.
pub fn encode_straight(bytes: &[u8], start: usize, k: usize) -> Result<u64, usize> {
    let window = window(bytes, start, k)?;
    let mut key = 0u64;
    for (i, &b) in window.iter().enumerate() {
        let code = base_code(b).ok_or(start + i)?;
        key = (key << BITS_PER_BASE) | code as u64;
    }
    Ok(key)
}

/// Encodes the reverse complement of `bytes[start..start + k]`.
pub fn encode_reverse_complement(bytes: &[u8], start: usize, k: usize) -> Result<u64, usize> {
    let window = window(bytes, start, k)?;
    let mut key = 0u64;
    for (i, &b) in window.iter().enumerate().rev() {
        let code = base_code(b).ok_or(start + i)?;
        key = (key << BITS_PER_BASE) | (code ^ 1) as u64;
    }
    Ok(key)
}

fn window(bytes: &[u8], start: usize, k: usize) -> Result<&[u8], usize> {
    match start.checked_add(k) {
        Some(end) if end <= bytes.len() => Ok(&bytes[start..end]),
        _ => Err(bytes.len()),
    }
}

/// Slides a straight key one base to the right.
#[inline]
pub fn next_straight(prev: u64, base: u8, k: usize) -> Option<u64> {
    let code = base_code(base)?;
    Some(((prev << BITS_PER_BASE) | code as u64) & kmer_mask(k))
}

/// Slides a reverse-complement key one base to the right.
#[inline]
pub fn next_reverse_complement(prev: u64, base: u8, k: usize) -> Option<u64> {
    let code = base_code(base)?;
    Some((prev >> BITS_PER_BASE) | (((code ^ 1) as u64) << ((k - 1) * BITS_PER_BASE)))
}

/// Reverse complement of an encoded key of length `k`.
pub fn reverse_complement_key(kmer: u64, k: usize) -> u64 {
    let mut kmer = kmer;
    kmer = ((kmer & 0xCCCCCCCCCCCCCCCC) >> 2) | ((kmer & 0x3333333333333333) << 2);
    kmer = ((kmer & 0xF0F0F0F0F0F0F0F0) >> 4) | ((kmer & 0x0F0F0F0F0F0F0F0F) << 4);
    kmer = ((kmer & 0xFF00FF00FF00FF00) >> 8) | ((kmer & 0x00FF00FF00FF00FF) << 8);
    kmer = ((kmer & 0xFFFF0000FFFF0000) >> 16) | ((kmer & 0x0000FFFF0000FFFF) << 16);
    kmer = (kmer >> 32) | (kmer << 32);
    ((kmer ^ 0x5555555555555555) >> (64 - k * BITS_PER_BASE)) & kmer_mask(k)
}

pub fn decode(key: u64, k: usize) -> Vec<u8> {
    (0..k)
        .rev()
        .map(|i| BASES[((key >> (i * BITS_PER_BASE)) & 0b11) as usize])
        .collect()
}

pub fn reverse_complement(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .rev()
        .map(|&b| match b {
            b'C' => b'G',
            b'G' => b'C',
            b'A' => b'T',
            b'T' => b'A',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub straight: u64,
    pub reverse: u64,
}

/// Valid k-mer windows of a read, re-encoded in O(1) per base.
///
/// An invalid base drops the partially loaded window; scanning resumes with
/// the following base.
pub struct KmerWindows<'a> {
    bytes: &'a [u8],
    k: usize,
    pos: usize,
    loaded: usize,
    straight: u64,
    reverse: u64,
}

impl<'a> KmerWindows<'a> {
    pub fn new(bytes: &'a [u8], k: usize) -> Self {
        KmerWindows {
            bytes,
            k,
            pos: 0,
            loaded: 0,
            straight: 0,
            reverse: 0,
        }
    }

    /// Number of window positions of the read, valid or not.
    pub fn window_count(&self) -> usize {
        (self.bytes.len() + 1).saturating_sub(self.k)
    }
}

impl Iterator for KmerWindows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        while self.pos < self.bytes.len() {
            let base = self.bytes[self.pos];
            self.pos += 1;
            match (
                next_straight(self.straight, base, self.k),
                next_reverse_complement(self.reverse, base, self.k),
            ) {
                (Some(straight), Some(reverse)) => {
                    self.straight = straight;
                    self.reverse = reverse;
                    if self.loaded < self.k {
                        self.loaded += 1;
                    }
                    if self.loaded == self.k {
                        return Some(Window {
                            offset: self.pos - self.k,
                            straight,
                            reverse,
                        });
                    }
                }
                _ => {
                    self.loaded = 0;
                    self.straight = 0;
                    self.reverse = 0;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_kmer(rng: &mut StdRng, k: usize) -> Vec<u8> {
        (0..k).map(|_| BASES[rng.random_range(0..4)]).collect()
    }

    #[test]
    fn test_encode_table() {
        assert_eq!(encode_straight(b"C", 0, 1), Ok(0));
        assert_eq!(encode_straight(b"G", 0, 1), Ok(1));
        assert_eq!(encode_straight(b"A", 0, 1), Ok(2));
        assert_eq!(encode_straight(b"T", 0, 1), Ok(3));
        assert_eq!(encode_straight(b"CGAT", 0, 4), Ok(0b00_01_10_11));
        // reverse complement of CGAT is ATCG
        assert_eq!(encode_reverse_complement(b"CGAT", 0, 4), Ok(0b10_11_00_01));
    }

    #[test]
    fn test_invalid_base_offset() {
        assert_eq!(encode_straight(b"CGNAT", 0, 4), Err(2));
        assert_eq!(encode_straight(b"CGNAT", 1, 4), Err(2));
        assert_eq!(encode_reverse_complement(b"ACGTx", 1, 4), Err(4));
        assert_eq!(encode_straight(b"acgt", 0, 4), Err(0));
        assert_eq!(encode_straight(b"CGA", 0, 4), Err(3));
    }

    #[test]
    fn test_round_trip_all_k() {
        let mut rng = StdRng::seed_from_u64(7);
        for k in 1..=MAX_K {
            for _ in 0..50 {
                let seq = random_kmer(&mut rng, k);
                let straight = encode_straight(&seq, 0, k).unwrap();
                assert_eq!(decode(straight, k), seq);
                let revcomp = reverse_complement(&seq);
                let reverse = encode_reverse_complement(&seq, 0, k).unwrap();
                assert_eq!(decode(reverse, k), revcomp);
                assert_eq!(reverse_complement_key(straight, k), reverse);
            }
        }
    }

    #[test]
    fn test_streaming_matches_direct() {
        let mut rng = StdRng::seed_from_u64(11);
        let read = random_kmer(&mut rng, 120);
        for k in [1, 4, 17, 31] {
            let windows: Vec<Window> = KmerWindows::new(&read, k).collect();
            assert_eq!(windows.len(), read.len() - k + 1);
            for w in windows {
                assert_eq!(Ok(w.straight), encode_straight(&read, w.offset, k));
                assert_eq!(Ok(w.reverse), encode_reverse_complement(&read, w.offset, k));
            }
        }
    }

    #[test]
    fn test_windows_skip_invalid() {
        let read = b"CGATNCGATC";
        let offsets: Vec<usize> = KmerWindows::new(read, 4).map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0, 5, 6]);
        assert_eq!(KmerWindows::new(read, 4).window_count(), 7);
        assert_eq!(KmerWindows::new(b"CGA", 4).count(), 0);
        assert_eq!(KmerWindows::new(b"", 4).window_count(), 0);
    }

    #[test]
    fn test_windows_repeated_kmer() {
        let windows: Vec<Vec<u8>> = KmerWindows::new(b"CGATCGAT", 4)
            .map(|w| decode(w.straight, 4))
            .collect();
        assert_eq!(
            windows,
            vec![
                b"CGAT".to_vec(),
                b"GATC".to_vec(),
                b"ATCG".to_vec(),
                b"TCGA".to_vec(),
                b"CGAT".to_vec()
            ]
        );
    }
}
